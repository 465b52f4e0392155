//! Position lifecycle store.
//!
//! Single positions (YES or NO), linked two-leg spreads, partial exits with a
//! full audit trail, and position averaging. Every operation is one SQLite
//! transaction covering the position rows, their legs, and the capital
//! ledger movement; the affected state-manager caches are invalidated before
//! the commit.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use thiserror::Error;
use tracing::{error, info};

use crate::book::Tick;
use crate::db::{round_money, round_price, Db};
use crate::engine::capital;
use crate::engine::state::{
    position_from_row, spread_from_row, PositionSnapshot, SpreadSnapshot, StateManager,
};
use crate::models::TokenSide;

/// Remaining shares at or below this are treated as fully exited.
pub const CLOSE_EPSILON: f64 = 0.0001;

/// A current price within this distance of 0 or 1 means the market resolved.
pub const RESOLUTION_THRESHOLD: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Partial,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Partial => "partial",
            PositionStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> PositionStatus {
        match s {
            "partial" => PositionStatus::Partial,
            "closed" => PositionStatus::Closed,
            _ => PositionStatus::Open,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, PositionStatus::Open | PositionStatus::Partial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadStatus {
    Open,
    Partial,
    Closed,
}

impl SpreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpreadStatus::Open => "open",
            SpreadStatus::Partial => "partial",
            SpreadStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> SpreadStatus {
        match s {
            "partial" => SpreadStatus::Partial,
            "closed" => SpreadStatus::Closed,
            _ => SpreadStatus::Open,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegType {
    Entry,
    Add,
    PartialExit,
    FullExit,
}

impl LegType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegType::Entry => "entry",
            LegType::Add => "add",
            LegType::PartialExit => "partial_exit",
            LegType::FullExit => "full_exit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadType {
    Scalp,
    Hedge,
    Arb,
}

impl SpreadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpreadType::Scalp => "scalp",
            SpreadType::Hedge => "hedge",
            SpreadType::Arb => "arb",
        }
    }
}

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("position {0} not found")]
    NotFound(i64),
    #[error("position {id} is not open (status: {status})")]
    NotOpen { id: i64, status: &'static str },
    #[error("spread {0} not found")]
    SpreadNotFound(i64),
    #[error("close fraction must be in (0, 1], got {0}")]
    InvalidFraction(f64),
    #[error("open position already exists for {strategy} on market {market_id} token {token_id}")]
    Duplicate {
        strategy: String,
        market_id: i64,
        token_id: String,
    },
}

/// Execution context recorded alongside a fill, denormalized from the tick
/// and the slippage model so every trade row carries the book state it
/// filled against. Inserted in the same transaction as the position
/// mutation.
#[derive(Debug, Clone)]
pub struct TradeContext<'a> {
    pub tick: &'a Tick,
    pub is_paper: bool,
    /// Pre-created order row (live path). When None and `is_paper`, a filled
    /// paper order row is synthesized inside the transaction.
    pub order_id: Option<i64>,
    pub slippage: f64,
    pub effective_bid: Option<f64>,
    pub effective_ask: Option<f64>,
    pub effective_spread: Option<f64>,
    pub fee_usd: f64,
}

fn insert_trade(
    tx: &Transaction<'_>,
    ctx: &TradeContext<'_>,
    position_id: i64,
    leg_id: Option<i64>,
    token_id: &str,
    side: &str,
    shares: f64,
    price: f64,
) -> Result<()> {
    let tick = ctx.tick;
    let order_id = match ctx.order_id {
        Some(id) => Some(id),
        None if ctx.is_paper => {
            let now = Utc::now().timestamp();
            tx.execute(
                "INSERT INTO orders
                 (is_paper, token_id, side, order_type, limit_price, executed_price, size_usd,
                  size_shares, filled_shares, status, submitted_at, filled_at)
                 VALUES (1, ?1, ?2, 'market', ?3, ?3, ?4, ?5, ?5, 'filled', ?6, ?6)",
                params![
                    token_id,
                    side,
                    round_price(price),
                    round_money(shares * price),
                    shares,
                    now,
                ],
            )?;
            Some(tx.last_insert_rowid())
        }
        None => None,
    };
    // Prefer tick book values; fall back to the slippage model's effective
    // book so spread data is never missing from the audit trail.
    let best_bid = tick.best_bid.or(ctx.effective_bid);
    let best_ask = tick.best_ask.or(ctx.effective_ask);
    let spread = tick.spread.or(ctx.effective_spread);
    tx.execute(
        "INSERT INTO executor_trades
         (order_id, position_id, leg_id, is_paper, token_id, side, price, size_shares,
          size_usd, fee_usd, best_bid, best_ask, spread, slippage, trigger_tick_id,
          team_yes, team_no, format, game_start_time, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19, ?20)",
        params![
            order_id,
            position_id,
            leg_id,
            ctx.is_paper as i64,
            token_id,
            side,
            round_price(price),
            shares,
            round_money(shares * price),
            round_money(ctx.fee_usd),
            best_bid.map(round_price),
            best_ask.map(round_price),
            spread.map(round_price),
            round_price(ctx.slippage),
            &tick.message_id,
            &tick.team_yes,
            &tick.team_no,
            tick.format.map(|f| f.as_str()),
            tick.game_start_time.map(|t| t.timestamp()),
            Utc::now().timestamp(),
        ],
    )?;
    Ok(())
}

/// One row of a position's audit history.
#[derive(Debug, Clone)]
pub struct PositionLeg {
    pub id: i64,
    pub position_id: i64,
    pub leg_type: &'static str,
    pub shares_delta: f64,
    pub price: f64,
    pub cost_delta: f64,
    pub realized_pnl: Option<f64>,
    pub trigger_reason: String,
}

#[derive(Clone)]
pub struct PositionStore {
    db: Db,
    state: StateManager,
}

impl PositionStore {
    pub fn new(db: Db, state: StateManager) -> Self {
        Self { db, state }
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    // =========================================================================
    // Single position operations
    // =========================================================================

    /// Open a new single position with one entry leg, reserving its cost
    /// from strategy capital.
    #[allow(clippy::too_many_arguments)]
    pub fn open_position(
        &self,
        strategy_name: &str,
        market_id: i64,
        condition_id: &str,
        token_id: &str,
        token_side: TokenSide,
        shares: f64,
        price: f64,
        tick: &Tick,
        trade: Option<&TradeContext<'_>>,
    ) -> Result<PositionSnapshot> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let id = insert_position(
            &tx,
            strategy_name,
            market_id,
            condition_id,
            token_id,
            token_side,
            shares,
            price,
            None,
            tick,
        )?;
        let leg = insert_leg(
            &tx,
            id,
            LegType::Entry,
            shares,
            price,
            shares * price,
            None,
            tick.side_price(token_side),
            "initial_entry",
        )?;
        capital::reserve(&tx, strategy_name, shares * price)?;
        if let Some(ctx) = trade {
            insert_trade(&tx, ctx, id, Some(leg.id), token_id, "BUY", shares, price)?;
        }

        self.state.invalidate_position(strategy_name, market_id, Some(token_side));
        self.state.invalidate_capital(strategy_name);
        tx.commit()?;
        drop(conn);

        info!(
            strategy = %strategy_name,
            market_id = %market_id,
            side = %token_side.as_str(),
            shares = %format!("{shares:.4}"),
            price = %format!("{price:.4}"),
            "opened position"
        );

        self.get(id)?.context("position vanished after insert")
    }

    /// Add shares to an existing position (averaging up/down).
    pub fn add_to_position(
        &self,
        position_id: i64,
        shares: f64,
        price: f64,
        trade: Option<&TradeContext<'_>>,
    ) -> Result<(PositionSnapshot, PositionLeg)> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let pos = fetch_position(&tx, position_id)?;
        if pos.status == PositionStatus::Closed {
            return Err(PositionError::NotOpen {
                id: position_id,
                status: pos.status.as_str(),
            }
            .into());
        }

        let cost = shares * price;
        let new_shares = pos.remaining_shares + shares;
        let new_avg = (pos.remaining_shares * pos.avg_entry_price + cost) / new_shares;

        let leg = insert_leg(
            &tx,
            position_id,
            LegType::Add,
            shares,
            price,
            cost,
            None,
            None,
            "position_add",
        )?;
        tx.execute(
            "UPDATE positions SET remaining_shares = ?2, initial_shares = initial_shares + ?3,
             avg_entry_price = ?4, cost_basis = cost_basis + ?5 WHERE id = ?1",
            params![
                position_id,
                new_shares,
                shares,
                round_price(new_avg),
                round_money(cost)
            ],
        )?;
        capital::reserve(&tx, &pos.strategy_name, cost)?;
        if let Some(ctx) = trade {
            insert_trade(
                &tx,
                ctx,
                position_id,
                Some(leg.id),
                &pos.token_id,
                "BUY",
                shares,
                price,
            )?;
        }

        self.state
            .invalidate_position(&pos.strategy_name, pos.market_id, Some(pos.token_side));
        self.state.invalidate_capital(&pos.strategy_name);
        tx.commit()?;
        drop(conn);

        info!(
            position_id = %position_id,
            shares = %format!("{shares:.4}"),
            price = %format!("{price:.4}"),
            new_avg = %format!("{new_avg:.4}"),
            "added to position"
        );

        let snap = self.get(position_id)?.context("position vanished")?;
        Ok((snap, leg))
    }

    /// Close a fraction of a position. Fraction 1.0 is a full close.
    pub fn partial_close(
        &self,
        position_id: i64,
        fraction: f64,
        price: f64,
        reason: &str,
    ) -> Result<(PositionSnapshot, PositionLeg)> {
        self.partial_close_with_trade(position_id, fraction, price, reason, None)
    }

    pub fn partial_close_with_trade(
        &self,
        position_id: i64,
        fraction: f64,
        price: f64,
        reason: &str,
        trade: Option<&TradeContext<'_>>,
    ) -> Result<(PositionSnapshot, PositionLeg)> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(PositionError::InvalidFraction(fraction).into());
        }
        self.exit_position(position_id, fraction, price, reason, LegType::PartialExit, trade)
    }

    /// Fully close a position.
    pub fn close_position(
        &self,
        position_id: i64,
        price: f64,
        reason: &str,
    ) -> Result<PositionSnapshot> {
        let (snap, _) =
            self.exit_position(position_id, 1.0, price, reason, LegType::FullExit, None)?;
        Ok(snap)
    }

    pub fn close_position_with_trade(
        &self,
        position_id: i64,
        price: f64,
        reason: &str,
        trade: Option<&TradeContext<'_>>,
    ) -> Result<PositionSnapshot> {
        let (snap, _) =
            self.exit_position(position_id, 1.0, price, reason, LegType::FullExit, trade)?;
        Ok(snap)
    }

    fn exit_position(
        &self,
        position_id: i64,
        fraction: f64,
        price: f64,
        reason: &str,
        leg_type: LegType,
        trade: Option<&TradeContext<'_>>,
    ) -> Result<(PositionSnapshot, PositionLeg)> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let pos = fetch_position(&tx, position_id)?;
        if !pos.status.is_live() {
            return Err(PositionError::NotOpen {
                id: position_id,
                status: pos.status.as_str(),
            }
            .into());
        }

        let shares_to_close = pos.remaining_shares * fraction;
        let exit_value = shares_to_close * price;
        let realized = shares_to_close * (price - pos.avg_entry_price);
        let new_remaining = pos.remaining_shares - shares_to_close;
        let fully_closed = new_remaining <= CLOSE_EPSILON;

        let leg = insert_leg(
            &tx,
            position_id,
            // A partial that empties the position keeps its partial_exit
            // label; only close_position writes full_exit.
            if fully_closed { leg_type } else { LegType::PartialExit },
            -shares_to_close,
            price,
            exit_value,
            Some(realized),
            Some(price),
            reason,
        )?;

        if fully_closed {
            tx.execute(
                "UPDATE positions SET remaining_shares = 0, realized_pnl = realized_pnl + ?2,
                 unrealized_pnl = 0, status = 'closed', close_reason = ?3, closed_at = ?4
                 WHERE id = ?1",
                params![
                    position_id,
                    round_money(realized),
                    reason,
                    Utc::now().timestamp()
                ],
            )?;
        } else {
            tx.execute(
                "UPDATE positions SET remaining_shares = ?2, realized_pnl = realized_pnl + ?3,
                 status = 'partial' WHERE id = ?1",
                params![position_id, new_remaining, round_money(realized)],
            )?;
        }

        capital::credit(&tx, &pos.strategy_name, exit_value, realized)?;
        if let Some(ctx) = trade {
            insert_trade(
                &tx,
                ctx,
                position_id,
                Some(leg.id),
                &pos.token_id,
                "SELL",
                shares_to_close,
                price,
            )?;
        }

        self.state
            .invalidate_position(&pos.strategy_name, pos.market_id, Some(pos.token_side));
        self.state.invalidate_capital(&pos.strategy_name);
        if pos.spread_id.is_some() {
            self.state.invalidate_spread(&pos.strategy_name, pos.market_id);
        }

        if let (Some(spread_id), true) = (pos.spread_id, fully_closed) {
            maybe_close_spread(&tx, spread_id)?;
        }

        tx.commit()?;
        drop(conn);

        info!(
            position_id = %position_id,
            fraction = %format!("{:.0}%", fraction * 100.0),
            price = %format!("{price:.4}"),
            pnl = %format!("{realized:+.2}"),
            remaining = %format!("{new_remaining:.4}"),
            reason = %reason,
            "position exit"
        );

        let snap = self.get(position_id)?.context("position vanished")?;
        Ok((snap, leg))
    }

    // =========================================================================
    // Spread operations
    // =========================================================================

    /// Open a spread: two positions, two entry legs, one spread row, and one
    /// combined capital reservation, all in a single transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn open_spread(
        &self,
        strategy_name: &str,
        market_id: i64,
        condition_id: &str,
        yes_token_id: &str,
        no_token_id: &str,
        yes_shares: f64,
        yes_price: f64,
        no_shares: f64,
        no_price: f64,
        tick: &Tick,
        spread_type: SpreadType,
        trades: Option<(&TradeContext<'_>, &TradeContext<'_>)>,
    ) -> Result<SpreadSnapshot> {
        let total_cost = yes_shares * yes_price + no_shares * no_price;
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        // Track the YES mid at entry (not the fill) so jump baselines can be
        // re-derived after a restart.
        let entry_mid = tick.yes_price().unwrap_or(yes_price);
        tx.execute(
            "INSERT INTO spreads
             (strategy_name, market_id, condition_id, spread_type, total_cost_basis,
              team_yes, team_no, entry_yes_price, status, opened_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'open', ?9)",
            params![
                strategy_name,
                market_id,
                condition_id,
                spread_type.as_str(),
                round_money(total_cost),
                &tick.team_yes,
                &tick.team_no,
                round_price(entry_mid),
                Utc::now().timestamp(),
            ],
        )?;
        let spread_id = tx.last_insert_rowid();

        let yes_position_id = insert_position(
            &tx,
            strategy_name,
            market_id,
            condition_id,
            yes_token_id,
            TokenSide::Yes,
            yes_shares,
            yes_price,
            Some(spread_id),
            tick,
        )?;
        insert_leg(
            &tx,
            yes_position_id,
            LegType::Entry,
            yes_shares,
            yes_price,
            yes_shares * yes_price,
            None,
            None,
            "spread_entry",
        )?;

        let no_position_id = insert_position(
            &tx,
            strategy_name,
            market_id,
            condition_id,
            no_token_id,
            TokenSide::No,
            no_shares,
            no_price,
            Some(spread_id),
            tick,
        )?;
        insert_leg(
            &tx,
            no_position_id,
            LegType::Entry,
            no_shares,
            no_price,
            no_shares * no_price,
            None,
            None,
            "spread_entry",
        )?;

        tx.execute(
            "UPDATE spreads SET yes_position_id = ?2, no_position_id = ?3 WHERE id = ?1",
            params![spread_id, yes_position_id, no_position_id],
        )?;

        capital::reserve(&tx, strategy_name, total_cost)?;
        if let Some((yes_ctx, no_ctx)) = trades {
            insert_trade(
                &tx, yes_ctx, yes_position_id, None, yes_token_id, "BUY", yes_shares, yes_price,
            )?;
            insert_trade(
                &tx, no_ctx, no_position_id, None, no_token_id, "BUY", no_shares, no_price,
            )?;
        }

        self.state.invalidate_position(strategy_name, market_id, None);
        self.state.invalidate_spread(strategy_name, market_id);
        self.state.invalidate_capital(strategy_name);
        tx.commit()?;
        drop(conn);

        info!(
            strategy = %strategy_name,
            market_id = %market_id,
            yes = %format!("{yes_shares:.4}@{yes_price:.4}"),
            no = %format!("{no_shares:.4}@{no_price:.4}"),
            total = %format!("{total_cost:.2}"),
            "opened spread"
        );

        self.get_spread_by_id(spread_id)?
            .context("spread vanished after insert")
    }

    /// Close both still-open legs of a spread at the given exit prices.
    pub fn close_spread(
        &self,
        spread_id: i64,
        yes_price: f64,
        no_price: f64,
        reason: &str,
    ) -> Result<SpreadSnapshot> {
        // Close legs through the normal exit path so each gets its audit leg
        // and capital credit; the last one auto-closes the spread row.
        let spread = self
            .get_spread_by_id(spread_id)?
            .ok_or(PositionError::SpreadNotFound(spread_id))?;

        for (pos_id, price) in [
            (spread.yes_position_id, yes_price),
            (spread.no_position_id, no_price),
        ] {
            let Some(pos_id) = pos_id else { continue };
            match self.get(pos_id)? {
                Some(p) if p.status.is_live() => {
                    self.close_position(pos_id, price, reason)?;
                }
                _ => {}
            }
        }

        // Aggregate even when both legs were already closed (explicit close
        // of a stale spread row).
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        maybe_close_spread(&tx, spread_id)?;
        self.state
            .invalidate_spread(&spread.strategy_name, spread.market_id);
        tx.commit()?;
        drop(conn);

        let closed = self
            .get_spread_by_id(spread_id)?
            .ok_or(PositionError::SpreadNotFound(spread_id))?;
        info!(
            spread_id = %spread_id,
            pnl = %format!("{:+.2}", closed.total_realized_pnl),
            "closed spread"
        );
        Ok(closed)
    }

    // =========================================================================
    // Price updates
    // =========================================================================

    /// Refresh current price and unrealized P&L for every live position (and
    /// spread aggregate) on the tick's market. Returns positions touched.
    pub fn update_prices(&self, tick: &Tick) -> Result<usize> {
        let yes = tick.yes_price();
        let no = tick.no_price();
        if yes.is_none() && no.is_none() {
            return Ok(0);
        }

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let mut count = 0usize;

        for (side, price) in [(TokenSide::Yes, yes), (TokenSide::No, no)] {
            let Some(price) = price else { continue };
            count += tx.execute(
                "UPDATE positions
                 SET current_price = ?3,
                     unrealized_pnl = remaining_shares * (?3 - avg_entry_price)
                 WHERE market_id = ?1 AND token_side = ?2 AND status IN ('open', 'partial')",
                params![tick.market_id, side.as_str(), round_price(price)],
            )?;
        }

        tx.execute(
            "UPDATE spreads SET total_unrealized_pnl = (
                 SELECT COALESCE(SUM(p.unrealized_pnl), 0) FROM positions p
                 WHERE p.spread_id = spreads.id
             )
             WHERE market_id = ?1 AND status IN ('open', 'partial')",
            params![tick.market_id],
        )?;

        tx.commit()?;
        Ok(count)
    }

    // =========================================================================
    // Resolution cleanup
    // =========================================================================

    /// Force-close positions whose market has already resolved (price pinned
    /// within `RESOLUTION_THRESHOLD` of 0 or 1). Handles exits that never
    /// triggered or were blocked by wide spreads.
    pub fn cleanup_resolved_positions(&self) -> Result<usize> {
        let live: Vec<PositionSnapshot> = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT id, strategy_name, market_id, condition_id, token_id, token_side,
                        initial_shares, remaining_shares, avg_entry_price, cost_basis,
                        current_price, unrealized_pnl, realized_pnl, spread_id, team_yes,
                        team_no, game_start_time, format, status, close_reason, opened_at,
                        closed_at
                 FROM positions WHERE status IN ('open', 'partial')",
            )?;
            let rows = stmt.query_map([], position_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut closed_count = 0usize;
        for pos in live {
            let Some(current) = pos.current_price else {
                continue;
            };
            let resolved_high = current >= 1.0 - RESOLUTION_THRESHOLD;
            let resolved_low = current <= RESOLUTION_THRESHOLD;
            if !resolved_high && !resolved_low {
                continue;
            }

            let (resolution_price, winner) = if resolved_high {
                (1.0, pos.token_side)
            } else {
                (0.0, pos.token_side.opposite())
            };
            let reason = format!("market_resolved:{}", winner.as_str());

            match self.close_position(pos.id, resolution_price, &reason) {
                Ok(_) => closed_count += 1,
                Err(e) => {
                    error!(position_id = %pos.id, error = %e, "failed to close resolved position");
                }
            }
        }

        if closed_count > 0 {
            info!(count = %closed_count, "cleaned up resolved positions");
            self.state.clear_cache();
        }
        Ok(closed_count)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, position_id: i64) -> Result<Option<PositionSnapshot>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, strategy_name, market_id, condition_id, token_id, token_side,
                    initial_shares, remaining_shares, avg_entry_price, cost_basis,
                    current_price, unrealized_pnl, realized_pnl, spread_id, team_yes, team_no,
                    game_start_time, format, status, close_reason, opened_at, closed_at
             FROM positions WHERE id = ?1",
        )?;
        Ok(stmt
            .query_row(params![position_id], position_from_row)
            .optional()?)
    }

    pub fn get_spread_by_id(&self, spread_id: i64) -> Result<Option<SpreadSnapshot>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, strategy_name, market_id, condition_id, spread_type, yes_position_id,
                    no_position_id, total_cost_basis, total_realized_pnl, total_unrealized_pnl,
                    team_yes, team_no, entry_yes_price, status, opened_at, closed_at
             FROM spreads WHERE id = ?1",
        )?;
        Ok(stmt
            .query_row(params![spread_id], spread_from_row)
            .optional()?)
    }

    pub fn legs(&self, position_id: i64) -> Result<Vec<PositionLeg>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, position_id, leg_type, shares_delta, price, cost_delta, realized_pnl,
                    trigger_reason
             FROM position_legs WHERE position_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![position_id], |row| {
            let leg_type: String = row.get(2)?;
            Ok(PositionLeg {
                id: row.get(0)?,
                position_id: row.get(1)?,
                leg_type: match leg_type.as_str() {
                    "add" => "add",
                    "partial_exit" => "partial_exit",
                    "full_exit" => "full_exit",
                    _ => "entry",
                },
                shares_delta: row.get(3)?,
                price: row.get(4)?,
                cost_delta: row.get(5)?,
                realized_pnl: row.get(6)?,
                trigger_reason: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

// =============================================================================
// Transaction-scoped helpers
// =============================================================================

#[allow(clippy::too_many_arguments)]
fn insert_position(
    tx: &Transaction<'_>,
    strategy_name: &str,
    market_id: i64,
    condition_id: &str,
    token_id: &str,
    token_side: TokenSide,
    shares: f64,
    price: f64,
    spread_id: Option<i64>,
    tick: &Tick,
) -> Result<i64> {
    // Pre-check gives a typed error; the partial unique index is the backstop.
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM positions WHERE strategy_name = ?1 AND market_id = ?2
             AND token_id = ?3 AND status IN ('open', 'partial')",
            params![strategy_name, market_id, token_id],
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(PositionError::Duplicate {
            strategy: strategy_name.to_string(),
            market_id,
            token_id: token_id.to_string(),
        }
        .into());
    }

    tx.execute(
        "INSERT INTO positions
         (strategy_name, market_id, condition_id, token_id, token_side, side, initial_shares,
          remaining_shares, avg_entry_price, cost_basis, current_price, spread_id, team_yes,
          team_no, game_start_time, format, status, opened_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'BUY', ?6, ?6, ?7, ?8, ?7, ?9, ?10, ?11, ?12, ?13, 'open', ?14)",
        params![
            strategy_name,
            market_id,
            condition_id,
            token_id,
            token_side.as_str(),
            shares,
            round_price(price),
            round_money(shares * price),
            spread_id,
            &tick.team_yes,
            &tick.team_no,
            tick.game_start_time.map(|t| t.timestamp()),
            tick.format.map(|f| f.as_str()),
            Utc::now().timestamp(),
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

#[allow(clippy::too_many_arguments)]
fn insert_leg(
    tx: &Transaction<'_>,
    position_id: i64,
    leg_type: LegType,
    shares_delta: f64,
    price: f64,
    cost_delta: f64,
    realized_pnl: Option<f64>,
    trigger_price: Option<f64>,
    trigger_reason: &str,
) -> Result<PositionLeg> {
    tx.execute(
        "INSERT INTO position_legs
         (position_id, leg_type, shares_delta, price, cost_delta, realized_pnl, trigger_price,
          trigger_reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            position_id,
            leg_type.as_str(),
            shares_delta,
            round_price(price),
            round_money(cost_delta),
            realized_pnl.map(round_money),
            trigger_price.map(round_price),
            trigger_reason,
            Utc::now().timestamp(),
        ],
    )?;
    Ok(PositionLeg {
        id: tx.last_insert_rowid(),
        position_id,
        leg_type: leg_type.as_str(),
        shares_delta,
        price,
        cost_delta,
        realized_pnl,
        trigger_reason: trigger_reason.to_string(),
    })
}

fn fetch_position(conn: &Connection, position_id: i64) -> Result<PositionSnapshot> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, strategy_name, market_id, condition_id, token_id, token_side,
                initial_shares, remaining_shares, avg_entry_price, cost_basis, current_price,
                unrealized_pnl, realized_pnl, spread_id, team_yes, team_no, game_start_time,
                format, status, close_reason, opened_at, closed_at
         FROM positions WHERE id = ?1",
    )?;
    stmt.query_row(params![position_id], position_from_row)
        .optional()?
        .ok_or_else(|| PositionError::NotFound(position_id).into())
}

/// If both legs of the spread are closed, close the spread and roll up its
/// realized P&L. Runs inside the caller's transaction so the last leg's
/// closure and the spread closure commit together.
fn maybe_close_spread(tx: &Transaction<'_>, spread_id: i64) -> Result<()> {
    let row: Option<(Option<i64>, Option<i64>, String)> = tx
        .query_row(
            "SELECT yes_position_id, no_position_id, status FROM spreads WHERE id = ?1",
            params![spread_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((yes_id, no_id, status)) = row else {
        return Ok(());
    };
    if status == "closed" {
        return Ok(());
    }

    let leg_closed = |id: Option<i64>| -> Result<bool> {
        match id {
            None => Ok(true),
            Some(id) => {
                let status: Option<String> = tx
                    .query_row(
                        "SELECT status FROM positions WHERE id = ?1",
                        params![id],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok(matches!(status.as_deref(), Some("closed")))
            }
        }
    };

    if !(leg_closed(yes_id)? && leg_closed(no_id)?) {
        return Ok(());
    }

    let total_pnl: f64 = tx.query_row(
        "SELECT COALESCE(SUM(realized_pnl), 0) FROM positions WHERE spread_id = ?1",
        params![spread_id],
        |r| r.get(0),
    )?;
    tx.execute(
        "UPDATE spreads SET status = 'closed', total_realized_pnl = ?2,
         total_unrealized_pnl = 0, closed_at = ?3 WHERE id = ?1",
        params![spread_id, round_money(total_pnl), Utc::now().timestamp()],
    )?;
    info!(
        spread_id = %spread_id,
        pnl = %format!("{total_pnl:+.2}"),
        "spread auto-closed, both legs done"
    );
    Ok(())
}
