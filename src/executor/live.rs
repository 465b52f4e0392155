//! Live executor.
//!
//! Places real limit orders against the exchange. The wallet - not the local
//! database - is authoritative for what has filled: every retry and every
//! timeout consults it before doing anything that could double an order.
//!
//! Flow per signal: safety preconditions, limit-price construction from the
//! fresh book, submission with bounded retries (aborting if the price runs
//! away), then fill polling with cancel-on-timeout.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::params;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::book::{EventKind, OrderBook, Tick};
use crate::db::{round_money, round_price, Db};
use crate::engine::positions::{PositionStore, TradeContext};
use crate::engine::router::WALLET_RECONCILE_STRATEGY;
use crate::exchange::orders::{is_retryable_error, OrderClient, OrderStatus, WalletPosition};
use crate::exchange::rest::MarketDataClient;
use crate::executor::order_types::{round_down_to_tick, shares_from_usd, OrderRequest, OrderType};
use crate::executor::safety::{MarketObservation, SafetyChecker, Signal};
use crate::models::TokenSide;

pub const ORDER_STATUS_POLL_INTERVAL_MS: u64 = 500;
pub const ORDER_STATUS_TIMEOUT_SECS: u64 = 30;

pub const ORDER_PLACEMENT_MAX_RETRIES: usize = 3;
const ORDER_PLACEMENT_RETRY_DELAYS_MS: [u64; 3] = [1_000, 2_000, 4_000];

/// Abort a retry rather than chase a price that moved more than this.
pub const MAX_PRICE_MOVE_BETWEEN_RETRIES: f64 = 0.03;

/// Exchange minimum notional.
pub const MIN_ORDER_SIZE_USD: f64 = 1.05;

const DEFAULT_TICK_SIZE: f64 = 0.001;

#[derive(Debug, Clone, Default)]
pub struct LiveOrderbookState {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub mid_price: Option<f64>,
    pub spread: Option<f64>,
}

impl From<&OrderBook> for LiveOrderbookState {
    fn from(book: &OrderBook) -> Self {
        Self {
            best_bid: book.best_bid(),
            best_ask: book.best_ask(),
            mid_price: book.mid(),
            spread: book.spread(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LiveOutcome {
    pub success: bool,
    pub order_row_id: Option<i64>,
    pub executed_price: Option<f64>,
    pub executed_shares: Option<f64>,
    pub executed_usd: Option<f64>,
    pub message: String,
}

impl LiveOutcome {
    fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            order_row_id: None,
            executed_price: None,
            executed_shares: None,
            executed_usd: None,
            message: message.into(),
        }
    }
}

pub struct LiveExecutor {
    db: Db,
    positions: PositionStore,
    client: Arc<OrderClient>,
    market_data: Arc<MarketDataClient>,
    safety: SafetyChecker,
}

impl LiveExecutor {
    pub fn new(
        db: Db,
        positions: PositionStore,
        client: Arc<OrderClient>,
        market_data: Arc<MarketDataClient>,
        safety: SafetyChecker,
    ) -> Self {
        Self {
            db,
            positions,
            client,
            market_data,
            safety,
        }
    }

    pub async fn get_orderbook_state(&self, token_id: &str) -> Result<LiveOrderbookState> {
        let book = self.market_data.fetch_orderbook(token_id).await?;
        Ok(LiveOrderbookState::from(&book))
    }

    /// Execute a signal end to end. Records a trade decision either way.
    pub async fn execute_signal(&self, signal: &Signal) -> LiveOutcome {
        self.safety.insert_signal(signal).ok();

        let outcome = self.execute_inner(signal).await;
        match &outcome {
            Ok(o) if o.success => {
                self.safety.mark_signal(&signal.id, "executed").ok();
                self.safety.record_decision(signal, true, None);
            }
            Ok(o) => {
                self.safety.mark_signal(&signal.id, "rejected").ok();
                self.safety.record_decision(signal, false, Some(&o.message));
            }
            Err(e) => {
                self.safety.mark_signal(&signal.id, "failed").ok();
                self.safety.record_decision(signal, false, Some(&e.to_string()));
            }
        }
        outcome.unwrap_or_else(|e| LiveOutcome::fail(e.to_string()))
    }

    async fn execute_inner(&self, signal: &Signal) -> Result<LiveOutcome> {
        // Fresh book + fee rate for the precondition checks.
        let book = self.get_orderbook_state(&signal.token_id).await?;
        let fee_rate_bps = match self.market_data.fetch_fee_rate_bps(&signal.token_id).await {
            Ok(bps) => Some(bps),
            Err(e) => {
                warn!(error = %e, "could not fetch fee rate, proceeding with caution");
                None
            }
        };

        let obs = MarketObservation {
            live_mid: book.mid_price,
            spread: book.spread,
            fee_rate_bps,
            is_exit: false,
        };
        let check = self.safety.check_all(signal, &obs);
        if !check.passed {
            return Ok(LiveOutcome::fail(check.reason));
        }

        // Balance and minimum notional.
        let balance = self.client.get_balance().await?;
        let size_usd = signal
            .suggested_size_usd
            .unwrap_or(25.0)
            .max(MIN_ORDER_SIZE_USD);
        if size_usd > balance {
            return Ok(LiveOutcome::fail(format!(
                "insufficient balance: ${balance:.2} < ${size_usd:.2}"
            )));
        }

        // Limit price from the fresh book, floored to the tick grid.
        let request = OrderRequest::new(&signal.token_id, signal.side, size_usd, OrderType::Limit);
        let Some(raw_price) = request.calculate_price(book.best_bid, book.best_ask, book.mid_price)
        else {
            return Ok(LiveOutcome::fail("could not determine limit price"));
        };
        let mut limit_price = round_down_to_tick(raw_price, DEFAULT_TICK_SIZE);

        let order_row_id = self.insert_order_row(signal, limit_price, size_usd)?;

        let initial_mid = book.mid_price;
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..ORDER_PLACEMENT_MAX_RETRIES {
            if attempt > 0 {
                let delay = ORDER_PLACEMENT_RETRY_DELAYS_MS
                    [attempt.saturating_sub(1).min(ORDER_PLACEMENT_RETRY_DELAYS_MS.len() - 1)];
                info!(
                    attempt = attempt + 1,
                    delay_ms = delay,
                    "retrying order placement"
                );
                sleep(Duration::from_millis(delay)).await;

                // The previous attempt may have succeeded with the response
                // lost in transit. The wallet knows.
                match self.check_wallet_for_fill(&signal.token_id).await {
                    Ok(Some(fill)) => {
                        warn!(
                            size = %fill.size,
                            avg_price = %fill.avg_price,
                            "found fill in wallet from previous attempt"
                        );
                        return self.settle_fill(
                            signal,
                            order_row_id,
                            fill.avg_price,
                            fill.size,
                            "detected from wallet",
                        );
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // Cannot verify: abort rather than risk a duplicate.
                        self.mark_order_failed(
                            order_row_id,
                            &format!("could not verify previous attempt: {e}"),
                        )?;
                        return Ok(LiveOutcome::fail(
                            "retry aborted: could not verify previous attempt status",
                        ));
                    }
                }

                // Fresh book: abort if the market ran away, else re-price.
                let fresh = match self.get_orderbook_state(&signal.token_id).await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, "could not refresh orderbook for retry");
                        continue;
                    }
                };
                if let (Some(fresh_mid), Some(initial_mid)) = (fresh.mid_price, initial_mid) {
                    let price_move = (fresh_mid - initial_mid).abs() / initial_mid;
                    if price_move > MAX_PRICE_MOVE_BETWEEN_RETRIES {
                        let msg = format!(
                            "price moved {:.1}% during retry (max {:.0}%)",
                            price_move * 100.0,
                            MAX_PRICE_MOVE_BETWEEN_RETRIES * 100.0
                        );
                        self.mark_order_failed(order_row_id, &msg)?;
                        return Ok(LiveOutcome::fail(msg));
                    }
                }
                if let Some(raw) =
                    request.calculate_price(fresh.best_bid, fresh.best_ask, fresh.mid_price)
                {
                    limit_price = round_down_to_tick(raw, DEFAULT_TICK_SIZE);
                }
            }

            let size_shares = shares_from_usd(size_usd, limit_price)
                .ok_or_else(|| anyhow!("invalid limit price {limit_price}"))?;

            match self
                .client
                .place_order(
                    &signal.token_id,
                    signal.side.as_str(),
                    limit_price,
                    size_shares,
                )
                .await
            {
                Ok(placed) => {
                    self.mark_order_submitted(order_row_id, &placed.order_id, limit_price)?;
                    if placed.matched {
                        let price = placed.avg_price.unwrap_or(limit_price);
                        let shares = placed.filled_size.unwrap_or(size_shares);
                        return self.settle_fill(
                            signal,
                            order_row_id,
                            price,
                            shares,
                            "immediate match",
                        );
                    }
                    return self
                        .wait_for_fill(signal, order_row_id, &placed.order_id, limit_price, size_shares)
                        .await;
                }
                Err(e) => {
                    if is_retryable_error(&e) {
                        warn!(attempt = attempt + 1, error = %e, "retryable order error");
                        last_error = Some(e);
                        continue;
                    }
                    // Business rejection: record and stop.
                    self.mark_order_failed(order_row_id, &e.to_string())?;
                    return Ok(LiveOutcome::fail(format!("order rejected: {e}")));
                }
            }
        }

        let msg = format!(
            "order placement failed after {ORDER_PLACEMENT_MAX_RETRIES} attempts: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        );
        self.mark_order_failed(order_row_id, &msg)?;
        Ok(LiveOutcome::fail(msg))
    }

    /// Poll order status until filled or timed out; cancel on timeout. A
    /// cancel refused because the order matched is a fill.
    async fn wait_for_fill(
        &self,
        signal: &Signal,
        order_row_id: i64,
        exchange_order_id: &str,
        limit_price: f64,
        size_shares: f64,
    ) -> Result<LiveOutcome> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(ORDER_STATUS_TIMEOUT_SECS);

        loop {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            sleep(Duration::from_millis(ORDER_STATUS_POLL_INTERVAL_MS)).await;

            match self.client.order_status(exchange_order_id).await {
                Ok(OrderStatus::Matched) => {
                    // Wallet has the authoritative size/price.
                    let (price, shares) = match self.check_wallet_for_fill(&signal.token_id).await {
                        Ok(Some(fill)) => (fill.avg_price, fill.size),
                        _ => (limit_price, size_shares),
                    };
                    return self.settle_fill(signal, order_row_id, price, shares, "status matched");
                }
                Ok(OrderStatus::Cancelled) => {
                    self.update_order_status(order_row_id, "cancelled", "cancelled by exchange")?;
                    return Ok(LiveOutcome::fail("order cancelled by exchange"));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "order status poll failed");
                }
            }
        }

        // Timed out: try to cancel.
        info!(order_id = %exchange_order_id, "fill timeout, cancelling");
        match self.client.cancel_order(exchange_order_id).await {
            Ok(outcome) if outcome.already_matched => {
                // Raced a fill. Consult the wallet for actual size; if even
                // the wallet lags, conservatively assume the submitted size
                // and flag the discrepancy for manual review.
                match self.check_wallet_for_fill(&signal.token_id).await {
                    Ok(Some(fill)) => self.settle_fill(
                        signal,
                        order_row_id,
                        fill.avg_price,
                        fill.size,
                        "cancel raced fill",
                    ),
                    _ => {
                        warn!(
                            order_id = %exchange_order_id,
                            "cancel says matched but wallet shows no fill yet; \
                             assuming submitted size - review manually"
                        );
                        self.settle_fill(
                            signal,
                            order_row_id,
                            limit_price,
                            size_shares,
                            "cancel raced fill (wallet lagging)",
                        )
                    }
                }
            }
            Ok(_) => {
                self.update_order_status(order_row_id, "cancelled", "timeout, cancelled")?;
                Ok(LiveOutcome::fail("order timed out and was cancelled"))
            }
            Err(e) => {
                error!(error = %e, "cancel failed");
                self.update_order_status(order_row_id, "failed", &format!("cancel failed: {e}"))?;
                Ok(LiveOutcome::fail(format!("cancel failed: {e}")))
            }
        }
    }

    /// Mark the order filled and open the position, in one transaction via
    /// the position store.
    fn settle_fill(
        &self,
        signal: &Signal,
        order_row_id: i64,
        price: f64,
        shares: f64,
        reason: &str,
    ) -> Result<LiveOutcome> {
        {
            let conn = self.db.lock();
            conn.execute(
                "UPDATE orders SET status = 'filled', executed_price = ?2, filled_shares = ?3,
                 size_shares = COALESCE(size_shares, ?3), status_message = ?4, filled_at = ?5
                 WHERE id = ?1",
                params![
                    order_row_id,
                    round_price(price),
                    shares,
                    reason,
                    Utc::now().timestamp(),
                ],
            )?;
        }

        let tick = self.context_tick(signal, price);
        let ctx = TradeContext {
            tick: &tick,
            is_paper: false,
            order_id: Some(order_row_id),
            slippage: 0.0,
            effective_bid: None,
            effective_ask: None,
            effective_spread: None,
            fee_usd: 0.0,
        };
        let position = self.positions.open_position(
            &signal.strategy_name,
            signal.market_id,
            &tick.condition_id,
            &signal.token_id,
            signal.token_side,
            shares,
            price,
            &tick,
            Some(&ctx),
        )?;

        info!(
            order_row_id = %order_row_id,
            position_id = %position.id,
            price = %format!("{price:.4}"),
            shares = %format!("{shares:.2}"),
            reason = %reason,
            "live fill settled"
        );

        Ok(LiveOutcome {
            success: true,
            order_row_id: Some(order_row_id),
            executed_price: Some(price),
            executed_shares: Some(shares),
            executed_usd: Some(round_money(price * shares)),
            message: reason.to_string(),
        })
    }

    /// Close an open live position with a crossing limit sell, then settle
    /// the store at the executed price. Used by the streaming exit pass.
    pub async fn close_position_live(
        &self,
        position: &crate::engine::state::PositionSnapshot,
        reason: &str,
    ) -> Result<LiveOutcome> {
        let book = self.get_orderbook_state(&position.token_id).await?;
        let Some(bid) = book.best_bid else {
            return Ok(LiveOutcome::fail("no bid to sell into"));
        };
        let limit_price = round_down_to_tick(bid, DEFAULT_TICK_SIZE);
        let shares = position.remaining_shares;

        let mut signal = Signal::new(
            &position.strategy_name,
            position.market_id,
            &position.token_id,
            position.token_side,
            crate::models::OrderSide::Sell,
        );
        signal.reason = reason.to_string();
        signal.price_at_signal = Some(limit_price);

        let order_row_id = self.insert_order_row(&signal, limit_price, shares * limit_price)?;

        let placed = match self
            .client
            .place_order(&position.token_id, "SELL", limit_price, shares)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                self.mark_order_failed(order_row_id, &e.to_string())?;
                return Ok(LiveOutcome::fail(format!("sell rejected: {e}")));
            }
        };
        self.mark_order_submitted(order_row_id, &placed.order_id, limit_price)?;

        let price = placed.avg_price.unwrap_or(limit_price);
        {
            let conn = self.db.lock();
            conn.execute(
                "UPDATE orders SET status = 'filled', executed_price = ?2, filled_shares = ?3,
                 status_message = ?4, filled_at = ?5 WHERE id = ?1",
                params![
                    order_row_id,
                    round_price(price),
                    shares,
                    reason,
                    Utc::now().timestamp(),
                ],
            )?;
        }

        let tick = self.context_tick(&signal, price);
        let ctx = TradeContext {
            tick: &tick,
            is_paper: false,
            order_id: Some(order_row_id),
            slippage: 0.0,
            effective_bid: book.best_bid,
            effective_ask: book.best_ask,
            effective_spread: book.spread,
            fee_usd: 0.0,
        };
        let closed = self
            .positions
            .close_position_with_trade(position.id, price, reason, Some(&ctx))?;

        info!(
            position_id = %closed.id,
            price = %format!("{price:.4}"),
            pnl = %format!("{:+.2}", closed.realized_pnl),
            reason = %reason,
            "live position closed"
        );
        Ok(LiveOutcome {
            success: true,
            order_row_id: Some(order_row_id),
            executed_price: Some(price),
            executed_shares: Some(shares),
            executed_usd: Some(round_money(shares * price)),
            message: reason.to_string(),
        })
    }

    /// Wallet position for this token, if any shares are held.
    async fn check_wallet_for_fill(&self, token_id: &str) -> Result<Option<WalletPosition>> {
        let positions = self.client.get_positions().await?;
        Ok(positions
            .into_iter()
            .find(|p| p.token_id == token_id && p.size > 0.0))
    }

    /// Compare wallet positions against locally recorded live positions and
    /// import anything the engine does not know about, under a synthetic
    /// strategy name that quarantines them from strategy dispatch.
    pub async fn reconcile_wallet_positions(&self) -> Result<usize> {
        let wallet = self.client.get_positions().await?;
        let mut imported = 0usize;

        for wp in wallet {
            if wp.size <= 0.0 {
                continue;
            }
            let known: i64 = {
                let conn = self.db.lock();
                conn.query_row(
                    "SELECT COUNT(*) FROM positions
                     WHERE token_id = ?1 AND status IN ('open', 'partial')",
                    params![&wp.token_id],
                    |r| r.get(0),
                )?
            };
            if known > 0 {
                continue;
            }

            let Some((market_id, condition_id, token_side)) =
                self.lookup_market_for_token(&wp.token_id)?
            else {
                warn!(token_id = %wp.token_id, "wallet position on unknown token, skipping");
                continue;
            };

            let mut signal = Signal::new(
                WALLET_RECONCILE_STRATEGY,
                market_id,
                &wp.token_id,
                token_side,
                crate::models::OrderSide::Buy,
            );
            signal.reason = "wallet reconciliation import".to_string();

            let tick = self.context_tick(&signal, wp.avg_price);
            match self.positions.open_position(
                WALLET_RECONCILE_STRATEGY,
                market_id,
                &condition_id,
                &wp.token_id,
                token_side,
                wp.size,
                wp.avg_price,
                &tick,
                None,
            ) {
                Ok(pos) => {
                    imported += 1;
                    info!(
                        position_id = %pos.id,
                        token_id = %wp.token_id,
                        size = %wp.size,
                        "imported wallet position"
                    );
                }
                Err(e) => {
                    error!(token_id = %wp.token_id, error = %e, "wallet import failed");
                }
            }
        }

        if imported > 0 {
            info!(count = %imported, "wallet reconciliation imported positions");
        }
        Ok(imported)
    }

    fn lookup_market_for_token(&self, token_id: &str) -> Result<Option<(i64, String, TokenSide)>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT market_id, condition_id, yes_token_id FROM markets
             WHERE yes_token_id = ?1 OR no_token_id = ?1",
        )?;
        let row = stmt
            .query_row(params![token_id], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(row.map(|(market_id, condition_id, yes_token)| {
            let side = if yes_token == token_id {
                TokenSide::Yes
            } else {
                TokenSide::No
            };
            (market_id, condition_id, side)
        }))
    }

    /// Minimal tick carrying market context for position creation.
    fn context_tick(&self, signal: &Signal, price: f64) -> Tick {
        let row = {
            let conn = self.db.lock();
            let mut stmt = conn
                .prepare_cached(
                    "SELECT condition_id, team_yes, team_no, game_start_time, format
                     FROM markets WHERE market_id = ?1",
                )
                .ok();
            stmt.and_then(|mut s| {
                s.query_row(params![signal.market_id], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, Option<i64>>(3)?,
                        r.get::<_, Option<String>>(4)?,
                    ))
                })
                .ok()
            })
        };
        let (condition_id, team_yes, team_no, game_start, format) = row.unwrap_or((
            String::new(),
            String::new(),
            String::new(),
            None,
            None,
        ));

        Tick {
            market_id: signal.market_id,
            condition_id,
            message_id: format!("signal:{}", signal.id),
            team_yes,
            team_no,
            game_start_time: game_start.map(crate::db::ts_to_datetime),
            format: format.as_deref().and_then(crate::models::MatchFormat::parse),
            market_type: None,
            timestamp: Utc::now(),
            event_kind: EventKind::Trade,
            token_side: signal.token_side,
            price: Some(price),
            best_bid: None,
            best_ask: None,
            spread: None,
            mid_price: Some(price),
            trade_size: None,
            trade_side: Some(signal.side),
            price_velocity_1m: None,
            yes_token_id: None,
            no_token_id: None,
            actual_yes_mid: None,
            actual_no_mid: None,
        }
    }

    // =========================================================================
    // Order row bookkeeping
    // =========================================================================

    fn insert_order_row(&self, signal: &Signal, limit_price: f64, size_usd: f64) -> Result<i64> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO orders
             (signal_id, is_paper, token_id, side, order_type, limit_price, size_usd, status,
              submitted_at)
             VALUES (?1, 0, ?2, ?3, 'limit', ?4, ?5, 'pending', ?6)",
            params![
                &signal.id,
                &signal.token_id,
                signal.side.as_str(),
                round_price(limit_price),
                round_money(size_usd),
                Utc::now().timestamp(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn mark_order_submitted(
        &self,
        order_row_id: i64,
        exchange_order_id: &str,
        limit_price: f64,
    ) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE orders SET status = 'submitted', exchange_order_id = ?2, limit_price = ?3
             WHERE id = ?1",
            params![order_row_id, exchange_order_id, round_price(limit_price)],
        )?;
        Ok(())
    }

    fn mark_order_failed(&self, order_row_id: i64, message: &str) -> Result<()> {
        self.update_order_status(order_row_id, "failed", message)
    }

    fn update_order_status(&self, order_row_id: i64, status: &str, message: &str) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE orders SET status = ?2, status_message = ?3 WHERE id = ?1",
            params![order_row_id, status, message],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::StateManager;
    use crate::models::OrderSide;
    use base64::Engine;

    fn fixture() -> (Db, PositionStore) {
        let db = Db::open_in_memory().unwrap();
        let state = StateManager::new(db.clone());
        (db.clone(), PositionStore::new(db, state))
    }

    fn executor_with(db: Db, positions: PositionStore) -> LiveExecutor {
        let creds = crate::exchange::orders::ExchangeCredentials {
            api_key: "k".into(),
            secret: base64::engine::general_purpose::STANDARD.encode(b"secret"),
            passphrase: "p".into(),
            wallet_address: "0xw".into(),
        };
        let client = Arc::new(OrderClient::new(creds, None).unwrap());
        let market_data = Arc::new(MarketDataClient::new());
        let safety = SafetyChecker::new(db.clone(), Default::default());
        LiveExecutor::new(db, positions, client, market_data, safety)
    }

    fn seed_market(db: &Db, market_id: i64) {
        let conn = db.lock();
        conn.execute(
            "INSERT INTO markets (market_id, condition_id, yes_token_id, no_token_id, question,
             team_yes, team_no, format, market_type)
             VALUES (?1, ?2, ?3, ?4, 'A vs B', 'A', 'B', 'BO3', 'moneyline')",
            params![
                market_id,
                format!("0xc{market_id}"),
                format!("yes-{market_id}"),
                format!("no-{market_id}"),
            ],
        )
        .unwrap();
    }

    #[test]
    fn settle_fill_creates_order_update_and_position() {
        let (db, positions) = fixture();
        seed_market(&db, 9);
        let exec = executor_with(db.clone(), positions.clone());

        let mut signal = Signal::new("live_test", 9, "yes-9", TokenSide::Yes, OrderSide::Buy);
        signal.price_at_signal = Some(0.42);
        let order_row_id = exec.insert_order_row(&signal, 0.42, 21.0).unwrap();

        // Scenario: wallet reports 50 shares at 0.4201 from a lost response.
        let outcome = exec
            .settle_fill(&signal, order_row_id, 0.4201, 50.0, "detected from wallet")
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.executed_shares, Some(50.0));

        let conn = db.lock();
        let (status, price, shares): (String, f64, f64) = conn
            .query_row(
                "SELECT status, executed_price, filled_shares FROM orders WHERE id = ?1",
                params![order_row_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(status, "filled");
        assert!((price - 0.4201).abs() < 1e-9);
        assert_eq!(shares, 50.0);

        let trade_reason: String = conn
            .query_row(
                "SELECT trigger_tick_id FROM executor_trades WHERE order_id = ?1",
                params![order_row_id],
                |r| r.get(0),
            )
            .unwrap();
        assert!(trade_reason.starts_with("signal:"));
        drop(conn);

        // Exactly one position, no second order placed.
        let pos = positions
            .state()
            .get_position("live_test", 9, Some(TokenSide::Yes))
            .unwrap()
            .unwrap();
        assert_eq!(pos.remaining_shares, 50.0);
        assert!((pos.avg_entry_price - 0.4201).abs() < 1e-9);
    }

    #[test]
    fn lookup_market_resolves_token_side() {
        let (db, positions) = fixture();
        seed_market(&db, 3);
        let exec = executor_with(db, positions);

        let (market_id, condition_id, side) =
            exec.lookup_market_for_token("no-3").unwrap().unwrap();
        assert_eq!(market_id, 3);
        assert_eq!(condition_id, "0xc3");
        assert_eq!(side, TokenSide::No);
        assert!(exec.lookup_market_for_token("unknown").unwrap().is_none());
    }

    #[test]
    fn order_row_lifecycle_updates() {
        let (db, positions) = fixture();
        seed_market(&db, 4);
        let exec = executor_with(db.clone(), positions);

        let signal = Signal::new("s", 4, "yes-4", TokenSide::Yes, OrderSide::Buy);
        let id = exec.insert_order_row(&signal, 0.50, 10.0).unwrap();
        exec.mark_order_submitted(id, "exch-1", 0.501).unwrap();
        exec.mark_order_failed(id, "price moved").unwrap();

        let conn = db.lock();
        let (status, exchange_id, message): (String, String, String) = conn
            .query_row(
                "SELECT status, exchange_order_id, status_message FROM orders WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(status, "failed");
        assert_eq!(exchange_id, "exch-1");
        assert!(message.contains("price moved"));
    }
}
