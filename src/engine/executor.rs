//! Paper executor.
//!
//! Turns a strategy `Action` into a simulated fill against the current book
//! state and drives the position store. The fill model crosses the spread
//! (BUY at ask, SELL at bid), estimates the spread from price level when the
//! book is missing or garbage, and adds a small size impact. Deterministic
//! for a given (base price, bid, ask, size, side) so runs are reproducible.

use tracing::{info, warn};

use crate::book::Tick;
use crate::engine::positions::{PositionStore, SpreadType, TradeContext};
use crate::engine::state::StateManager;
use crate::engine::strategy::{Action, ActionType};
use crate::models::{OrderSide, TokenSide};

/// 0.1% additional slippage per $100 of notional.
pub const SIZE_IMPACT: f64 = 0.001;

/// Fills are clamped to this band; slightly wider than [0.01, 0.99] so
/// near-resolution exits can still print.
pub const MIN_FILL: f64 = 0.001;
pub const MAX_FILL: f64 = 0.999;

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub fill_price: Option<f64>,
    pub shares_filled: Option<f64>,
    pub cost_usd: Option<f64>,
    pub slippage: Option<f64>,
    pub position_id: Option<i64>,
    pub spread_id: Option<i64>,
    pub error: Option<String>,
}

impl ExecutionResult {
    fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            fill_price: None,
            shares_filled: None,
            cost_usd: None,
            slippage: None,
            position_id: None,
            spread_id: None,
            error: Some(error.into()),
        }
    }

    fn ok() -> Self {
        Self {
            success: true,
            fill_price: None,
            shares_filled: None,
            cost_usd: None,
            slippage: None,
            position_id: None,
            spread_id: None,
            error: None,
        }
    }
}

/// Result of the fill model: the price plus the effective book it assumed.
#[derive(Debug, Clone, Copy)]
pub struct Fill {
    pub price: f64,
    pub slippage: f64,
    pub effective_spread: f64,
    pub effective_bid: Option<f64>,
    pub effective_ask: Option<f64>,
}

/// Estimated bid-ask spread as a function of price level.
///
/// Fallback used when the book carries no usable spread. Markets near 0 or 1
/// trade far wider than mid-range ones; observed levels:
/// 45-55% ~2.5%, 35-65% ~4%, 25-75% ~6%, 18-82% ~10%, 10-90% ~18%,
/// 5-95% ~30%, 2-98% ~45%, beyond that ~60%.
pub fn price_level_spread(price: f64) -> f64 {
    let distance = (price - 0.5).abs();
    if distance <= 0.05 {
        0.025
    } else if distance <= 0.15 {
        0.04
    } else if distance <= 0.25 {
        0.06
    } else if distance <= 0.32 {
        0.10
    } else if distance <= 0.40 {
        0.18
    } else if distance <= 0.45 {
        0.30
    } else if distance <= 0.48 {
        0.45
    } else {
        0.60
    }
}

/// Validate an observed spread; None forces the price-level model.
pub fn validate_spread(spread: Option<f64>, price: f64) -> Option<f64> {
    let spread = spread?;
    if spread < 0.0 || spread >= 1.0 {
        return None;
    }
    // Dramatically wider than the price-level estimate means bad data.
    if spread > price_level_spread(price) * 3.0 {
        return None;
    }
    Some(spread)
}

/// Simulate a fill by crossing the spread.
///
/// BUY executes at best ask (or base + half the effective spread when the
/// book is empty); SELL at best bid (or base - half). Size impact is added
/// in the direction of execution and the result clamped to the valid band.
pub fn calculate_fill(
    base_price: f64,
    best_ask: Option<f64>,
    best_bid: Option<f64>,
    spread: Option<f64>,
    size_usd: f64,
    side: OrderSide,
) -> Fill {
    let effective_spread =
        validate_spread(spread, base_price).unwrap_or_else(|| price_level_spread(base_price));

    let mut effective_bid = best_bid;
    let mut effective_ask = best_ask;

    let mut fill_price = match side {
        OrderSide::Buy => match best_ask {
            Some(ask) if ask > 0.0 => ask,
            _ => {
                let ask = base_price + effective_spread / 2.0;
                effective_ask = Some(ask);
                effective_bid = Some(base_price - effective_spread / 2.0);
                ask
            }
        },
        OrderSide::Sell => match best_bid {
            Some(bid) if bid > 0.0 => bid,
            _ => {
                let bid = base_price - effective_spread / 2.0;
                effective_bid = Some(bid);
                effective_ask = Some(base_price + effective_spread / 2.0);
                bid
            }
        },
    };

    let size_impact = (size_usd / 100.0) * SIZE_IMPACT;
    match side {
        OrderSide::Buy => fill_price *= 1.0 + size_impact,
        OrderSide::Sell => fill_price *= 1.0 - size_impact,
    }

    fill_price = fill_price.clamp(MIN_FILL, MAX_FILL);

    let slippage = if base_price > 0.0 {
        (fill_price - base_price).abs() / base_price
    } else {
        0.0
    };

    Fill {
        price: fill_price,
        slippage,
        effective_spread,
        effective_bid,
        effective_ask,
    }
}

#[derive(Clone)]
pub struct PaperExecutor {
    positions: PositionStore,
}

impl PaperExecutor {
    pub fn new(positions: PositionStore) -> Self {
        Self { positions }
    }

    fn state(&self) -> &StateManager {
        self.positions.state()
    }

    pub fn execute(&self, action: &Action, tick: &Tick) -> ExecutionResult {
        let result = match action.action_type {
            ActionType::OpenLong => self.execute_open_long(action, tick),
            ActionType::OpenSpread => self.execute_open_spread(action, tick),
            ActionType::Close => self.execute_close(action, tick),
            ActionType::PartialClose => self.execute_partial_close(action, tick),
            ActionType::Add => self.execute_add(action, tick),
            ActionType::Rebalance => {
                ExecutionResult::fail("REBALANCE executes as paired partial_close + add")
            }
        };
        if let Some(ref err) = result.error {
            warn!(
                strategy = %action.strategy_name,
                action = %action.action_type.as_str(),
                error = %err,
                "execution failed"
            );
        }
        result
    }

    /// Ask for `side` as seen by this tick. When the tick quotes the other
    /// token, the complement of its bid approximates this side's ask.
    fn side_ask(tick: &Tick, side: TokenSide) -> Option<f64> {
        if tick.token_side == side {
            tick.best_ask
        } else {
            tick.best_bid.map(|b| 1.0 - b)
        }
    }

    fn side_bid(tick: &Tick, side: TokenSide) -> Option<f64> {
        if tick.token_side == side {
            tick.best_bid
        } else {
            None
        }
    }

    fn execute_open_long(&self, action: &Action, tick: &Tick) -> ExecutionResult {
        let Some(side) = action.token_side else {
            return ExecutionResult::fail("token_side required for OPEN_LONG");
        };
        let Some(size_usd) = action.size_usd else {
            return ExecutionResult::fail("size_usd required for OPEN_LONG");
        };
        let Some(token_id) = tick.token_id_for(side).map(str::to_string) else {
            return ExecutionResult::fail(format!("no token id for {}", side.as_str()));
        };
        let Some(base_price) = tick.side_price(side) else {
            return ExecutionResult::fail(format!("no price for {}", side.as_str()));
        };

        let fill = calculate_fill(
            base_price,
            Self::side_ask(tick, side),
            None,
            tick.spread,
            size_usd,
            OrderSide::Buy,
        );
        let shares = size_usd / fill.price;
        let cost = shares * fill.price;

        if !self.state().has_capacity(&action.strategy_name, cost) {
            return ExecutionResult::fail("insufficient capital");
        }

        let ctx = TradeContext {
            tick,
            is_paper: true,
            order_id: None,
            slippage: fill.slippage,
            effective_bid: fill.effective_bid,
            effective_ask: fill.effective_ask,
            effective_spread: Some(fill.effective_spread),
            fee_usd: 0.0,
        };
        match self.positions.open_position(
            &action.strategy_name,
            action.market_id,
            &action.condition_id,
            &token_id,
            side,
            shares,
            fill.price,
            tick,
            Some(&ctx),
        ) {
            Ok(pos) => {
                info!(
                    strategy = %action.strategy_name,
                    side = %side.as_str(),
                    price = %format!("{:.4}", fill.price),
                    shares = %format!("{shares:.2}"),
                    cost = %format!("{cost:.2}"),
                    slippage = %format!("{:.4}", fill.slippage),
                    "OPEN_LONG executed"
                );
                ExecutionResult {
                    fill_price: Some(fill.price),
                    shares_filled: Some(shares),
                    cost_usd: Some(cost),
                    slippage: Some(fill.slippage),
                    position_id: Some(pos.id),
                    ..ExecutionResult::ok()
                }
            }
            Err(e) => ExecutionResult::fail(e.to_string()),
        }
    }

    fn execute_open_spread(&self, action: &Action, tick: &Tick) -> ExecutionResult {
        let (Some(yes_size), Some(no_size)) = (action.yes_size_usd, action.no_size_usd) else {
            return ExecutionResult::fail("yes_size_usd and no_size_usd required for OPEN_SPREAD");
        };
        let (Some(yes_token), Some(no_token)) = (
            tick.yes_token_id.clone(),
            tick.no_token_id.clone(),
        ) else {
            return ExecutionResult::fail("missing token ids");
        };
        let (Some(yes_price), Some(no_price)) = (tick.yes_price(), tick.no_price()) else {
            return ExecutionResult::fail("missing prices");
        };

        let yes_fill = calculate_fill(
            yes_price,
            if tick.token_side == TokenSide::Yes {
                tick.best_ask
            } else {
                None
            },
            None,
            tick.spread,
            yes_size,
            OrderSide::Buy,
        );
        let no_fill = calculate_fill(
            no_price,
            if tick.token_side == TokenSide::No {
                tick.best_ask
            } else {
                None
            },
            None,
            tick.spread,
            no_size,
            OrderSide::Buy,
        );

        let yes_shares = yes_size / yes_fill.price;
        let no_shares = no_size / no_fill.price;
        let total_cost = yes_shares * yes_fill.price + no_shares * no_fill.price;

        if !self.state().has_capacity(&action.strategy_name, total_cost) {
            return ExecutionResult::fail("insufficient capital");
        }

        let yes_ctx = TradeContext {
            tick,
            is_paper: true,
            order_id: None,
            slippage: yes_fill.slippage,
            effective_bid: yes_fill.effective_bid,
            effective_ask: yes_fill.effective_ask,
            effective_spread: Some(yes_fill.effective_spread),
            fee_usd: 0.0,
        };
        let no_ctx = TradeContext {
            tick,
            is_paper: true,
            order_id: None,
            slippage: no_fill.slippage,
            effective_bid: no_fill.effective_bid,
            effective_ask: no_fill.effective_ask,
            effective_spread: Some(no_fill.effective_spread),
            fee_usd: 0.0,
        };

        match self.positions.open_spread(
            &action.strategy_name,
            action.market_id,
            &action.condition_id,
            &yes_token,
            &no_token,
            yes_shares,
            yes_fill.price,
            no_shares,
            no_fill.price,
            tick,
            SpreadType::Scalp,
            Some((&yes_ctx, &no_ctx)),
        ) {
            Ok(spread) => {
                info!(
                    strategy = %action.strategy_name,
                    yes = %format!("{:.4}x{:.2}", yes_fill.price, yes_shares),
                    no = %format!("{:.4}x{:.2}", no_fill.price, no_shares),
                    total = %format!("{total_cost:.2}"),
                    "OPEN_SPREAD executed"
                );
                ExecutionResult {
                    fill_price: Some(yes_fill.price),
                    shares_filled: Some(yes_shares + no_shares),
                    cost_usd: Some(total_cost),
                    slippage: Some((yes_fill.slippage + no_fill.slippage) / 2.0),
                    spread_id: Some(spread.id),
                    ..ExecutionResult::ok()
                }
            }
            Err(e) => ExecutionResult::fail(e.to_string()),
        }
    }

    fn execute_close(&self, action: &Action, tick: &Tick) -> ExecutionResult {
        let strategy = &action.strategy_name;

        // Without an explicit side, a spread close takes precedence so both
        // legs go out together.
        if action.token_side.is_none() {
            if let Ok(Some(spread)) = self.state().get_spread(strategy, action.market_id) {
                return self.close_spread_holding(action, tick, spread.id);
            }
        }

        let position = match self
            .state()
            .get_position(strategy, action.market_id, action.token_side)
        {
            Ok(Some(p)) => p,
            Ok(None) => return ExecutionResult::fail("no position found to close"),
            Err(e) => return ExecutionResult::fail(e.to_string()),
        };

        if position.spread_id.is_some() {
            if let Ok(Some(spread)) = self.state().get_spread(strategy, action.market_id) {
                return self.close_spread_holding(action, tick, spread.id);
            }
        }

        let Some(base_price) = tick.side_price(position.token_side) else {
            return ExecutionResult::fail("no price available for exit");
        };
        let exit_value = position.remaining_shares * base_price;
        let fill = calculate_fill(
            base_price,
            None,
            Self::side_bid(tick, position.token_side),
            tick.spread,
            exit_value,
            OrderSide::Sell,
        );

        let ctx = TradeContext {
            tick,
            is_paper: true,
            order_id: None,
            slippage: fill.slippage,
            effective_bid: fill.effective_bid,
            effective_ask: fill.effective_ask,
            effective_spread: Some(fill.effective_spread),
            fee_usd: 0.0,
        };
        let reason = if action.reason.is_empty() {
            "strategy_close"
        } else {
            &action.reason
        };
        match self
            .positions
            .close_position_with_trade(position.id, fill.price, reason, Some(&ctx))
        {
            Ok(closed) => ExecutionResult {
                fill_price: Some(fill.price),
                shares_filled: Some(position.remaining_shares),
                cost_usd: Some(position.remaining_shares * fill.price),
                slippage: Some(fill.slippage),
                position_id: Some(closed.id),
                ..ExecutionResult::ok()
            },
            Err(e) => ExecutionResult::fail(e.to_string()),
        }
    }

    fn execute_partial_close(&self, action: &Action, tick: &Tick) -> ExecutionResult {
        let Some(close_pct) = action.close_pct else {
            return ExecutionResult::fail("close_pct required for PARTIAL_CLOSE");
        };

        let position = match self.state().get_position(
            &action.strategy_name,
            action.market_id,
            action.token_side,
        ) {
            Ok(Some(p)) => p,
            Ok(None) => return ExecutionResult::fail("no position found for partial close"),
            Err(e) => return ExecutionResult::fail(e.to_string()),
        };

        let Some(base_price) = tick.side_price(position.token_side) else {
            return ExecutionResult::fail("no price available for exit");
        };
        let shares_to_close = position.remaining_shares * close_pct;
        let fill = calculate_fill(
            base_price,
            None,
            Self::side_bid(tick, position.token_side),
            tick.spread,
            shares_to_close * base_price,
            OrderSide::Sell,
        );

        let ctx = TradeContext {
            tick,
            is_paper: true,
            order_id: None,
            slippage: fill.slippage,
            effective_bid: fill.effective_bid,
            effective_ask: fill.effective_ask,
            effective_spread: Some(fill.effective_spread),
            fee_usd: 0.0,
        };
        let reason = if action.reason.is_empty() {
            "partial_exit"
        } else {
            &action.reason
        };
        match self.positions.partial_close_with_trade(
            position.id,
            close_pct,
            fill.price,
            reason,
            Some(&ctx),
        ) {
            Ok((updated, _leg)) => ExecutionResult {
                fill_price: Some(fill.price),
                shares_filled: Some(shares_to_close),
                cost_usd: Some(shares_to_close * fill.price),
                slippage: Some(fill.slippage),
                position_id: Some(updated.id),
                ..ExecutionResult::ok()
            },
            Err(e) => ExecutionResult::fail(e.to_string()),
        }
    }

    fn execute_add(&self, action: &Action, tick: &Tick) -> ExecutionResult {
        let Some(add_size) = action.add_size_usd else {
            return ExecutionResult::fail("add_size_usd required for ADD");
        };

        let position = match self.state().get_position(
            &action.strategy_name,
            action.market_id,
            action.token_side,
        ) {
            Ok(Some(p)) => p,
            Ok(None) => return ExecutionResult::fail("no position found to add to"),
            Err(e) => return ExecutionResult::fail(e.to_string()),
        };

        let Some(base_price) = tick.side_price(position.token_side) else {
            return ExecutionResult::fail("no price available for add");
        };
        let fill = calculate_fill(
            base_price,
            Self::side_ask(tick, position.token_side),
            None,
            tick.spread,
            add_size,
            OrderSide::Buy,
        );
        let shares = add_size / fill.price;

        let ctx = TradeContext {
            tick,
            is_paper: true,
            order_id: None,
            slippage: fill.slippage,
            effective_bid: fill.effective_bid,
            effective_ask: fill.effective_ask,
            effective_spread: Some(fill.effective_spread),
            fee_usd: 0.0,
        };
        match self
            .positions
            .add_to_position(position.id, shares, fill.price, Some(&ctx))
        {
            Ok((updated, _leg)) => ExecutionResult {
                fill_price: Some(fill.price),
                shares_filled: Some(shares),
                cost_usd: Some(shares * fill.price),
                slippage: Some(fill.slippage),
                position_id: Some(updated.id),
                ..ExecutionResult::ok()
            },
            Err(e) => ExecutionResult::fail(e.to_string()),
        }
    }

    fn close_spread_holding(
        &self,
        action: &Action,
        tick: &Tick,
        spread_id: i64,
    ) -> ExecutionResult {
        let (Some(yes_price), Some(no_price)) = (tick.yes_price(), tick.no_price()) else {
            return ExecutionResult::fail("missing prices for spread close");
        };

        let yes_fill = calculate_fill(
            yes_price,
            None,
            Self::side_bid(tick, TokenSide::Yes),
            tick.spread,
            50.0,
            OrderSide::Sell,
        );
        let no_fill = calculate_fill(
            no_price,
            None,
            Self::side_bid(tick, TokenSide::No),
            tick.spread,
            50.0,
            OrderSide::Sell,
        );

        let reason = if action.reason.is_empty() {
            "spread_close"
        } else {
            &action.reason
        };
        match self
            .positions
            .close_spread(spread_id, yes_fill.price, no_fill.price, reason)
        {
            Ok(spread) => ExecutionResult {
                fill_price: Some(yes_fill.price),
                spread_id: Some(spread.id),
                ..ExecutionResult::ok()
            },
            Err(e) => ExecutionResult::fail(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::EventKind;
    use crate::db::Db;
    use crate::engine::positions::PositionStatus;
    use crate::models::{MarketType, MatchFormat};
    use chrono::Utc;

    fn tick(market_id: i64, yes_mid: f64, no_mid: f64) -> Tick {
        Tick {
            market_id,
            condition_id: format!("0xc{market_id}"),
            message_id: format!("m-{market_id}"),
            team_yes: "A".to_string(),
            team_no: "B".to_string(),
            game_start_time: Some(Utc::now()),
            format: Some(MatchFormat::Bo3),
            market_type: Some(MarketType::Moneyline),
            timestamp: Utc::now(),
            event_kind: EventKind::Trade,
            token_side: TokenSide::Yes,
            price: Some(yes_mid),
            best_bid: Some(yes_mid - 0.01),
            best_ask: Some(yes_mid + 0.01),
            spread: Some(0.02),
            mid_price: Some(yes_mid),
            trade_size: None,
            trade_side: None,
            price_velocity_1m: None,
            yes_token_id: Some(format!("yes-{market_id}")),
            no_token_id: Some(format!("no-{market_id}")),
            actual_yes_mid: Some(yes_mid),
            actual_no_mid: Some(no_mid),
        }
    }

    fn executor() -> (PaperExecutor, PositionStore, Db) {
        let db = Db::open_in_memory().unwrap();
        let state = StateManager::new(db.clone());
        let store = PositionStore::new(db.clone(), state);
        (PaperExecutor::new(store.clone()), store, db)
    }

    #[test]
    fn spread_heuristic_widens_toward_extremes() {
        assert_eq!(price_level_spread(0.50), 0.025);
        assert_eq!(price_level_spread(0.30), 0.06);
        assert_eq!(price_level_spread(0.08), 0.30);
        assert_eq!(price_level_spread(0.99), 0.60);
        // Monotone in distance from mid.
        let mut last = 0.0;
        for p in [0.5, 0.4, 0.3, 0.2, 0.1, 0.05, 0.02, 0.005] {
            let s = price_level_spread(p);
            assert!(s >= last);
            last = s;
        }
    }

    #[test]
    fn spread_validation_rejects_garbage() {
        assert_eq!(validate_spread(Some(0.02), 0.5), Some(0.02));
        assert_eq!(validate_spread(Some(-0.01), 0.5), None);
        assert_eq!(validate_spread(Some(1.0), 0.5), None);
        // 3x the 2.5% heuristic at mid = 7.5%; 10% is rejected.
        assert_eq!(validate_spread(Some(0.10), 0.5), None);
        assert_eq!(validate_spread(None, 0.5), None);
    }

    #[test]
    fn buy_crosses_to_ask_with_size_impact() {
        // $20 crossing a 0.51 ask picks up 2 bps of size impact.
        let fill = calculate_fill(0.50, Some(0.51), None, Some(0.02), 20.0, OrderSide::Buy);
        assert!((fill.price - 0.510102).abs() < 1e-6);
        let shares = 20.0 / fill.price;
        assert!((shares - 39.21).abs() < 0.01);
    }

    #[test]
    fn sell_crosses_to_bid() {
        let fill = calculate_fill(0.62, None, Some(0.61), Some(0.02), 10.0, OrderSide::Sell);
        assert!(fill.price < 0.61 + 1e-9);
        assert!(fill.price > 0.60);
    }

    #[test]
    fn missing_book_uses_half_spread_estimate() {
        let fill = calculate_fill(0.50, None, None, None, 0.0, OrderSide::Buy);
        // Heuristic spread at mid is 2.5%; BUY fills at base + half.
        assert!((fill.price - 0.5125).abs() < 1e-9);
        assert_eq!(fill.effective_ask, Some(0.5125));
        assert_eq!(fill.effective_bid, Some(0.4875));
    }

    #[test]
    fn fill_is_deterministic() {
        let a = calculate_fill(0.42, Some(0.43), None, Some(0.02), 35.0, OrderSide::Buy);
        let b = calculate_fill(0.42, Some(0.43), None, Some(0.02), 35.0, OrderSide::Buy);
        assert_eq!(a.price, b.price);
        assert_eq!(a.slippage, b.slippage);
    }

    #[test]
    fn fill_clamps_at_band_edges() {
        // 0.999 ask plus positive size impact stays at 0.999.
        let fill = calculate_fill(0.995, Some(0.999), None, None, 500.0, OrderSide::Buy);
        assert_eq!(fill.price, MAX_FILL);
        let fill = calculate_fill(0.004, None, Some(0.001), None, 500.0, OrderSide::Sell);
        assert_eq!(fill.price, MIN_FILL);
    }

    #[test]
    fn open_long_creates_position_order_and_trade() {
        let (exec, store, db) = executor();
        let t = tick(1, 0.50, 0.50);
        let action = Action::open_long(1, "0xc1", "s", TokenSide::Yes, 20.0).with_reason("entry");
        let result = exec.execute(&action, &t);
        assert!(result.success, "error: {:?}", result.error);
        assert!((result.fill_price.unwrap() - 0.510102).abs() < 1e-6);

        let pos = store.get(result.position_id.unwrap()).unwrap().unwrap();
        assert_eq!(pos.status, PositionStatus::Open);

        // Order + trade rows landed in the same transaction as the position.
        let conn = db.lock();
        let orders: i64 = conn
            .query_row("SELECT COUNT(*) FROM orders WHERE status = 'filled'", [], |r| r.get(0))
            .unwrap();
        let trades: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM executor_trades WHERE order_id IS NOT NULL",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(orders, 1);
        assert_eq!(trades, 1);
    }

    #[test]
    fn scalp_happy_path_partial_close() {
        let (exec, store, _db) = executor();
        let t = tick(42, 0.50, 0.50);
        let open = Action::open_spread(42, "0xc42", "scalp", 20.0, 20.0);
        let result = exec.execute(&open, &t);
        assert!(result.success, "error: {:?}", result.error);

        // YES moved to 0.62; sell half the YES leg at its bid.
        let mut t2 = tick(42, 0.62, 0.39);
        t2.best_bid = Some(0.62);
        t2.best_ask = Some(0.64);
        let close = Action::partial_close(42, "0xc42", "scalp", TokenSide::Yes, 0.5);
        let result = exec.execute(&close, &t2);
        assert!(result.success, "error: {:?}", result.error);

        let yes = store
            .state()
            .get_position("scalp", 42, Some(TokenSide::Yes))
            .unwrap()
            .unwrap();
        assert_eq!(yes.status, PositionStatus::Partial);
        assert!((yes.remaining_shares - 19.6).abs() < 0.05);
        // Roughly (0.62 - 0.5101) * 19.6 minus sell-side slippage.
        assert!(yes.realized_pnl > 1.8 && yes.realized_pnl < 2.4);
    }

    #[test]
    fn close_without_side_closes_whole_spread() {
        let (exec, store, _db) = executor();
        let t = tick(7, 0.50, 0.50);
        let result = exec.execute(&Action::open_spread(7, "0xc7", "s", 20.0, 20.0), &t);
        let spread_id = result.spread_id.unwrap();

        let t2 = tick(7, 0.70, 0.31);
        let close = Action::new(ActionType::Close, 7, "0xc7", "s");
        let result = exec.execute(&close, &t2);
        assert!(result.success, "error: {:?}", result.error);

        let spread = store.get_spread_by_id(spread_id).unwrap().unwrap();
        assert_eq!(
            spread.status,
            crate::engine::positions::SpreadStatus::Closed
        );
    }

    #[test]
    fn partial_close_without_position_fails_cleanly() {
        let (exec, _store, _db) = executor();
        let t = tick(1, 0.50, 0.50);
        let close = Action::partial_close(1, "0xc1", "s", TokenSide::Yes, 0.5);
        let result = exec.execute(&close, &t);
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no position"));
    }
}
