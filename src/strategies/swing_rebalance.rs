//! Swing rebalance strategy.
//!
//! Enters a balanced spread around game start, then extracts profit on
//! 15-point swings inside a 5-minute lookback: sell half the appreciated
//! side (only when it trades 15+ points above its cost basis), and reinvest
//! the freed cost basis into the opposite side on the next tick. A 3-minute
//! cooldown and a 30%-of-total floor on either side bound the churn. No
//! explicit exit - the book rides to resolution.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::book::Tick;
use crate::engine::state::StateManager;
use crate::engine::strategy::{Action, Holding, Strategy, StrategyParams};
use crate::models::{MarketType, MatchFormat, TokenSide};

const ENTRY_MINUTES_MIN: f64 = -30.0;
const ENTRY_MINUTES_MAX: f64 = 15.0;
const ENTRY_PRICE_MIN: f64 = 0.40;
const ENTRY_PRICE_MAX: f64 = 0.60;
const EXTREME_PRICE_MIN: f64 = 0.10;
const EXTREME_PRICE_MAX: f64 = 0.90;
const POSITION_SIZE_USD: f64 = 20.0;

const TRIGGER_POINTS: f64 = 0.15;
const MIN_PROFIT_POINTS: f64 = 0.15;
const SELL_PCT: f64 = 0.50;
const MIN_HOLDING_PCT: f64 = 0.30;
const COOLDOWN_MINUTES: f64 = 3.0;
const LOOKBACK_MINUTES: f64 = 5.0;
const PRICE_HISTORY_CAP: usize = 300;

#[derive(Debug, Clone)]
struct PendingBuy {
    side: TokenSide,
    size_usd: f64,
}

struct MarketState {
    skipped: bool,
    price_history: VecDeque<(DateTime<Utc>, f64)>,
    last_trade_time: DateTime<Utc>,
    rebalance_count: u32,
    pending_buy: Option<PendingBuy>,
}

pub struct SwingRebalanceStrategy {
    params: StrategyParams,
    market_states: HashMap<i64, MarketState>,
}

impl SwingRebalanceStrategy {
    pub fn new() -> Self {
        Self {
            params: StrategyParams {
                formats: vec![MatchFormat::Bo3, MatchFormat::Bo5],
                market_types: vec![MarketType::Moneyline],
                max_position_usd: 100.0,
                max_positions: 5,
                max_spread: 0.05,
                ..StrategyParams::default()
            },
            market_states: HashMap::new(),
        }
    }

    fn push_price(&mut self, market_id: i64, yes_price: f64) {
        if let Some(state) = self.market_states.get_mut(&market_id) {
            if state.skipped {
                return;
            }
            if state.price_history.len() >= PRICE_HISTORY_CAP {
                state.price_history.pop_front();
            }
            state.price_history.push_back((Utc::now(), yes_price));
        }
    }

    fn oldest_price_in_window(history: &VecDeque<(DateTime<Utc>, f64)>) -> Option<f64> {
        let cutoff = Utc::now() - Duration::milliseconds((LOOKBACK_MINUTES * 60_000.0) as i64);
        history
            .iter()
            .find(|(ts, _)| *ts >= cutoff)
            .map(|(_, price)| *price)
    }

    /// Max shares sellable while the sold side keeps at least `min_pct` of
    /// total holdings value, assuming the proceeds' cost basis lands on the
    /// other side. Solved by bisection; 5% safety buffer on the result.
    fn max_sellable(
        sell_shares: f64,
        sell_price: f64,
        sell_cost: f64,
        other_value: f64,
        min_pct: f64,
    ) -> f64 {
        if sell_shares <= 0.0 || sell_price <= 0.0 {
            return 0.0;
        }
        let cost = sell_cost.max(0.01);
        let other = other_value.max(0.0);

        let (mut low, mut high) = (0.0_f64, sell_shares);
        for _ in 0..20 {
            let x = (low + high) / 2.0;
            let new_sell_value = (sell_shares - x) * sell_price;
            let new_total = new_sell_value + other + x * cost;
            let pct = if new_total > 0.0 {
                new_sell_value / new_total
            } else {
                0.0
            };
            if pct >= min_pct {
                low = x;
            } else {
                high = x;
            }
        }
        low * 0.95
    }

    fn rebalance_action(
        &mut self,
        tick: &Tick,
        sell_side: TokenSide,
        sell_shares_held: f64,
        sell_price: f64,
        sell_cost: f64,
        other_value: f64,
        price_move: f64,
    ) -> Option<Action> {
        if sell_shares_held <= 0.0 {
            return None;
        }

        let max_sell = Self::max_sellable(
            sell_shares_held,
            sell_price,
            sell_cost,
            other_value,
            MIN_HOLDING_PCT,
        );
        if max_sell <= 0.0 {
            debug!(side = %sell_side.as_str(), "rebalance skipped: would breach holding floor");
            return None;
        }

        let sell_shares = (sell_shares_held * SELL_PCT).min(max_sell);
        if sell_shares < 0.1 {
            return None;
        }

        let profit = sell_shares * (sell_price - sell_cost);
        let reinvest = sell_shares * sell_cost;
        if reinvest < 1.0 {
            return None;
        }

        info!(
            side = %sell_side.as_str(),
            move_pts = %format!("{price_move:+.2}"),
            sell = %format!("{sell_shares:.2}@{sell_price:.4}"),
            profit = %format!("{profit:.2}"),
            reinvest = %format!("{reinvest:.2}"),
            "swing rebalance"
        );

        let state = self.market_states.get_mut(&tick.market_id)?;
        state.last_trade_time = Utc::now();
        state.rebalance_count += 1;
        state.pending_buy = Some(PendingBuy {
            side: sell_side.opposite(),
            size_usd: reinvest,
        });

        let close_pct = (sell_shares / sell_shares_held).clamp(0.01, 0.99);
        Some(
            Action::partial_close(
                tick.market_id,
                &tick.condition_id,
                self.name(),
                sell_side,
                close_pct,
            )
            .with_reason(format!(
                "swing {price_move:+.2}, profit ${profit:.2}, reinvest ${reinvest:.2}"
            ))
            .with_trigger(tick.yes_price().unwrap_or(sell_price)),
        )
    }
}

impl Default for SwingRebalanceStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for SwingRebalanceStrategy {
    fn name(&self) -> &'static str {
        "swing_rebalance"
    }

    fn version(&self) -> &'static str {
        "3.0.0"
    }

    fn params(&self) -> &StrategyParams {
        &self.params
    }

    fn on_tick(&mut self, tick: &Tick, state: &StateManager) -> Option<Action> {
        let market_id = tick.market_id;

        if self.market_states.contains_key(&market_id) {
            if let Some(yes) = tick.yes_price() {
                self.push_price(market_id, yes);
            }
            return None;
        }

        let mins = tick.minutes_since_start()?;
        if !(ENTRY_MINUTES_MIN..=ENTRY_MINUTES_MAX).contains(&mins) {
            return None;
        }

        let yes_price = tick.yes_price()?;

        // One-shot skips: remember markets that failed entry conditions so
        // they are not re-evaluated every tick.
        if !(EXTREME_PRICE_MIN..=EXTREME_PRICE_MAX).contains(&yes_price) {
            info!(yes = %format!("{yes_price:.2}"), "skip: near resolution");
            self.market_states.insert(market_id, skipped_state());
            return None;
        }
        match tick.spread {
            Some(spread) if spread <= self.params.max_spread => {}
            _ => {
                info!(spread = ?tick.spread, "skip: spread wide or unknown");
                self.market_states.insert(market_id, skipped_state());
                return None;
            }
        }
        if !(ENTRY_PRICE_MIN..=ENTRY_PRICE_MAX).contains(&yes_price) {
            info!(yes = %format!("{yes_price:.2}"), "skip: outside balanced range");
            self.market_states.insert(market_id, skipped_state());
            return None;
        }

        if tick.yes_token_id.is_none() || tick.no_token_id.is_none() {
            return None;
        }
        if !state.has_capacity(self.name(), POSITION_SIZE_USD * 2.0) {
            return None;
        }

        info!(
            teams = %format!("{} vs {}", tick.team_yes, tick.team_no),
            yes = %format!("{yes_price:.2}"),
            "swing entry"
        );

        let mut market_state = MarketState {
            skipped: false,
            price_history: VecDeque::with_capacity(PRICE_HISTORY_CAP),
            last_trade_time: Utc::now(),
            rebalance_count: 0,
            pending_buy: None,
        };
        market_state.price_history.push_back((Utc::now(), yes_price));
        self.market_states.insert(market_id, market_state);

        Some(
            Action::open_spread(
                market_id,
                &tick.condition_id,
                self.name(),
                POSITION_SIZE_USD,
                POSITION_SIZE_USD,
            )
            .with_reason(format!("swing entry @ {yes_price:.2}"))
            .with_trigger(yes_price),
        )
    }

    fn on_position_update(
        &mut self,
        _holding: &Holding,
        tick: &Tick,
        state: &StateManager,
    ) -> Option<Action> {
        let market_id = tick.market_id;
        if self.market_states.get(&market_id).map_or(true, |s| s.skipped) {
            return None;
        }

        let yes_price = tick.yes_price()?;
        let no_price = tick.no_price().unwrap_or(1.0 - yes_price);
        self.push_price(market_id, yes_price);

        // Phase two of a rebalance: reinvest the freed cost basis.
        if let Some(pending) = self
            .market_states
            .get_mut(&market_id)
            .and_then(|s| s.pending_buy.take())
        {
            if pending.size_usd < 1.0 {
                return None;
            }
            if yes_price <= 0.01 || yes_price >= 0.99 {
                debug!("invalid price for pending buy, dropping");
                return None;
            }
            let buy_price = match pending.side {
                TokenSide::Yes => yes_price,
                TokenSide::No => no_price,
            };
            if buy_price <= 0.01 {
                return None;
            }
            info!(
                side = %pending.side.as_str(),
                size = %format!("{:.2}", pending.size_usd),
                price = %format!("{buy_price:.4}"),
                "reinvesting cost basis"
            );
            return Some(
                Action::add(
                    market_id,
                    &tick.condition_id,
                    self.name(),
                    pending.side,
                    pending.size_usd,
                )
                .with_reason("cost basis reinvest")
                .with_trigger(yes_price),
            );
        }

        // Cooldown between rebalances.
        {
            let ms = self.market_states.get(&market_id)?;
            let elapsed = Utc::now() - ms.last_trade_time;
            if elapsed < Duration::milliseconds((COOLDOWN_MINUTES * 60_000.0) as i64) {
                return None;
            }
        }

        let oldest = {
            let ms = self.market_states.get(&market_id)?;
            Self::oldest_price_in_window(&ms.price_history)?
        };
        let price_change = yes_price - oldest;

        let yes_pos = state
            .get_position(self.name(), market_id, Some(TokenSide::Yes))
            .ok()
            .flatten()?;
        let no_pos = state
            .get_position(self.name(), market_id, Some(TokenSide::No))
            .ok()
            .flatten()?;

        if price_change >= TRIGGER_POINTS {
            // YES spiked; only sell when 15+ points above cost.
            if yes_price < yes_pos.avg_entry_price + MIN_PROFIT_POINTS {
                debug!(
                    yes = %format!("{yes_price:.2}"),
                    cost = %format!("{:.2}", yes_pos.avg_entry_price),
                    "spike without profit, holding"
                );
                return None;
            }
            return self.rebalance_action(
                tick,
                TokenSide::Yes,
                yes_pos.remaining_shares,
                yes_price,
                yes_pos.avg_entry_price,
                no_pos.remaining_shares * no_price,
                price_change,
            );
        }

        if price_change <= -TRIGGER_POINTS {
            // YES crashed, NO spiked.
            if no_price < no_pos.avg_entry_price + MIN_PROFIT_POINTS {
                debug!(
                    no = %format!("{no_price:.2}"),
                    cost = %format!("{:.2}", no_pos.avg_entry_price),
                    "crash without NO profit, holding"
                );
                return None;
            }
            return self.rebalance_action(
                tick,
                TokenSide::No,
                no_pos.remaining_shares,
                no_price,
                no_pos.avg_entry_price,
                yes_pos.remaining_shares * yes_price,
                price_change,
            );
        }

        None
    }
}

fn skipped_state() -> MarketState {
    MarketState {
        skipped: true,
        price_history: VecDeque::new(),
        last_trade_time: Utc::now(),
        rebalance_count: 0,
        pending_buy: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::EventKind;
    use crate::db::Db;
    use crate::engine::positions::{PositionStore, SpreadType};
    use crate::engine::strategy::ActionType;

    fn tick(market_id: i64, yes: f64, minutes_in: i64) -> Tick {
        Tick {
            market_id,
            condition_id: format!("0xc{market_id}"),
            message_id: "m".to_string(),
            team_yes: "A".to_string(),
            team_no: "B".to_string(),
            game_start_time: Some(Utc::now() - Duration::minutes(minutes_in)),
            format: Some(MatchFormat::Bo3),
            market_type: Some(MarketType::Moneyline),
            timestamp: Utc::now(),
            event_kind: EventKind::Periodic,
            token_side: TokenSide::Yes,
            price: Some(yes),
            best_bid: Some(yes - 0.01),
            best_ask: Some(yes + 0.01),
            spread: Some(0.02),
            mid_price: Some(yes),
            trade_size: None,
            trade_side: None,
            price_velocity_1m: None,
            yes_token_id: Some(format!("yes-{market_id}")),
            no_token_id: Some(format!("no-{market_id}")),
            actual_yes_mid: Some(yes),
            actual_no_mid: Some(1.0 - yes),
        }
    }

    fn fixture() -> (StateManager, PositionStore) {
        let db = Db::open_in_memory().unwrap();
        let state = StateManager::new(db.clone());
        (state.clone(), PositionStore::new(db, state))
    }

    fn seed_spread(store: &PositionStore, market_id: i64, yes_price: f64, no_price: f64) -> Holding {
        let t = tick(market_id, yes_price, 5);
        let spread = store
            .open_spread(
                "swing_rebalance",
                market_id,
                &format!("0xc{market_id}"),
                &format!("yes-{market_id}"),
                &format!("no-{market_id}"),
                40.0,
                yes_price,
                40.0,
                no_price,
                &t,
                SpreadType::Scalp,
                None,
            )
            .unwrap();
        Holding::Spread(spread)
    }

    #[test]
    fn enters_balanced_spread_near_start() {
        let (state, _) = fixture();
        let mut strat = SwingRebalanceStrategy::new();
        let action = strat.on_tick(&tick(1, 0.50, 5), &state).unwrap();
        assert_eq!(action.action_type, ActionType::OpenSpread);
    }

    #[test]
    fn unknown_spread_marks_market_skipped() {
        let (state, _) = fixture();
        let mut strat = SwingRebalanceStrategy::new();
        let mut t = tick(1, 0.50, 5);
        t.spread = None;
        assert!(strat.on_tick(&t, &state).is_none());
        // Skipped for good: even a clean tick no longer enters.
        assert!(strat.on_tick(&tick(1, 0.50, 6), &state).is_none());
    }

    #[test]
    fn spike_sells_profitable_side_then_reinvests() {
        let (state, store) = fixture();
        let mut strat = SwingRebalanceStrategy::new();
        strat.on_tick(&tick(7, 0.45, 5), &state);
        let holding = seed_spread(&store, 7, 0.45, 0.55);

        // Age the cooldown and plant an old price in the lookback window.
        {
            let ms = strat.market_states.get_mut(&7).unwrap();
            ms.last_trade_time = Utc::now() - Duration::minutes(10);
            ms.price_history.clear();
            ms.price_history
                .push_back((Utc::now() - Duration::minutes(2), 0.45));
        }

        // YES at 0.63: +18 points in window, 18 above cost. Sell YES half.
        let action = strat
            .on_position_update(&holding, &tick(7, 0.63, 10), &state)
            .unwrap();
        assert_eq!(action.action_type, ActionType::PartialClose);
        assert_eq!(action.token_side, Some(TokenSide::Yes));
        let pct = action.close_pct.unwrap();
        assert!(pct > 0.0 && pct <= 0.5);

        // Next tick executes the queued reinvest into NO.
        let action = strat
            .on_position_update(&holding, &tick(7, 0.63, 10), &state)
            .unwrap();
        assert_eq!(action.action_type, ActionType::Add);
        assert_eq!(action.token_side, Some(TokenSide::No));
        assert!(action.add_size_usd.unwrap() > 1.0);
    }

    #[test]
    fn spike_without_profit_holds() {
        let (state, store) = fixture();
        let mut strat = SwingRebalanceStrategy::new();
        strat.on_tick(&tick(7, 0.50, 5), &state);
        // Entered at 0.55: a move to 0.65 is +15 in window but only +10 over cost.
        let holding = seed_spread(&store, 7, 0.55, 0.45);
        {
            let ms = strat.market_states.get_mut(&7).unwrap();
            ms.last_trade_time = Utc::now() - Duration::minutes(10);
            ms.price_history.clear();
            ms.price_history
                .push_back((Utc::now() - Duration::minutes(2), 0.50));
        }
        assert!(strat
            .on_position_update(&holding, &tick(7, 0.65, 10), &state)
            .is_none());
    }

    #[test]
    fn cooldown_blocks_back_to_back_rebalances() {
        let (state, store) = fixture();
        let mut strat = SwingRebalanceStrategy::new();
        strat.on_tick(&tick(7, 0.45, 5), &state);
        let holding = seed_spread(&store, 7, 0.45, 0.55);
        {
            let ms = strat.market_states.get_mut(&7).unwrap();
            // Fresh last_trade_time: still cooling down.
            ms.price_history.clear();
            ms.price_history
                .push_back((Utc::now() - Duration::minutes(2), 0.45));
        }
        assert!(strat
            .on_position_update(&holding, &tick(7, 0.63, 10), &state)
            .is_none());
    }

    #[test]
    fn holding_floor_limits_sale() {
        // Selling from a tiny other-side book would breach the 30% floor.
        let max = SwingRebalanceStrategy::max_sellable(100.0, 0.60, 0.45, 5.0, MIN_HOLDING_PCT);
        let full = SwingRebalanceStrategy::max_sellable(100.0, 0.60, 0.45, 60.0, MIN_HOLDING_PCT);
        assert!(max < full);
        // Never negative, never the whole book when the floor binds.
        assert!(max >= 0.0);
        assert!(max < 100.0);
    }
}
