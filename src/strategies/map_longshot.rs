//! Map longshot strategy.
//!
//! Detects rapid crashes (15+ points down inside a 5-minute window) on
//! series and map-winner markets, waits one minute for the panic volume to
//! settle, then buys the depressed side if it trades in [0.05, 0.20].
//! Exits on a 20-point rebound from entry. After an exit the same side can
//! re-enter on a fresh crash.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::book::Tick;
use crate::engine::state::StateManager;
use crate::engine::strategy::{Action, Holding, Strategy, StrategyParams};
use crate::models::{MarketType, MatchFormat, TokenSide};

const ENTRY_PRICE_MIN: f64 = 0.05;
const ENTRY_PRICE_MAX: f64 = 0.20;

const DROP_THRESHOLD: f64 = 0.15;
const LOOKBACK_MINUTES: f64 = 5.0;
const ENTRY_COOLDOWN_MINUTES: f64 = 1.0;

const EXIT_JUMP_POINTS: f64 = 0.20;

const POSITION_SIZE_USD: f64 = 15.0;
const PRICE_HISTORY_CAP: usize = 600;

pub struct MapLongshotStrategy {
    params: StrategyParams,
    /// market_id -> (timestamp, yes_price) history for drop detection.
    price_history: HashMap<i64, VecDeque<(DateTime<Utc>, f64)>>,
    /// (market, side) -> when the crash was first seen; entry waits out the
    /// cooldown so the knife has stopped falling.
    drop_detected_at: HashMap<(i64, TokenSide), DateTime<Utc>>,
    /// (market, side) -> entry price for the rebound exit.
    entry_prices: HashMap<(i64, TokenSide), f64>,
    /// (market, side) -> entries taken on this side, for diagnostics.
    trade_counts: HashMap<(i64, TokenSide), u32>,
}

impl MapLongshotStrategy {
    pub fn new() -> Self {
        Self {
            params: StrategyParams {
                formats: vec![MatchFormat::Bo3, MatchFormat::Bo5],
                market_types: vec![MarketType::Moneyline, MarketType::ChildMoneyline],
                max_position_usd: 50.0,
                max_positions: 10,
                max_spread: 0.10,
                // This strategy exists to buy depressed sides.
                min_entry_price: 0.01,
                ..StrategyParams::default()
            },
            price_history: HashMap::new(),
            drop_detected_at: HashMap::new(),
            entry_prices: HashMap::new(),
            trade_counts: HashMap::new(),
        }
    }

    fn push_price(&mut self, market_id: i64, yes_price: f64) {
        let history = self.price_history.entry(market_id).or_default();
        if history.len() >= PRICE_HISTORY_CAP {
            history.pop_front();
        }
        history.push_back((Utc::now(), yes_price));
    }

    /// Largest drop of `side`'s price inside the lookback window: the
    /// highest price seen minus the current one.
    fn drop_for_side(&self, market_id: i64, side: TokenSide, current: f64) -> Option<f64> {
        let history = self.price_history.get(&market_id)?;
        let cutoff = Utc::now() - Duration::milliseconds((LOOKBACK_MINUTES * 60_000.0) as i64);
        let high = history
            .iter()
            .filter(|(ts, _)| *ts >= cutoff)
            .map(|(_, yes)| match side {
                TokenSide::Yes => *yes,
                TokenSide::No => 1.0 - *yes,
            })
            .fold(f64::NEG_INFINITY, f64::max);
        if high.is_finite() {
            Some(high - current)
        } else {
            None
        }
    }

    fn check_entry(
        &mut self,
        tick: &Tick,
        side: TokenSide,
        current_price: f64,
        state: &StateManager,
    ) -> Option<Action> {
        let market_id = tick.market_id;
        let key = (market_id, side);
        let now = Utc::now();

        if !(ENTRY_PRICE_MIN..=ENTRY_PRICE_MAX).contains(&current_price) {
            self.drop_detected_at.remove(&key);
            return None;
        }

        let drop = self.drop_for_side(market_id, side, current_price);
        match drop {
            Some(drop) if drop >= DROP_THRESHOLD => {}
            _ => {
                self.drop_detected_at.remove(&key);
                return None;
            }
        }
        let drop = drop.unwrap_or(0.0);

        let Some(detected_at) = self.drop_detected_at.get(&key) else {
            self.drop_detected_at.insert(key, now);
            info!(
                teams = %format!("{} vs {}", tick.team_yes, tick.team_no),
                side = %side.as_str(),
                price = %format!("{current_price:.2}"),
                drop = %format!("{drop:.2}"),
                "crash detected, waiting for volume to settle"
            );
            return None;
        };

        let elapsed_minutes = (now - *detected_at).num_milliseconds() as f64 / 60_000.0;
        if elapsed_minutes < ENTRY_COOLDOWN_MINUTES {
            return None;
        }

        if !state.has_capacity(self.name(), POSITION_SIZE_USD) {
            return None;
        }

        let trade_num = self.trade_counts.entry(key).or_insert(0);
        *trade_num += 1;

        info!(
            entry = %*trade_num,
            side = %side.as_str(),
            price = %format!("{current_price:.2}"),
            drop = %format!("{drop:.2}"),
            waited_min = %format!("{elapsed_minutes:.1}"),
            "longshot entry"
        );

        // A fresh crash is required to re-enter after the next exit.
        self.drop_detected_at.remove(&key);
        self.entry_prices.insert(key, current_price);

        Some(
            Action::open_long(
                market_id,
                &tick.condition_id,
                self.name(),
                side,
                POSITION_SIZE_USD,
            )
            .with_reason(format!(
                "crash rebound {}: dropped {drop:.2} to {current_price:.2}",
                side.as_str()
            ))
            .with_trigger(current_price),
        )
    }
}

impl Default for MapLongshotStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for MapLongshotStrategy {
    fn name(&self) -> &'static str {
        "map_longshot"
    }

    fn params(&self) -> &StrategyParams {
        &self.params
    }

    fn on_tick(&mut self, tick: &Tick, state: &StateManager) -> Option<Action> {
        let yes_price = tick.yes_price()?;
        self.push_price(tick.market_id, yes_price);

        if let Some(spread) = tick.spread {
            if spread > self.params.max_spread {
                return None;
            }
        }
        if tick.yes_token_id.is_none() || tick.no_token_id.is_none() {
            return None;
        }

        if let Some(action) = self.check_entry(tick, TokenSide::Yes, yes_price, state) {
            return Some(action);
        }
        let no_price = 1.0 - yes_price;
        self.check_entry(tick, TokenSide::No, no_price, state)
    }

    fn on_position_update(
        &mut self,
        holding: &Holding,
        tick: &Tick,
        _state: &StateManager,
    ) -> Option<Action> {
        let Holding::Single(position) = holding else {
            return None;
        };
        let yes_price = tick.yes_price()?;
        self.push_price(tick.market_id, yes_price);

        let side = position.token_side;
        let current = match side {
            TokenSide::Yes => yes_price,
            TokenSide::No => 1.0 - yes_price,
        };
        let key = (tick.market_id, side);
        let entry = self
            .entry_prices
            .get(&key)
            .copied()
            .unwrap_or(position.avg_entry_price);

        if current - entry < EXIT_JUMP_POINTS {
            return None;
        }

        info!(
            side = %side.as_str(),
            entry = %format!("{entry:.2}"),
            current = %format!("{current:.2}"),
            "rebound target hit, exiting"
        );
        self.entry_prices.remove(&key);

        Some(
            Action::partial_close(tick.market_id, &tick.condition_id, self.name(), side, 1.0)
                .with_reason(format!("rebound exit: {entry:.2} -> {current:.2}"))
                .with_trigger(yes_price),
        )
    }

    fn filter_tick(&self, tick: &Tick) -> bool {
        // Longshots live at depressed prices; only the format/market-type
        // and spread gates from the default filter apply.
        let p = self.params();
        if let Some(format) = tick.format {
            if !p.formats.contains(&format) {
                return false;
            }
        }
        if let Some(market_type) = tick.market_type {
            if !p.market_types.contains(&market_type) {
                return false;
            }
        }
        if let Some(spread) = tick.spread {
            if spread > p.max_spread {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::EventKind;
    use crate::db::Db;
    use crate::engine::state::PositionSnapshot;
    use crate::engine::strategy::ActionType;

    fn state() -> StateManager {
        StateManager::new(Db::open_in_memory().unwrap())
    }

    fn tick(market_id: i64, yes: f64) -> Tick {
        Tick {
            market_id,
            condition_id: format!("0xc{market_id}"),
            message_id: "m".to_string(),
            team_yes: "A".to_string(),
            team_no: "B".to_string(),
            game_start_time: Some(Utc::now() - Duration::minutes(20)),
            format: Some(MatchFormat::Bo3),
            market_type: Some(MarketType::ChildMoneyline),
            timestamp: Utc::now(),
            event_kind: EventKind::Trade,
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

    fn crash_setup(strat: &mut MapLongshotStrategy, market_id: i64) {
        // Price was 0.32 four minutes ago, now 0.15: a 17-point drop.
        let history = strat.price_history.entry(market_id).or_default();
        history.push_back((Utc::now() - Duration::minutes(4), 0.32));
    }

    fn holding(side: TokenSide, entry: f64) -> Holding {
        Holding::Single(PositionSnapshot {
            id: 1,
            strategy_name: "map_longshot".to_string(),
            market_id: 5,
            condition_id: "0xc5".to_string(),
            token_id: "yes-5".to_string(),
            token_side: side,
            initial_shares: 100.0,
            remaining_shares: 100.0,
            avg_entry_price: entry,
            cost_basis: entry * 100.0,
            current_price: Some(entry),
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            spread_id: None,
            team_yes: "A".to_string(),
            team_no: "B".to_string(),
            game_start_time: Some(Utc::now()),
            format: Some(MatchFormat::Bo3),
            status: crate::engine::positions::PositionStatus::Open,
            close_reason: None,
            opened_at: Utc::now(),
            closed_at: None,
        })
    }

    #[test]
    fn crash_waits_out_cooldown_then_enters() {
        let mut strat = MapLongshotStrategy::new();
        let state = state();
        crash_setup(&mut strat, 5);

        // First sighting starts the cooldown, no entry yet.
        assert!(strat.on_tick(&tick(5, 0.15), &state).is_none());
        assert!(strat.drop_detected_at.contains_key(&(5, TokenSide::Yes)));

        // Still inside the 1-minute settle window.
        assert!(strat.on_tick(&tick(5, 0.15), &state).is_none());

        // Age the detection past the cooldown.
        strat
            .drop_detected_at
            .insert((5, TokenSide::Yes), Utc::now() - Duration::seconds(90));
        let action = strat.on_tick(&tick(5, 0.15), &state).unwrap();
        assert_eq!(action.action_type, ActionType::OpenLong);
        assert_eq!(action.token_side, Some(TokenSide::Yes));
        assert_eq!(action.size_usd, Some(15.0));
        // Detection is consumed: the next entry needs a new crash.
        assert!(!strat.drop_detected_at.contains_key(&(5, TokenSide::Yes)));
    }

    #[test]
    fn slow_bleed_does_not_trigger() {
        let mut strat = MapLongshotStrategy::new();
        let state = state();
        // Only a 10-point decline in the window.
        let history = strat.price_history.entry(5).or_default();
        history.push_back((Utc::now() - Duration::minutes(4), 0.25));
        assert!(strat.on_tick(&tick(5, 0.15), &state).is_none());
        assert!(!strat.drop_detected_at.contains_key(&(5, TokenSide::Yes)));
    }

    #[test]
    fn price_out_of_zone_clears_detection() {
        let mut strat = MapLongshotStrategy::new();
        let state = state();
        crash_setup(&mut strat, 5);
        strat.on_tick(&tick(5, 0.15), &state);
        assert!(strat.drop_detected_at.contains_key(&(5, TokenSide::Yes)));

        // Price recovered above the entry zone before the cooldown ended.
        strat.on_tick(&tick(5, 0.30), &state);
        assert!(!strat.drop_detected_at.contains_key(&(5, TokenSide::Yes)));
    }

    #[test]
    fn no_side_crash_detected_from_yes_history() {
        let mut strat = MapLongshotStrategy::new();
        let state = state();
        // YES rallied 0.68 -> 0.85: NO crashed 0.32 -> 0.15.
        let history = strat.price_history.entry(5).or_default();
        history.push_back((Utc::now() - Duration::minutes(4), 0.68));

        assert!(strat.on_tick(&tick(5, 0.85), &state).is_none());
        assert!(strat.drop_detected_at.contains_key(&(5, TokenSide::No)));
    }

    #[test]
    fn exits_on_twenty_point_rebound() {
        let mut strat = MapLongshotStrategy::new();
        let state = state();
        strat.entry_prices.insert((5, TokenSide::Yes), 0.15);

        // +18: hold.
        assert!(strat
            .on_position_update(&holding(TokenSide::Yes, 0.15), &tick(5, 0.33), &state)
            .is_none());
        // +20: exit everything.
        let action = strat
            .on_position_update(&holding(TokenSide::Yes, 0.15), &tick(5, 0.35), &state)
            .unwrap();
        assert_eq!(action.action_type, ActionType::PartialClose);
        assert_eq!(action.close_pct, Some(1.0));
    }
}
