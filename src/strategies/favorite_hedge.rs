//! Favorite hedge strategy.
//!
//! Buys the favored side 3-8 minutes after game start when its price is in
//! [0.55, 0.65], sized by linear interpolation ($10 at 0.55 up to $50 at
//! 0.65). If the favorite later reaches 0.85, hedges with the opposite side
//! at a quarter of the entry size.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::book::Tick;
use crate::engine::state::StateManager;
use crate::engine::strategy::{Action, Holding, Strategy, StrategyParams};
use crate::models::{MarketType, MatchFormat, TokenSide};

const ENTRY_MINUTES_MIN: f64 = 3.0;
const ENTRY_MINUTES_MAX: f64 = 8.0;

const MIN_FAV_PRICE: f64 = 0.55;
const MAX_FAV_PRICE: f64 = 0.65;
const MIN_SIZE_USD: f64 = 10.0;
const MAX_SIZE_USD: f64 = 50.0;

const HEDGE_TRIGGER_PRICE: f64 = 0.85;
const HEDGE_SIZE_RATIO: f64 = 0.25;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Stage {
    Waiting,
    Entered,
    Hedged,
}

#[derive(Debug, Clone)]
struct MarketState {
    stage: Stage,
    entry_price: f64,
    entry_size_usd: f64,
    entry_side: TokenSide,
}

pub struct FavoriteHedgeStrategy {
    params: StrategyParams,
    market_states: HashMap<i64, MarketState>,
}

impl FavoriteHedgeStrategy {
    pub fn new() -> Self {
        Self {
            params: StrategyParams {
                formats: vec![MatchFormat::Bo3, MatchFormat::Bo5],
                market_types: vec![MarketType::Moneyline],
                max_position_usd: 50.0,
                max_positions: 10,
                max_spread: 0.10,
                max_exit_spread: 0.05,
                ..StrategyParams::default()
            },
            market_states: HashMap::new(),
        }
    }

    /// Rehydrate in-memory stage tracking from the persisted per-market
    /// record. Returns None when nothing was persisted.
    fn restore_market_state(
        &self,
        market_id: i64,
        state: &StateManager,
    ) -> Option<MarketState> {
        let persisted = state.get_market_state(self.name(), market_id).ok()?;
        if persisted.stage == "WAITING" {
            return None;
        }
        let entry_size_usd = persisted
            .custom_state
            .as_deref()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .and_then(|v| v.get("entry_size_usd").and_then(|s| s.as_f64()))
            .unwrap_or(MIN_SIZE_USD);
        Some(MarketState {
            stage: if persisted.stage == "HEDGED" {
                Stage::Hedged
            } else {
                Stage::Entered
            },
            entry_price: persisted.entry_price.unwrap_or(0.0),
            entry_size_usd,
            entry_side: persisted.current_side.unwrap_or(TokenSide::Yes),
        })
    }

    fn persist_market_state(
        &self,
        market_id: i64,
        ms: &MarketState,
        condition_id: &str,
        state: &StateManager,
    ) {
        let mut snap = match state.get_market_state(self.name(), market_id) {
            Ok(snap) => snap,
            Err(e) => {
                debug!(error = %e, "could not load market state for persist");
                return;
            }
        };
        snap.condition_id = condition_id.to_string();
        snap.stage = match ms.stage {
            Stage::Waiting => "WAITING",
            Stage::Entered => "ENTERED",
            Stage::Hedged => "HEDGED",
        }
        .to_string();
        snap.entry_price = Some(ms.entry_price);
        snap.current_side = Some(ms.entry_side);
        snap.custom_state = Some(
            serde_json::json!({ "entry_size_usd": ms.entry_size_usd }).to_string(),
        );
        if let Err(e) = state.save_market_state(&snap) {
            debug!(error = %e, "market state persist failed");
        }
    }

    /// Size by linear interpolation: $10 at 0.55 scaling to $50 at 0.65,
    /// capped above.
    fn calculate_size(favorite_price: f64) -> f64 {
        if favorite_price >= MAX_FAV_PRICE {
            return MAX_SIZE_USD;
        }
        let price_pct = (favorite_price - MIN_FAV_PRICE) / (MAX_FAV_PRICE - MIN_FAV_PRICE);
        let size = MIN_SIZE_USD + price_pct * (MAX_SIZE_USD - MIN_SIZE_USD);
        (size * 100.0).round() / 100.0
    }
}

impl Default for FavoriteHedgeStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for FavoriteHedgeStrategy {
    fn name(&self) -> &'static str {
        "favorite_hedge"
    }

    fn params(&self) -> &StrategyParams {
        &self.params
    }

    fn on_tick(&mut self, tick: &Tick, state: &StateManager) -> Option<Action> {
        let market_id = tick.market_id;

        if let Some(ms) = self.market_states.get(&market_id) {
            if ms.stage != Stage::Waiting {
                return None;
            }
        } else if let Some(restored) = self.restore_market_state(market_id, state) {
            // After a restart the persisted stage record decides whether
            // this market was already played.
            let done = restored.stage != Stage::Waiting;
            self.market_states.insert(market_id, restored);
            if done {
                return None;
            }
        }

        let mins = tick.minutes_since_start()?;
        if !(ENTRY_MINUTES_MIN..=ENTRY_MINUTES_MAX).contains(&mins) {
            return None;
        }

        let yes_price = tick.yes_price()?;
        let (favorite_side, favorite_price) = if yes_price >= 0.5 {
            (TokenSide::Yes, yes_price)
        } else {
            (TokenSide::No, 1.0 - yes_price)
        };

        if favorite_price < MIN_FAV_PRICE {
            debug!(fav = %format!("{favorite_price:.2}"), "no clear favorite yet");
            return None;
        }
        if favorite_price > MAX_FAV_PRICE {
            debug!(fav = %format!("{favorite_price:.2}"), "too lopsided");
            return None;
        }
        if let Some(spread) = tick.spread {
            if spread > self.params.max_spread {
                return None;
            }
        }

        let size_usd = Self::calculate_size(favorite_price);
        if !state.has_capacity(self.name(), size_usd) {
            debug!(size = %format!("{size_usd:.2}"), "insufficient capital");
            return None;
        }
        if tick.yes_token_id.is_none() || tick.no_token_id.is_none() {
            return None;
        }

        info!(
            teams = %format!("{} vs {}", tick.team_yes, tick.team_no),
            side = %favorite_side.as_str(),
            price = %format!("{favorite_price:.2}"),
            size = %format!("{size_usd:.2}"),
            "buying favorite"
        );

        let ms = MarketState {
            stage: Stage::Entered,
            entry_price: favorite_price,
            entry_size_usd: size_usd,
            entry_side: favorite_side,
        };
        self.persist_market_state(market_id, &ms, &tick.condition_id, state);
        self.market_states.insert(market_id, ms);

        Some(
            Action::open_long(
                market_id,
                &tick.condition_id,
                self.name(),
                favorite_side,
                size_usd,
            )
            .with_reason(format!(
                "buy favorite {} @ {favorite_price:.2}",
                favorite_side.as_str()
            ))
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
        if !self.market_states.contains_key(&market_id) {
            if let Some(restored) = self.restore_market_state(market_id, state) {
                self.market_states.insert(market_id, restored);
            }
        }
        let ms = self.market_states.get(&market_id)?;
        if ms.stage != Stage::Entered {
            return None;
        }

        let yes_price = tick.yes_price()?;
        let current_fav_price = match ms.entry_side {
            TokenSide::Yes => yes_price,
            TokenSide::No => 1.0 - yes_price,
        };

        if current_fav_price < HEDGE_TRIGGER_PRICE {
            return None;
        }
        if let Some(spread) = tick.spread {
            if spread > self.params.max_exit_spread {
                debug!(spread = %format!("{spread:.2}"), "skip hedge: spread too wide");
                return None;
            }
        }

        let underdog = ms.entry_side.opposite();
        let hedge_size = ms.entry_size_usd * HEDGE_SIZE_RATIO;

        info!(
            side = %underdog.as_str(),
            price = %format!("{:.2}", 1.0 - current_fav_price),
            size = %format!("{hedge_size:.2}"),
            fav = %format!("{current_fav_price:.2}"),
            "hedging favorite"
        );

        if let Some(ms) = self.market_states.get_mut(&market_id) {
            ms.stage = Stage::Hedged;
        }
        if let Some(ms) = self.market_states.get(&market_id).cloned() {
            self.persist_market_state(market_id, &ms, &tick.condition_id, state);
        }

        Some(
            Action::open_long(market_id, &tick.condition_id, self.name(), underdog, hedge_size)
                .with_reason(format!(
                    "hedge with {}, favorite hit {current_fav_price:.2}",
                    underdog.as_str()
                ))
                .with_trigger(yes_price),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::EventKind;
    use crate::db::Db;
    use crate::engine::state::PositionSnapshot;
    use crate::engine::strategy::ActionType;
    use chrono::{Duration, Utc};

    fn state() -> StateManager {
        StateManager::new(Db::open_in_memory().unwrap())
    }

    fn tick(market_id: i64, yes: f64, minutes_in: i64) -> Tick {
        Tick {
            market_id,
            condition_id: format!("0xc{market_id}"),
            message_id: "m".to_string(),
            team_yes: "A".to_string(),
            team_no: "B".to_string(),
            game_start_time: Some(Utc::now() - Duration::minutes(minutes_in)),
            format: Some(MatchFormat::Bo5),
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
            yes_token_id: Some("yt".to_string()),
            no_token_id: Some("nt".to_string()),
            actual_yes_mid: Some(yes),
            actual_no_mid: Some(1.0 - yes),
        }
    }

    fn holding(side: TokenSide) -> Holding {
        Holding::Single(PositionSnapshot {
            id: 1,
            strategy_name: "favorite_hedge".to_string(),
            market_id: 9,
            condition_id: "0xc9".to_string(),
            token_id: "yt".to_string(),
            token_side: side,
            initial_shares: 37.9,
            remaining_shares: 37.9,
            avg_entry_price: 0.58,
            cost_basis: 22.0,
            current_price: Some(0.58),
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            spread_id: None,
            team_yes: "A".to_string(),
            team_no: "B".to_string(),
            game_start_time: Some(Utc::now()),
            format: Some(MatchFormat::Bo5),
            status: crate::engine::positions::PositionStatus::Open,
            close_reason: None,
            opened_at: Utc::now(),
            closed_at: None,
        })
    }

    #[test]
    fn size_interpolates_linearly() {
        assert!((FavoriteHedgeStrategy::calculate_size(0.55) - 10.0).abs() < 1e-9);
        assert!((FavoriteHedgeStrategy::calculate_size(0.58) - 22.0).abs() < 1e-9);
        assert!((FavoriteHedgeStrategy::calculate_size(0.65) - 50.0).abs() < 1e-9);
        assert!((FavoriteHedgeStrategy::calculate_size(0.80) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn buys_favorite_in_window() {
        let mut strat = FavoriteHedgeStrategy::new();
        // Scenario: t0+4min, YES mid 0.58 -> buy YES for $22.
        let action = strat.on_tick(&tick(9, 0.58, 4), &state()).unwrap();
        assert_eq!(action.action_type, ActionType::OpenLong);
        assert_eq!(action.token_side, Some(TokenSide::Yes));
        assert!((action.size_usd.unwrap() - 22.0).abs() < 1e-9);
    }

    #[test]
    fn no_side_can_be_the_favorite() {
        let mut strat = FavoriteHedgeStrategy::new();
        let action = strat.on_tick(&tick(9, 0.40, 5), &state()).unwrap();
        assert_eq!(action.token_side, Some(TokenSide::No));
        // NO at 0.60 -> $30.
        assert!((action.size_usd.unwrap() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn skips_outside_window_or_range() {
        let mut strat = FavoriteHedgeStrategy::new();
        let state = state();
        // Too early / too late.
        assert!(strat.on_tick(&tick(9, 0.58, 2), &state).is_none());
        assert!(strat.on_tick(&tick(9, 0.58, 9), &state).is_none());
        // No clear favorite / too lopsided.
        assert!(strat.on_tick(&tick(9, 0.52, 5), &state).is_none());
        assert!(strat.on_tick(&tick(9, 0.70, 5), &state).is_none());
    }

    #[test]
    fn hedges_when_favorite_hits_trigger() {
        let mut strat = FavoriteHedgeStrategy::new();
        let state = state();
        strat.on_tick(&tick(9, 0.58, 5), &state).unwrap();

        // Below trigger: nothing.
        assert!(strat
            .on_position_update(&holding(TokenSide::Yes), &tick(9, 0.80, 30), &state)
            .is_none());

        // Favorite at 0.86: hedge NO at 1/4 of $22.
        let action = strat
            .on_position_update(&holding(TokenSide::Yes), &tick(9, 0.86, 40), &state)
            .unwrap();
        assert_eq!(action.action_type, ActionType::OpenLong);
        assert_eq!(action.token_side, Some(TokenSide::No));
        assert!((action.size_usd.unwrap() - 5.50).abs() < 1e-9);

        // Only one hedge per market.
        assert!(strat
            .on_position_update(&holding(TokenSide::Yes), &tick(9, 0.90, 50), &state)
            .is_none());
    }

    #[test]
    fn stage_survives_restart_via_persisted_state() {
        let state = state();
        let mut strat = FavoriteHedgeStrategy::new();
        strat.on_tick(&tick(9, 0.58, 5), &state).unwrap();

        // Fresh instance (restart): the persisted record blocks re-entry...
        let mut restarted = FavoriteHedgeStrategy::new();
        assert!(restarted.on_tick(&tick(9, 0.58, 5), &state).is_none());

        // ...and still carries the entry context for the hedge.
        let action = restarted
            .on_position_update(&holding(TokenSide::Yes), &tick(9, 0.86, 40), &state)
            .unwrap();
        assert_eq!(action.token_side, Some(TokenSide::No));
        assert!((action.size_usd.unwrap() - 5.50).abs() < 1e-9);
    }
}
