//! BO3 longshot rebound strategy.
//!
//! BO3 series swing hard: losing map one does not lose the series. In the
//! first 90 minutes, buy crashed sides in tiers ($20 below 20%, $30 more
//! below 10% for a $50 combined cost), sell 70% when the price doubles off
//! the average entry, and let the remaining 30% ride to resolution.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::book::Tick;
use crate::engine::state::StateManager;
use crate::engine::strategy::{Action, Holding, Strategy, StrategyParams};
use crate::models::{MarketType, MatchFormat, TokenSide};

const ENTRY_WINDOW_MINUTES: f64 = 90.0;

const TIER1_THRESHOLD: f64 = 0.20;
const TIER1_SIZE_USD: f64 = 20.0;
const TIER2_THRESHOLD: f64 = 0.10;
const TIER2_SIZE_USD: f64 = 30.0;

const MIN_PRICE: f64 = 0.05;

const PROFIT_TARGET_PCT: f64 = 1.00;
const PARTIAL_CLOSE_PCT: f64 = 0.70;
const COOLDOWN_MINUTES: f64 = 5.0;

#[derive(Debug, Default)]
struct SideState {
    tiers_hit: HashSet<u8>,
    partial_done: bool,
    last_exit_time: Option<DateTime<Utc>>,
}

pub struct Bo3LongshotStrategy {
    params: StrategyParams,
    sides: HashMap<(i64, TokenSide), SideState>,
}

impl Bo3LongshotStrategy {
    pub fn new() -> Self {
        Self {
            params: StrategyParams {
                formats: vec![MatchFormat::Bo3],
                market_types: vec![MarketType::Moneyline],
                max_position_usd: 100.0,
                max_positions: 10,
                max_spread: 0.10,
                min_entry_price: 0.01,
                ..StrategyParams::default()
            },
            sides: HashMap::new(),
        }
    }

    fn in_cooldown(&self, key: &(i64, TokenSide)) -> bool {
        self.sides
            .get(key)
            .and_then(|s| s.last_exit_time)
            .map(|t| Utc::now() - t < Duration::milliseconds((COOLDOWN_MINUTES * 60_000.0) as i64))
            .unwrap_or(false)
    }

    fn tier_entry(
        &mut self,
        tick: &Tick,
        side: TokenSide,
        price: f64,
        state: &StateManager,
    ) -> Option<Action> {
        let key = (tick.market_id, side);

        if price < MIN_PRICE {
            return None;
        }
        if self.in_cooldown(&key) {
            return None;
        }

        let tiers_hit = self
            .sides
            .get(&key)
            .map(|s| s.tiers_hit.clone())
            .unwrap_or_default();

        let (tier, size) = if price < TIER2_THRESHOLD && !tiers_hit.contains(&2) {
            (2u8, TIER2_SIZE_USD)
        } else if price < TIER1_THRESHOLD && !tiers_hit.contains(&1) {
            (1u8, TIER1_SIZE_USD)
        } else {
            return None;
        };

        if !state.has_capacity(self.name(), size) {
            return None;
        }

        info!(
            teams = %format!("{} vs {}", tick.team_yes, tick.team_no),
            side = %side.as_str(),
            tier = %tier,
            price = %format!("{price:.2}"),
            size = %format!("{size:.0}"),
            "longshot tier entry"
        );

        let side_state = self.sides.entry(key).or_default();
        side_state.tiers_hit.insert(tier);
        side_state.partial_done = false;

        Some(
            Action::open_long(tick.market_id, &tick.condition_id, self.name(), side, size)
                .with_reason(format!("T{tier} longshot {} @ {price:.2}", side.as_str()))
                .with_trigger(price),
        )
    }
}

impl Default for Bo3LongshotStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for Bo3LongshotStrategy {
    fn name(&self) -> &'static str {
        "bo3_longshot"
    }

    fn params(&self) -> &StrategyParams {
        &self.params
    }

    fn on_tick(&mut self, tick: &Tick, state: &StateManager) -> Option<Action> {
        let mins = tick.minutes_since_start()?;
        if !(0.0..=ENTRY_WINDOW_MINUTES).contains(&mins) {
            return None;
        }
        let yes_price = tick.yes_price()?;
        if let Some(spread) = tick.spread {
            if spread > self.params.max_spread {
                return None;
            }
        }
        if tick.yes_token_id.is_none() || tick.no_token_id.is_none() {
            return None;
        }

        if let Some(action) = self.tier_entry(tick, TokenSide::Yes, yes_price, state) {
            return Some(action);
        }
        let no_price = tick.no_price().unwrap_or(1.0 - yes_price);
        self.tier_entry(tick, TokenSide::No, no_price, state)
    }

    fn on_position_update(
        &mut self,
        holding: &Holding,
        tick: &Tick,
        state: &StateManager,
    ) -> Option<Action> {
        let Holding::Single(position) = holding else {
            return None;
        };
        let side = position.token_side;
        let key = (tick.market_id, side);
        let yes_price = tick.yes_price()?;
        let current = match side {
            TokenSide::Yes => yes_price,
            TokenSide::No => tick.no_price().unwrap_or(1.0 - yes_price),
        };

        // Tier 2 stacks onto the existing position while the window is open.
        let mins = tick.minutes_since_start().unwrap_or(f64::MAX);
        if mins <= ENTRY_WINDOW_MINUTES
            && current >= MIN_PRICE
            && current < TIER2_THRESHOLD
            && !self
                .sides
                .get(&key)
                .map(|s| s.tiers_hit.contains(&2))
                .unwrap_or(false)
        {
            if state.has_capacity(self.name(), TIER2_SIZE_USD) {
                info!(
                    side = %side.as_str(),
                    price = %format!("{current:.2}"),
                    "stacking tier 2"
                );
                let side_state = self.sides.entry(key).or_default();
                side_state.tiers_hit.insert(2);
                return Some(
                    Action::add(
                        tick.market_id,
                        &tick.condition_id,
                        self.name(),
                        side,
                        TIER2_SIZE_USD,
                    )
                    .with_reason(format!("T2 longshot stack @ {current:.2}"))
                    .with_trigger(current),
                );
            }
        }

        // Take 70% off at a double; the remaining 30% rides to resolution.
        let already_done = self
            .sides
            .get(&key)
            .map(|s| s.partial_done)
            .unwrap_or(false);
        if already_done {
            return None;
        }

        let avg_entry = position.avg_entry_price;
        if avg_entry <= 0.0 {
            return None;
        }
        let profit_pct = (current - avg_entry) / avg_entry;
        if profit_pct < PROFIT_TARGET_PCT {
            debug!(
                side = %side.as_str(),
                profit = %format!("{:.0}%", profit_pct * 100.0),
                "below profit target"
            );
            return None;
        }

        info!(
            side = %side.as_str(),
            entry = %format!("{avg_entry:.2}"),
            current = %format!("{current:.2}"),
            "price doubled, selling 70%"
        );
        let side_state = self.sides.entry(key).or_default();
        side_state.partial_done = true;
        side_state.last_exit_time = Some(Utc::now());

        Some(
            Action::partial_close(
                tick.market_id,
                &tick.condition_id,
                self.name(),
                side,
                PARTIAL_CLOSE_PCT,
            )
            .with_reason(format!(
                "double from {avg_entry:.2}, taking 70%, holding 30% to resolution"
            ))
            .with_trigger(current),
        )
    }

    fn filter_tick(&self, tick: &Tick) -> bool {
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
