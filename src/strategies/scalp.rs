//! Scalping strategy.
//!
//! Buys both sides near 50/50 in-play and swings on price movements: sell
//! half of whichever side jumps 10 points from its own baseline, re-baseline
//! at the new price, repeat. At the extreme (90%+) the remaining WINNER
//! shares are sold for good fills; the loser is never force-sold into a
//! 30-50% spread - it rides to resolution and goes to zero.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::book::Tick;
use crate::engine::state::StateManager;
use crate::engine::strategy::{Action, Holding, Strategy, StrategyParams};
use crate::models::{MarketType, MatchFormat, TokenSide};

const ENTRY_PRICE_MIN: f64 = 0.45;
const ENTRY_PRICE_MAX: f64 = 0.55;
const POSITION_SIZE_USD: f64 = 20.0;
const JUMP_THRESHOLD: f64 = 0.10;
const PARTIAL_CLOSE_PCT: f64 = 0.5;
const EXTREME_THRESHOLD: f64 = 0.90;
const MIN_HOLD_SECONDS: f64 = 30.0;

pub struct ScalpStrategy {
    params: StrategyParams,
    min_hold_seconds: f64,
    // Separate baselines per side prevent cascading partial closes: each
    // side triggers only on a 10-point move from ITS OWN baseline.
    yes_baselines: HashMap<i64, f64>,
    no_baselines: HashMap<i64, f64>,
    entry_prices: HashMap<i64, f64>,
    entry_times: HashMap<i64, DateTime<Utc>>,
}

impl ScalpStrategy {
    pub fn new() -> Self {
        Self {
            params: StrategyParams {
                formats: vec![MatchFormat::Bo3, MatchFormat::Bo5],
                market_types: vec![MarketType::Moneyline],
                max_position_usd: 50.0,
                max_positions: 5,
                max_spread: 0.05,
                max_exit_spread: 0.15,
                ..StrategyParams::default()
            },
            min_hold_seconds: MIN_HOLD_SECONDS,
            yes_baselines: HashMap::new(),
            no_baselines: HashMap::new(),
            entry_prices: HashMap::new(),
            entry_times: HashMap::new(),
        }
    }

    /// Override the post-entry hold window (noise guard, 30 s by default).
    pub fn with_min_hold_seconds(mut self, seconds: f64) -> Self {
        self.min_hold_seconds = seconds;
        self
    }

    /// Rebuild per-market state after a restart: entry mid from the spread
    /// row, NO baseline from the NO leg's actual entry (the two books are
    /// independent; 1 - yes is only a fallback).
    fn ensure_baselines(&mut self, market_id: i64, entry_price: f64, state: &StateManager) {
        self.yes_baselines.entry(market_id).or_insert(entry_price);
        if !self.no_baselines.contains_key(&market_id) {
            let no_entry = state
                .get_position("scalp", market_id, Some(TokenSide::No))
                .ok()
                .flatten()
                .map(|p| p.avg_entry_price)
                .unwrap_or(1.0 - entry_price);
            self.no_baselines.insert(market_id, no_entry);
        }
    }
}

impl Default for ScalpStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for ScalpStrategy {
    fn name(&self) -> &'static str {
        "scalp"
    }

    fn version(&self) -> &'static str {
        "2.0.0"
    }

    fn params(&self) -> &StrategyParams {
        &self.params
    }

    fn on_tick(&mut self, tick: &Tick, state: &StateManager) -> Option<Action> {
        let yes_price = tick.yes_price()?;

        if !(ENTRY_PRICE_MIN..=ENTRY_PRICE_MAX).contains(&yes_price) {
            return None;
        }
        if let Some(spread) = tick.spread {
            if spread > self.params.max_spread {
                return None;
            }
        }
        if !tick.is_in_play() {
            return None;
        }
        if tick.yes_token_id.is_none() || tick.no_token_id.is_none() {
            debug!(market_id = %tick.market_id, "missing token ids");
            return None;
        }
        if !state.has_capacity(self.name(), POSITION_SIZE_USD * 2.0) {
            debug!("insufficient capital for spread entry");
            return None;
        }

        info!(
            teams = %format!("{} vs {}", tick.team_yes, tick.team_no),
            yes = %format!("{yes_price:.2}"),
            "scalp entry signal"
        );

        self.entry_prices.insert(tick.market_id, yes_price);
        self.yes_baselines.insert(tick.market_id, yes_price);
        self.no_baselines
            .insert(tick.market_id, tick.no_price().unwrap_or(1.0 - yes_price));
        self.entry_times.insert(tick.market_id, Utc::now());

        Some(
            Action::open_spread(
                tick.market_id,
                &tick.condition_id,
                self.name(),
                POSITION_SIZE_USD,
                POSITION_SIZE_USD,
            )
            .with_reason(format!(
                "scalp entry {} vs {} @ {yes_price:.2}",
                tick.team_yes, tick.team_no
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
        let yes_price = tick.yes_price()?;
        let market_id = tick.market_id;

        let entry_price = match self.entry_prices.get(&market_id) {
            Some(p) => *p,
            None => {
                // Restarted mid-position: recover the entry mid.
                let spread = state.get_spread(self.name(), market_id).ok().flatten()?;
                let entry = spread.entry_yes_price?;
                self.entry_prices.insert(market_id, entry);
                entry
            }
        };
        self.ensure_baselines(market_id, entry_price, state);

        if let Some(entered_at) = self.entry_times.get(&market_id) {
            let held = (Utc::now() - *entered_at).num_milliseconds() as f64 / 1000.0;
            if held < self.min_hold_seconds {
                return None;
            }
        }

        let spread_ok = tick
            .spread
            .map_or(true, |s| s <= self.params.max_exit_spread);

        // Extreme: sell only the remaining winner. The loser holds to
        // resolution - fills at the extreme are unusable on that side.
        if yes_price >= EXTREME_THRESHOLD {
            let yes_pos = state
                .get_position(self.name(), market_id, Some(TokenSide::Yes))
                .ok()
                .flatten();
            if let Some(pos) = yes_pos {
                if pos.remaining_shares > 0.0 {
                    info!(yes = %format!("{yes_price:.2}"), "extreme: closing remaining YES winner");
                    return Some(
                        Action::partial_close(
                            market_id,
                            &tick.condition_id,
                            self.name(),
                            TokenSide::Yes,
                            1.0,
                        )
                        .with_reason(format!("extreme exit YES @ {yes_price:.2}"))
                        .with_trigger(yes_price),
                    );
                }
            }
            return None;
        }
        if yes_price <= 1.0 - EXTREME_THRESHOLD {
            let no_pos = state
                .get_position(self.name(), market_id, Some(TokenSide::No))
                .ok()
                .flatten();
            if let Some(pos) = no_pos {
                if pos.remaining_shares > 0.0 {
                    info!(no = %format!("{:.2}", 1.0 - yes_price), "extreme: closing remaining NO winner");
                    return Some(
                        Action::partial_close(
                            market_id,
                            &tick.condition_id,
                            self.name(),
                            TokenSide::No,
                            1.0,
                        )
                        .with_reason(format!("extreme exit NO @ {:.2}", 1.0 - yes_price))
                        .with_trigger(yes_price),
                    );
                }
            }
            return None;
        }

        if !spread_ok {
            debug!(spread = ?tick.spread, "skip partial exit: spread too wide");
            return None;
        }

        let yes_baseline = *self.yes_baselines.get(&market_id).unwrap_or(&entry_price);
        let no_baseline = *self
            .no_baselines
            .get(&market_id)
            .unwrap_or(&(1.0 - entry_price));
        let no_price = tick.no_price().unwrap_or(1.0 - yes_price);

        let yes_change = yes_price - yes_baseline;
        let no_change = no_price - no_baseline;

        if yes_change >= JUMP_THRESHOLD {
            info!(
                change = %format!("{yes_change:+.2}"),
                baseline = %format!("{yes_baseline:.2}"),
                "YES jumped, selling partial"
            );
            // Next trigger needs another full jump from here.
            self.yes_baselines.insert(market_id, yes_price);
            return Some(
                Action::partial_close(
                    market_id,
                    &tick.condition_id,
                    self.name(),
                    TokenSide::Yes,
                    PARTIAL_CLOSE_PCT,
                )
                .with_reason(format!("YES jump {yes_change:+.2} from {yes_baseline:.2}"))
                .with_trigger(yes_price),
            );
        }

        if no_change >= JUMP_THRESHOLD {
            info!(
                change = %format!("{no_change:+.2}"),
                baseline = %format!("{no_baseline:.2}"),
                "NO jumped, selling partial"
            );
            self.no_baselines.insert(market_id, no_price);
            return Some(
                Action::partial_close(
                    market_id,
                    &tick.condition_id,
                    self.name(),
                    TokenSide::No,
                    PARTIAL_CLOSE_PCT,
                )
                .with_reason(format!("NO jump {no_change:+.2} from {no_baseline:.2}"))
                .with_trigger(yes_price),
            );
        }

        None
    }
}
