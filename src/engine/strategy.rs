//! Strategy interface.
//!
//! Strategies are stateful objects driven by the router: `on_tick` when no
//! position exists on the market (entries), `on_position_update` when one
//! does (exits, adds, rebalances). Callbacks run on the dispatch path and
//! must stay fast - no blocking I/O, state reads go through the
//! `StateManager` snapshots.

use chrono::{DateTime, Utc};

use crate::book::Tick;
use crate::engine::state::{PositionSnapshot, SpreadSnapshot, StateManager};
use crate::models::{MarketType, MatchFormat, TokenSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    /// Buy a single token.
    OpenLong,
    /// Buy both YES and NO.
    OpenSpread,
    /// Close the entire position (or both spread legs).
    Close,
    /// Close part of a position.
    PartialClose,
    /// Add to an existing position.
    Add,
    /// Adjust the spread ratio.
    Rebalance,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::OpenLong => "open_long",
            ActionType::OpenSpread => "open_spread",
            ActionType::Close => "close",
            ActionType::PartialClose => "partial_close",
            ActionType::Add => "add",
            ActionType::Rebalance => "rebalance",
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, ActionType::Close | ActionType::PartialClose)
    }
}

/// Strategy output - what to execute.
#[derive(Debug, Clone)]
pub struct Action {
    pub action_type: ActionType,
    pub market_id: i64,
    pub condition_id: String,

    /// Target side for OPEN_LONG / PARTIAL_CLOSE / ADD.
    pub token_side: Option<TokenSide>,
    /// For OPEN_LONG.
    pub size_usd: Option<f64>,
    /// For PARTIAL_CLOSE, in (0, 1].
    pub close_pct: Option<f64>,
    /// For OPEN_SPREAD.
    pub yes_size_usd: Option<f64>,
    pub no_size_usd: Option<f64>,
    /// For ADD.
    pub add_size_usd: Option<f64>,

    /// Required for capital attribution.
    pub strategy_name: String,
    pub reason: String,
    pub trigger_price: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Action {
    pub fn new(action_type: ActionType, market_id: i64, condition_id: &str, strategy: &str) -> Self {
        Self {
            action_type,
            market_id,
            condition_id: condition_id.to_string(),
            token_side: None,
            size_usd: None,
            close_pct: None,
            yes_size_usd: None,
            no_size_usd: None,
            add_size_usd: None,
            strategy_name: strategy.to_string(),
            reason: String::new(),
            trigger_price: None,
            created_at: Utc::now(),
        }
    }

    pub fn open_long(
        market_id: i64,
        condition_id: &str,
        strategy: &str,
        side: TokenSide,
        size_usd: f64,
    ) -> Self {
        let mut a = Self::new(ActionType::OpenLong, market_id, condition_id, strategy);
        a.token_side = Some(side);
        a.size_usd = Some(size_usd);
        a
    }

    pub fn open_spread(
        market_id: i64,
        condition_id: &str,
        strategy: &str,
        yes_size_usd: f64,
        no_size_usd: f64,
    ) -> Self {
        let mut a = Self::new(ActionType::OpenSpread, market_id, condition_id, strategy);
        a.yes_size_usd = Some(yes_size_usd);
        a.no_size_usd = Some(no_size_usd);
        a
    }

    pub fn partial_close(
        market_id: i64,
        condition_id: &str,
        strategy: &str,
        side: TokenSide,
        close_pct: f64,
    ) -> Self {
        let mut a = Self::new(ActionType::PartialClose, market_id, condition_id, strategy);
        a.token_side = Some(side);
        a.close_pct = Some(close_pct);
        a
    }

    pub fn add(
        market_id: i64,
        condition_id: &str,
        strategy: &str,
        side: TokenSide,
        add_size_usd: f64,
    ) -> Self {
        let mut a = Self::new(ActionType::Add, market_id, condition_id, strategy);
        a.token_side = Some(side);
        a.add_size_usd = Some(add_size_usd);
        a
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_trigger(mut self, price: f64) -> Self {
        self.trigger_price = Some(price);
        self
    }
}

/// What the router hands to `on_position_update`: either a single position or
/// a two-leg spread.
#[derive(Debug, Clone)]
pub enum Holding {
    Single(PositionSnapshot),
    Spread(SpreadSnapshot),
}

impl Holding {
    pub fn market_id(&self) -> i64 {
        match self {
            Holding::Single(p) => p.market_id,
            Holding::Spread(s) => s.market_id,
        }
    }
}

/// Static per-strategy filters and limits the router enforces.
#[derive(Debug, Clone)]
pub struct StrategyParams {
    pub formats: Vec<MatchFormat>,
    pub market_types: Vec<MarketType>,
    pub max_position_usd: f64,
    pub max_positions: i64,
    pub min_spread: f64,
    pub max_spread: f64,
    pub max_exit_spread: f64,
    /// Extreme-price protection: near-resolved markets have terrible
    /// liquidity and are usually decided.
    pub min_entry_price: f64,
    pub max_entry_price: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            formats: vec![MatchFormat::Bo3, MatchFormat::Bo5],
            market_types: vec![MarketType::Moneyline],
            max_position_usd: 100.0,
            max_positions: 5,
            min_spread: 0.0,
            max_spread: 0.10,
            max_exit_spread: 0.15,
            min_entry_price: 0.05,
            max_entry_price: 0.95,
        }
    }
}

pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn params(&self) -> &StrategyParams;

    /// Entry logic. Called for every filtered tick when this strategy has no
    /// position on the market.
    fn on_tick(&mut self, tick: &Tick, state: &StateManager) -> Option<Action>;

    /// Management logic. Called when this strategy holds a position or
    /// spread on the tick's market.
    fn on_position_update(
        &mut self,
        _holding: &Holding,
        _tick: &Tick,
        _state: &StateManager,
    ) -> Option<Action> {
        None
    }

    /// Cheap pre-filter before `on_tick`. The default applies the
    /// format/market-type/spread/extreme-price filters from `params()`.
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
            if spread < p.min_spread || spread > p.max_spread {
                return false;
            }
        }
        if let Some(yes_price) = tick.yes_price() {
            if yes_price < p.min_entry_price || yes_price > p.max_entry_price {
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

    struct NeverStrategy {
        params: StrategyParams,
    }

    impl Strategy for NeverStrategy {
        fn name(&self) -> &'static str {
            "never"
        }
        fn params(&self) -> &StrategyParams {
            &self.params
        }
        fn on_tick(&mut self, _tick: &Tick, _state: &StateManager) -> Option<Action> {
            None
        }
    }

    fn tick() -> Tick {
        Tick {
            market_id: 1,
            condition_id: "0xc1".to_string(),
            message_id: "m".to_string(),
            team_yes: "A".to_string(),
            team_no: "B".to_string(),
            game_start_time: None,
            format: Some(MatchFormat::Bo3),
            market_type: Some(MarketType::Moneyline),
            timestamp: Utc::now(),
            event_kind: EventKind::Trade,
            token_side: TokenSide::Yes,
            price: Some(0.5),
            best_bid: Some(0.49),
            best_ask: Some(0.51),
            spread: Some(0.02),
            mid_price: Some(0.5),
            trade_size: None,
            trade_side: None,
            price_velocity_1m: None,
            yes_token_id: None,
            no_token_id: None,
            actual_yes_mid: Some(0.5),
            actual_no_mid: Some(0.5),
        }
    }

    #[test]
    fn default_filter_applies_format_spread_and_extremes() {
        let s = NeverStrategy {
            params: StrategyParams::default(),
        };
        assert!(s.filter_tick(&tick()));

        let mut bo1 = tick();
        bo1.format = Some(MatchFormat::Bo1);
        assert!(!s.filter_tick(&bo1));

        let mut wide = tick();
        wide.spread = Some(0.20);
        assert!(!s.filter_tick(&wide));

        let mut extreme = tick();
        extreme.actual_yes_mid = Some(0.97);
        assert!(!s.filter_tick(&extreme));
    }

    #[test]
    fn unknown_fields_pass_the_filter() {
        let s = NeverStrategy {
            params: StrategyParams::default(),
        };
        let mut t = tick();
        t.format = None;
        t.market_type = None;
        t.spread = None;
        assert!(s.filter_tick(&t));
    }

    #[test]
    fn action_builders_fill_fields() {
        let a = Action::open_spread(7, "0xc7", "scalp", 20.0, 20.0).with_reason("entry");
        assert_eq!(a.action_type, ActionType::OpenSpread);
        assert_eq!(a.yes_size_usd, Some(20.0));
        assert_eq!(a.strategy_name, "scalp");
        assert!(!a.action_type.is_exit());

        let c = Action::partial_close(7, "0xc7", "scalp", TokenSide::Yes, 0.5);
        assert!(c.action_type.is_exit());
        assert_eq!(c.close_pct, Some(0.5));
    }

    #[test]
    fn state_manager_is_usable_from_trait_objects() {
        let db = Db::open_in_memory().unwrap();
        let state = StateManager::new(db);
        let mut s: Box<dyn Strategy> = Box::new(NeverStrategy {
            params: StrategyParams::default(),
        });
        assert!(s.on_tick(&tick(), &state).is_none());
    }
}
