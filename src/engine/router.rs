//! Tick router.
//!
//! Central dispatch: deduplicate stream messages, enrich ticks from the
//! market cache, apply global filters, refresh position prices, and hand the
//! tick to every registered strategy. Returned actions are validated against
//! the strategy's limits before execution; every rejection is recorded as a
//! trade decision row.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use rusqlite::params;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::book::Tick;
use crate::db::{Db, MarketRow};
use crate::engine::executor::PaperExecutor;
use crate::engine::positions::PositionStore;
use crate::engine::state::StateManager;
use crate::engine::strategy::{Action, ActionType, Holding, Strategy};
use crate::models::{MarketType, MatchFormat};

/// Bounded memory of recently seen message ids; absorbs at-least-once
/// delivery from the stream.
const MAX_SEEN_MESSAGES: usize = 10_000;

/// Positions imported from the wallet are quarantined: no strategy dispatch,
/// no position-count accounting.
pub const WALLET_RECONCILE_STRATEGY: &str = "wallet_reconcile";

/// Shared market reference/quote cache, written by the runner's refresh
/// loops and read on the dispatch path.
pub type MarketCache = Arc<RwLock<std::collections::HashMap<i64, MarketRow>>>;

#[derive(Debug, Default, Clone)]
pub struct RouterStats {
    pub ticks_processed: u64,
    pub ticks_filtered: u64,
    pub ticks_deduped: u64,
    pub actions_executed: u64,
    pub errors: u64,
}

pub struct TickRouter {
    db: Db,
    state: StateManager,
    positions: PositionStore,
    executor: PaperExecutor,
    markets: MarketCache,
    strategies: Vec<Box<dyn Strategy>>,

    seen_messages: HashSet<String>,
    seen_order: VecDeque<String>,
    stats: RouterStats,
}

impl TickRouter {
    pub fn new(
        db: Db,
        state: StateManager,
        positions: PositionStore,
        executor: PaperExecutor,
        markets: MarketCache,
    ) -> Self {
        Self {
            db,
            state,
            positions,
            executor,
            markets,
            strategies: Vec::new(),
            seen_messages: HashSet::with_capacity(MAX_SEEN_MESSAGES),
            seen_order: VecDeque::with_capacity(MAX_SEEN_MESSAGES),
            stats: RouterStats::default(),
        }
    }

    pub fn register_strategy(&mut self, strategy: Box<dyn Strategy>) {
        // Materialize the capital row up front so dashboards see the budget.
        if let Err(e) = self.state.get_strategy_capital(strategy.name()) {
            warn!(strategy = %strategy.name(), error = %e, "could not init strategy capital");
        }
        info!(
            strategy = %strategy.name(),
            version = %strategy.version(),
            "registered strategy"
        );
        self.strategies.push(strategy);
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats.clone()
    }

    /// Process one tick end to end. Returns false when the tick was dropped
    /// by dedup or a global filter.
    pub fn process_tick(&mut self, tick: &Tick) -> bool {
        if !self.remember_message(&tick.message_id) {
            self.stats.ticks_deduped += 1;
            return false;
        }

        let tick = self.enrich(tick.clone());

        if !self.global_filter(&tick) {
            self.stats.ticks_filtered += 1;
            return false;
        }

        self.stats.ticks_processed += 1;

        if let Err(e) = self.positions.update_prices(&tick) {
            error!(market_id = %tick.market_id, error = %e, "price update failed");
            self.stats.errors += 1;
        }

        for i in 0..self.strategies.len() {
            if let Err(e) = self.dispatch_index(i, &tick) {
                let name = self.strategies[i].name();
                error!(strategy = %name, error = %e, "dispatch error");
                self.stats.errors += 1;
            }
        }
        true
    }

    /// Bounded dedup set; trims the oldest half on overflow.
    fn remember_message(&mut self, message_id: &str) -> bool {
        if message_id.is_empty() {
            return true;
        }
        if self.seen_messages.contains(message_id) {
            return false;
        }
        self.seen_messages.insert(message_id.to_string());
        self.seen_order.push_back(message_id.to_string());
        if self.seen_order.len() > MAX_SEEN_MESSAGES {
            for _ in 0..MAX_SEEN_MESSAGES / 2 {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen_messages.remove(&old);
                }
            }
        }
        true
    }

    /// Fill missing tick fields from the market cache. The cached per-token
    /// mids are authoritative: the exchange publishes separate books whose
    /// prices are not complementary.
    fn enrich(&self, mut tick: Tick) -> Tick {
        let markets = self.markets.read();
        let Some(market) = markets.get(&tick.market_id) else {
            return tick;
        };

        if tick.format.is_none() {
            tick.format = market.format;
        }
        if tick.market_type.is_none() {
            tick.market_type = market.market_type;
        }
        if tick.game_start_time.is_none() {
            tick.game_start_time = market.game_start_time;
        }
        if tick.team_yes.is_empty() {
            tick.team_yes = market.team_yes.clone();
        }
        if tick.team_no.is_empty() {
            tick.team_no = market.team_no.clone();
        }
        if tick.yes_token_id.is_none() {
            tick.yes_token_id = Some(market.yes_token_id.clone());
        }
        if tick.no_token_id.is_none() {
            tick.no_token_id = Some(market.no_token_id.clone());
        }
        // Stream spreads above 50% are garbage; recompute from cached quotes.
        if tick.spread.map_or(true, |s| s > 0.50) {
            tick.spread = Some(market.computed_spread());
        }
        if tick.actual_yes_mid.is_none() {
            tick.actual_yes_mid = market.yes_price;
        }
        if tick.actual_no_mid.is_none() {
            tick.actual_no_mid = market.no_price;
        }
        tick
    }

    fn global_filter(&self, tick: &Tick) -> bool {
        {
            let markets = self.markets.read();
            if let Some(market) = markets.get(&tick.market_id) {
                if market.resolved || market.closed {
                    debug!(market_id = %tick.market_id, "tick for resolved/closed market");
                    return false;
                }
            }
        }

        let Some(market_type) = tick.market_type else {
            return false;
        };
        if !matches!(
            market_type,
            MarketType::Moneyline | MarketType::ChildMoneyline
        ) {
            return false;
        }
        // Series-winner markets need a known format; BO1 is excluded.
        if market_type == MarketType::Moneyline {
            match tick.format {
                None | Some(MatchFormat::Bo1) => return false,
                _ => {}
            }
        }
        true
    }

    fn dispatch_index(&mut self, idx: usize, tick: &Tick) -> Result<()> {
        let name = self.strategies[idx].name();

        let position = self.state.get_position(name, tick.market_id, None)?;
        let spread = self.state.get_spread(name, tick.market_id)?;
        let holding = match (position, spread) {
            (_, Some(s)) => Some(Holding::Spread(s)),
            (Some(p), None) => Some(Holding::Single(p)),
            (None, None) => None,
        };

        if !self.strategy_accepts(idx, tick, holding.is_some()) {
            return Ok(());
        }

        let action = match &holding {
            Some(h) => self.strategies[idx].on_position_update(h, tick, &self.state),
            None => {
                let max_positions = self.strategies[idx].params().max_positions;
                if self.state.position_count(name)? >= max_positions {
                    return Ok(());
                }
                self.strategies[idx].on_tick(tick, &self.state)
            }
        };

        let Some(action) = action else {
            return Ok(());
        };

        if let Err(reason) = self.validate_action(idx, &action, tick) {
            warn!(strategy = %name, action = %action.action_type.as_str(), reason = %reason,
                  "action rejected");
            self.record_decision(&action, &reason);
            return Ok(());
        }

        let result = self.executor.execute(&action, tick);
        if result.success {
            self.stats.actions_executed += 1;
            info!(
                strategy = %name,
                action = %action.action_type.as_str(),
                price = %result.fill_price.map(|p| format!("{p:.4}")).unwrap_or_else(|| "-".into()),
                shares = %result.shares_filled.map(|s| format!("{s:.2}")).unwrap_or_else(|| "-".into()),
                "action executed"
            );
        } else {
            self.stats.errors += 1;
            self.record_decision(
                &action,
                result.error.as_deref().unwrap_or("execution failed"),
            );
        }
        Ok(())
    }

    /// Per-strategy format/market-type filters always apply; the full entry
    /// filter (spread, extreme price) is skipped when managing an existing
    /// position so exits are never starved by a wide book.
    fn strategy_accepts(&self, idx: usize, tick: &Tick, has_position: bool) -> bool {
        let params = self.strategies[idx].params();
        if let Some(format) = tick.format {
            if !params.formats.contains(&format) {
                return false;
            }
        }
        if let Some(market_type) = tick.market_type {
            if !params.market_types.contains(&market_type) {
                return false;
            }
        }
        if !has_position && !self.strategies[idx].filter_tick(tick) {
            return false;
        }
        true
    }

    /// Hard limit checks before execution. Returns the rejection reason.
    fn validate_action(&self, idx: usize, action: &Action, tick: &Tick) -> Result<(), String> {
        let params = self.strategies[idx].params();
        let max = params.max_position_usd;

        for (label, size) in [
            ("size", action.size_usd),
            ("YES size", action.yes_size_usd),
            ("NO size", action.no_size_usd),
            ("add size", action.add_size_usd),
        ] {
            if let Some(size) = size {
                if size > max {
                    return Err(format!("{label} ${size:.2} exceeds limit ${max:.2}"));
                }
            }
        }

        // Don't sell into a one-sided book: exits wait for liquidity.
        if action.action_type.is_exit() {
            if let Some(spread) = tick.spread {
                if spread > params.max_exit_spread {
                    return Err(format!(
                        "exit blocked: spread {:.1}% > max {:.0}%",
                        spread * 100.0,
                        params.max_exit_spread * 100.0
                    ));
                }
            }
        }

        if matches!(action.action_type, ActionType::PartialClose) {
            match action.close_pct {
                Some(p) if p > 0.0 && p <= 1.0 => {}
                _ => return Err("close_pct must be in (0, 1]".to_string()),
            }
        }

        Ok(())
    }

    fn record_decision(&self, action: &Action, reason: &str) {
        let conn = self.db.lock();
        let result = conn.execute(
            "INSERT INTO trade_decisions
             (id, strategy_name, market_id, executed, rejected_reason, created_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                &action.strategy_name,
                action.market_id,
                reason,
                Utc::now().timestamp(),
            ],
        );
        if let Err(e) = result {
            error!(error = %e, "failed to record trade decision");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{EventKind, Tick};
    use crate::engine::strategy::StrategyParams;
    use crate::models::TokenSide;
    use std::collections::HashMap;

    struct SpreadOnce {
        params: StrategyParams,
        fired: bool,
    }

    impl Strategy for SpreadOnce {
        fn name(&self) -> &'static str {
            "spread_once"
        }
        fn params(&self) -> &StrategyParams {
            &self.params
        }
        fn on_tick(&mut self, tick: &Tick, _state: &StateManager) -> Option<Action> {
            if self.fired {
                return None;
            }
            self.fired = true;
            Some(
                Action::open_spread(tick.market_id, &tick.condition_id, "spread_once", 20.0, 20.0)
                    .with_reason("test entry"),
            )
        }
        fn on_position_update(
            &mut self,
            _holding: &Holding,
            tick: &Tick,
            _state: &StateManager,
        ) -> Option<Action> {
            // Partial-close YES by 30% on every management tick.
            Some(Action::partial_close(
                tick.market_id,
                &tick.condition_id,
                "spread_once",
                TokenSide::Yes,
                0.3,
            ))
        }
    }

    struct Oversized {
        params: StrategyParams,
    }

    impl Strategy for Oversized {
        fn name(&self) -> &'static str {
            "oversized"
        }
        fn params(&self) -> &StrategyParams {
            &self.params
        }
        fn on_tick(&mut self, tick: &Tick, _state: &StateManager) -> Option<Action> {
            Some(Action::open_long(
                tick.market_id,
                &tick.condition_id,
                "oversized",
                TokenSide::Yes,
                1_000.0,
            ))
        }
    }

    fn market_row(id: i64) -> MarketRow {
        MarketRow {
            market_id: id,
            condition_id: format!("0xc{id}"),
            yes_token_id: format!("yes-{id}"),
            no_token_id: format!("no-{id}"),
            question: "A vs B".to_string(),
            team_yes: "A".to_string(),
            team_no: "B".to_string(),
            game_start_time: Some(Utc::now()),
            format: Some(MatchFormat::Bo3),
            market_type: Some(MarketType::Moneyline),
            category: None,
            end_time: None,
            resolved: false,
            closed: false,
            liquidity: None,
            yes_price: Some(0.50),
            no_price: Some(0.50),
            best_bid: Some(0.49),
            best_ask: Some(0.51),
            last_quote_at: Some(Utc::now()),
        }
    }

    fn bare_tick(market_id: i64, message_id: &str) -> Tick {
        Tick {
            market_id,
            condition_id: format!("0xc{market_id}"),
            message_id: message_id.to_string(),
            team_yes: String::new(),
            team_no: String::new(),
            game_start_time: None,
            format: None,
            market_type: None,
            timestamp: Utc::now(),
            event_kind: EventKind::Trade,
            token_side: TokenSide::Yes,
            price: None,
            best_bid: None,
            best_ask: None,
            spread: None,
            mid_price: None,
            trade_size: None,
            trade_side: None,
            price_velocity_1m: None,
            yes_token_id: None,
            no_token_id: None,
            actual_yes_mid: None,
            actual_no_mid: None,
        }
    }

    fn router_with(markets: Vec<MarketRow>) -> (TickRouter, Db) {
        let db = Db::open_in_memory().unwrap();
        let state = StateManager::new(db.clone());
        let store = PositionStore::new(db.clone(), state.clone());
        let executor = PaperExecutor::new(store.clone());
        let cache: MarketCache = Arc::new(RwLock::new(HashMap::new()));
        {
            let mut w = cache.write();
            for m in markets {
                w.insert(m.market_id, m);
            }
        }
        (
            TickRouter::new(db.clone(), state, store, executor, cache),
            db,
        )
    }

    #[test]
    fn enrichment_fills_metadata_and_authoritative_mids() {
        let (mut router, _db) = router_with(vec![market_row(1)]);
        router.register_strategy(Box::new(SpreadOnce {
            params: StrategyParams::default(),
            fired: false,
        }));

        assert!(router.process_tick(&bare_tick(1, "m-1")));
        // Entry fired means enrichment delivered token ids and prices.
        assert_eq!(router.stats().actions_executed, 1);
    }

    #[test]
    fn replayed_message_produces_one_mutation() {
        let (mut router, db) = router_with(vec![market_row(7)]);
        router.register_strategy(Box::new(SpreadOnce {
            params: StrategyParams::default(),
            fired: false,
        }));

        // First delivery opens the spread.
        assert!(router.process_tick(&bare_tick(7, "m-123")));
        let legs_after_first: i64 = {
            let conn = db.lock();
            conn.query_row("SELECT COUNT(*) FROM position_legs", [], |r| r.get(0))
                .unwrap()
        };

        // Redelivery of the same message id: no further mutation.
        assert!(!router.process_tick(&bare_tick(7, "m-123")));
        let legs_after_second: i64 = {
            let conn = db.lock();
            conn.query_row("SELECT COUNT(*) FROM position_legs", [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(legs_after_first, legs_after_second);
        assert_eq!(router.stats().ticks_deduped, 1);
    }

    #[test]
    fn resolved_market_ticks_are_dropped() {
        let mut resolved = market_row(2);
        resolved.resolved = true;
        let (mut router, _db) = router_with(vec![resolved]);
        router.register_strategy(Box::new(SpreadOnce {
            params: StrategyParams::default(),
            fired: false,
        }));

        assert!(!router.process_tick(&bare_tick(2, "m-2")));
        assert_eq!(router.stats().ticks_filtered, 1);
        assert_eq!(router.stats().actions_executed, 0);
    }

    #[test]
    fn oversized_action_rejected_with_decision_row() {
        let (mut router, db) = router_with(vec![market_row(3)]);
        router.register_strategy(Box::new(Oversized {
            params: StrategyParams {
                max_position_usd: 100.0,
                ..StrategyParams::default()
            },
        }));

        assert!(router.process_tick(&bare_tick(3, "m-3")));
        assert_eq!(router.stats().actions_executed, 0);

        let conn = db.lock();
        let (executed, reason): (i64, String) = conn
            .query_row(
                "SELECT executed, rejected_reason FROM trade_decisions LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(executed, 0);
        assert!(reason.contains("exceeds limit"));
    }

    #[test]
    fn exit_blocked_on_wide_spread() {
        let (mut router, db) = router_with(vec![market_row(4)]);
        router.register_strategy(Box::new(SpreadOnce {
            params: StrategyParams::default(),
            fired: false,
        }));

        // Entry on a tight book.
        assert!(router.process_tick(&bare_tick(4, "m-4a")));
        assert_eq!(router.stats().actions_executed, 1);

        // Management tick arrives with a 40% spread: exit must be blocked.
        {
            let mut w = router.markets.write();
            let m = w.get_mut(&4).unwrap();
            m.best_bid = Some(0.30);
            m.best_ask = Some(0.70);
        }
        assert!(router.process_tick(&bare_tick(4, "m-4b")));
        assert_eq!(router.stats().actions_executed, 1);

        let conn = db.lock();
        let reason: String = conn
            .query_row(
                "SELECT rejected_reason FROM trade_decisions ORDER BY created_at DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(reason.contains("exit blocked"), "reason: {reason}");
    }

    #[test]
    fn position_cap_gates_new_entries() {
        let (mut router, _db) = router_with(vec![market_row(5), market_row(6)]);
        router.register_strategy(Box::new(SpreadOnce {
            params: StrategyParams {
                max_positions: 0,
                ..StrategyParams::default()
            },
            fired: false,
        }));

        assert!(router.process_tick(&bare_tick(5, "m-5")));
        // Cap of zero: no entry even though the strategy would fire.
        assert_eq!(router.stats().actions_executed, 0);
    }
}
