//! Pre-trade safety checks.
//!
//! Uniform gate in front of both executors. Checks run cheapest-first in a
//! fixed order and short-circuit on the first failure; every rejection is
//! recorded as a trade-decision row so rejected signals stay diagnosable.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use tracing::{error, warn};
use uuid::Uuid;

use crate::db::{round_money, round_price, Db};
use crate::models::{OrderSide, TokenSide};

/// Strategy intent to open a position, persisted before execution.
#[derive(Debug, Clone)]
pub struct Signal {
    pub id: String,
    pub strategy_name: String,
    pub market_id: i64,
    pub token_id: String,
    pub token_side: TokenSide,
    pub side: OrderSide,
    pub reason: String,
    pub edge: Option<f64>,
    pub confidence: Option<f64>,
    pub price_at_signal: Option<f64>,
    pub suggested_size_usd: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        strategy_name: &str,
        market_id: i64,
        token_id: &str,
        token_side: TokenSide,
        side: OrderSide,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            strategy_name: strategy_name.to_string(),
            market_id,
            token_id: token_id.to_string(),
            token_side,
            side,
            reason: String::new(),
            edge: None,
            confidence: None,
            price_at_signal: None,
            suggested_size_usd: None,
            created_at: Utc::now(),
        }
    }

    pub fn age_seconds(&self) -> f64 {
        (Utc::now() - self.created_at).num_milliseconds() as f64 / 1000.0
    }
}

#[derive(Debug, Clone)]
pub struct SafetyLimits {
    pub max_position_usd: f64,
    pub max_exit_spread: f64,
    pub max_signal_age_seconds: f64,
    pub max_price_deviation: f64,
    pub max_spread: f64,
    /// Extreme-price band; set `check_extreme_price = false` for strategies
    /// that deliberately trade near resolution.
    pub min_entry_price: f64,
    pub max_entry_price: f64,
    pub check_extreme_price: bool,
    pub recent_order_window_minutes: i64,
    pub max_fee_rate_bps: i64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_position_usd: 100.0,
            max_exit_spread: 0.15,
            max_signal_age_seconds: 5.0,
            max_price_deviation: 0.03,
            max_spread: 0.03,
            min_entry_price: 0.05,
            max_entry_price: 0.95,
            check_extreme_price: true,
            recent_order_window_minutes: 10,
            max_fee_rate_bps: 200,
        }
    }
}

/// Market observations the checks compare the signal against.
#[derive(Debug, Clone, Default)]
pub struct MarketObservation {
    pub live_mid: Option<f64>,
    pub spread: Option<f64>,
    pub fee_rate_bps: Option<i64>,
    /// True when the signal closes an existing position.
    pub is_exit: bool,
}

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub passed: bool,
    pub reason: String,
}

impl CheckOutcome {
    fn pass() -> Self {
        Self {
            passed: true,
            reason: String::new(),
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
        }
    }
}

#[derive(Clone)]
pub struct SafetyChecker {
    db: Db,
    limits: SafetyLimits,
}

impl SafetyChecker {
    pub fn new(db: Db, limits: SafetyLimits) -> Self {
        Self { db, limits }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Run every check in order; first failure wins.
    pub fn check_all(&self, signal: &Signal, obs: &MarketObservation) -> CheckOutcome {
        // 1. Size limit.
        if let Some(size) = signal.suggested_size_usd {
            if size > self.limits.max_position_usd {
                return CheckOutcome::fail(format!(
                    "size ${size:.2} exceeds max ${:.2}",
                    self.limits.max_position_usd
                ));
            }
        }

        // 2. Exit spread (closes only).
        if obs.is_exit {
            if let Some(spread) = obs.spread {
                if spread > self.limits.max_exit_spread {
                    return CheckOutcome::fail(format!(
                        "exit spread {:.1}% > max {:.0}%",
                        spread * 100.0,
                        self.limits.max_exit_spread * 100.0
                    ));
                }
            }
            // Remaining checks guard entries.
            return CheckOutcome::pass();
        }

        // 3. Signal age.
        let age = signal.age_seconds();
        if age > self.limits.max_signal_age_seconds {
            return CheckOutcome::fail(format!(
                "signal too old: {age:.1}s > max {:.0}s",
                self.limits.max_signal_age_seconds
            ));
        }

        // 4. Price deviation vs the live book.
        if let (Some(live_mid), Some(signal_mid)) = (obs.live_mid, signal.price_at_signal) {
            if signal_mid > 0.0 {
                let deviation = (live_mid - signal_mid).abs() / signal_mid;
                if deviation > self.limits.max_price_deviation {
                    return CheckOutcome::fail(format!(
                        "price moved too much: signal={signal_mid:.4}, live={live_mid:.4}, \
                         deviation {:.1}% > max {:.0}%",
                        deviation * 100.0,
                        self.limits.max_price_deviation * 100.0
                    ));
                }
            }
        }

        // 5. Entry spread.
        if let Some(spread) = obs.spread {
            if spread > self.limits.max_spread {
                return CheckOutcome::fail(format!(
                    "spread {:.1}% > max {:.1}%",
                    spread * 100.0,
                    self.limits.max_spread * 100.0
                ));
            }
        }

        // 6. Extreme price.
        if self.limits.check_extreme_price {
            if let Some(price) = signal.price_at_signal {
                if price < self.limits.min_entry_price || price > self.limits.max_entry_price {
                    return CheckOutcome::fail(format!(
                        "price {price:.4} outside [{:.2}, {:.2}]",
                        self.limits.min_entry_price, self.limits.max_entry_price
                    ));
                }
            }
        }

        // 7. Duplicate position on this token.
        match self.has_open_position(&signal.strategy_name, &signal.token_id) {
            Ok(true) => {
                return CheckOutcome::fail("duplicate: open position exists on this token")
            }
            Ok(false) => {}
            Err(e) => {
                // Can't verify - block for safety.
                error!(error = %e, "could not check open positions");
                return CheckOutcome::fail(format!("could not verify positions: {e}"));
            }
        }

        // 8. Recent order on this token.
        match self.has_recent_order(&signal.token_id) {
            Ok(true) => {
                return CheckOutcome::fail(format!(
                    "recent order on this token within last {} min",
                    self.limits.recent_order_window_minutes
                ))
            }
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "could not check recent orders");
                return CheckOutcome::fail(format!("could not verify recent orders: {e}"));
            }
        }

        // 9. Fee rate.
        if let Some(fee_bps) = obs.fee_rate_bps {
            if fee_bps > self.limits.max_fee_rate_bps {
                return CheckOutcome::fail(format!(
                    "fee rate {fee_bps} bps > max {} bps",
                    self.limits.max_fee_rate_bps
                ));
            }
        }

        CheckOutcome::pass()
    }

    fn has_open_position(&self, strategy: &str, token_id: &str) -> Result<bool> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM positions
             WHERE strategy_name = ?1 AND token_id = ?2 AND status IN ('open', 'partial')",
            params![strategy, token_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    fn has_recent_order(&self, token_id: &str) -> Result<bool> {
        let cutoff =
            (Utc::now() - Duration::minutes(self.limits.recent_order_window_minutes)).timestamp();
        let conn = self.db.lock();
        // Cancelled orders count too - they might have actually filled.
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE token_id = ?1 AND submitted_at >= ?2
             AND status IN ('pending', 'submitted', 'filled', 'cancelled')",
            params![token_id, cutoff],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    pub fn insert_signal(&self, signal: &Signal) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT OR REPLACE INTO signals
             (id, strategy_name, market_id, token_id, side, reason, edge, confidence,
              price_at_signal, suggested_size_usd, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'new', ?11)",
            params![
                &signal.id,
                &signal.strategy_name,
                signal.market_id,
                &signal.token_id,
                signal.side.as_str(),
                &signal.reason,
                signal.edge.map(round_price),
                signal.confidence.map(round_price),
                signal.price_at_signal.map(round_price),
                signal.suggested_size_usd.map(round_money),
                signal.created_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn mark_signal(&self, signal_id: &str, status: &str) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE signals SET status = ?2, processed_at = ?3 WHERE id = ?1",
            params![signal_id, status, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn record_decision(&self, signal: &Signal, executed: bool, reason: Option<&str>) {
        let conn = self.db.lock();
        let result = conn.execute(
            "INSERT INTO trade_decisions
             (id, signal_id, strategy_name, market_id, token_id, executed, rejected_reason,
              created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Uuid::new_v4().to_string(),
                &signal.id,
                &signal.strategy_name,
                signal.market_id,
                &signal.token_id,
                executed as i64,
                reason,
                Utc::now().timestamp(),
            ],
        );
        if let Err(e) = result {
            error!(error = %e, "failed to record trade decision");
        }
        if let Some(reason) = reason {
            warn!(
                strategy = %signal.strategy_name,
                token_id = %signal.token_id,
                reason = %reason,
                "signal rejected"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> SafetyChecker {
        SafetyChecker::new(Db::open_in_memory().unwrap(), SafetyLimits::default())
    }

    fn signal() -> Signal {
        let mut s = Signal::new("imbalance", 1, "tok-1", TokenSide::Yes, OrderSide::Buy);
        s.price_at_signal = Some(0.50);
        s.suggested_size_usd = Some(10.0);
        s
    }

    fn obs() -> MarketObservation {
        MarketObservation {
            live_mid: Some(0.50),
            spread: Some(0.02),
            fee_rate_bps: Some(0),
            is_exit: false,
        }
    }

    #[test]
    fn clean_signal_passes() {
        let outcome = checker().check_all(&signal(), &obs());
        assert!(outcome.passed, "reason: {}", outcome.reason);
    }

    #[test]
    fn stale_signal_rejected() {
        let mut s = signal();
        s.created_at = Utc::now() - Duration::seconds(7);
        let outcome = checker().check_all(&s, &obs());
        assert!(!outcome.passed);
        assert!(outcome.reason.contains("too old"));
    }

    #[test]
    fn price_deviation_rejected() {
        // Scenario: signal mid 0.30, live mid 0.28 -> 6.67% > 3%.
        let mut s = signal();
        s.price_at_signal = Some(0.30);
        let mut o = obs();
        o.live_mid = Some(0.28);
        let outcome = checker().check_all(&s, &o);
        assert!(!outcome.passed);
        assert!(outcome.reason.contains("moved too much"));
    }

    #[test]
    fn wide_spread_rejected() {
        let mut o = obs();
        o.spread = Some(0.05);
        let outcome = checker().check_all(&signal(), &o);
        assert!(!outcome.passed);
        assert!(outcome.reason.contains("spread"));
    }

    #[test]
    fn extreme_price_rejected_unless_opted_out() {
        let mut s = signal();
        s.price_at_signal = Some(0.97);
        let mut o = obs();
        o.live_mid = Some(0.97);
        let outcome = checker().check_all(&s, &o);
        assert!(!outcome.passed);

        let mut limits = SafetyLimits::default();
        limits.check_extreme_price = false;
        let lenient = SafetyChecker::new(Db::open_in_memory().unwrap(), limits);
        let outcome = lenient.check_all(&s, &o);
        assert!(outcome.passed, "reason: {}", outcome.reason);
    }

    #[test]
    fn oversize_rejected_first() {
        let mut s = signal();
        s.suggested_size_usd = Some(500.0);
        // Even with a stale timestamp, size is the first reported failure.
        s.created_at = Utc::now() - Duration::seconds(60);
        let outcome = checker().check_all(&s, &obs());
        assert!(outcome.reason.contains("exceeds max"));
    }

    #[test]
    fn duplicate_position_rejected() {
        let db = Db::open_in_memory().unwrap();
        {
            let conn = db.lock();
            conn.execute(
                "INSERT INTO positions (strategy_name, market_id, condition_id, token_id,
                 token_side, initial_shares, remaining_shares, avg_entry_price, cost_basis,
                 status, opened_at)
                 VALUES ('imbalance', 1, '0xc1', 'tok-1', 'YES', 10, 10, 0.5, 5.0, 'open', 0)",
                [],
            )
            .unwrap();
        }
        let checker = SafetyChecker::new(db, SafetyLimits::default());
        let outcome = checker.check_all(&signal(), &obs());
        assert!(!outcome.passed);
        assert!(outcome.reason.contains("duplicate"));
    }

    #[test]
    fn recent_order_rejected() {
        let db = Db::open_in_memory().unwrap();
        {
            let conn = db.lock();
            conn.execute(
                "INSERT INTO orders (is_paper, token_id, side, order_type, size_usd, status,
                 submitted_at)
                 VALUES (0, 'tok-1', 'BUY', 'limit', 10.0, 'cancelled', ?1)",
                params![Utc::now().timestamp() - 60],
            )
            .unwrap();
        }
        let checker = SafetyChecker::new(db, SafetyLimits::default());
        let outcome = checker.check_all(&signal(), &obs());
        assert!(!outcome.passed);
        assert!(outcome.reason.contains("recent order"));
    }

    #[test]
    fn high_fee_rejected() {
        let mut o = obs();
        o.fee_rate_bps = Some(1000);
        let outcome = checker().check_all(&signal(), &o);
        assert!(!outcome.passed);
        assert!(outcome.reason.contains("fee rate"));
    }

    #[test]
    fn exit_only_checks_exit_spread() {
        let mut s = signal();
        s.created_at = Utc::now() - Duration::seconds(60); // would fail age as entry
        let mut o = obs();
        o.is_exit = true;
        o.spread = Some(0.10);
        let outcome = checker().check_all(&s, &o);
        assert!(outcome.passed, "reason: {}", outcome.reason);

        o.spread = Some(0.20);
        let outcome = checker().check_all(&s, &o);
        assert!(!outcome.passed);
    }

    #[test]
    fn decisions_are_recorded() {
        let db = Db::open_in_memory().unwrap();
        let checker = SafetyChecker::new(db.clone(), SafetyLimits::default());
        let s = signal();
        checker.insert_signal(&s).unwrap();
        checker.record_decision(&s, false, Some("spread too wide"));

        let conn = db.lock();
        let (executed, reason): (i64, String) = conn
            .query_row(
                "SELECT executed, rejected_reason FROM trade_decisions WHERE signal_id = ?1",
                params![&s.id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(executed, 0);
        assert_eq!(reason, "spread too wide");
    }
}
