//! Per-strategy capital ledger.
//!
//! The ledger is the synchronization point for capital: every reserve and
//! credit runs on the shared connection, and reserve is a guarded update so
//! a concurrent writer can never take the same dollars twice. Invariant:
//! `allocated = available + cost_basis(open positions) - realized_pnl`.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::db::{round_money, Db};

/// Budget assigned to a strategy the first time it trades.
pub const DEFAULT_ALLOCATED_USD: f64 = 400.0;

#[derive(Debug, Error)]
pub enum CapitalError {
    #[error("insufficient capital for {strategy}: available ${available:.2} < required ${required:.2}")]
    Insufficient {
        strategy: String,
        available: f64,
        required: f64,
    },
}

#[derive(Debug, Clone)]
pub struct CapitalSnapshot {
    pub strategy_name: String,
    pub allocated_usd: f64,
    pub available_usd: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub trade_count: i64,
    pub win_count: i64,
    pub loss_count: i64,
    pub high_water_mark: f64,
    pub max_drawdown: f64,
    pub is_active: bool,
}

/// Create the strategy row with the default budget if it does not exist.
pub(crate) fn ensure_row(conn: &Connection, strategy: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO strategy_capital
         (strategy_name, allocated_usd, available_usd, high_water_mark)
         VALUES (?1, ?2, ?2, ?2)
         ON CONFLICT(strategy_name) DO NOTHING",
        params![strategy, DEFAULT_ALLOCATED_USD],
    )?;
    Ok(())
}

/// Reserve `amount` from the strategy's available capital.
///
/// Guarded update: affects zero rows when available < amount, in which case
/// the caller gets `CapitalError::Insufficient` and must abort its
/// transaction.
pub(crate) fn reserve(conn: &Connection, strategy: &str, amount: f64) -> Result<()> {
    ensure_row(conn, strategy)?;
    let amount = round_money(amount);
    let updated = conn.execute(
        "UPDATE strategy_capital
         SET available_usd = available_usd - ?2,
             trade_count = trade_count + 1,
             last_trade_at = ?3
         WHERE strategy_name = ?1 AND available_usd >= ?2",
        params![strategy, amount, Utc::now().timestamp()],
    )?;
    if updated == 0 {
        let available: f64 = conn
            .query_row(
                "SELECT available_usd FROM strategy_capital WHERE strategy_name = ?1",
                params![strategy],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or(0.0);
        return Err(CapitalError::Insufficient {
            strategy: strategy.to_string(),
            available,
            required: amount,
        }
        .into());
    }
    Ok(())
}

/// Return `return_amount` to available capital and record `realized_delta`
/// of realized P&L. Updates win/loss counts and the high-water mark.
pub(crate) fn credit(
    conn: &Connection,
    strategy: &str,
    return_amount: f64,
    realized_delta: f64,
) -> Result<()> {
    ensure_row(conn, strategy)?;
    let return_amount = round_money(return_amount);
    let realized_delta = round_money(realized_delta);
    conn.execute(
        "UPDATE strategy_capital
         SET available_usd = available_usd + ?2,
             realized_pnl = realized_pnl + ?3,
             win_count = win_count + (CASE WHEN ?3 > 0 THEN 1 ELSE 0 END),
             loss_count = loss_count + (CASE WHEN ?3 < 0 THEN 1 ELSE 0 END)
         WHERE strategy_name = ?1",
        params![strategy, return_amount, realized_delta],
    )?;
    conn.execute(
        "UPDATE strategy_capital
         SET high_water_mark = MAX(high_water_mark, available_usd + unrealized_pnl),
             max_drawdown = MAX(max_drawdown,
                                high_water_mark - (available_usd + unrealized_pnl))
         WHERE strategy_name = ?1",
        params![strategy],
    )?;
    Ok(())
}

pub(crate) fn read_snapshot(conn: &Connection, strategy: &str) -> Result<Option<CapitalSnapshot>> {
    let mut stmt = conn.prepare_cached(
        "SELECT strategy_name, allocated_usd, available_usd, realized_pnl, unrealized_pnl,
                trade_count, win_count, loss_count, high_water_mark, max_drawdown, is_active
         FROM strategy_capital WHERE strategy_name = ?1",
    )?;
    let snap = stmt
        .query_row(params![strategy], |row| {
            Ok(CapitalSnapshot {
                strategy_name: row.get(0)?,
                allocated_usd: row.get(1)?,
                available_usd: row.get(2)?,
                realized_pnl: row.get(3)?,
                unrealized_pnl: row.get(4)?,
                trade_count: row.get(5)?,
                win_count: row.get(6)?,
                loss_count: row.get(7)?,
                high_water_mark: row.get(8)?,
                max_drawdown: row.get(9)?,
                is_active: row.get::<_, i64>(10)? != 0,
            })
        })
        .optional()?;
    Ok(snap)
}

/// Standalone ledger handle for callers outside the position store's
/// transactions.
#[derive(Clone)]
pub struct CapitalLedger {
    db: Db,
}

impl CapitalLedger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn get_or_create(&self, strategy: &str) -> Result<CapitalSnapshot> {
        let conn = self.db.lock();
        ensure_row(&conn, strategy)?;
        read_snapshot(&conn, strategy)?.context("strategy capital row missing after insert")
    }

    pub fn reserve(&self, strategy: &str, amount: f64) -> Result<()> {
        let conn = self.db.lock();
        reserve(&conn, strategy, amount)
    }

    pub fn credit(&self, strategy: &str, return_amount: f64, realized_delta: f64) -> Result<()> {
        let conn = self.db.lock();
        credit(&conn, strategy, return_amount, realized_delta)
    }

    /// Overwrite the strategy's aggregate unrealized P&L.
    pub fn update_unrealized(&self, strategy: &str, amount: f64) -> Result<()> {
        let conn = self.db.lock();
        ensure_row(&conn, strategy)?;
        conn.execute(
            "UPDATE strategy_capital SET unrealized_pnl = ?2 WHERE strategy_name = ?1",
            params![strategy, round_money(amount)],
        )?;
        Ok(())
    }

    pub fn has_capacity(&self, strategy: &str, size_usd: f64) -> Result<bool> {
        Ok(self.get_or_create(strategy)?.available_usd >= size_usd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> CapitalLedger {
        CapitalLedger::new(Db::open_in_memory().unwrap())
    }

    #[test]
    fn creates_row_with_default_budget() {
        let ledger = ledger();
        let snap = ledger.get_or_create("scalp").unwrap();
        assert_eq!(snap.allocated_usd, DEFAULT_ALLOCATED_USD);
        assert_eq!(snap.available_usd, DEFAULT_ALLOCATED_USD);
        assert_eq!(snap.trade_count, 0);
    }

    #[test]
    fn reserve_decrements_and_counts() {
        let ledger = ledger();
        ledger.reserve("scalp", 40.0).unwrap();
        let snap = ledger.get_or_create("scalp").unwrap();
        assert_eq!(snap.available_usd, 360.0);
        assert_eq!(snap.trade_count, 1);
    }

    #[test]
    fn reserve_fails_when_insufficient() {
        let ledger = ledger();
        let err = ledger.reserve("scalp", 500.0).unwrap_err();
        let cap = err.downcast_ref::<CapitalError>().expect("typed error");
        match cap {
            CapitalError::Insufficient {
                available, required, ..
            } => {
                assert_eq!(*available, DEFAULT_ALLOCATED_USD);
                assert_eq!(*required, 500.0);
            }
        }
        // Nothing was taken.
        let snap = ledger.get_or_create("scalp").unwrap();
        assert_eq!(snap.available_usd, DEFAULT_ALLOCATED_USD);
        assert_eq!(snap.trade_count, 0);
    }

    #[test]
    fn credit_updates_pnl_and_watermark() {
        let ledger = ledger();
        ledger.reserve("scalp", 100.0).unwrap();
        ledger.credit("scalp", 112.0, 12.0).unwrap();

        let snap = ledger.get_or_create("scalp").unwrap();
        assert_eq!(snap.available_usd, 412.0);
        assert_eq!(snap.realized_pnl, 12.0);
        assert_eq!(snap.win_count, 1);
        assert_eq!(snap.loss_count, 0);
        assert_eq!(snap.high_water_mark, 412.0);

        ledger.reserve("scalp", 50.0).unwrap();
        ledger.credit("scalp", 30.0, -20.0).unwrap();
        let snap = ledger.get_or_create("scalp").unwrap();
        assert_eq!(snap.loss_count, 1);
        assert_eq!(snap.high_water_mark, 412.0);
        assert!((snap.max_drawdown - 20.0).abs() < 1e-9);
    }

    #[test]
    fn capital_conservation_across_cycle() {
        // allocated = available + open cost - realized at every step.
        let ledger = ledger();
        ledger.reserve("s", 60.0).unwrap(); // open at $60
        let snap = ledger.get_or_create("s").unwrap();
        assert!((snap.allocated_usd - (snap.available_usd + 60.0 - snap.realized_pnl)).abs() < 1e-6);

        ledger.credit("s", 75.0, 15.0).unwrap(); // close at $75
        let snap = ledger.get_or_create("s").unwrap();
        assert!((snap.allocated_usd - (snap.available_usd - snap.realized_pnl)).abs() < 1e-6);
    }

    #[test]
    fn update_unrealized_overwrites() {
        let ledger = ledger();
        ledger.update_unrealized("s", 7.5).unwrap();
        assert_eq!(ledger.get_or_create("s").unwrap().unrealized_pnl, 7.5);
        ledger.update_unrealized("s", -2.0).unwrap();
        assert_eq!(ledger.get_or_create("s").unwrap().unrealized_pnl, -2.0);
    }
}
