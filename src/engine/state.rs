//! Strategy state manager.
//!
//! Read-mostly access to open positions, spreads, capital, and per-market
//! strategy state, backed by in-memory caches over SQLite. Callers get plain
//! value snapshots, never live rows. Mutators must invalidate the affected
//! cache keys BEFORE committing their transaction: a reader that misses the
//! cache after invalidation re-reads post-commit state, so no stale entry
//! can outlive a write.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;

use crate::db::{ts_to_datetime, Db};
use crate::engine::capital::{self, CapitalSnapshot};
use crate::engine::positions::{PositionStatus, SpreadStatus};
use crate::models::{MatchFormat, TokenSide};

#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub id: i64,
    pub strategy_name: String,
    pub market_id: i64,
    pub condition_id: String,
    pub token_id: String,
    pub token_side: TokenSide,
    pub initial_shares: f64,
    pub remaining_shares: f64,
    pub avg_entry_price: f64,
    pub cost_basis: f64,
    pub current_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub spread_id: Option<i64>,
    pub team_yes: String,
    pub team_no: String,
    pub game_start_time: Option<DateTime<Utc>>,
    pub format: Option<MatchFormat>,
    pub status: PositionStatus,
    pub close_reason: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SpreadSnapshot {
    pub id: i64,
    pub strategy_name: String,
    pub market_id: i64,
    pub condition_id: String,
    pub spread_type: String,
    pub yes_position_id: Option<i64>,
    pub no_position_id: Option<i64>,
    pub total_cost_basis: f64,
    pub total_realized_pnl: f64,
    pub total_unrealized_pnl: f64,
    pub team_yes: String,
    pub team_no: String,
    pub entry_yes_price: Option<f64>,
    pub status: SpreadStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Per-(strategy, market) record for multi-stage strategies.
#[derive(Debug, Clone)]
pub struct MarketStateSnapshot {
    pub strategy_name: String,
    pub market_id: i64,
    pub condition_id: String,
    pub stage: String,
    pub entry_price: Option<f64>,
    pub switch_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub high_water_mark: Option<f64>,
    pub low_water_mark: Option<f64>,
    pub switches_count: i64,
    pub reentries_count: i64,
    pub current_side: Option<TokenSide>,
    pub custom_state: Option<String>,
    pub is_active: bool,
}

impl MarketStateSnapshot {
    pub fn new(strategy_name: &str, market_id: i64) -> Self {
        Self {
            strategy_name: strategy_name.to_string(),
            market_id,
            condition_id: String::new(),
            stage: "WAITING".to_string(),
            entry_price: None,
            switch_price: None,
            exit_price: None,
            high_water_mark: None,
            low_water_mark: None,
            switches_count: 0,
            reentries_count: 0,
            current_side: None,
            custom_state: None,
            is_active: true,
        }
    }
}

type PositionKey = (String, i64, Option<TokenSide>);

#[derive(Clone)]
pub struct StateManager {
    db: Db,
    position_cache: Arc<RwLock<HashMap<PositionKey, PositionSnapshot>>>,
    spread_cache: Arc<RwLock<HashMap<(String, i64), SpreadSnapshot>>>,
    capital_cache: Arc<RwLock<HashMap<String, CapitalSnapshot>>>,
    market_state_cache: Arc<RwLock<HashMap<(String, i64), MarketStateSnapshot>>>,
}

impl StateManager {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            position_cache: Arc::new(RwLock::new(HashMap::new())),
            spread_cache: Arc::new(RwLock::new(HashMap::new())),
            capital_cache: Arc::new(RwLock::new(HashMap::new())),
            market_state_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    // =========================================================================
    // Positions
    // =========================================================================

    /// Open (or partial) position for a strategy on a market, optionally
    /// restricted to one token side. The side is part of the cache key so a
    /// spread's two legs cache independently.
    pub fn get_position(
        &self,
        strategy: &str,
        market_id: i64,
        token_side: Option<TokenSide>,
    ) -> Result<Option<PositionSnapshot>> {
        let key = (strategy.to_string(), market_id, token_side);
        if let Some(hit) = self.position_cache.read().get(&key) {
            return Ok(Some(hit.clone()));
        }

        let conn = self.db.lock();
        let snap = match token_side {
            Some(side) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "{POSITION_SELECT} WHERE strategy_name = ?1 AND market_id = ?2
                     AND token_side = ?3 AND status IN ('open', 'partial') LIMIT 1"
                ))?;
                stmt.query_row(params![strategy, market_id, side.as_str()], position_from_row)
                    .optional()?
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "{POSITION_SELECT} WHERE strategy_name = ?1 AND market_id = ?2
                     AND status IN ('open', 'partial') LIMIT 1"
                ))?;
                stmt.query_row(params![strategy, market_id], position_from_row)
                    .optional()?
            }
        };
        drop(conn);

        if let Some(ref snap) = snap {
            self.position_cache.write().insert(key, snap.clone());
        }
        Ok(snap)
    }

    pub fn get_open_positions(&self, strategy: &str) -> Result<Vec<PositionSnapshot>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{POSITION_SELECT} WHERE strategy_name = ?1 AND status IN ('open', 'partial')"
        ))?;
        let rows = stmt.query_map(params![strategy], position_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn position_count(&self, strategy: &str) -> Result<i64> {
        let conn = self.db.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM positions WHERE strategy_name = ?1 AND status = 'open'",
            params![strategy],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    // =========================================================================
    // Spreads
    // =========================================================================

    pub fn get_spread(&self, strategy: &str, market_id: i64) -> Result<Option<SpreadSnapshot>> {
        let key = (strategy.to_string(), market_id);
        if let Some(hit) = self.spread_cache.read().get(&key) {
            return Ok(Some(hit.clone()));
        }

        let conn = self.db.lock();
        let snap = {
            let mut stmt = conn.prepare_cached(&format!(
                "{SPREAD_SELECT} WHERE strategy_name = ?1 AND market_id = ?2
                 AND status IN ('open', 'partial') LIMIT 1"
            ))?;
            stmt.query_row(params![strategy, market_id], spread_from_row)
                .optional()?
        };
        drop(conn);

        if let Some(ref snap) = snap {
            self.spread_cache.write().insert(key, snap.clone());
        }
        Ok(snap)
    }

    // =========================================================================
    // Capital
    // =========================================================================

    pub fn get_strategy_capital(&self, strategy: &str) -> Result<CapitalSnapshot> {
        if let Some(hit) = self.capital_cache.read().get(strategy) {
            return Ok(hit.clone());
        }
        let conn = self.db.lock();
        capital::ensure_row(&conn, strategy)?;
        let snap =
            capital::read_snapshot(&conn, strategy)?.context("capital row missing after insert")?;
        drop(conn);
        self.capital_cache
            .write()
            .insert(strategy.to_string(), snap.clone());
        Ok(snap)
    }

    pub fn has_capacity(&self, strategy: &str, size_usd: f64) -> bool {
        self.get_strategy_capital(strategy)
            .map(|s| s.available_usd >= size_usd)
            .unwrap_or(false)
    }

    pub fn available_usd(&self, strategy: &str) -> f64 {
        self.get_strategy_capital(strategy)
            .map(|s| s.available_usd)
            .unwrap_or(0.0)
    }

    // =========================================================================
    // Per-market strategy state
    // =========================================================================

    pub fn get_market_state(&self, strategy: &str, market_id: i64) -> Result<MarketStateSnapshot> {
        let key = (strategy.to_string(), market_id);
        if let Some(hit) = self.market_state_cache.read().get(&key) {
            return Ok(hit.clone());
        }

        let conn = self.db.lock();
        let existing = {
            let mut stmt = conn.prepare_cached(
                "SELECT strategy_name, market_id, condition_id, stage, entry_price, switch_price,
                        exit_price, high_water_mark, low_water_mark, switches_count,
                        reentries_count, current_side, custom_state, is_active
                 FROM strategy_market_state WHERE strategy_name = ?1 AND market_id = ?2",
            )?;
            stmt.query_row(params![strategy, market_id], market_state_from_row)
                .optional()?
        };

        let snap = match existing {
            Some(s) => s,
            None => {
                let fresh = MarketStateSnapshot::new(strategy, market_id);
                conn.execute(
                    "INSERT OR IGNORE INTO strategy_market_state
                     (strategy_name, market_id, stage, updated_at) VALUES (?1, ?2, 'WAITING', ?3)",
                    params![strategy, market_id, Utc::now().timestamp()],
                )?;
                fresh
            }
        };
        drop(conn);

        self.market_state_cache.write().insert(key, snap.clone());
        Ok(snap)
    }

    pub fn save_market_state(&self, snap: &MarketStateSnapshot) -> Result<()> {
        let key = (snap.strategy_name.clone(), snap.market_id);
        // Invalidate before the write commits.
        self.market_state_cache.write().remove(&key);

        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO strategy_market_state
             (strategy_name, market_id, condition_id, stage, entry_price, switch_price,
              exit_price, high_water_mark, low_water_mark, switches_count, reentries_count,
              current_side, custom_state, is_active, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(strategy_name, market_id) DO UPDATE SET
                condition_id = excluded.condition_id,
                stage = excluded.stage,
                entry_price = excluded.entry_price,
                switch_price = excluded.switch_price,
                exit_price = excluded.exit_price,
                high_water_mark = excluded.high_water_mark,
                low_water_mark = excluded.low_water_mark,
                switches_count = excluded.switches_count,
                reentries_count = excluded.reentries_count,
                current_side = excluded.current_side,
                custom_state = excluded.custom_state,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at",
            params![
                &snap.strategy_name,
                snap.market_id,
                &snap.condition_id,
                &snap.stage,
                snap.entry_price,
                snap.switch_price,
                snap.exit_price,
                snap.high_water_mark,
                snap.low_water_mark,
                snap.switches_count,
                snap.reentries_count,
                snap.current_side.map(|s| s.as_str()),
                snap.custom_state.as_deref(),
                snap.is_active as i64,
                Utc::now().timestamp(),
            ],
        )?;
        drop(conn);

        self.market_state_cache.write().insert(key, snap.clone());
        Ok(())
    }

    pub fn deactivate_market_state(&self, strategy: &str, market_id: i64) -> Result<()> {
        let key = (strategy.to_string(), market_id);
        self.market_state_cache.write().remove(&key);
        let conn = self.db.lock();
        conn.execute(
            "UPDATE strategy_market_state SET is_active = 0, updated_at = ?3
             WHERE strategy_name = ?1 AND market_id = ?2",
            params![strategy, market_id, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    // =========================================================================
    // Cache invalidation
    // =========================================================================

    pub fn invalidate_position(
        &self,
        strategy: &str,
        market_id: i64,
        token_side: Option<TokenSide>,
    ) {
        let mut cache = self.position_cache.write();
        match token_side {
            Some(side) => {
                cache.remove(&(strategy.to_string(), market_id, Some(side)));
                // The side-less key may be caching this same row.
                cache.remove(&(strategy.to_string(), market_id, None));
            }
            None => {
                for side in [None, Some(TokenSide::Yes), Some(TokenSide::No)] {
                    cache.remove(&(strategy.to_string(), market_id, side));
                }
            }
        }
    }

    pub fn invalidate_spread(&self, strategy: &str, market_id: i64) {
        self.spread_cache
            .write()
            .remove(&(strategy.to_string(), market_id));
    }

    pub fn invalidate_capital(&self, strategy: &str) {
        self.capital_cache.write().remove(strategy);
    }

    pub fn clear_cache(&self) {
        self.position_cache.write().clear();
        self.spread_cache.write().clear();
        self.capital_cache.write().clear();
        self.market_state_cache.write().clear();
    }
}

const POSITION_SELECT: &str = "SELECT id, strategy_name, market_id, condition_id, token_id, \
     token_side, initial_shares, remaining_shares, avg_entry_price, cost_basis, current_price, \
     unrealized_pnl, realized_pnl, spread_id, team_yes, team_no, game_start_time, format, \
     status, close_reason, opened_at, closed_at FROM positions";

pub(crate) fn position_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PositionSnapshot> {
    let side_str: String = row.get(5)?;
    let status_str: String = row.get(18)?;
    Ok(PositionSnapshot {
        id: row.get(0)?,
        strategy_name: row.get(1)?,
        market_id: row.get(2)?,
        condition_id: row.get(3)?,
        token_id: row.get(4)?,
        token_side: TokenSide::parse(&side_str).unwrap_or(TokenSide::Yes),
        initial_shares: row.get(6)?,
        remaining_shares: row.get(7)?,
        avg_entry_price: row.get(8)?,
        cost_basis: row.get(9)?,
        current_price: row.get(10)?,
        unrealized_pnl: row.get(11)?,
        realized_pnl: row.get(12)?,
        spread_id: row.get(13)?,
        team_yes: row.get(14)?,
        team_no: row.get(15)?,
        game_start_time: row.get::<_, Option<i64>>(16)?.map(ts_to_datetime),
        format: row
            .get::<_, Option<String>>(17)?
            .as_deref()
            .and_then(MatchFormat::parse),
        status: PositionStatus::parse(&status_str),
        close_reason: row.get(19)?,
        opened_at: ts_to_datetime(row.get(20)?),
        closed_at: row.get::<_, Option<i64>>(21)?.map(ts_to_datetime),
    })
}

const SPREAD_SELECT: &str = "SELECT id, strategy_name, market_id, condition_id, spread_type, \
     yes_position_id, no_position_id, total_cost_basis, total_realized_pnl, \
     total_unrealized_pnl, team_yes, team_no, entry_yes_price, status, opened_at, closed_at \
     FROM spreads";

pub(crate) fn spread_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SpreadSnapshot> {
    let status_str: String = row.get(13)?;
    Ok(SpreadSnapshot {
        id: row.get(0)?,
        strategy_name: row.get(1)?,
        market_id: row.get(2)?,
        condition_id: row.get(3)?,
        spread_type: row.get(4)?,
        yes_position_id: row.get(5)?,
        no_position_id: row.get(6)?,
        total_cost_basis: row.get(7)?,
        total_realized_pnl: row.get(8)?,
        total_unrealized_pnl: row.get(9)?,
        team_yes: row.get(10)?,
        team_no: row.get(11)?,
        entry_yes_price: row.get(12)?,
        status: SpreadStatus::parse(&status_str),
        opened_at: ts_to_datetime(row.get(14)?),
        closed_at: row.get::<_, Option<i64>>(15)?.map(ts_to_datetime),
    })
}

fn market_state_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MarketStateSnapshot> {
    Ok(MarketStateSnapshot {
        strategy_name: row.get(0)?,
        market_id: row.get(1)?,
        condition_id: row.get(2)?,
        stage: row.get(3)?,
        entry_price: row.get(4)?,
        switch_price: row.get(5)?,
        exit_price: row.get(6)?,
        high_water_mark: row.get(7)?,
        low_water_mark: row.get(8)?,
        switches_count: row.get(9)?,
        reentries_count: row.get(10)?,
        current_side: row
            .get::<_, Option<String>>(11)?
            .as_deref()
            .and_then(TokenSide::parse),
        custom_state: row.get(12)?,
        is_active: row.get::<_, i64>(13)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_state_created_on_first_read() {
        let db = Db::open_in_memory().unwrap();
        let state = StateManager::new(db);
        let snap = state.get_market_state("hedge", 9).unwrap();
        assert_eq!(snap.stage, "WAITING");
        assert!(snap.is_active);
    }

    #[test]
    fn market_state_roundtrip() {
        let db = Db::open_in_memory().unwrap();
        let state = StateManager::new(db);
        let mut snap = state.get_market_state("hedge", 9).unwrap();
        snap.stage = "ENTERED".to_string();
        snap.entry_price = Some(0.58);
        snap.current_side = Some(TokenSide::Yes);
        state.save_market_state(&snap).unwrap();

        state.clear_cache();
        let reread = state.get_market_state("hedge", 9).unwrap();
        assert_eq!(reread.stage, "ENTERED");
        assert_eq!(reread.entry_price, Some(0.58));
        assert_eq!(reread.current_side, Some(TokenSide::Yes));
    }

    #[test]
    fn capital_snapshot_cached_and_invalidated() {
        let db = Db::open_in_memory().unwrap();
        let state = StateManager::new(db.clone());
        assert!(state.has_capacity("s", 100.0));

        // Mutate under the cache's feet, then invalidate.
        {
            let conn = db.lock();
            conn.execute(
                "UPDATE strategy_capital SET available_usd = 1.0 WHERE strategy_name = 's'",
                [],
            )
            .unwrap();
        }
        // Stale until invalidated.
        assert!(state.has_capacity("s", 100.0));
        state.invalidate_capital("s");
        assert!(!state.has_capacity("s", 100.0));
    }
}
