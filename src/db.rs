//! SQLite persistence layer.
//!
//! One shared connection (WAL mode) behind a `parking_lot::Mutex`. Critical
//! sections are short and never held across awaits; multi-row lifecycle
//! writes run inside explicit transactions so a crash can never leave legs
//! without a position or a spread referencing missing legs.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection};
use std::sync::Arc;

use crate::models::{MarketType, MatchFormat};

/// Round to 6 decimals before persisting a price.
pub fn round_price(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

/// Round to 2 decimals before persisting a money amount.
pub fn round_money(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

/// Reference data for one market, denormalized with the latest quotes from
/// the authoritative book cache. The engine never mutates the identity
/// columns; quote columns are refreshed by the price poller.
#[derive(Debug, Clone)]
pub struct MarketRow {
    pub market_id: i64,
    pub condition_id: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub question: String,
    pub team_yes: String,
    pub team_no: String,
    pub game_start_time: Option<DateTime<Utc>>,
    pub format: Option<MatchFormat>,
    pub market_type: Option<MarketType>,
    pub category: Option<String>,
    pub end_time: Option<DateTime<Utc>>,
    pub resolved: bool,
    pub closed: bool,
    pub liquidity: Option<f64>,
    pub yes_price: Option<f64>,
    pub no_price: Option<f64>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub last_quote_at: Option<DateTime<Utc>>,
}

impl MarketRow {
    /// Spread from the cached book quotes. The raw stream spread field is
    /// unreliable; this is always recomputed from bid/ask with a
    /// conservative fallback when the book is one-sided.
    pub fn computed_spread(&self) -> f64 {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) if bid > 0.0 => {
                let spread = ask - bid;
                if spread < 0.0 || spread > 0.50 {
                    0.10
                } else {
                    spread
                }
            }
            _ => 0.10,
        }
    }
}

/// Buffered per-tick row, flushed in batches for charting/diagnosis.
#[derive(Debug, Clone)]
pub struct PriceTickRow {
    pub market_id: i64,
    pub ts: i64,
    pub token_side: String,
    pub event_kind: String,
    pub price: Option<f64>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub spread: Option<f64>,
    pub trade_size: Option<f64>,
    pub trade_side: Option<String>,
}

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open engine db")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory db")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the shared connection. Do not hold across await points.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS markets (
                market_id INTEGER PRIMARY KEY,
                condition_id TEXT NOT NULL UNIQUE,
                yes_token_id TEXT NOT NULL,
                no_token_id TEXT NOT NULL,
                question TEXT NOT NULL DEFAULT '',
                team_yes TEXT NOT NULL DEFAULT '',
                team_no TEXT NOT NULL DEFAULT '',
                game_start_time INTEGER,
                format TEXT,
                market_type TEXT,
                category TEXT,
                end_time INTEGER,
                resolved INTEGER NOT NULL DEFAULT 0,
                closed INTEGER NOT NULL DEFAULT 0,
                subscribed INTEGER NOT NULL DEFAULT 0,
                liquidity REAL,
                yes_price REAL,
                no_price REAL,
                best_bid REAL,
                best_ask REAL,
                last_quote_at INTEGER
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_name TEXT NOT NULL,
                market_id INTEGER NOT NULL,
                condition_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                token_side TEXT NOT NULL,
                side TEXT NOT NULL DEFAULT 'BUY',
                initial_shares REAL NOT NULL,
                remaining_shares REAL NOT NULL,
                avg_entry_price REAL NOT NULL,
                cost_basis REAL NOT NULL,
                current_price REAL,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                realized_pnl REAL NOT NULL DEFAULT 0,
                spread_id INTEGER,
                team_yes TEXT NOT NULL DEFAULT '',
                team_no TEXT NOT NULL DEFAULT '',
                game_start_time INTEGER,
                format TEXT,
                status TEXT NOT NULL DEFAULT 'open',
                close_reason TEXT,
                opened_at INTEGER NOT NULL,
                closed_at INTEGER
            )",
            [],
        )?;
        // One live position per (strategy, market, token).
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_open_unique
             ON positions(strategy_name, market_id, token_id)
             WHERE status IN ('open', 'partial')",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_positions_market_status
             ON positions(market_id, status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_positions_strategy_status
             ON positions(strategy_name, status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS position_legs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id INTEGER NOT NULL REFERENCES positions(id),
                leg_type TEXT NOT NULL,
                shares_delta REAL NOT NULL,
                price REAL NOT NULL,
                cost_delta REAL NOT NULL,
                realized_pnl REAL,
                trigger_price REAL,
                trigger_reason TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_position_legs_position
             ON position_legs(position_id, created_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS spreads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_name TEXT NOT NULL,
                market_id INTEGER NOT NULL,
                condition_id TEXT NOT NULL,
                spread_type TEXT NOT NULL,
                yes_position_id INTEGER,
                no_position_id INTEGER,
                total_cost_basis REAL NOT NULL,
                total_realized_pnl REAL NOT NULL DEFAULT 0,
                total_unrealized_pnl REAL NOT NULL DEFAULT 0,
                team_yes TEXT NOT NULL DEFAULT '',
                team_no TEXT NOT NULL DEFAULT '',
                entry_yes_price REAL,
                status TEXT NOT NULL DEFAULT 'open',
                opened_at INTEGER NOT NULL,
                closed_at INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_spreads_strategy_market
             ON spreads(strategy_name, market_id, status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS strategy_capital (
                strategy_name TEXT PRIMARY KEY,
                allocated_usd REAL NOT NULL,
                available_usd REAL NOT NULL,
                realized_pnl REAL NOT NULL DEFAULT 0,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                trade_count INTEGER NOT NULL DEFAULT 0,
                win_count INTEGER NOT NULL DEFAULT 0,
                loss_count INTEGER NOT NULL DEFAULT 0,
                high_water_mark REAL NOT NULL DEFAULT 0,
                max_drawdown REAL NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_trade_at INTEGER
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS strategy_market_state (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_name TEXT NOT NULL,
                market_id INTEGER NOT NULL,
                condition_id TEXT NOT NULL DEFAULT '',
                stage TEXT NOT NULL DEFAULT 'WAITING',
                entry_price REAL,
                switch_price REAL,
                exit_price REAL,
                high_water_mark REAL,
                low_water_mark REAL,
                switches_count INTEGER NOT NULL DEFAULT 0,
                reentries_count INTEGER NOT NULL DEFAULT 0,
                current_side TEXT,
                custom_state TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL,
                UNIQUE(strategy_name, market_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_id TEXT,
                is_paper INTEGER NOT NULL,
                token_id TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                limit_price REAL,
                executed_price REAL,
                size_usd REAL NOT NULL,
                size_shares REAL,
                filled_shares REAL,
                status TEXT NOT NULL,
                exchange_order_id TEXT,
                status_message TEXT,
                submitted_at INTEGER NOT NULL,
                filled_at INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_orders_token_submitted
             ON orders(token_id, submitted_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS executor_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id INTEGER REFERENCES orders(id),
                position_id INTEGER,
                leg_id INTEGER,
                is_paper INTEGER NOT NULL,
                token_id TEXT NOT NULL,
                side TEXT NOT NULL,
                price REAL NOT NULL,
                size_shares REAL NOT NULL,
                size_usd REAL NOT NULL,
                fee_usd REAL NOT NULL DEFAULT 0,
                best_bid REAL,
                best_ask REAL,
                spread REAL,
                slippage REAL,
                trigger_tick_id TEXT,
                team_yes TEXT,
                team_no TEXT,
                format TEXT,
                game_start_time INTEGER,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS signals (
                id TEXT PRIMARY KEY,
                strategy_name TEXT NOT NULL,
                market_id INTEGER NOT NULL,
                token_id TEXT NOT NULL,
                side TEXT NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                edge REAL,
                confidence REAL,
                price_at_signal REAL,
                suggested_size_usd REAL,
                status TEXT NOT NULL DEFAULT 'new',
                created_at INTEGER NOT NULL,
                processed_at INTEGER
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trade_decisions (
                id TEXT PRIMARY KEY,
                signal_id TEXT,
                strategy_name TEXT NOT NULL,
                market_id INTEGER,
                token_id TEXT,
                executed INTEGER NOT NULL,
                rejected_reason TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trade_decisions_created
             ON trade_decisions(created_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS paper_balance (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                balance_usd REAL NOT NULL,
                starting_balance_usd REAL NOT NULL,
                total_pnl REAL NOT NULL DEFAULT 0,
                high_water_mark REAL NOT NULL,
                low_water_mark REAL NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS price_ticks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                market_id INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                token_side TEXT NOT NULL,
                event_kind TEXT NOT NULL,
                price REAL,
                best_bid REAL,
                best_ask REAL,
                spread REAL,
                trade_size REAL,
                trade_side TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_price_ticks_market_ts
             ON price_ticks(market_id, ts)",
            [],
        )?;

        Ok(())
    }

    // =========================================================================
    // Markets
    // =========================================================================

    pub fn upsert_market(&self, m: &MarketRow) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO markets
             (market_id, condition_id, yes_token_id, no_token_id, question, team_yes, team_no,
              game_start_time, format, market_type, category, end_time, resolved, closed,
              liquidity, yes_price, no_price, best_bid, best_ask, last_quote_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
             ON CONFLICT(market_id) DO UPDATE SET
                question = excluded.question,
                team_yes = excluded.team_yes,
                team_no = excluded.team_no,
                game_start_time = excluded.game_start_time,
                format = excluded.format,
                market_type = excluded.market_type,
                category = excluded.category,
                end_time = excluded.end_time,
                resolved = excluded.resolved,
                closed = excluded.closed,
                liquidity = excluded.liquidity",
            params![
                m.market_id,
                &m.condition_id,
                &m.yes_token_id,
                &m.no_token_id,
                &m.question,
                &m.team_yes,
                &m.team_no,
                m.game_start_time.map(|t| t.timestamp()),
                m.format.map(|f| f.as_str()),
                m.market_type.map(|t| t.as_str()),
                m.category.as_deref(),
                m.end_time.map(|t| t.timestamp()),
                m.resolved as i64,
                m.closed as i64,
                m.liquidity,
                m.yes_price.map(round_price),
                m.no_price.map(round_price),
                m.best_bid.map(round_price),
                m.best_ask.map(round_price),
                m.last_quote_at.map(|t| t.timestamp()),
            ],
        )?;
        Ok(())
    }

    /// Markets that should be subscribed: active, unresolved, starting within
    /// `hours_ahead` (or already started and not finished).
    pub fn markets_for_subscription(&self, hours_ahead: f64) -> Result<Vec<MarketRow>> {
        let cutoff = Utc::now().timestamp() + (hours_ahead * 3600.0) as i64;
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT market_id, condition_id, yes_token_id, no_token_id, question, team_yes,
                    team_no, game_start_time, format, market_type, category, end_time,
                    resolved, closed, liquidity, yes_price, no_price, best_bid, best_ask,
                    last_quote_at
             FROM markets
             WHERE resolved = 0 AND closed = 0
               AND (game_start_time IS NULL OR game_start_time <= ?1)",
        )?;
        let rows = stmt.query_map(params![cutoff], Self::row_to_market)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn get_market(&self, market_id: i64) -> Result<Option<MarketRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT market_id, condition_id, yes_token_id, no_token_id, question, team_yes,
                    team_no, game_start_time, format, market_type, category, end_time,
                    resolved, closed, liquidity, yes_price, no_price, best_bid, best_ask,
                    last_quote_at
             FROM markets WHERE market_id = ?1",
        )?;
        let mut rows = stmt.query(params![market_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::market_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn update_market_quotes(
        &self,
        market_id: i64,
        yes_price: Option<f64>,
        no_price: Option<f64>,
        best_bid: Option<f64>,
        best_ask: Option<f64>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE markets SET yes_price = ?2, no_price = ?3, best_bid = ?4, best_ask = ?5,
             last_quote_at = ?6 WHERE market_id = ?1",
            params![
                market_id,
                yes_price.map(round_price),
                no_price.map(round_price),
                best_bid.map(round_price),
                best_ask.map(round_price),
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn set_market_subscribed(&self, market_ids: &[i64], subscribed: bool) -> Result<()> {
        if market_ids.is_empty() {
            return Ok(());
        }
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached("UPDATE markets SET subscribed = ?2 WHERE market_id = ?1")?;
        for id in market_ids {
            stmt.execute(params![id, subscribed as i64])?;
        }
        Ok(())
    }

    fn row_to_market(row: &rusqlite::Row<'_>) -> rusqlite::Result<MarketRow> {
        Self::market_from_row(row)
    }

    fn market_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MarketRow> {
        Ok(MarketRow {
            market_id: row.get(0)?,
            condition_id: row.get(1)?,
            yes_token_id: row.get(2)?,
            no_token_id: row.get(3)?,
            question: row.get(4)?,
            team_yes: row.get(5)?,
            team_no: row.get(6)?,
            game_start_time: row.get::<_, Option<i64>>(7)?.map(ts_to_datetime),
            format: row
                .get::<_, Option<String>>(8)?
                .as_deref()
                .and_then(MatchFormat::parse),
            market_type: row
                .get::<_, Option<String>>(9)?
                .as_deref()
                .and_then(MarketType::parse),
            category: row.get(10)?,
            end_time: row.get::<_, Option<i64>>(11)?.map(ts_to_datetime),
            resolved: row.get::<_, i64>(12)? != 0,
            closed: row.get::<_, i64>(13)? != 0,
            liquidity: row.get(14)?,
            yes_price: row.get(15)?,
            no_price: row.get(16)?,
            best_bid: row.get(17)?,
            best_ask: row.get(18)?,
            last_quote_at: row.get::<_, Option<i64>>(19)?.map(ts_to_datetime),
        })
    }

    // =========================================================================
    // Tick buffer
    // =========================================================================

    /// Bulk-insert buffered ticks in one transaction. All-or-nothing so the
    /// caller can retain its buffer on failure.
    pub fn insert_price_ticks(&self, ticks: &[PriceTickRow]) -> Result<()> {
        if ticks.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO price_ticks
                 (market_id, ts, token_side, event_kind, price, best_bid, best_ask, spread,
                  trade_size, trade_side)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for t in ticks {
                stmt.execute(params![
                    t.market_id,
                    t.ts,
                    &t.token_side,
                    &t.event_kind,
                    t.price.map(round_price),
                    t.best_bid.map(round_price),
                    t.best_ask.map(round_price),
                    t.spread.map(round_price),
                    t.trade_size,
                    t.trade_side.as_deref(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(id: i64) -> MarketRow {
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
            category: Some("CSGO".to_string()),
            end_time: None,
            resolved: false,
            closed: false,
            liquidity: Some(1000.0),
            yes_price: Some(0.5),
            no_price: Some(0.5),
            best_bid: Some(0.49),
            best_ask: Some(0.51),
            last_quote_at: Some(Utc::now()),
        }
    }

    #[test]
    fn market_roundtrip_and_quote_update() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_market(&market(42)).unwrap();

        let row = db.get_market(42).unwrap().unwrap();
        assert_eq!(row.condition_id, "0xc42");
        assert_eq!(row.format, Some(MatchFormat::Bo3));
        assert!((row.computed_spread() - 0.02).abs() < 1e-9);

        db.update_market_quotes(42, Some(0.62), Some(0.39), Some(0.61), Some(0.63))
            .unwrap();
        let row = db.get_market(42).unwrap().unwrap();
        assert_eq!(row.yes_price, Some(0.62));
        assert_eq!(row.no_price, Some(0.39));
    }

    #[test]
    fn computed_spread_falls_back_on_garbage() {
        let mut m = market(1);
        m.best_bid = Some(0.10);
        m.best_ask = Some(0.95); // 85% "spread" is garbage data
        assert!((m.computed_spread() - 0.10).abs() < 1e-9);
        m.best_bid = None;
        assert!((m.computed_spread() - 0.10).abs() < 1e-9);
    }

    #[test]
    fn tick_buffer_flush_is_atomic() {
        let db = Db::open_in_memory().unwrap();
        let rows: Vec<PriceTickRow> = (0..3)
            .map(|i| PriceTickRow {
                market_id: 1,
                ts: 1_700_000_000 + i,
                token_side: "YES".to_string(),
                event_kind: "trade".to_string(),
                price: Some(0.5),
                best_bid: Some(0.49),
                best_ask: Some(0.51),
                spread: Some(0.02),
                trade_size: Some(10.0),
                trade_side: Some("BUY".to_string()),
            })
            .collect();
        db.insert_price_ticks(&rows).unwrap();
        let conn = db.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM price_ticks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(round_price(0.123456789), 0.123457);
        assert_eq!(round_money(12.345), 12.35);
    }
}
