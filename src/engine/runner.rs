//! Unified trading engine.
//!
//! One process, one WebSocket, cooperative tasks:
//! - the socket reader turns stream events into ticks
//! - a quote poller refreshes authoritative per-token mids from REST
//! - a periodic emitter synthesizes ticks every 5 s so time-based logic
//!   advances on quiet markets, and triggers the resolution sweep
//! - a subscription maintainer re-selects markets every 60 s
//! - a health monitor forces a reconnect after 120 s of silence
//!
//! All ticks funnel through one mpsc channel into a single dispatcher task
//! that owns the router, so events for a market are processed in arrival
//! order. Prices on ticks always come from the quote cache, never from the
//! stream payload - the stream only says "something happened".

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::book::{EventKind, Tick};
use crate::db::{Db, MarketRow, PriceTickRow};
use crate::engine::router::{MarketCache, TickRouter};
use crate::engine::positions::PositionStore;
use crate::exchange::rest::MarketDataClient;
use crate::exchange::ws::{parse_events, subscribe_message, unsubscribe_message, MarketEvent};
use crate::models::{OrderSide, TokenSide};

const SUBSCRIPTION_REFRESH_SECONDS: u64 = 60;
const SUBSCRIPTION_HOURS_AHEAD: f64 = 6.0;
const HEALTH_CHECK_SECONDS: u64 = 30;
const STALE_CONNECTION_SECONDS: i64 = 120;
const QUOTE_POLL_SECONDS: u64 = 5;
const PERIODIC_TICK_SECONDS: u64 = 5;
const CLEANUP_INTERVAL_TICKS: u32 = 12;
const TICK_BUFFER_SIZE: usize = 50;
const TICK_FLUSH_SECONDS: u64 = 5;
const PRICE_STALENESS_THRESHOLD_SECONDS: i64 = 15;

pub struct UnifiedEngine {
    ws_url: String,
    db: Db,
    markets: MarketCache,
    positions: PositionStore,
    market_data: Arc<MarketDataClient>,
    /// Recent YES mids per market for the 1-minute velocity figure.
    price_history: Mutex<HashMap<i64, VecDeque<(i64, f64)>>>,
}

impl UnifiedEngine {
    pub fn new(
        ws_url: String,
        db: Db,
        markets: MarketCache,
        positions: PositionStore,
        market_data: Arc<MarketDataClient>,
    ) -> Self {
        Self {
            ws_url,
            db,
            markets,
            positions,
            market_data,
            price_history: Mutex::new(HashMap::new()),
        }
    }

    /// Record the current YES mid and return the signed move over the last
    /// minute, once at least a minute of history exists.
    fn record_velocity(&self, market_id: i64, yes_price: f64) -> Option<f64> {
        let now_ms = Utc::now().timestamp_millis();
        let mut history = self.price_history.lock();
        let entries = history.entry(market_id).or_default();
        entries.push_back((now_ms, yes_price));
        while entries
            .front()
            .map_or(false, |(ts, _)| now_ms - ts > 120_000)
        {
            entries.pop_front();
        }
        let (oldest_ts, oldest_price) = *entries.front()?;
        if now_ms - oldest_ts < 60_000 {
            return None;
        }
        Some(yes_price - oldest_price)
    }

    /// Run until cancelled. The router (with its registered strategies)
    /// moves into the dispatcher task.
    pub async fn run(self, router: TickRouter) -> Result<()> {
        info!(strategies = ?router.strategy_names(), "unified engine starting");

        self.reload_market_cache()?;

        let (tick_tx, tick_rx) = mpsc::channel::<Tick>(1024);

        let dispatcher = tokio::spawn(dispatch_loop(router, tick_rx, self.db.clone()));

        let quote_poller = tokio::spawn(quote_poll_loop(
            self.db.clone(),
            self.markets.clone(),
            self.market_data.clone(),
        ));

        let periodic = tokio::spawn(periodic_tick_loop(
            self.markets.clone(),
            self.positions.clone(),
            tick_tx.clone(),
        ));

        let mut reconnect_delay = Duration::from_secs(5);
        let max_reconnect_delay = Duration::from_secs(60);

        let result = loop {
            match self.connect_and_stream(&tick_tx).await {
                Ok(()) => {
                    reconnect_delay = Duration::from_secs(5);
                }
                Err(e) => {
                    warn!(error = %e, delay = ?reconnect_delay, "websocket loop ended; reconnecting");
                    sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(max_reconnect_delay);
                }
            }
            if tick_tx.is_closed() {
                break Err(anyhow!("dispatcher gone"));
            }
        };

        quote_poller.abort();
        periodic.abort();
        drop(tick_tx);
        // Dispatcher drains remaining ticks and flushes its buffer.
        let _ = dispatcher.await;
        result
    }

    async fn connect_and_stream(&self, tick_tx: &mpsc::Sender<Tick>) -> Result<()> {
        let mut subscribed: HashSet<String> = HashSet::new();
        let token_map = self.token_map();
        if token_map.is_empty() {
            sleep(Duration::from_secs(SUBSCRIPTION_REFRESH_SECONDS)).await;
            self.reload_market_cache()?;
            return Ok(());
        }

        info!(url = %self.ws_url, tokens = %token_map.len(), "connecting to market stream");
        let (ws_stream, resp) = connect_async(&self.ws_url)
            .await
            .context("connect market ws")?;
        info!(status = %resp.status(), "market stream connected");

        let (mut write, mut read) = ws_stream.split();

        let initial: Vec<String> = token_map.keys().cloned().collect();
        write
            .send(Message::Text(subscribe_message(&initial)))
            .await
            .context("send initial subscription")?;
        subscribed.extend(initial);

        let mut last_activity = Utc::now();

        let mut sub_refresh = interval(Duration::from_secs(SUBSCRIPTION_REFRESH_SECONDS));
        sub_refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
        sub_refresh.reset();
        let mut health = interval(Duration::from_secs(HEALTH_CHECK_SECONDS));
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = sub_refresh.tick() => {
                    if let Err(e) = self.reload_market_cache() {
                        error!(error = %e, "market cache refresh failed");
                        continue;
                    }
                    let desired: HashSet<String> = self.token_map().keys().cloned().collect();
                    let to_remove: Vec<String> = subscribed.difference(&desired).cloned().collect();
                    let to_add: Vec<String> = desired.difference(&subscribed).cloned().collect();
                    if !to_remove.is_empty() {
                        let _ = write.send(Message::Text(unsubscribe_message(&to_remove))).await;
                    }
                    if !to_add.is_empty() {
                        let _ = write.send(Message::Text(subscribe_message(&to_add))).await;
                        info!(added = %to_add.len(), removed = %to_remove.len(),
                              "subscriptions refreshed");
                    }
                    subscribed = desired;
                }
                _ = health.tick() => {
                    let quiet = (Utc::now() - last_activity).num_seconds();
                    if quiet > STALE_CONNECTION_SECONDS {
                        warn!(quiet_seconds = %quiet, "connection stale, forcing reconnect");
                        return Err(anyhow!("stale connection"));
                    }
                }
                message = read.next() => {
                    let Some(message) = message else {
                        return Err(anyhow!("market stream ended"));
                    };
                    last_activity = Utc::now();
                    match message {
                        Ok(Message::Text(text)) => {
                            self.handle_stream_text(&text, tick_tx).await;
                        }
                        Ok(Message::Binary(payload)) => {
                            // A subset of frames arrive as MessagePack; the
                            // JSON mirror carries the same data, so these
                            // only count as liveness.
                            debug!(bytes = %payload.len(), "binary frame ignored");
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            info!(?frame, "market stream closed by peer");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => return Err(anyhow!("market stream error: {e}")),
                    }
                }
            }
        }
    }

    async fn handle_stream_text(&self, text: &str, tick_tx: &mpsc::Sender<Tick>) {
        for event in parse_events(text) {
            let Some((market, token_side)) = self.lookup_token(event.asset_id()) else {
                continue;
            };
            let Some(tick) = self.build_event_tick(&market, token_side, &event) else {
                continue;
            };
            if tick_tx.send(tick).await.is_err() {
                return;
            }
        }
    }

    /// Build a tick for a stream event. Prices come from the quote cache;
    /// stale quotes (no refresh within 15 s) drop the event entirely.
    fn build_event_tick(
        &self,
        market: &MarketRow,
        token_side: TokenSide,
        event: &MarketEvent,
    ) -> Option<Tick> {
        let quote_age = market
            .last_quote_at
            .map(|t| (Utc::now() - t).num_seconds())
            .unwrap_or(i64::MAX);
        if quote_age > PRICE_STALENESS_THRESHOLD_SECONDS {
            debug!(
                market_id = %market.market_id,
                age_seconds = %quote_age,
                "stale quotes, dropping event"
            );
            return None;
        }
        let yes_price = market.yes_price?;
        let no_price = market.no_price.unwrap_or(1.0 - yes_price);
        let velocity = self.record_velocity(market.market_id, yes_price);

        let now = Utc::now();
        let (event_kind, message_id, trade_size, trade_side) = match event {
            MarketEvent::Book(snapshot) => (
                EventKind::Book,
                format!(
                    "book:{}:{}",
                    snapshot.asset_id,
                    snapshot.timestamp_ms.unwrap_or_else(|| now.timestamp_millis())
                ),
                None,
                None,
            ),
            MarketEvent::Trade { size, side, .. } => (
                EventKind::Trade,
                // Second-resolution id: absorbs redelivered bursts.
                format!("{}:{}", market.market_id, now.timestamp()),
                *size,
                *side,
            ),
            MarketEvent::PriceChange { size, side, .. } => (
                EventKind::PriceChange,
                format!("{}:{}", market.market_id, now.timestamp()),
                *size,
                *side,
            ),
        };

        Some(Tick {
            market_id: market.market_id,
            condition_id: market.condition_id.clone(),
            message_id,
            team_yes: market.team_yes.clone(),
            team_no: market.team_no.clone(),
            game_start_time: market.game_start_time,
            format: market.format,
            market_type: market.market_type,
            timestamp: now,
            event_kind,
            token_side,
            price: Some(match token_side {
                TokenSide::Yes => yes_price,
                TokenSide::No => no_price,
            }),
            best_bid: market.best_bid,
            best_ask: market.best_ask,
            spread: Some(market.computed_spread()),
            mid_price: Some(match token_side {
                TokenSide::Yes => yes_price,
                TokenSide::No => no_price,
            }),
            trade_size,
            trade_side,
            price_velocity_1m: velocity,
            yes_token_id: Some(market.yes_token_id.clone()),
            no_token_id: Some(market.no_token_id.clone()),
            actual_yes_mid: Some(yes_price),
            actual_no_mid: Some(no_price),
        })
    }

    fn lookup_token(&self, asset_id: &str) -> Option<(MarketRow, TokenSide)> {
        let markets = self.markets.read();
        for market in markets.values() {
            if market.yes_token_id == asset_id {
                return Some((market.clone(), TokenSide::Yes));
            }
            if market.no_token_id == asset_id {
                return Some((market.clone(), TokenSide::No));
            }
        }
        None
    }

    fn token_map(&self) -> HashMap<String, (i64, TokenSide)> {
        let markets = self.markets.read();
        let mut map = HashMap::with_capacity(markets.len() * 2);
        for market in markets.values() {
            map.insert(market.yes_token_id.clone(), (market.market_id, TokenSide::Yes));
            map.insert(market.no_token_id.clone(), (market.market_id, TokenSide::No));
        }
        map
    }

    fn reload_market_cache(&self) -> Result<()> {
        let rows = self.db.markets_for_subscription(SUBSCRIPTION_HOURS_AHEAD)?;
        let ids: Vec<i64> = rows.iter().map(|m| m.market_id).collect();
        self.db.set_market_subscribed(&ids, true)?;

        let mut cache = HashMap::with_capacity(rows.len());
        for market in rows {
            cache.insert(market.market_id, market);
        }
        info!(markets = %cache.len(), "market cache loaded");
        *self.markets.write() = cache;
        Ok(())
    }
}

/// Single consumer of the tick channel: owns the router, buffers per-tick
/// rows, flushes every 5 s (retaining the buffer on failure).
async fn dispatch_loop(mut router: TickRouter, mut tick_rx: mpsc::Receiver<Tick>, db: Db) {
    let mut buffer: Vec<PriceTickRow> = Vec::with_capacity(TICK_BUFFER_SIZE);
    let mut flush = interval(Duration::from_secs(TICK_FLUSH_SECONDS));
    flush.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            tick = tick_rx.recv() => {
                let Some(tick) = tick else { break };
                buffer.push(tick_row(&tick));
                if buffer.len() >= TICK_BUFFER_SIZE {
                    flush_ticks(&db, &mut buffer);
                }
                router.process_tick(&tick);
            }
            _ = flush.tick() => {
                flush_ticks(&db, &mut buffer);
            }
        }
    }

    // Shutdown: one final flush.
    flush_ticks(&db, &mut buffer);
    let stats = router.stats();
    info!(
        ticks = %stats.ticks_processed,
        filtered = %stats.ticks_filtered,
        actions = %stats.actions_executed,
        errors = %stats.errors,
        "dispatcher stopped"
    );
}

fn tick_row(tick: &Tick) -> PriceTickRow {
    PriceTickRow {
        market_id: tick.market_id,
        ts: tick.timestamp.timestamp(),
        token_side: tick.token_side.as_str().to_string(),
        event_kind: tick.event_kind.as_str().to_string(),
        price: tick.price,
        best_bid: tick.best_bid,
        best_ask: tick.best_ask,
        spread: tick.spread,
        trade_size: tick.trade_size,
        trade_side: tick.trade_side.map(|s: OrderSide| s.as_str().to_string()),
    }
}

fn flush_ticks(db: &Db, buffer: &mut Vec<PriceTickRow>) {
    if buffer.is_empty() {
        return;
    }
    match db.insert_price_ticks(buffer) {
        Ok(()) => buffer.clear(),
        Err(e) => {
            error!(error = %e, pending = %buffer.len(), "tick flush failed, keeping buffer");
            // Bound the retry buffer so a dead database cannot eat memory.
            if buffer.len() > TICK_BUFFER_SIZE * 10 {
                let drop_count = TICK_BUFFER_SIZE * 5;
                warn!(dropped = %drop_count, "tick buffer overflow, dropping oldest");
                buffer.drain(..drop_count);
            }
        }
    }
}

/// Refresh authoritative quotes for every cached market from the REST books.
async fn quote_poll_loop(db: Db, markets: MarketCache, client: Arc<MarketDataClient>) {
    let mut poll = interval(Duration::from_secs(QUOTE_POLL_SECONDS));
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        poll.tick().await;

        let snapshot: Vec<MarketRow> = markets.read().values().cloned().collect();
        for market in snapshot {
            let yes_book = client.fetch_orderbook(&market.yes_token_id).await;
            let no_book = client.fetch_orderbook(&market.no_token_id).await;

            let (yes_book, no_book) = match (yes_book, no_book) {
                (Ok(y), Ok(n)) => (y, n),
                (Err(e), _) | (_, Err(e)) => {
                    debug!(market_id = %market.market_id, error = %e, "quote poll failed");
                    continue;
                }
            };

            let yes_mid = yes_book.mid();
            let no_mid = no_book.mid();
            if let Err(e) = db.update_market_quotes(
                market.market_id,
                yes_mid,
                no_mid,
                yes_book.best_bid(),
                yes_book.best_ask(),
            ) {
                error!(error = %e, "quote persist failed");
                continue;
            }

            let mut cache = markets.write();
            if let Some(entry) = cache.get_mut(&market.market_id) {
                entry.yes_price = yes_mid.or(entry.yes_price);
                entry.no_price = no_mid.or(entry.no_price);
                entry.best_bid = yes_book.best_bid();
                entry.best_ask = yes_book.best_ask();
                entry.last_quote_at = Some(Utc::now());
            }
        }
    }
}

/// Synthesize a tick for every cached market each period so time-based
/// entries and cooldowns advance without stream traffic. Every 12th pass
/// runs the resolution sweep.
async fn periodic_tick_loop(
    markets: MarketCache,
    positions: PositionStore,
    tick_tx: mpsc::Sender<Tick>,
) {
    let mut period = interval(Duration::from_secs(PERIODIC_TICK_SECONDS));
    period.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cleanup_counter: u32 = 0;

    loop {
        period.tick().await;

        cleanup_counter += 1;
        if cleanup_counter >= CLEANUP_INTERVAL_TICKS {
            cleanup_counter = 0;
            match positions.cleanup_resolved_positions() {
                Ok(0) => {}
                Ok(count) => info!(count = %count, "resolution sweep closed positions"),
                Err(e) => error!(error = %e, "resolution sweep failed"),
            }
        }

        let snapshot: Vec<MarketRow> = markets.read().values().cloned().collect();
        let now = Utc::now();
        for market in snapshot {
            let fresh = market
                .last_quote_at
                .map(|t| (now - t).num_seconds() <= PRICE_STALENESS_THRESHOLD_SECONDS)
                .unwrap_or(false);
            if !fresh {
                continue;
            }
            let Some(yes_price) = market.yes_price else {
                continue;
            };
            let no_price = market.no_price.unwrap_or(1.0 - yes_price);

            let tick = Tick {
                market_id: market.market_id,
                condition_id: market.condition_id.clone(),
                message_id: format!("periodic:{}:{}", market.market_id, now.timestamp_millis()),
                team_yes: market.team_yes.clone(),
                team_no: market.team_no.clone(),
                game_start_time: market.game_start_time,
                format: market.format,
                market_type: market.market_type,
                timestamp: now,
                event_kind: EventKind::Periodic,
                token_side: TokenSide::Yes,
                price: Some(yes_price),
                best_bid: market.best_bid,
                best_ask: market.best_ask,
                spread: Some(market.computed_spread()),
                mid_price: Some(yes_price),
                trade_size: None,
                trade_side: None,
                price_velocity_1m: None,
                yes_token_id: Some(market.yes_token_id.clone()),
                no_token_id: Some(market.no_token_id.clone()),
                actual_yes_mid: Some(yes_price),
                actual_no_mid: Some(no_price),
            };
            if tick_tx.send(tick).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::executor::PaperExecutor;
    use crate::engine::state::StateManager;
    use crate::models::{MarketType, MatchFormat};
    use parking_lot::RwLock;

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
            liquidity: None,
            yes_price: Some(0.52),
            no_price: Some(0.49),
            best_bid: Some(0.51),
            best_ask: Some(0.53),
            last_quote_at: Some(Utc::now()),
        }
    }

    fn engine_with(markets_rows: Vec<MarketRow>) -> UnifiedEngine {
        let db = Db::open_in_memory().unwrap();
        for m in &markets_rows {
            db.upsert_market(m).unwrap();
        }
        let markets: MarketCache = Arc::new(RwLock::new(
            markets_rows.into_iter().map(|m| (m.market_id, m)).collect(),
        ));
        let state = StateManager::new(db.clone());
        let positions = PositionStore::new(db.clone(), state);
        UnifiedEngine::new(
            "wss://example/ws/market".to_string(),
            db,
            markets,
            positions,
            Arc::new(MarketDataClient::new()),
        )
    }

    #[test]
    fn event_tick_carries_cache_prices_not_stream_prices() {
        let engine = engine_with(vec![market(1)]);
        let event = MarketEvent::Trade {
            asset_id: "yes-1".to_string(),
            price: Some(0.99), // garbage stream price
            size: Some(10.0),
            side: Some(OrderSide::Buy),
        };
        let (row, side) = engine.lookup_token("yes-1").unwrap();
        assert_eq!(side, TokenSide::Yes);
        let tick = engine.build_event_tick(&row, side, &event).unwrap();
        // Authoritative cache mid wins over the stream's trade price.
        assert_eq!(tick.actual_yes_mid, Some(0.52));
        assert_eq!(tick.actual_no_mid, Some(0.49));
        assert_eq!(tick.yes_price(), Some(0.52));
        assert_eq!(tick.trade_size, Some(10.0));
    }

    #[test]
    fn stale_quotes_drop_the_event() {
        let mut m = market(1);
        m.last_quote_at = Some(Utc::now() - chrono::Duration::seconds(60));
        let engine = engine_with(vec![m]);
        let event = MarketEvent::Trade {
            asset_id: "yes-1".to_string(),
            price: None,
            size: None,
            side: None,
        };
        let (row, side) = engine.lookup_token("yes-1").unwrap();
        assert!(engine.build_event_tick(&row, side, &event).is_none());
    }

    #[test]
    fn unknown_asset_is_ignored() {
        let engine = engine_with(vec![market(1)]);
        assert!(engine.lookup_token("other-token").is_none());
    }

    #[tokio::test]
    async fn dispatch_loop_drains_and_flushes_on_shutdown() {
        let db = Db::open_in_memory().unwrap();
        let state = StateManager::new(db.clone());
        let positions = PositionStore::new(db.clone(), state.clone());
        let executor = PaperExecutor::new(positions.clone());
        let markets: MarketCache = Arc::new(RwLock::new(HashMap::new()));
        let router = TickRouter::new(db.clone(), state, positions, executor, markets);

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(dispatch_loop(router, rx, db.clone()));

        let engine = engine_with(vec![market(1)]);
        let event = MarketEvent::Trade {
            asset_id: "yes-1".to_string(),
            price: None,
            size: Some(5.0),
            side: Some(OrderSide::Sell),
        };
        let (row, side) = engine.lookup_token("yes-1").unwrap();
        let tick = engine.build_event_tick(&row, side, &event).unwrap();
        tx.send(tick).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let conn = db.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM price_ticks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
