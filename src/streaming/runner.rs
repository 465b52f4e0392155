//! Streaming imbalance executor.
//!
//! A parallel ingest path that consumes only full book snapshots: maintain a
//! per-token in-memory book, evaluate the imbalance strategy directly on
//! each update, and execute passing signals in spawned tasks so the event
//! loop never blocks on order placement. Shares the position store, capital
//! ledger, and safety gate with the polled engine.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rusqlite::params;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::book::{EventKind, OrderBook, Tick};
use crate::db::{round_money, Db, MarketRow};
use crate::engine::executor::calculate_fill;
use crate::engine::positions::{PositionStore, TradeContext};
use crate::engine::state::PositionSnapshot;
use crate::executor::live::LiveExecutor;
use crate::executor::safety::{MarketObservation, SafetyChecker, Signal};
use crate::exchange::ws::{parse_events, subscribe_message, unsubscribe_message, MarketEvent};
use crate::models::{OrderSide, TokenSide};
use crate::streaming::config::StreamingConfig;
use crate::streaming::state::StreamingState;
use crate::streaming::strategy::{BookImbalanceStrategy, Rejection};

const POSITION_SYNC_INTERVAL_SECS: u64 = 30;
const WS_PING_INTERVAL_SECS: u64 = 5;

/// Everything the spawned execution task needs, cloneable across tasks.
#[derive(Clone)]
struct ExecutionHandles {
    db: Db,
    positions: PositionStore,
    safety: SafetyChecker,
    state: StreamingState,
    live: Option<Arc<LiveExecutor>>,
}

pub struct StreamingRunner {
    config: StreamingConfig,
    ws_url: String,
    db: Db,
    strategy: Arc<BookImbalanceStrategy>,
    state: StreamingState,
    handles: ExecutionHandles,

    /// token_id -> latest book. Written only by the WebSocket reader;
    /// strategies read immutable snapshots.
    books: Arc<RwLock<HashMap<String, OrderBook>>>,
    /// token_id -> (market, side) for the currently selected market set.
    token_markets: Arc<RwLock<HashMap<String, (MarketRow, TokenSide)>>>,

    running: Arc<AtomicBool>,
}

impl StreamingRunner {
    pub fn new(
        config: StreamingConfig,
        ws_url: String,
        db: Db,
        positions: PositionStore,
        safety: SafetyChecker,
        live: Option<Arc<LiveExecutor>>,
    ) -> Self {
        let state = StreamingState::new();
        let handles = ExecutionHandles {
            db: db.clone(),
            positions,
            safety,
            state: state.clone(),
            live,
        };
        Self {
            strategy: Arc::new(BookImbalanceStrategy::new(config.clone())),
            config,
            ws_url,
            db,
            state,
            handles,
            books: Arc::new(RwLock::new(HashMap::new())),
            token_markets: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let mode = if self.config.live { "LIVE" } else { "PAPER" };
        info!(strategy = %self.config.name, mode = %mode, "starting streaming executor");
        if self.config.live {
            warn!("LIVE MODE - trading with real funds");
        }

        self.refresh_markets()?;
        self.sync_positions();

        let mut reconnect_delay = Duration::from_secs_f64(self.config.reconnect_delay);
        let max_delay = Duration::from_secs_f64(self.config.max_reconnect_delay);

        while self.running.load(Ordering::SeqCst) {
            match self.connect_and_stream().await {
                Ok(()) => {
                    reconnect_delay = Duration::from_secs_f64(self.config.reconnect_delay);
                }
                Err(e) => {
                    warn!(error = %e, "streaming websocket disconnected; reconnecting");
                    sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(max_delay);
                }
            }
        }
        info!("streaming executor stopped");
        Ok(())
    }

    async fn connect_and_stream(&self) -> Result<()> {
        let tokens: Vec<String> = self.token_markets.read().keys().cloned().collect();
        if tokens.is_empty() {
            // Nothing to watch yet; re-select markets after a pause.
            sleep(Duration::from_secs(self.config.subscription_refresh_interval)).await;
            self.refresh_markets()?;
            return Ok(());
        }

        info!(tokens = %tokens.len(), "connecting streaming websocket");
        let (ws_stream, _) = connect_async(&self.ws_url)
            .await
            .context("connect streaming ws")?;
        let (mut write, mut read) = ws_stream.split();

        write
            .send(Message::Text(subscribe_message(&tokens)))
            .await
            .context("send streaming subscription")?;

        let mut subscribed: HashSet<String> = tokens.into_iter().collect();

        let mut ping = interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut refresh = interval(Duration::from_secs(self.config.subscription_refresh_interval));
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sync = interval(Duration::from_secs(POSITION_SYNC_INTERVAL_SECS));
        sync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::select! {
                _ = ping.tick() => {
                    let _ = write.send(Message::Text("PING".to_string())).await;
                }
                _ = refresh.tick() => {
                    if let Err(e) = self.refresh_markets() {
                        error!(error = %e, "market refresh failed");
                        continue;
                    }
                    let desired: HashSet<String> =
                        self.token_markets.read().keys().cloned().collect();
                    let to_remove: Vec<String> =
                        subscribed.difference(&desired).cloned().collect();
                    let to_add: Vec<String> = desired.difference(&subscribed).cloned().collect();
                    if !to_remove.is_empty() {
                        let _ = write.send(Message::Text(unsubscribe_message(&to_remove))).await;
                    }
                    if !to_add.is_empty() {
                        let _ = write.send(Message::Text(subscribe_message(&to_add))).await;
                        info!(added = %to_add.len(), removed = %to_remove.len(),
                              "streaming subscriptions updated");
                    }
                    subscribed = desired;
                }
                _ = sync.tick() => {
                    self.sync_positions();
                    self.check_exits();
                }
                message = read.next() => {
                    let Some(message) = message else {
                        return Err(anyhow!("streaming ws ended"));
                    };
                    match message {
                        Ok(Message::Text(text)) => self.handle_text(&text),
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "streaming ws close frame");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => return Err(anyhow!("streaming ws error: {e}")),
                    }
                }
            }
        }
    }

    /// Book events only; everything else on this path is noise.
    fn handle_text(&self, text: &str) {
        for event in parse_events(text) {
            let MarketEvent::Book(snapshot) = event else {
                continue;
            };
            self.state.increment_stat("book_events");

            let Some((market, side)) = self
                .token_markets
                .read()
                .get(&snapshot.asset_id)
                .cloned()
            else {
                continue;
            };

            let book = OrderBook::new(snapshot.asset_id.clone(), snapshot.bids, snapshot.asks);
            self.books.write().insert(snapshot.asset_id.clone(), book.clone());

            match self.strategy.evaluate(&book, side, &market, &self.state) {
                Ok(signal) => {
                    self.state.increment_stat("signals_emitted");
                    let handles = self.handles.clone();
                    let config = self.config.clone();
                    let book_state = book.clone();
                    // Fire and forget: order placement must not stall ingest.
                    tokio::spawn(async move {
                        execute_signal(handles, config, signal, book_state).await;
                    });
                }
                Err(Rejection::BelowThreshold) => {}
                Err(rejection) => {
                    debug!(?rejection, market_id = %market.market_id, "entry filtered");
                    self.state.increment_stat("signals_filtered");
                }
            }
        }
    }

    /// Re-select markets for subscription: active, in-category, inside the
    /// time-to-close window.
    fn refresh_markets(&self) -> Result<()> {
        let rows = self.db.markets_for_subscription(self.config.max_hours_to_close)?;
        let now = Utc::now();
        let mut map = HashMap::new();

        for market in rows {
            if let Some(category) = &market.category {
                if !self.config.categories.is_empty()
                    && !self
                        .config
                        .categories
                        .iter()
                        .any(|c| c.eq_ignore_ascii_case(category))
                {
                    continue;
                }
            }
            if let Some(end_time) = market.end_time {
                let minutes_left = (end_time - now).num_milliseconds() as f64 / 60_000.0;
                if minutes_left < self.config.min_minutes_to_close {
                    continue;
                }
            }
            map.insert(
                market.yes_token_id.clone(),
                (market.clone(), TokenSide::Yes),
            );
            map.insert(market.no_token_id.clone(), (market.clone(), TokenSide::No));
        }

        info!(tokens = %map.len(), "selected streaming markets");
        *self.token_markets.write() = map;
        Ok(())
    }

    /// Refresh the in-memory open-position count from the store.
    fn sync_positions(&self) {
        match self
            .handles
            .positions
            .state()
            .get_open_positions(&self.config.name)
        {
            Ok(open) => self
                .state
                .set_position_count(&self.config.name, open.len() as i64),
            Err(e) => error!(error = %e, "position sync failed"),
        }
    }

    /// Exit pass over open streaming positions: profit target or max hold,
    /// priced from the live in-memory book.
    fn check_exits(&self) {
        let open = match self
            .handles
            .positions
            .state()
            .get_open_positions(&self.config.name)
        {
            Ok(open) => open,
            Err(e) => {
                error!(error = %e, "could not load positions for exit check");
                return;
            }
        };

        for position in open {
            let Some(book) = self.books.read().get(&position.token_id).cloned() else {
                continue;
            };
            let Some(current) = book.mid() else { continue };
            let held_minutes =
                (Utc::now() - position.opened_at).num_milliseconds() as f64 / 60_000.0;

            let Some(reason) =
                self.strategy
                    .check_exit(position.avg_entry_price, current, held_minutes)
            else {
                continue;
            };

            // Exit-spread gate still applies on the way out.
            if let Some(spread) = book.spread() {
                if spread > self.config.max_exit_spread {
                    debug!(
                        position_id = %position.id,
                        spread = %format!("{spread:.3}"),
                        "exit deferred: spread too wide"
                    );
                    continue;
                }
            }

            let handles = self.handles.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                close_streaming_position(handles, config, position, book, reason).await;
            });
        }
    }
}

/// Spawned per signal. Safety gate, then paper or live execution, then
/// cooldown bookkeeping.
async fn execute_signal(
    handles: ExecutionHandles,
    config: StreamingConfig,
    signal: Signal,
    book: OrderBook,
) {
    handles.safety.insert_signal(&signal).ok();

    let obs = MarketObservation {
        live_mid: book.mid(),
        spread: book.spread(),
        fee_rate_bps: None,
        is_exit: false,
    };
    let check = handles.safety.check_all(&signal, &obs);
    if !check.passed {
        handles.safety.mark_signal(&signal.id, "rejected").ok();
        handles.safety.record_decision(&signal, false, Some(&check.reason));
        handles.state.increment_stat("signals_rejected");
        return;
    }

    let success = if config.live {
        match &handles.live {
            Some(live) => live.execute_signal(&signal).await.success,
            None => {
                error!("live mode configured but no live executor available");
                false
            }
        }
    } else {
        execute_paper(&handles, &signal, &book)
    };

    if success {
        handles.state.set_cooldown(&signal.strategy_name, signal.market_id);
        handles.state.add_position(&signal.strategy_name);
        handles.state.increment_stat("signals_executed");
    }
}

/// Paper fill against the live book snapshot, settled through the shared
/// position store.
fn execute_paper(handles: &ExecutionHandles, signal: &Signal, book: &OrderBook) -> bool {
    let Some(base_price) = signal.price_at_signal.or_else(|| book.mid()) else {
        handles
            .safety
            .record_decision(signal, false, Some("no price for paper fill"));
        return false;
    };
    let size_usd = signal.suggested_size_usd.unwrap_or(1.1);

    let fill = calculate_fill(
        base_price,
        book.best_ask(),
        book.best_bid(),
        book.spread(),
        size_usd,
        OrderSide::Buy,
    );
    let shares = size_usd / fill.price;

    let market = match handles.db.get_market(signal.market_id) {
        Ok(Some(m)) => m,
        _ => {
            handles
                .safety
                .record_decision(signal, false, Some("unknown market"));
            return false;
        }
    };

    let tick = paper_context_tick(signal, &market, fill.price);
    let ctx = TradeContext {
        tick: &tick,
        is_paper: true,
        order_id: None,
        slippage: fill.slippage,
        effective_bid: fill.effective_bid,
        effective_ask: fill.effective_ask,
        effective_spread: Some(fill.effective_spread),
        fee_usd: 0.0,
    };

    match handles.positions.open_position(
        &signal.strategy_name,
        signal.market_id,
        &market.condition_id,
        &signal.token_id,
        signal.token_side,
        shares,
        fill.price,
        &tick,
        Some(&ctx),
    ) {
        Ok(position) => {
            adjust_paper_balance(&handles.db, -(shares * fill.price));
            handles.safety.mark_signal(&signal.id, "executed").ok();
            handles.safety.record_decision(signal, true, None);
            info!(
                strategy = %signal.strategy_name,
                position_id = %position.id,
                price = %format!("{:.4}", fill.price),
                shares = %format!("{shares:.2}"),
                "streaming paper entry"
            );
            true
        }
        Err(e) => {
            handles.safety.mark_signal(&signal.id, "failed").ok();
            handles
                .safety
                .record_decision(signal, false, Some(&e.to_string()));
            false
        }
    }
}

async fn close_streaming_position(
    handles: ExecutionHandles,
    config: StreamingConfig,
    position: PositionSnapshot,
    book: OrderBook,
    reason: &'static str,
) {
    // Live mode sells through the exchange; the store settles at the
    // executed price.
    if config.live {
        match &handles.live {
            Some(live) => {
                match live.close_position_live(&position, reason).await {
                    Ok(outcome) if outcome.success => {
                        handles.state.remove_position(&position.strategy_name);
                        handles.state.increment_stat("exits_executed");
                    }
                    Ok(outcome) => {
                        warn!(position_id = %position.id, message = %outcome.message,
                              "live exit not filled");
                    }
                    Err(e) => {
                        error!(position_id = %position.id, error = %e, "live exit failed");
                    }
                }
            }
            None => error!("live mode configured but no live executor available"),
        }
        return;
    }

    let Some(base_price) = book.mid() else { return };
    let exit_value = position.remaining_shares * base_price;
    let fill = calculate_fill(
        base_price,
        None,
        book.best_bid(),
        book.spread(),
        exit_value,
        OrderSide::Sell,
    );

    let market = match handles.db.get_market(position.market_id) {
        Ok(Some(m)) => m,
        _ => return,
    };
    let mut signal = Signal::new(
        &position.strategy_name,
        position.market_id,
        &position.token_id,
        position.token_side,
        OrderSide::Sell,
    );
    signal.reason = reason.to_string();
    signal.price_at_signal = Some(fill.price);

    let tick = paper_context_tick(&signal, &market, fill.price);
    let ctx = TradeContext {
        tick: &tick,
        is_paper: !config.live,
        order_id: None,
        slippage: fill.slippage,
        effective_bid: fill.effective_bid,
        effective_ask: fill.effective_ask,
        effective_spread: Some(fill.effective_spread),
        fee_usd: 0.0,
    };

    match handles
        .positions
        .close_position_with_trade(position.id, fill.price, reason, Some(&ctx))
    {
        Ok(closed) => {
            adjust_paper_balance(&handles.db, position.remaining_shares * fill.price);
            handles.state.remove_position(&position.strategy_name);
            handles.state.increment_stat("exits_executed");
            info!(
                position_id = %closed.id,
                reason = %reason,
                pnl = %format!("{:+.2}", closed.realized_pnl),
                "streaming exit"
            );
        }
        Err(e) => {
            error!(position_id = %position.id, error = %e, "streaming exit failed");
        }
    }
}

fn paper_context_tick(signal: &Signal, market: &MarketRow, price: f64) -> Tick {
    Tick {
        market_id: market.market_id,
        condition_id: market.condition_id.clone(),
        message_id: format!("signal:{}", signal.id),
        team_yes: market.team_yes.clone(),
        team_no: market.team_no.clone(),
        game_start_time: market.game_start_time,
        format: market.format,
        market_type: market.market_type,
        timestamp: Utc::now(),
        event_kind: EventKind::Book,
        token_side: signal.token_side,
        price: Some(price),
        best_bid: market.best_bid,
        best_ask: market.best_ask,
        spread: Some(market.computed_spread()),
        trade_size: None,
        trade_side: Some(signal.side),
        mid_price: Some(price),
        price_velocity_1m: None,
        yes_token_id: Some(market.yes_token_id.clone()),
        no_token_id: Some(market.no_token_id.clone()),
        actual_yes_mid: market.yes_price,
        actual_no_mid: market.no_price,
    }
}

/// Streaming paper cash account: debit on entries, credit on exits, with
/// high/low water marks over the cash balance.
fn adjust_paper_balance(db: &Db, delta: f64) {
    let result = (|| -> Result<()> {
        let conn = db.lock();
        conn.execute(
            "INSERT INTO paper_balance
             (id, balance_usd, starting_balance_usd, high_water_mark, low_water_mark, updated_at)
             VALUES (1, 10000.0, 10000.0, 10000.0, 10000.0, ?1)
             ON CONFLICT(id) DO NOTHING",
            params![Utc::now().timestamp()],
        )?;
        conn.execute(
            "UPDATE paper_balance SET
                balance_usd = balance_usd + ?1,
                total_pnl = balance_usd + ?1 - starting_balance_usd,
                high_water_mark = MAX(high_water_mark, balance_usd + ?1),
                low_water_mark = MIN(low_water_mark, balance_usd + ?1),
                updated_at = ?2
             WHERE id = 1",
            params![round_money(delta), Utc::now().timestamp()],
        )?;
        Ok(())
    })();
    if let Err(e) = result {
        error!(error = %e, "paper balance update failed");
    }
}
