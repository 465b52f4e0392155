//! Tick and order-book model.
//!
//! A `Tick` is an immutable snapshot of one market at one instant, built by
//! the router from a stream event (or synthesized periodically). An
//! `OrderBook` is a full L2 snapshot for one token. YES and NO trade on
//! separate books, so their mids do not sum to 1 in general - the
//! `actual_yes_mid` / `actual_no_mid` fields carry the separately quoted
//! mids from the authoritative price cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{MarketType, MatchFormat, OrderSide, TokenSide};

/// How many levels per side contribute to the imbalance figure.
pub const IMBALANCE_DEPTH: usize = 5;

/// What kind of stream event produced a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Trade,
    Book,
    PriceChange,
    Periodic,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Trade => "trade",
            EventKind::Book => "book",
            EventKind::PriceChange => "price_change",
            EventKind::Periodic => "periodic",
        }
    }
}

/// One price level of an order book. The exchange serializes both fields as
/// decimal strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    #[serde(with = "string_f64")]
    pub price: f64,
    #[serde(with = "string_f64")]
    pub size: f64,
}

mod string_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        let s = String::deserialize(d)?;
        s.parse::<f64>().map_err(serde::de::Error::custom)
    }
}

/// Full order-book snapshot for one token.
///
/// Invariant after `sort()`: bids descending, asks ascending.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    pub token_id: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub last_update: Option<DateTime<Utc>>,
}

impl OrderBook {
    pub fn new(token_id: impl Into<String>, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        let mut book = Self {
            token_id: token_id.into(),
            bids,
            asks,
            last_update: Some(Utc::now()),
        };
        book.sort();
        book
    }

    pub fn sort(&mut self) {
        self.bids.sort_by(|a, b| {
            b.price
                .partial_cmp(&a.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.asks.sort_by(|a, b| {
            a.price
                .partial_cmp(&b.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Signed depth imbalance over the top `IMBALANCE_DEPTH` levels.
    ///
    /// `(bid_depth - ask_depth) / (bid_depth + ask_depth)`, in [-1, 1].
    /// Positive = bid-heavy. Zero when both sides are empty.
    pub fn imbalance(&self) -> f64 {
        let bid_depth: f64 = self.bids.iter().take(IMBALANCE_DEPTH).map(|l| l.size).sum();
        let ask_depth: f64 = self.asks.iter().take(IMBALANCE_DEPTH).map(|l| l.size).sum();
        let total = bid_depth + ask_depth;
        if total <= 0.0 {
            return 0.0;
        }
        (bid_depth - ask_depth) / total
    }
}

/// Immutable market snapshot delivered to strategies.
#[derive(Debug, Clone)]
pub struct Tick {
    // Identity
    pub market_id: i64,
    pub condition_id: String,
    /// Stream message id, used for deduplication.
    pub message_id: String,

    // Teams
    pub team_yes: String,
    pub team_no: String,

    // Match info
    pub game_start_time: Option<DateTime<Utc>>,
    pub format: Option<MatchFormat>,
    pub market_type: Option<MarketType>,

    // Event metadata
    pub timestamp: DateTime<Utc>,
    pub event_kind: EventKind,
    /// Which token this event is about.
    pub token_side: TokenSide,

    // Prices for the token in `token_side`
    pub price: Option<f64>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub spread: Option<f64>,
    pub mid_price: Option<f64>,

    // Trade details (trade events only)
    pub trade_size: Option<f64>,
    pub trade_side: Option<OrderSide>,

    // Derived metrics
    pub price_velocity_1m: Option<f64>,

    // Token ids for order placement
    pub yes_token_id: Option<String>,
    pub no_token_id: Option<String>,

    // Separately quoted mids from the authoritative book cache.
    // YES + NO need not sum to 1.
    pub actual_yes_mid: Option<f64>,
    pub actual_no_mid: Option<f64>,
}

impl Tick {
    /// YES price, preferring the authoritative order-book mid, then the
    /// tick's own mid when this is a YES event, then the complement of the
    /// NO quote as a last resort.
    pub fn yes_price(&self) -> Option<f64> {
        if let Some(mid) = self.actual_yes_mid {
            return Some(mid);
        }
        match self.token_side {
            TokenSide::Yes => self.mid_price.or(self.price),
            TokenSide::No => self.mid_price.or(self.price).map(|p| 1.0 - p),
        }
    }

    /// NO price, symmetric with `yes_price`.
    pub fn no_price(&self) -> Option<f64> {
        if let Some(mid) = self.actual_no_mid {
            return Some(mid);
        }
        match self.token_side {
            TokenSide::No => self.mid_price.or(self.price),
            TokenSide::Yes => self.mid_price.or(self.price).map(|p| 1.0 - p),
        }
    }

    pub fn side_price(&self, side: TokenSide) -> Option<f64> {
        match side {
            TokenSide::Yes => self.yes_price(),
            TokenSide::No => self.no_price(),
        }
    }

    pub fn is_in_play(&self) -> bool {
        match self.game_start_time {
            Some(start) => Utc::now() >= start,
            None => false,
        }
    }

    /// Minutes since game start; negative before the game, None if unknown.
    pub fn minutes_since_start(&self) -> Option<f64> {
        self.game_start_time
            .map(|start| (Utc::now() - start).num_milliseconds() as f64 / 60_000.0)
    }

    pub fn token_id_for(&self, side: TokenSide) -> Option<&str> {
        match side {
            TokenSide::Yes => self.yes_token_id.as_deref(),
            TokenSide::No => self.no_token_id.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn level(price: f64, size: f64) -> PriceLevel {
        PriceLevel { price, size }
    }

    fn base_tick() -> Tick {
        Tick {
            market_id: 1,
            condition_id: "0xc0".to_string(),
            message_id: "m-1".to_string(),
            team_yes: "A".to_string(),
            team_no: "B".to_string(),
            game_start_time: None,
            format: Some(MatchFormat::Bo3),
            market_type: Some(MarketType::Moneyline),
            timestamp: Utc::now(),
            event_kind: EventKind::Trade,
            token_side: TokenSide::Yes,
            price: Some(0.52),
            best_bid: Some(0.51),
            best_ask: Some(0.53),
            spread: Some(0.02),
            mid_price: Some(0.52),
            trade_size: None,
            trade_side: None,
            price_velocity_1m: None,
            yes_token_id: Some("yt".to_string()),
            no_token_id: Some("nt".to_string()),
            actual_yes_mid: None,
            actual_no_mid: None,
        }
    }

    #[test]
    fn book_sorts_and_derives() {
        let book = OrderBook::new(
            "t",
            vec![level(0.48, 10.0), level(0.49, 5.0)],
            vec![level(0.53, 7.0), level(0.51, 3.0)],
        );
        assert_eq!(book.best_bid(), Some(0.49));
        assert_eq!(book.best_ask(), Some(0.51));
        assert!((book.mid().unwrap() - 0.50).abs() < 1e-9);
        assert!((book.spread().unwrap() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn imbalance_uses_top_levels_only() {
        let bids = (0..8).map(|i| level(0.50 - i as f64 * 0.01, 10.0)).collect();
        let asks = (0..8).map(|i| level(0.51 + i as f64 * 0.01, 5.0)).collect();
        let book = OrderBook::new("t", bids, asks);
        // Top 5: 50 bid depth vs 25 ask depth -> +1/3.
        assert!((book.imbalance() - (25.0 / 75.0)).abs() < 1e-9);
    }

    #[test]
    fn imbalance_zero_on_empty_book() {
        let book = OrderBook::new("t", vec![], vec![]);
        assert_eq!(book.imbalance(), 0.0);
    }

    #[test]
    fn yes_price_prefers_actual_mid() {
        let mut tick = base_tick();
        tick.actual_yes_mid = Some(0.61);
        assert_eq!(tick.yes_price(), Some(0.61));
    }

    #[test]
    fn yes_price_falls_back_to_own_mid_then_complement() {
        let tick = base_tick();
        assert_eq!(tick.yes_price(), Some(0.52));

        let mut no_tick = base_tick();
        no_tick.token_side = TokenSide::No;
        no_tick.mid_price = Some(0.40);
        no_tick.price = Some(0.40);
        // No actual mids: YES derived as 1 - NO quote.
        assert!((no_tick.yes_price().unwrap() - 0.60).abs() < 1e-9);
    }

    #[test]
    fn no_price_does_not_assume_complement_when_actual_present() {
        let mut tick = base_tick();
        tick.actual_yes_mid = Some(0.52);
        tick.actual_no_mid = Some(0.51); // separate books: 0.52 + 0.51 != 1
        assert_eq!(tick.no_price(), Some(0.51));
    }

    #[test]
    fn in_play_and_minutes() {
        let mut tick = base_tick();
        assert!(!tick.is_in_play());
        tick.game_start_time = Some(Utc::now() - Duration::minutes(4));
        assert!(tick.is_in_play());
        let mins = tick.minutes_since_start().unwrap();
        assert!(mins > 3.9 && mins < 4.1);
    }

    #[test]
    fn price_level_parses_exchange_strings() {
        let level: PriceLevel = serde_json::from_str(r#"{"price":"0.515","size":"120.5"}"#).unwrap();
        assert!((level.price - 0.515).abs() < 1e-9);
        assert!((level.size - 120.5).abs() < 1e-9);
    }
}
