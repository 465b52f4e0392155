//! Exchange market-channel WebSocket protocol.
//!
//! Message shapes and subscription frames for the market data channel. The
//! stream delivers JSON objects or arrays of objects; heartbeats are the
//! literal strings PING/PONG. Unknown event types parse to nothing and are
//! ignored by the caller.

use serde::Deserialize;
use serde_json::json;

use crate::book::PriceLevel;
use crate::models::OrderSide;

#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub asset_id: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum MarketEvent {
    /// Full order-book snapshot for one token.
    Book(BookSnapshot),
    /// A trade printed.
    Trade {
        asset_id: String,
        price: Option<f64>,
        size: Option<f64>,
        side: Option<OrderSide>,
    },
    /// Batched price-level deltas.
    PriceChange {
        asset_id: String,
        size: Option<f64>,
        side: Option<OrderSide>,
    },
}

impl MarketEvent {
    pub fn asset_id(&self) -> &str {
        match self {
            MarketEvent::Book(b) => &b.asset_id,
            MarketEvent::Trade { asset_id, .. } => asset_id,
            MarketEvent::PriceChange { asset_id, .. } => asset_id,
        }
    }
}

/// Initial/with-additions subscription frame.
pub fn subscribe_message(asset_ids: &[String]) -> String {
    json!({
        "type": "market",
        "assets_ids": asset_ids,
    })
    .to_string()
}

pub fn unsubscribe_message(asset_ids: &[String]) -> String {
    json!({
        "type": "market",
        "assets_ids": asset_ids,
        "action": "unsubscribe",
    })
    .to_string()
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    asset_id: Option<String>,
    #[serde(default)]
    bids: Vec<PriceLevel>,
    #[serde(default)]
    asks: Vec<PriceLevel>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    side: Option<String>,
    #[serde(default)]
    price_changes: Vec<RawPriceChange>,
}

#[derive(Debug, Deserialize)]
struct RawPriceChange {
    #[serde(default)]
    asset_id: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    side: Option<String>,
}

fn parse_str_f64(v: &Option<String>) -> Option<f64> {
    v.as_deref().and_then(|s| s.parse::<f64>().ok())
}

/// Parse one text frame into zero or more events. Heartbeats, malformed
/// JSON, and unknown event types yield an empty list.
pub fn parse_events(text: &str) -> Vec<MarketEvent> {
    let trimmed = text.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("PONG")
        || trimmed.eq_ignore_ascii_case("PING")
    {
        return Vec::new();
    }

    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    match value {
        serde_json::Value::Array(items) => items.into_iter().flat_map(parse_one).collect(),
        obj @ serde_json::Value::Object(_) => parse_one(obj),
        _ => Vec::new(),
    }
}

fn parse_one(value: serde_json::Value) -> Vec<MarketEvent> {
    let raw: RawEvent = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(_) => return Vec::new(),
    };

    match raw.event_type.as_str() {
        "book" => {
            let Some(asset_id) = raw.asset_id else {
                return Vec::new();
            };
            vec![MarketEvent::Book(BookSnapshot {
                asset_id,
                bids: raw.bids,
                asks: raw.asks,
                timestamp_ms: raw.timestamp.as_deref().and_then(|s| s.parse().ok()),
            })]
        }
        "last_trade_price" => {
            let Some(asset_id) = raw.asset_id else {
                return Vec::new();
            };
            vec![MarketEvent::Trade {
                asset_id,
                price: parse_str_f64(&raw.price),
                size: parse_str_f64(&raw.size),
                side: raw.side.as_deref().and_then(OrderSide::parse),
            }]
        }
        "price_change" => raw
            .price_changes
            .into_iter()
            .filter_map(|c| {
                Some(MarketEvent::PriceChange {
                    asset_id: c.asset_id?,
                    size: parse_str_f64(&c.size),
                    side: c.side.as_deref().and_then(OrderSide::parse),
                })
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_frames_have_expected_shape() {
        let msg = subscribe_message(&["tok-1".to_string(), "tok-2".to_string()]);
        let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["type"], "market");
        assert_eq!(v["assets_ids"].as_array().unwrap().len(), 2);
        assert!(v.get("action").is_none());

        let msg = unsubscribe_message(&["tok-1".to_string()]);
        let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["action"], "unsubscribe");
    }

    #[test]
    fn parses_book_snapshot() {
        let text = r#"{
            "event_type": "book",
            "asset_id": "tok-1",
            "bids": [{"price": "0.48", "size": "100"}, {"price": "0.49", "size": "50"}],
            "asks": [{"price": "0.51", "size": "70"}],
            "timestamp": "1700000000123"
        }"#;
        let events = parse_events(text);
        assert_eq!(events.len(), 1);
        match &events[0] {
            MarketEvent::Book(book) => {
                assert_eq!(book.asset_id, "tok-1");
                assert_eq!(book.bids.len(), 2);
                assert_eq!(book.asks.len(), 1);
                assert_eq!(book.timestamp_ms, Some(1_700_000_000_123));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_trade_and_array_frames() {
        let text = r#"[
            {"event_type": "last_trade_price", "asset_id": "tok-1", "price": "0.52",
             "size": "12.5", "side": "BUY"},
            {"event_type": "book", "asset_id": "tok-2", "bids": [], "asks": []}
        ]"#;
        let events = parse_events(text);
        assert_eq!(events.len(), 2);
        match &events[0] {
            MarketEvent::Trade { price, side, .. } => {
                assert_eq!(*price, Some(0.52));
                assert_eq!(*side, Some(OrderSide::Buy));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_price_change_batch() {
        let text = r#"{
            "event_type": "price_change",
            "price_changes": [
                {"asset_id": "tok-1", "size": "5", "side": "SELL"},
                {"asset_id": "tok-2", "size": "1", "side": "BUY"},
                {"size": "1"}
            ]
        }"#;
        let events = parse_events(text);
        // The entry without an asset id is dropped.
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn heartbeats_and_garbage_are_ignored() {
        assert!(parse_events("PONG").is_empty());
        assert!(parse_events("PING").is_empty());
        assert!(parse_events("not json").is_empty());
        assert!(parse_events(r#"{"event_type": "tick_size_change"}"#).is_empty());
        assert!(parse_events("42").is_empty());
    }
}
