//! Order types and pricing.
//!
//! Market orders cross the spread immediately; limit orders post at an
//! offset from mid without crossing; spread orders post on our side of the
//! book and cross after a timeout.

use chrono::{DateTime, Utc};

use crate::models::OrderSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    Spread,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Spread => "spread",
        }
    }

    pub fn parse(s: &str) -> Option<OrderType> {
        match s.trim() {
            "market" => Some(OrderType::Market),
            "limit" => Some(OrderType::Limit),
            "spread" => Some(OrderType::Spread),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub token_id: String,
    pub side: OrderSide,
    pub size_usd: f64,
    pub order_type: OrderType,
    pub limit_offset_bps: i64,
    pub spread_timeout_seconds: i64,
    pub created_at: DateTime<Utc>,
}

impl OrderRequest {
    pub fn new(token_id: &str, side: OrderSide, size_usd: f64, order_type: OrderType) -> Self {
        Self {
            token_id: token_id.to_string(),
            side,
            size_usd,
            order_type,
            limit_offset_bps: 50,
            spread_timeout_seconds: 30,
            created_at: Utc::now(),
        }
    }

    /// Price for this order against the given book state.
    pub fn calculate_price(
        &self,
        best_bid: Option<f64>,
        best_ask: Option<f64>,
        mid_price: Option<f64>,
    ) -> Option<f64> {
        match self.order_type {
            OrderType::Market => match self.side {
                OrderSide::Buy => best_ask,
                OrderSide::Sell => best_bid,
            },
            OrderType::Limit => {
                let mid = mid_price?;
                let offset = self.limit_offset_bps as f64 / 10_000.0;
                match self.side {
                    OrderSide::Buy => {
                        // Post below mid without crossing the ask.
                        let mut price = mid - offset;
                        if let Some(ask) = best_ask {
                            price = price.min(ask - 0.001);
                        }
                        Some(price.max(0.001))
                    }
                    OrderSide::Sell => {
                        let mut price = mid + offset;
                        if let Some(bid) = best_bid {
                            price = price.max(bid + 0.001);
                        }
                        Some(price.min(0.999))
                    }
                }
            }
            OrderType::Spread => match self.side {
                OrderSide::Buy => match (best_bid, best_ask, mid_price) {
                    (Some(bid), Some(ask), _) => Some((bid + 0.001).min((bid + ask) / 2.0)),
                    (Some(bid), None, _) => Some(bid + 0.001),
                    (None, _, Some(mid)) => Some(mid - 0.01),
                    _ => None,
                },
                OrderSide::Sell => match (best_bid, best_ask, mid_price) {
                    (Some(bid), Some(ask), _) => Some((ask - 0.001).max((bid + ask) / 2.0)),
                    (None, Some(ask), _) => Some(ask - 0.001),
                    (_, None, Some(mid)) => Some(mid + 0.01),
                    _ => None,
                },
            },
        }
    }

    /// Whether the order should give up posting and cross the spread.
    pub fn should_cross_spread(&self, elapsed_seconds: f64) -> bool {
        match self.order_type {
            OrderType::Market => true,
            OrderType::Limit => false,
            OrderType::Spread => elapsed_seconds >= self.spread_timeout_seconds as f64,
        }
    }
}

/// Shares bought with `size_usd` at `price`, rounded down to 2 decimals to
/// avoid rounding up past the available notional.
pub fn shares_from_usd(size_usd: f64, price: f64) -> Option<f64> {
    if price <= 0.0 {
        return None;
    }
    Some((size_usd / price * 100.0).floor() / 100.0)
}

pub fn usd_from_shares(shares: f64, price: f64) -> f64 {
    (shares * price * 100.0).round() / 100.0
}

/// Exchange limit prices must be rounded DOWN to the token's tick size.
pub fn round_down_to_tick(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    (price / tick_size).floor() * tick_size
}
