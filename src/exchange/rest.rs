//! Exchange REST market-data client.
//!
//! Unauthenticated CLOB endpoints: order books, prices, fee rates. Requests
//! go through a windowed rate limiter and an exponential-backoff retry
//! wrapper.

use anyhow::{bail, Context, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use crate::book::{OrderBook, PriceLevel};

const CLOB_API_BASE: &str = "https://clob.polymarket.com";

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;

/// Requests per 10-second window, reset when the window rolls.
struct RateLimiter {
    requests_per_10s: u32,
    current_requests: u32,
    window_start: Instant,
}

impl RateLimiter {
    fn new(requests_per_10s: u32) -> Self {
        Self {
            requests_per_10s,
            current_requests: 0,
            window_start: Instant::now(),
        }
    }

    async fn acquire(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(10) {
            self.current_requests = 0;
            self.window_start = Instant::now();
        }

        if self.current_requests >= self.requests_per_10s {
            let wait = Duration::from_secs(10).saturating_sub(elapsed);
            if wait > Duration::ZERO {
                debug!("rate limiting: waiting {}ms", wait.as_millis());
                sleep(wait).await;
                self.current_requests = 0;
                self.window_start = Instant::now();
            }
        }
        self.current_requests += 1;
    }
}

#[derive(Debug, Deserialize)]
struct RawBook {
    #[serde(default)]
    asset_id: String,
    #[serde(default)]
    bids: Vec<PriceLevel>,
    #[serde(default)]
    asks: Vec<PriceLevel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceInfo {
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub ask: f64,
    #[serde(default)]
    pub spread: f64,
}

pub struct MarketDataClient {
    client: Client,
    base_url: String,
    limiter: Mutex<RateLimiter>,
}

impl MarketDataClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("oddsbot/0.1 (engine)")
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            base_url: CLOB_API_BASE.to_string(),
            limiter: Mutex::new(RateLimiter::new(500)),
        }
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let mut c = Self::new();
        c.base_url = base_url.into();
        c
    }

    /// Full order book for one token, sorted.
    pub async fn fetch_orderbook(&self, token_id: &str) -> Result<OrderBook> {
        self.limiter.lock().await.acquire().await;

        let url = format!("{}/book", self.base_url);
        let mut params = HashMap::new();
        params.insert("token_id", token_id.to_string());

        let response = self.execute_with_retry(&url, Some(&params)).await?;
        let raw: RawBook = response.json().await.context("parse orderbook")?;

        debug!(
            token_id = %token_id,
            bids = %raw.bids.len(),
            asks = %raw.asks.len(),
            "fetched orderbook"
        );
        Ok(OrderBook::new(
            if raw.asset_id.is_empty() {
                token_id.to_string()
            } else {
                raw.asset_id
            },
            raw.bids,
            raw.asks,
        ))
    }

    /// Batched books for several tokens in one request.
    pub async fn fetch_orderbooks(&self, token_ids: &[String]) -> Result<Vec<OrderBook>> {
        if token_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.limiter.lock().await.acquire().await;

        let url = format!("{}/books", self.base_url);
        let mut params = HashMap::new();
        params.insert("token_ids", token_ids.join(","));

        let response = self.execute_with_retry(&url, Some(&params)).await?;
        let raw: Vec<RawBook> = response.json().await.context("parse orderbooks")?;

        Ok(raw
            .into_iter()
            .map(|b| OrderBook::new(b.asset_id, b.bids, b.asks))
            .collect())
    }

    pub async fn fetch_price(&self, token_id: &str) -> Result<PriceInfo> {
        self.limiter.lock().await.acquire().await;

        let url = format!("{}/price", self.base_url);
        let mut params = HashMap::new();
        params.insert("token_id", token_id.to_string());

        let response = self.execute_with_retry(&url, Some(&params)).await?;
        response.json().await.context("parse price")
    }

    /// Fee rate for a token in basis points.
    pub async fn fetch_fee_rate_bps(&self, token_id: &str) -> Result<i64> {
        self.limiter.lock().await.acquire().await;

        let url = format!("{}/fee-rate", self.base_url);
        let mut params = HashMap::new();
        params.insert("token_id", token_id.to_string());

        let response = self.execute_with_retry(&url, Some(&params)).await?;
        let value: serde_json::Value = response.json().await.context("parse fee rate")?;
        let bps = value
            .get("fee_rate_bps")
            .and_then(|v| {
                v.as_i64()
                    .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            })
            .unwrap_or(0);
        Ok(bps)
    }

    async fn execute_with_retry(
        &self,
        url: &str,
        params: Option<&HashMap<&str, String>>,
    ) -> Result<reqwest::Response> {
        let mut backoff = INITIAL_BACKOFF_MS;

        for attempt in 0..MAX_RETRIES {
            let mut request = self.client.get(url);
            if let Some(p) = params {
                request = request.query(p);
            }

            match timeout(Duration::from_secs(10), request.send()).await {
                Ok(Ok(response)) => {
                    if response.status().is_success() {
                        return Ok(response);
                    } else if response.status() == StatusCode::TOO_MANY_REQUESTS {
                        warn!("rate limited on attempt {}, backing off", attempt + 1);
                        sleep(Duration::from_millis(backoff * 10)).await;
                    } else {
                        let status = response.status();
                        let text = response.text().await.unwrap_or_default();
                        error!("API error {}: {}", status, text);
                        bail!("API error {}: {}", status, text);
                    }
                }
                Ok(Err(e)) => {
                    warn!("request failed (attempt {}): {}", attempt + 1, e);
                }
                Err(_) => {
                    warn!("request timeout (attempt {})", attempt + 1);
                }
            }

            if attempt < MAX_RETRIES - 1 {
                debug!("retrying in {}ms", backoff);
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(30_000);
            }
        }

        bail!("max retries exceeded for {}", url)
    }
}

impl Default for MarketDataClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_counts_within_window() {
        let mut limiter = RateLimiter::new(100);
        for _ in 0..50 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.current_requests, 50);
    }

    #[test]
    fn raw_book_parses_exchange_shape() {
        let raw: RawBook = serde_json::from_str(
            r#"{"asset_id": "tok", "bids": [{"price": "0.5", "size": "10"}], "asks": []}"#,
        )
        .unwrap();
        assert_eq!(raw.asset_id, "tok");
        assert_eq!(raw.bids.len(), 1);
    }
}
