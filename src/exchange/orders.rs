//! Authenticated exchange order client.
//!
//! HMAC-SHA256 signed requests against the CLOB: order placement, status,
//! cancel, balance, wallet positions, and trade history. The wallet, not the
//! local database, is authoritative for what has filled; the live executor
//! consults it on retries and timeouts.

use anyhow::{anyhow, Context, Result};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

const CLOB_HOST: &str = "https://clob.polymarket.com";
const DATA_API_HOST: &str = "https://data-api.polymarket.com";

/// Collateral balances are fixed-point with 6 decimals.
const COLLATERAL_DECIMALS: f64 = 1_000_000.0;

#[derive(Debug, Clone)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
    pub wallet_address: String,
}

impl ExchangeCredentials {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("EXCHANGE_API_KEY").ok()?;
        let secret = std::env::var("EXCHANGE_API_SECRET").ok()?;
        let passphrase = std::env::var("EXCHANGE_API_PASSPHRASE").ok()?;
        let wallet_address = std::env::var("EXCHANGE_WALLET_ADDRESS").unwrap_or_default();

        if api_key.is_empty() || secret.is_empty() || passphrase.is_empty() {
            return None;
        }
        Some(Self {
            api_key,
            secret,
            passphrase,
            wallet_address,
        })
    }
}

#[derive(Debug, Serialize)]
struct OrderPayload {
    #[serde(rename = "tokenID")]
    token_id: String,
    price: String,
    size: String,
    side: String,
    #[serde(rename = "orderType")]
    order_type: String,
}

#[derive(Debug, Deserialize)]
struct RawOrderResponse {
    #[serde(rename = "orderID", alias = "orderId", alias = "order_id")]
    order_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "errorMsg", alias = "error", default)]
    error_msg: Option<String>,
    #[serde(rename = "filledSize", alias = "filled_size", default)]
    filled_size: Option<String>,
    #[serde(rename = "avgPrice", alias = "avg_price", default)]
    avg_price: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: String,
    /// Exchange reported an immediate match.
    pub matched: bool,
    pub filled_size: Option<f64>,
    pub avg_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    Live,
    Matched,
    Cancelled,
    Unknown(String),
}

#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub cancelled: bool,
    /// Cancel refused because the order already matched.
    pub already_matched: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletPosition {
    #[serde(rename = "asset_id", alias = "assetId", alias = "token_id", default)]
    pub token_id: String,
    #[serde(default)]
    pub size: f64,
    #[serde(rename = "avgPrice", alias = "avg_price", default)]
    pub avg_price: f64,
    #[serde(rename = "curPrice", alias = "cur_price", default)]
    pub current_price: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeTrade {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "asset_id", alias = "assetId", default)]
    pub asset_id: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub size: f64,
    #[serde(default)]
    pub price: f64,
}

/// Classify an error as retryable (transient network) vs a business
/// rejection that must not be retried.
pub fn is_retryable_error(err: &anyhow::Error) -> bool {
    if let Some(req_err) = err.downcast_ref::<reqwest::Error>() {
        return req_err.is_timeout() || req_err.is_connect() || req_err.is_request();
    }
    let text = err.to_string().to_ascii_lowercase();
    text.contains("timeout")
        || text.contains("timed out")
        || text.contains("connection")
        || text.contains("proxy")
        || text.contains("reset")
}

pub struct OrderClient {
    client: Client,
    creds: ExchangeCredentials,
    host: String,
    data_host: String,
}

impl std::fmt::Debug for OrderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderClient")
            .field("host", &self.host)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl OrderClient {
    pub fn new(creds: ExchangeCredentials, proxy_url: Option<&str>) -> Result<Self> {
        let mut builder = Client::builder().timeout(Duration::from_secs(30));
        if let Some(proxy) = proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy).context("bad proxy url")?);
        }
        Ok(Self {
            client: builder.build().context("build HTTP client")?,
            creds,
            host: CLOB_HOST.to_string(),
            data_host: DATA_API_HOST.to_string(),
        })
    }

    pub fn from_env() -> Option<Self> {
        let creds = ExchangeCredentials::from_env()?;
        let proxy = std::env::var("TRADING_PROXY_URL").ok();
        match Self::new(creds, proxy.as_deref()) {
            Ok(client) => {
                info!("order client initialized with exchange credentials");
                Some(client)
            }
            Err(e) => {
                warn!(error = %e, "order client init failed");
                None
            }
        }
    }

    // =========================================================================
    // Signing
    // =========================================================================

    fn sign_request(&self, method: &str, path: &str, body: &str, timestamp: i64) -> Result<String> {
        let message = format!("{timestamp}{method}{path}{body}");

        // Secrets arrive base64 in one of several alphabets.
        let secret_bytes = URL_SAFE
            .decode(&self.creds.secret)
            .or_else(|_| URL_SAFE_NO_PAD.decode(&self.creds.secret))
            .or_else(|_| BASE64.decode(&self.creds.secret))
            .context("decode API secret")?;

        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|e| anyhow!("HMAC key error: {e}"))?;
        mac.update(message.as_bytes());
        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> Result<Vec<(String, String)>> {
        let timestamp = Utc::now().timestamp();
        let signature = self.sign_request(method, path, body, timestamp)?;
        Ok(vec![
            ("POLY_ADDRESS".to_string(), self.creds.wallet_address.clone()),
            ("POLY_API_KEY".to_string(), self.creds.api_key.clone()),
            ("POLY_SIGNATURE".to_string(), signature),
            ("POLY_TIMESTAMP".to_string(), timestamp.to_string()),
            ("POLY_PASSPHRASE".to_string(), self.creds.passphrase.clone()),
        ])
    }

    async fn signed_get(&self, path: &str) -> Result<String> {
        let headers = self.auth_headers("GET", path, "")?;
        let url = format!("{}{}", self.host, path);
        let mut request = self.client.get(&url);
        for (key, value) in headers {
            request = request.header(&key, &value);
        }
        let response = request.send().await.context("signed GET failed")?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("{path} failed ({status}): {text}"));
        }
        Ok(text)
    }

    // =========================================================================
    // Account
    // =========================================================================

    /// Collateral balance in USD (the wire value is 6-decimal fixed point).
    pub async fn get_balance(&self) -> Result<f64> {
        let text = self.signed_get("/balance-allowance?signature_type=2").await?;
        let value: serde_json::Value = serde_json::from_str(&text).context("parse balance")?;

        if let Some(bal) = value.get("balance") {
            if let Some(v) = bal.as_f64() {
                return Ok(v);
            }
            if let Some(s) = bal.as_str() {
                if let Ok(raw) = s.parse::<f64>() {
                    return Ok(raw / COLLATERAL_DECIMALS);
                }
            }
        }
        warn!(response = %text, "could not parse balance response");
        Ok(0.0)
    }

    /// Wallet positions - the authoritative view of what has filled.
    pub async fn get_positions(&self) -> Result<Vec<WalletPosition>> {
        let url = format!(
            "{}/positions?user={}",
            self.data_host, self.creds.wallet_address
        );
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .context("positions request failed")?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("positions request failed ({status}): {text}"));
        }
        serde_json::from_str(&text).context("parse positions")
    }

    pub async fn get_trades(&self, asset_id: &str) -> Result<Vec<ExchangeTrade>> {
        let url = format!(
            "{}/trades?user={}&asset_id={}",
            self.data_host, self.creds.wallet_address, asset_id
        );
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .context("trades request failed")?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("trades request failed ({status}): {text}"));
        }
        serde_json::from_str(&text).context("parse trades")
    }

    // =========================================================================
    // Orders
    // =========================================================================

    /// Place a limit order. `price` must already be rounded to the token's
    /// tick size; `size` is in shares.
    pub async fn place_order(
        &self,
        token_id: &str,
        side: &str,
        price: f64,
        size: f64,
    ) -> Result<PlacedOrder> {
        let payload = OrderPayload {
            token_id: token_id.to_string(),
            price: format!("{price:.4}"),
            size: format!("{size:.6}"),
            side: side.to_string(),
            order_type: "LIMIT".to_string(),
        };
        let body = serde_json::to_string(&payload).context("serialize order")?;
        let path = "/order";
        let headers = self.auth_headers("POST", path, &body)?;

        debug!(token_id = %token_id, side = %side, price = %price, size = %size, "submitting order");

        let url = format!("{}{}", self.host, path);
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let response = request.body(body).send().await.context("order request failed")?;
        let status = response.status();
        let text = response.text().await.context("read order response")?;

        if !status.is_success() {
            return Err(anyhow!("order rejected ({status}): {text}"));
        }

        let raw: RawOrderResponse =
            serde_json::from_str(&text).context("parse order response")?;
        if let Some(err) = raw.error_msg {
            if !err.is_empty() {
                return Err(anyhow!("order error: {err}"));
            }
        }

        let matched = matches!(raw.status.as_deref(), Some("matched") | Some("MATCHED"));
        Ok(PlacedOrder {
            order_id: raw
                .order_id
                .ok_or_else(|| anyhow!("order response missing id"))?,
            matched,
            filled_size: raw.filled_size.and_then(|s| s.parse().ok()),
            avg_price: raw.avg_price.and_then(|s| s.parse().ok()),
        })
    }

    pub async fn order_status(&self, order_id: &str) -> Result<OrderStatus> {
        let path = format!("/data/order/{order_id}");
        let text = self.signed_get(&path).await?;
        let value: serde_json::Value = serde_json::from_str(&text).context("parse order status")?;
        let status = value
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        Ok(match status.as_str() {
            "live" | "open" => OrderStatus::Live,
            "matched" | "filled" => OrderStatus::Matched,
            "cancelled" | "canceled" => OrderStatus::Cancelled,
            other => OrderStatus::Unknown(other.to_string()),
        })
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<CancelOutcome> {
        let path = "/order";
        let body = serde_json::json!({ "orderID": order_id }).to_string();
        let headers = self.auth_headers("DELETE", path, &body)?;

        let url = format!("{}{}", self.host, path);
        let mut request = self
            .client
            .delete(&url)
            .header("Content-Type", "application/json");
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let response = request.body(body).send().await.context("cancel request failed")?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status.is_success() {
            return Ok(CancelOutcome {
                cancelled: true,
                already_matched: false,
            });
        }

        // A cancel refused because the order matched is a fill, not an error.
        let lower = text.to_ascii_lowercase();
        if lower.contains("matched") || lower.contains("filled") {
            return Ok(CancelOutcome {
                cancelled: false,
                already_matched: true,
            });
        }
        Err(anyhow!("cancel failed ({status}): {text}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> ExchangeCredentials {
        ExchangeCredentials {
            api_key: "key".to_string(),
            // base64 of "supersecret"
            secret: BASE64.encode(b"supersecret"),
            passphrase: "pass".to_string(),
            wallet_address: "0xwallet".to_string(),
        }
    }

    #[test]
    fn signature_is_deterministic_and_urlsafe() {
        let client = OrderClient::new(creds(), None).unwrap();
        let a = client.sign_request("POST", "/order", "{}", 1_700_000_000).unwrap();
        let b = client.sign_request("POST", "/order", "{}", 1_700_000_000).unwrap();
        assert_eq!(a, b);
        assert!(!a.contains('+') && !a.contains('/'));

        let c = client.sign_request("POST", "/order", "{}", 1_700_000_001).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn auth_headers_carry_all_fields() {
        let client = OrderClient::new(creds(), None).unwrap();
        let headers = client.auth_headers("GET", "/balance-allowance", "").unwrap();
        let keys: Vec<&str> = headers.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "POLY_ADDRESS",
                "POLY_API_KEY",
                "POLY_SIGNATURE",
                "POLY_TIMESTAMP",
                "POLY_PASSPHRASE"
            ]
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(is_retryable_error(&anyhow!("connection reset by peer")));
        assert!(is_retryable_error(&anyhow!("proxy error 502")));
        assert!(is_retryable_error(&anyhow!("request timed out")));
        assert!(!is_retryable_error(&anyhow!(
            "order rejected (400): invalid price"
        )));
        assert!(!is_retryable_error(&anyhow!("insufficient balance")));
    }

    #[test]
    fn wallet_position_parses_aliases() {
        let p: WalletPosition = serde_json::from_str(
            r#"{"assetId": "tok", "size": 50.0, "avgPrice": 0.4201, "curPrice": 0.45}"#,
        )
        .unwrap();
        assert_eq!(p.token_id, "tok");
        assert_eq!(p.size, 50.0);
        assert!((p.avg_price - 0.4201).abs() < 1e-9);
    }
}
