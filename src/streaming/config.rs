//! Streaming executor configuration.
//!
//! Loaded from `strategies.yaml` under the `streaming_book_imbalance`
//! section; the first enabled entry wins. Missing keys fall back to the
//! defaults below.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

use crate::executor::order_types::OrderType;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    // Identity
    pub name: String,
    pub enabled: bool,
    /// false = paper-simulated.
    pub live: bool,

    // Entry parameters
    /// |imbalance| at or above this triggers evaluation.
    pub min_imbalance: f64,
    pub yes_price_min: f64,
    pub yes_price_max: f64,
    pub max_spread: f64,
    pub max_exit_spread: f64,

    // Market selection
    pub categories: Vec<String>,
    pub max_hours_to_close: f64,
    pub min_minutes_to_close: f64,

    // Position management
    pub max_positions: i64,
    pub fixed_size_usd: f64,
    /// Optional fraction of available capital; overrides fixed size when set.
    pub size_pct: Option<f64>,
    pub cooldown_minutes: f64,
    pub profit_target_pct: f64,
    pub max_hold_minutes: f64,

    // Safety thresholds (stricter than the polled path: the streaming path
    // reacts to events directly, so staleness is a real risk)
    pub max_signal_age_seconds: f64,
    pub max_price_deviation: f64,
    pub max_fee_rate_bps: i64,

    // Order construction
    pub order_type: String,
    pub limit_offset_bps: i64,
    pub spread_timeout_seconds: i64,

    // WebSocket
    pub subscription_refresh_interval: u64,
    pub reconnect_delay: f64,
    pub max_reconnect_delay: f64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            name: "streaming_imbalance".to_string(),
            enabled: true,
            live: false,
            min_imbalance: 0.5,
            yes_price_min: 0.30,
            yes_price_max: 0.70,
            max_spread: 0.03,
            max_exit_spread: 0.05,
            categories: vec!["CSGO".to_string()],
            max_hours_to_close: 4.0,
            min_minutes_to_close: 2.0,
            max_positions: 5,
            fixed_size_usd: 1.1,
            size_pct: None,
            cooldown_minutes: 60.0,
            profit_target_pct: 0.10,
            max_hold_minutes: 120.0,
            max_signal_age_seconds: 5.0,
            max_price_deviation: 0.03,
            max_fee_rate_bps: 200,
            order_type: "limit".to_string(),
            limit_offset_bps: 50,
            spread_timeout_seconds: 30,
            subscription_refresh_interval: 300,
            reconnect_delay: 5.0,
            max_reconnect_delay: 60.0,
        }
    }
}

impl StreamingConfig {
    pub fn order_type(&self) -> OrderType {
        OrderType::parse(&self.order_type).unwrap_or(OrderType::Limit)
    }
}

#[derive(Debug, Default, Deserialize)]
struct StrategiesFile {
    #[serde(default)]
    streaming_book_imbalance: Vec<StreamingConfig>,
}

/// Load the streaming config from a strategies.yaml file. A missing file or
/// empty section yields defaults so the paper path can run out of the box.
pub fn load_streaming_config(path: &Path) -> Result<StreamingConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "strategies config not found, using defaults");
        return Ok(StreamingConfig::default());
    }

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    let file: StrategiesFile =
        serde_yaml::from_str(&text).with_context(|| format!("parse {}", path.display()))?;

    match file
        .streaming_book_imbalance
        .into_iter()
        .find(|c| c.enabled)
    {
        Some(config) => Ok(config),
        None => {
            warn!("no enabled streaming_book_imbalance config, using defaults");
            Ok(StreamingConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = StreamingConfig::default();
        assert!(!c.live);
        assert_eq!(c.min_imbalance, 0.5);
        assert_eq!(c.order_type(), OrderType::Limit);
    }

    #[test]
    fn parses_yaml_section() {
        let yaml = r#"
streaming_book_imbalance:
  - name: imbalance_momentum
    enabled: true
    live: false
    min_imbalance: 0.6
    yes_price_min: 0.35
    yes_price_max: 0.65
    max_spread: 0.02
    categories: [CSGO, LOL]
    max_positions: 3
    fixed_size_usd: 5.0
    cooldown_minutes: 30
    order_type: market
"#;
        let file: StrategiesFile = serde_yaml::from_str(yaml).unwrap();
        let c = file
            .streaming_book_imbalance
            .into_iter()
            .find(|c| c.enabled)
            .unwrap();
        assert_eq!(c.name, "imbalance_momentum");
        assert_eq!(c.min_imbalance, 0.6);
        assert_eq!(c.categories, vec!["CSGO", "LOL"]);
        assert_eq!(c.order_type(), OrderType::Market);
        // Unspecified keys keep defaults.
        assert_eq!(c.max_signal_age_seconds, 5.0);
    }

    #[test]
    fn disabled_entries_are_skipped() {
        let yaml = r#"
streaming_book_imbalance:
  - name: off
    enabled: false
  - name: on
    enabled: true
"#;
        let file: StrategiesFile = serde_yaml::from_str(yaml).unwrap();
        let c = file
            .streaming_book_imbalance
            .into_iter()
            .find(|c| c.enabled)
            .unwrap();
        assert_eq!(c.name, "on");
    }
}
