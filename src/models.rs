use serde::{Deserialize, Serialize};

/// Which outcome token an event, position, or order refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenSide {
    Yes,
    No,
}

impl TokenSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenSide::Yes => "YES",
            TokenSide::No => "NO",
        }
    }

    pub fn opposite(&self) -> TokenSide {
        match self {
            TokenSide::Yes => TokenSide::No,
            TokenSide::No => TokenSide::Yes,
        }
    }

    pub fn parse(s: &str) -> Option<TokenSide> {
        match s.trim().to_ascii_uppercase().as_str() {
            "YES" => Some(TokenSide::Yes),
            "NO" => Some(TokenSide::No),
            _ => None,
        }
    }
}

/// Match format. The engine trades best-of-3 and longer by default;
/// BO1 markets resolve too fast for swing logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchFormat {
    Bo1,
    Bo3,
    Bo5,
}

impl MatchFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchFormat::Bo1 => "BO1",
            MatchFormat::Bo3 => "BO3",
            MatchFormat::Bo5 => "BO5",
        }
    }

    pub fn parse(s: &str) -> Option<MatchFormat> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BO1" => Some(MatchFormat::Bo1),
            "BO3" => Some(MatchFormat::Bo3),
            "BO5" => Some(MatchFormat::Bo5),
            _ => None,
        }
    }
}

/// Market type: series winner or per-map winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    Moneyline,
    ChildMoneyline,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Moneyline => "moneyline",
            MarketType::ChildMoneyline => "child_moneyline",
        }
    }

    pub fn parse(s: &str) -> Option<MarketType> {
        match s.trim() {
            "moneyline" => Some(MarketType::Moneyline),
            "child_moneyline" => Some(MarketType::ChildMoneyline),
            _ => None,
        }
    }
}

/// BUY or SELL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<OrderSide> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

/// Engine configuration from environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub websocket_url: String,
    pub strategies_config_path: String,
    /// Comma-separated strategy name whitelist; empty = all registered.
    pub strategy_whitelist: Vec<String>,
    pub trading_proxy_url: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./oddsbot.db".to_string());

        let websocket_url = std::env::var("EXCHANGE_WS_URL").unwrap_or_else(|_| {
            "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string()
        });

        let strategies_config_path =
            std::env::var("STRATEGIES_CONFIG").unwrap_or_else(|_| "./strategies.yaml".to_string());

        let strategy_whitelist = std::env::var("STRATEGY_WHITELIST")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let trading_proxy_url = std::env::var("TRADING_PROXY_URL").ok();

        Ok(Self {
            database_path,
            websocket_url,
            strategies_config_path,
            strategy_whitelist,
            trading_proxy_url,
        })
    }
}
