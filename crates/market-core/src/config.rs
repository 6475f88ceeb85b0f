//! Configuration management for the Augury trading core.
//!
//! Everything is injected at startup via [`AppConfig::from_env`]; nothing is
//! re-read at runtime.

use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;

/// Trading mode: simulated fills against the live feed, or real orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    Paper,
    Live,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub exchange: ExchangeConfig,
    pub stream: StreamConfig,
    pub trading: TradingConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Order-matching API base URL.
    pub clob_url: String,
    /// Public data API base URL (positions, balances).
    pub data_url: String,
    /// Chain id used in the order-signing domain.
    pub chain_id: u64,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub ws_url: String,
    /// Reconnect backoff floor in seconds.
    pub reconnect_floor_secs: u64,
    /// Reconnect backoff cap in seconds.
    pub reconnect_cap_secs: u64,
    /// Per-instrument tick history ring capacity.
    pub history_capacity: usize,
    /// A position is stale when no tick has landed for this long.
    pub stale_after_secs: u64,
    /// Fallback REST full-refresh interval in seconds.
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct TradingConfig {
    pub mode: TradingMode,
    /// Minimum trade size in quote currency.
    pub min_trade: Decimal,
    /// Maximum trade size in quote currency.
    pub max_trade: Decimal,
    /// Default slippage percent for the buy fallback limit order.
    pub default_slippage_pct: Decimal,
    /// Base fee constant for the dynamic fee curve.
    pub base_fee: Decimal,
    /// Immediate buy attempts before falling back to a resting order.
    pub buy_attempts: u32,
    /// Pause between immediate buy attempts, in milliseconds.
    pub retry_pause_ms: u64,
    /// Resting sell ladder retries.
    pub max_sell_retries: u32,
    /// Price discount per resting sell retry.
    pub sell_retry_discount: Decimal,
    /// Starting balance for a fresh paper account.
    pub paper_starting_balance: Decimal,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Inactivity timeout in seconds.
    pub timeout_secs: u64,
    /// Expiry sweep interval in seconds.
    pub sweep_interval_secs: u64,
    /// Minimum password length for credential registration.
    pub min_password_len: usize,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mode = match env::var("TRADING_MODE").as_deref() {
            Ok("live") => TradingMode::Live,
            Ok("paper") | Err(_) => TradingMode::Paper,
            Ok(other) => {
                return Err(Error::Config {
                    message: format!("TRADING_MODE must be 'paper' or 'live', got '{other}'"),
                })
            }
        };

        Ok(Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/augury.db".to_string()),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5),
            },
            exchange: ExchangeConfig {
                clob_url: env::var("EXCHANGE_CLOB_URL")
                    .unwrap_or_else(|_| "https://clob.polymarket.com".to_string()),
                data_url: env::var("EXCHANGE_DATA_URL")
                    .unwrap_or_else(|_| "https://data-api.polymarket.com".to_string()),
                chain_id: env_parse("EXCHANGE_CHAIN_ID", 137),
            },
            stream: StreamConfig {
                ws_url: env::var("EXCHANGE_WS_URL").unwrap_or_else(|_| {
                    "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string()
                }),
                reconnect_floor_secs: env_parse("WS_RECONNECT_FLOOR_SECS", 1),
                reconnect_cap_secs: env_parse("WS_RECONNECT_CAP_SECS", 30),
                history_capacity: env_parse("PRICE_HISTORY_CAPACITY", 120),
                stale_after_secs: env_parse("POSITION_STALE_SECS", 30),
                refresh_interval_secs: env_parse("POSITION_REFRESH_INTERVAL", 10),
            },
            trading: TradingConfig {
                mode,
                min_trade: env_parse("MIN_TRADE_USD", Decimal::ONE),
                max_trade: env_parse("MAX_TRADE_USD", Decimal::new(100, 0)),
                default_slippage_pct: env_parse("DEFAULT_SLIPPAGE", Decimal::new(2, 0)),
                base_fee: env_parse("BASE_FEE", Decimal::new(156, 4)),
                buy_attempts: env_parse("BUY_ATTEMPTS", 2),
                retry_pause_ms: env_parse("BUY_RETRY_PAUSE_MS", 500),
                max_sell_retries: env_parse("MAX_SELL_RETRIES", 3),
                sell_retry_discount: env_parse("SELL_RETRY_DISCOUNT", Decimal::new(1, 2)),
                paper_starting_balance: env_parse("PAPER_STARTING_BALANCE", Decimal::new(1000, 0)),
            },
            session: SessionConfig {
                timeout_secs: env_parse("SESSION_TIMEOUT", 1800),
                sweep_interval_secs: env_parse("SESSION_SWEEP_INTERVAL", 60),
                min_password_len: env_parse("MIN_PASSWORD_LEN", 6),
            },
        })
    }

    /// Configuration with defaults suitable for unit tests.
    pub fn test_config() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
                max_connections: 2,
            },
            exchange: ExchangeConfig {
                clob_url: "http://127.0.0.1:0".to_string(),
                data_url: "http://127.0.0.1:0".to_string(),
                chain_id: 137,
            },
            stream: StreamConfig {
                ws_url: "ws://127.0.0.1:0".to_string(),
                reconnect_floor_secs: 1,
                reconnect_cap_secs: 30,
                history_capacity: 120,
                stale_after_secs: 30,
                refresh_interval_secs: 10,
            },
            trading: TradingConfig {
                mode: TradingMode::Paper,
                min_trade: Decimal::ONE,
                max_trade: Decimal::new(100, 0),
                default_slippage_pct: Decimal::new(2, 0),
                base_fee: Decimal::new(156, 4),
                buy_attempts: 2,
                retry_pause_ms: 0,
                max_sell_retries: 3,
                sell_retry_discount: Decimal::new(1, 2),
                paper_starting_balance: Decimal::new(1000, 0),
            },
            session: SessionConfig {
                timeout_secs: 1800,
                sweep_interval_secs: 60,
                min_password_len: 6,
            },
        }
    }
}
