//! Core domain types shared across the workspace.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lowest price accepted anywhere in the trading path.
pub fn min_price() -> Decimal {
    Decimal::new(1, 2)
}

/// Highest price accepted anywhere in the trading path.
pub fn max_price() -> Decimal {
    Decimal::new(99, 2)
}

/// Positions at or below this size are considered closed.
pub fn dust_size() -> Decimal {
    Decimal::new(1, 3)
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

/// Order type for submission to the matching engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Fill-and-kill: fill what is immediately available, cancel the rest.
    Fak,
    /// Fill-or-kill: fill completely immediately or cancel entirely.
    Fok,
    /// Good-til-cancelled: rests on the book until filled or cancelled.
    #[default]
    Gtc,
}

/// Relationship between the signing key and the funding account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMode {
    /// The signing key directly owns the funds.
    Eoa,
    /// Email/managed wallet: a proxy contract custodies the funds.
    #[default]
    Email,
    /// Browser proxy wallet.
    Proxy,
}

impl SignatureMode {
    pub fn as_u8(self) -> u8 {
        match self {
            SignatureMode::Eoa => 0,
            SignatureMode::Email => 1,
            SignatureMode::Proxy => 2,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => SignatureMode::Eoa,
            2 => SignatureMode::Proxy,
            _ => SignatureMode::Email,
        }
    }
}

/// Result of one order execution attempt, as surfaced to callers.
///
/// `error` is set exactly when `success` is false; it is a human-readable
/// reason, never a panic payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub filled_size: Decimal,
    pub avg_price: Decimal,
    pub error: Option<String>,
}

impl OrderResult {
    /// A fill (full or partial) at an average price.
    pub fn filled(order_id: impl Into<String>, filled_size: Decimal, avg_price: Decimal) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            filled_size,
            avg_price,
            error: None,
        }
    }

    /// A resting order accepted by the book: nothing filled yet, the price
    /// reported is the limit price.
    pub fn resting(order_id: impl Into<String>, limit_price: Decimal) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            filled_size: Decimal::ZERO,
            avg_price: limit_price,
            error: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            filled_size: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            error: Some(reason.into()),
        }
    }

    /// Quote-currency proceeds of the fill.
    pub fn proceeds(&self) -> Decimal {
        self.filled_size * self.avg_price
    }
}

/// Kind of trigger held by the Trigger Engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    PriceAlert,
    StopLoss,
    TakeProfit,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::PriceAlert => "price_alert",
            AlertKind::StopLoss => "stop_loss",
            AlertKind::TakeProfit => "take_profit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "price_alert" => Some(AlertKind::PriceAlert),
            "stop_loss" => Some(AlertKind::StopLoss),
            "take_profit" => Some(AlertKind::TakeProfit),
            _ => None,
        }
    }
}

/// Direction a trigger fires in relative to its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSide {
    Above,
    Below,
}

impl AlertSide {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSide::Above => "above",
            AlertSide::Below => "below",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "above" => Some(AlertSide::Above),
            "below" => Some(AlertSide::Below),
            _ => None,
        }
    }
}

/// A price alert or auto-trade trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub user_id: i64,
    pub token_id: String,
    /// Market question, kept for display by the front end.
    pub label: String,
    pub kind: AlertKind,
    pub trigger_price: Decimal,
    pub side: AlertSide,
    /// When set, the trigger auto-liquidates the position on fire.
    pub auto_trade: bool,
    pub trade_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub triggered: bool,
}

impl Alert {
    /// Whether a price satisfies this alert's threshold.
    pub fn matches(&self, price: Decimal) -> bool {
        match self.side {
            AlertSide::Above => price >= self.trigger_price,
            AlertSide::Below => price <= self.trigger_price,
        }
    }
}

/// Stored credential record for one user.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub user_id: i64,
    /// base64(salt ‖ nonce ‖ ciphertext); opaque without the password.
    pub encrypted_key: String,
    pub funder_address: String,
    pub signature_mode: SignatureMode,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// One open position as reported by the exchange's position query.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangePosition {
    #[serde(alias = "asset", alias = "tokenId")]
    pub token_id: String,
    #[serde(alias = "conditionId", default)]
    pub market_id: String,
    #[serde(alias = "title", alias = "question", default)]
    pub label: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub size: Decimal,
    #[serde(alias = "avgPrice", default)]
    pub avg_price: Decimal,
    #[serde(alias = "curPrice", alias = "currentPrice", default)]
    pub current_price: Decimal,
}

/// Top-of-book quote for one instrument.
#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
}
