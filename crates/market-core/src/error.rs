//! Error types for the Augury trading core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("API error: {message}")]
    Api { message: String, status: Option<u16> },

    #[error("Rate limited by exchange: {message}")]
    RateLimited { message: String },

    #[error("Authentication error: {message}")]
    Auth { message: String },

    #[error("Trading is not available from your region: {guidance}")]
    GeoBlocked { guidance: String },

    #[error("Could not unlock credentials: wrong password or corrupted data")]
    Decrypt,

    #[error("No active session for user {0}; unlock required")]
    SessionRequired(i64),

    #[error("No open position for instrument {0}")]
    PositionNotFound(String),

    #[error("Order {0} not found")]
    OrderNotFound(String),

    #[error("Signing error: {message}")]
    Signing { message: String },

    #[error("Order error: {message}")]
    Order { message: String },
}

impl Error {
    /// Transient errors may succeed on a plain retry; everything else needs
    /// caller action first.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) | Error::WebSocket(_) | Error::RateLimited { .. } => true,
            Error::Api { status, .. } => matches!(status, Some(s) if *s >= 500),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let e = Error::Api {
            message: "boom".into(),
            status: Some(503),
        };
        assert!(e.is_transient());
    }

    #[test]
    fn client_errors_are_not_transient() {
        let e = Error::Api {
            message: "bad order".into(),
            status: Some(400),
        };
        assert!(!e.is_transient());
        assert!(!Error::Decrypt.is_transient());
        assert!(!Error::GeoBlocked {
            guidance: "g".into()
        }
        .is_transient());
    }
}
