//! Read-only exchange API client.
//!
//! Quotes and order books come from the matching-engine REST API; positions
//! and balances come from the public data API keyed by funder address.

use crate::config::ExchangeConfig;
use crate::types::{ExchangePosition, Quote};
use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// One level of an order book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Top-of-book snapshot for one instrument.
#[derive(Debug, Clone)]
pub struct Book {
    pub token_id: String,
    /// Bids sorted best (highest) first.
    pub bids: Vec<PriceLevel>,
    /// Asks sorted best (lowest) first.
    pub asks: Vec<PriceLevel>,
}

impl Book {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    pub fn quote(&self) -> Quote {
        Quote {
            best_bid: self.best_bid(),
            best_ask: self.best_ask(),
        }
    }
}

/// Read-only exchange client.
pub struct ClobClient {
    clob_url: String,
    data_url: String,
    pub(crate) http: reqwest::Client,
}

impl ClobClient {
    /// Maximum retry attempts for transient API failures.
    const MAX_RETRIES: u32 = 3;

    pub fn new(config: &ExchangeConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            clob_url: config.clob_url.clone(),
            data_url: config.data_url.clone(),
            http,
        }
    }

    pub fn clob_url(&self) -> &str {
        &self.clob_url
    }

    /// Execute an HTTP GET with retry and exponential backoff.
    ///
    /// Retries 5xx and 429 responses (longer backoff for 429); other 4xx
    /// errors fail immediately.
    pub(crate) async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response> {
        let mut last_error = None;

        for attempt in 0..Self::MAX_RETRIES {
            match self.http.get(url).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response)
                    if response.status().as_u16() == 429 || response.status().is_server_error() =>
                {
                    let status = response.status();
                    let rate_limited = status.as_u16() == 429;
                    warn!(
                        attempt = attempt + 1,
                        status = %status,
                        url,
                        rate_limited,
                        "Retryable API error, backing off"
                    );
                    last_error = Some(if rate_limited {
                        Error::RateLimited {
                            message: format!("rate limited: {status}"),
                        }
                    } else {
                        Error::Api {
                            message: format!("server error: {status}"),
                            status: Some(status.as_u16()),
                        }
                    });

                    if attempt + 1 < Self::MAX_RETRIES {
                        let backoff = if rate_limited {
                            Duration::from_millis(2000 * 2u64.pow(attempt))
                        } else {
                            Duration::from_millis(500 * 2u64.pow(attempt))
                        };
                        tokio::time::sleep(backoff).await;
                    }
                    continue;
                }
                Ok(response) => {
                    return Err(Error::Api {
                        message: format!("API error: {}", response.status()),
                        status: Some(response.status().as_u16()),
                    });
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, url, "HTTP request failed, backing off");
                    last_error = Some(Error::Http(e));
                }
            }

            if attempt + 1 < Self::MAX_RETRIES {
                tokio::time::sleep(Duration::from_millis(500 * 2u64.pow(attempt))).await;
            }
        }

        Err(last_error.unwrap_or(Error::Api {
            message: "max retries exceeded".to_string(),
            status: None,
        }))
    }

    /// Current midpoint price for an instrument.
    pub async fn midpoint(&self, token_id: &str) -> Result<Decimal> {
        let url = format!("{}/midpoint?token_id={}", self.clob_url, token_id);
        let response = self.get_with_retry(&url).await?;

        #[derive(Deserialize)]
        struct Midpoint {
            mid: String,
        }
        let mid: Midpoint = response.json().await?;
        mid.mid.parse().map_err(|_| Error::Api {
            message: format!("unparseable midpoint: {}", mid.mid),
            status: None,
        })
    }

    /// Order book for an instrument, top levels per side.
    pub async fn book(&self, token_id: &str) -> Result<Book> {
        let url = format!("{}/book?token_id={}", self.clob_url, token_id);
        let response = self.get_with_retry(&url).await?;
        let raw: RawBook = response.json().await?;
        Ok(raw.normalize(token_id))
    }

    /// Open positions for a funder address from the data API.
    ///
    /// This is the query-based snapshot the Position Tracker loads from; it
    /// is not derived from the stream.
    pub async fn positions(&self, funder: &str) -> Result<Vec<ExchangePosition>> {
        let url = format!(
            "{}/positions?user={}&sizeThreshold=0.01",
            self.data_url, funder
        );
        let response = self.get_with_retry(&url).await?;
        let text = response.text().await?;

        match serde_json::from_str::<Vec<ExchangePosition>>(&text) {
            Ok(positions) => {
                debug!(funder, count = positions.len(), "Fetched open positions");
                Ok(positions)
            }
            Err(e) => {
                let preview = if text.len() > 500 { &text[..500] } else { &text };
                warn!(error = %e, response_preview = %preview, "Could not parse positions response");
                Err(Error::Api {
                    message: format!("positions parse error: {e}"),
                    status: None,
                })
            }
        }
    }

    /// Quote-currency balance for a funder address.
    pub async fn balance(&self, funder: &str) -> Result<Decimal> {
        let url = format!("{}/value?user={}", self.data_url, funder);
        let response = self.get_with_retry(&url).await?;

        #[derive(Deserialize)]
        struct ValueEntry {
            #[serde(default)]
            value: Decimal,
        }
        // The data API wraps the balance in a one-element array.
        let entries: Vec<ValueEntry> = response.json().await?;
        Ok(entries.first().map(|e| e.value).unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct RawBook {
    #[serde(default, alias = "buys")]
    bids: Vec<RawLevel>,
    #[serde(default, alias = "sells")]
    asks: Vec<RawLevel>,
}

#[derive(Debug, Deserialize)]
struct RawLevel {
    price: String,
    size: String,
}

impl RawBook {
    fn normalize(self, token_id: &str) -> Book {
        let parse = |levels: Vec<RawLevel>| -> Vec<PriceLevel> {
            levels
                .into_iter()
                .filter_map(|l| {
                    Some(PriceLevel {
                        price: l.price.parse().ok()?,
                        size: l.size.parse().ok()?,
                    })
                })
                .collect()
        };
        let mut bids = parse(self.bids);
        let mut asks = parse(self.asks);
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));
        Book {
            token_id: token_id.to_string(),
            bids,
            asks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn raw_book_sorts_sides() {
        let raw = RawBook {
            bids: vec![
                RawLevel {
                    price: "0.40".into(),
                    size: "10".into(),
                },
                RawLevel {
                    price: "0.45".into(),
                    size: "5".into(),
                },
            ],
            asks: vec![
                RawLevel {
                    price: "0.55".into(),
                    size: "8".into(),
                },
                RawLevel {
                    price: "0.50".into(),
                    size: "3".into(),
                },
            ],
        };
        let book = raw.normalize("tok");
        assert_eq!(book.best_bid(), Some(dec!(0.45)));
        assert_eq!(book.best_ask(), Some(dec!(0.50)));
        let quote = book.quote();
        assert!(quote.best_ask.unwrap() >= quote.best_bid.unwrap());
    }

    #[test]
    fn raw_book_drops_unparseable_levels() {
        let raw = RawBook {
            bids: vec![RawLevel {
                price: "not-a-price".into(),
                size: "10".into(),
            }],
            asks: vec![],
        };
        let book = raw.normalize("tok");
        assert!(book.bids.is_empty());
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn empty_book_has_no_quote() {
        let book = Book {
            token_id: "tok".into(),
            bids: vec![],
            asks: vec![],
        };
        let quote = book.quote();
        assert!(quote.best_bid.is_none());
        assert!(quote.best_ask.is_none());
    }
}
