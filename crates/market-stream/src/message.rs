//! Inbound message normalization.
//!
//! The market-data channel sends four shapes: an initial snapshot (an array
//! of per-instrument book entries), a batched price-change event, a single
//! book/trade update, and a legacy single-field price update. All of them
//! are normalized here into one tagged union and reduced to [`RawTick`]s;
//! downstream code only ever sees [`PriceTick`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Instant;
use tracing::debug;

/// Point-in-time price data for one instrument.
#[derive(Debug, Clone)]
pub struct PriceTick {
    pub token_id: String,
    pub price: Decimal,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub spread: Decimal,
    /// Wall-clock time the tick was accepted.
    pub timestamp: DateTime<Utc>,
    /// Monotonic clock for staleness checks.
    pub received: Instant,
}

impl PriceTick {
    /// Midpoint when both sides are present, last price otherwise.
    pub fn mid_price(&self) -> Decimal {
        if self.best_bid > Decimal::ZERO && self.best_ask > Decimal::ZERO {
            (self.best_bid + self.best_ask) / Decimal::TWO
        } else {
            self.price
        }
    }

    /// Spread as a percentage of the ask.
    pub fn spread_pct(&self) -> Decimal {
        if self.best_ask > Decimal::ZERO {
            self.spread / self.best_ask * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        }
    }
}

/// A normalized price observation before sanity checks and side synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTick {
    pub token_id: String,
    pub price: Decimal,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
}

/// The four inbound shapes, as one tagged union.
#[derive(Debug)]
pub enum StreamMessage {
    /// Initial snapshot: one book entry per subscribed instrument.
    Snapshot(Vec<BookEntry>),
    /// Batched price-change event.
    PriceChangeBatch(Vec<PriceChange>),
    /// Single per-instrument book or trade update.
    BookUpdate(BookUpdate),
    /// Legacy single-field price update.
    LegacyPrice(LegacyPrice),
}

#[derive(Debug, Deserialize)]
pub struct BookEntry {
    #[serde(default)]
    pub asset_id: String,
    #[serde(default, alias = "buys")]
    pub bids: Vec<Level>,
    #[serde(default, alias = "sells")]
    pub asks: Vec<Level>,
}

#[derive(Debug, Deserialize)]
pub struct Level {
    #[serde(alias = "p")]
    pub price: String,
    #[serde(default, alias = "s")]
    pub size: String,
}

#[derive(Debug, Deserialize)]
pub struct PriceChange {
    #[serde(default)]
    pub asset_id: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub best_bid: String,
    #[serde(default)]
    pub best_ask: String,
}

#[derive(Debug, Deserialize)]
pub struct BookUpdate {
    // Book frames carry both keys; asset_id wins when present.
    #[serde(default)]
    pub asset_id: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub last_trade_price: String,
    #[serde(default)]
    pub best_bid: String,
    #[serde(default)]
    pub best_ask: String,
}

#[derive(Debug, Deserialize)]
pub struct LegacyPrice {
    #[serde(default, alias = "token_id")]
    pub asset_id: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub mid: String,
}

impl StreamMessage {
    /// Classify one inbound frame. Returns `None` for keepalives and
    /// payloads that match none of the four shapes.
    pub fn parse(raw: &str) -> Option<StreamMessage> {
        let trimmed = raw.trim();
        if trimmed.is_empty()
            || trimmed.eq_ignore_ascii_case("ping")
            || trimmed.eq_ignore_ascii_case("pong")
        {
            return None;
        }

        let value: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "Dropping unparseable stream frame");
                return None;
            }
        };

        match value {
            serde_json::Value::Array(items) => {
                let entries: Vec<BookEntry> = items
                    .into_iter()
                    .filter_map(|v| serde_json::from_value(v).ok())
                    .collect();
                if entries.is_empty() {
                    None
                } else {
                    Some(StreamMessage::Snapshot(entries))
                }
            }
            serde_json::Value::Object(ref obj) => {
                let event_type = obj
                    .get("event_type")
                    .or_else(|| obj.get("type"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");

                if event_type == "price_change" && obj.contains_key("price_changes") {
                    let changes = obj
                        .get("price_changes")
                        .cloned()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default();
                    return Some(StreamMessage::PriceChangeBatch(changes));
                }

                if matches!(
                    event_type,
                    "book" | "price_change" | "last_trade_price" | "tick_size_change"
                ) {
                    return serde_json::from_value(value.clone())
                        .ok()
                        .map(StreamMessage::BookUpdate);
                }

                if event_type == "price_update"
                    || (obj.contains_key("price") && obj.contains_key("asset_id"))
                {
                    return serde_json::from_value(value.clone())
                        .ok()
                        .map(StreamMessage::LegacyPrice);
                }

                None
            }
            _ => None,
        }
    }

    /// Reduce the message to per-instrument price observations. Entries
    /// without a usable instrument id or price are dropped.
    pub fn ticks(self) -> Vec<RawTick> {
        match self {
            StreamMessage::Snapshot(entries) => {
                entries.into_iter().filter_map(snapshot_tick).collect()
            }
            StreamMessage::PriceChangeBatch(changes) => changes
                .into_iter()
                .filter_map(|ch| {
                    if ch.asset_id.is_empty() {
                        return None;
                    }
                    let best_bid = parse_price(&ch.best_bid);
                    let best_ask = parse_price(&ch.best_ask);
                    let price = pick_price(parse_price(&ch.price), best_bid, best_ask)?;
                    Some(RawTick {
                        token_id: ch.asset_id,
                        price,
                        best_bid,
                        best_ask,
                    })
                })
                .collect(),
            StreamMessage::BookUpdate(update) => {
                let token_id = if !update.asset_id.is_empty() {
                    update.asset_id
                } else {
                    update.market
                };
                if token_id.is_empty() {
                    return Vec::new();
                }
                let best_bid = parse_price(&update.best_bid);
                let best_ask = parse_price(&update.best_ask);
                let stated = match parse_price(&update.price) {
                    p if p > Decimal::ZERO => p,
                    _ => parse_price(&update.last_trade_price),
                };
                match pick_price(stated, best_bid, best_ask) {
                    Some(price) => vec![RawTick {
                        token_id,
                        price,
                        best_bid,
                        best_ask,
                    }],
                    None => Vec::new(),
                }
            }
            StreamMessage::LegacyPrice(legacy) => {
                if legacy.asset_id.is_empty() {
                    return Vec::new();
                }
                let price = match parse_price(&legacy.price) {
                    p if p > Decimal::ZERO => p,
                    _ => parse_price(&legacy.mid),
                };
                if price > Decimal::ZERO {
                    vec![RawTick {
                        token_id: legacy.asset_id,
                        price,
                        best_bid: Decimal::ZERO,
                        best_ask: Decimal::ZERO,
                    }]
                } else {
                    Vec::new()
                }
            }
        }
    }
}

/// Best bid is the highest sane bid, best ask the lowest sane ask; the
/// price is the mid when both sides exist.
fn snapshot_tick(entry: BookEntry) -> Option<RawTick> {
    if entry.asset_id.is_empty() {
        return None;
    }
    let sane = |p: Decimal| p > Decimal::ZERO && p <= Decimal::ONE;
    let best_bid = entry
        .bids
        .iter()
        .map(|l| parse_price(&l.price))
        .filter(|p| sane(*p))
        .max()
        .unwrap_or_default();
    let best_ask = entry
        .asks
        .iter()
        .map(|l| parse_price(&l.price))
        .filter(|p| sane(*p))
        .min()
        .unwrap_or_default();

    let price = pick_price(Decimal::ZERO, best_bid, best_ask)?;
    Some(RawTick {
        token_id: entry.asset_id,
        price,
        best_bid,
        best_ask,
    })
}

/// Prefer a stated price; fall back to the mid, then to whichever side is
/// present.
fn pick_price(stated: Decimal, best_bid: Decimal, best_ask: Decimal) -> Option<Decimal> {
    if stated > Decimal::ZERO {
        return Some(stated);
    }
    if best_bid > Decimal::ZERO && best_ask > Decimal::ZERO {
        return Some((best_bid + best_ask) / Decimal::TWO);
    }
    if best_ask > Decimal::ZERO {
        return Some(best_ask);
    }
    if best_bid > Decimal::ZERO {
        return Some(best_bid);
    }
    None
}

fn parse_price(s: &str) -> Decimal {
    s.parse().unwrap_or_default()
}
