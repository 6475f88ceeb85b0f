//! Market Stream Client
//!
//! Maintains one reconnecting WebSocket connection to the exchange's
//! market-data channel, normalizes the protocol's message shapes into
//! [`PriceTick`]s, caches the latest quote per instrument, and dispatches
//! ticks to registered handlers.

pub mod client;
pub mod message;

pub use client::{MarketStreamClient, StreamStats, TickHandler};
pub use message::{PriceTick, RawTick};
