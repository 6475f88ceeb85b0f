//! Exchange API clients.
//!
//! [`clob::ClobClient`] is the unauthenticated read side (prices, books,
//! positions, balances); [`signed::SignedClient`] submits signed orders and
//! performs the derived-credentials handshake.

pub mod clob;
pub mod signed;

pub use clob::{Book, ClobClient, PriceLevel};
pub use signed::{ApiCredentials, OrderResponse, SignedClient};
