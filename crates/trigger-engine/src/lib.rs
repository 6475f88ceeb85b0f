//! Trigger Engine
//!
//! Evaluates stored price alerts against every stream tick and, for
//! stop-loss/take-profit triggers, hands auto-liquidation off to the order
//! execution engine without ever stalling the read loop.

pub mod engine;

pub use engine::{TriggerEngine, TriggerEvent, TriggerOutcome};
