//! Trading Engine
//!
//! Buy/sell execution with multi-tier order-type fallback, a guarded call
//! path around the signed exchange client, a paper-trading engine for
//! simulation mode, and fee-aware live position tracking.

pub mod executor;
pub mod guard;
pub mod paper;
pub mod position_tracker;

pub use executor::{MarketRef, SellAmount, TradeExecutor};
pub use guard::CallGuard;
pub use paper::PaperEngine;
pub use position_tracker::{PositionTracker, TrackedPosition};
