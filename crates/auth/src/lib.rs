//! Credential Vault and Session Manager
//!
//! Per-user trading secrets encrypted at rest with a password-derived key,
//! and the lifecycle of unlocked trading sessions built from them.

pub mod session;
pub mod vault;

pub use session::{SessionManager, UserSession};
pub use vault::{decrypt_secret, encrypt_secret};
