//! Trading-session lifecycle.
//!
//! A session is born when a user unlocks their credentials, carries the
//! exclusive signing handle for that user, and dies on explicit lock, lazy
//! expiry at access time, or the periodic sweep. The plaintext secret lives
//! only long enough to construct the signing handle.

use crate::vault::{decrypt_secret, encrypt_secret};
use chrono::Utc;
use market_core::api::{ClobClient, SignedClient};
use market_core::config::{ExchangeConfig, SessionConfig};
use market_core::db::users::UserRepository;
use market_core::signing::OrderSigner;
use market_core::types::{CredentialRecord, SignatureMode};
use market_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// An unlocked user session holding the exclusive signing handle.
pub struct UserSession {
    pub user_id: i64,
    pub funder_address: String,
    pub display_name: String,
    pub signature_mode: SignatureMode,
    pub session_start: Instant,
    client: RwLock<SignedClient>,
    last_activity: StdMutex<Instant>,
}

impl UserSession {
    /// The session's authenticated exchange client. Exclusive to this user;
    /// never reused after lock or expiry.
    pub fn client(&self) -> &RwLock<SignedClient> {
        &self.client
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.lock().unwrap().elapsed() > timeout
    }

    /// Refresh the inactivity clock.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    #[cfg(test)]
    fn backdate(&self, by: Duration) {
        *self.last_activity.lock().unwrap() = Instant::now() - by;
    }
}

impl std::fmt::Debug for UserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The signing client is intentionally omitted from debug output.
        f.debug_struct("UserSession")
            .field("user_id", &self.user_id)
            .field("funder_address", &self.funder_address)
            .field("display_name", &self.display_name)
            .field("signature_mode", &self.signature_mode)
            .finish_non_exhaustive()
    }
}

/// Manages encrypted credential registration and unlocked sessions.
pub struct SessionManager {
    config: SessionConfig,
    exchange: ExchangeConfig,
    clob: Arc<ClobClient>,
    users: UserRepository,
    sessions: RwLock<HashMap<i64, Arc<UserSession>>>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        exchange: ExchangeConfig,
        clob: Arc<ClobClient>,
        users: UserRepository,
    ) -> Self {
        Self {
            config,
            exchange,
            clob,
            users,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    /// Register (or replace) a user's trading credentials.
    ///
    /// The secret is validated, encrypted under the password, and the blob
    /// is verified by an immediate round-trip decryption before anything is
    /// stored. The password itself is never persisted or logged.
    pub async fn register(
        &self,
        user_id: i64,
        secret_key: &str,
        password: &str,
        funder_address: &str,
        signature_mode: SignatureMode,
        display_name: &str,
    ) -> Result<()> {
        let key_clean = secret_key.trim().trim_start_matches("0x");
        if key_clean.len() != 64 || hex::decode(key_clean).is_err() {
            return Err(Error::Validation(
                "secret key must be 64 hex characters (0x prefix optional)".to_string(),
            ));
        }
        if password.len() < self.config.min_password_len {
            return Err(Error::Validation(format!(
                "password too short; use at least {} characters",
                self.config.min_password_len
            )));
        }

        let encrypted = encrypt_secret(secret_key.trim(), password)?;

        // Self-verify before storing: a blob we cannot decrypt back to the
        // original secret must never reach the database.
        let verified = decrypt_secret(&encrypted, password)?;
        if verified.as_str() != secret_key.trim() {
            return Err(Error::Validation(
                "encryption verification failed; please try again".to_string(),
            ));
        }

        // A replaced key invalidates any session built from the old one.
        self.lock(user_id).await;

        self.users
            .upsert(&CredentialRecord {
                user_id,
                encrypted_key: encrypted,
                funder_address: funder_address.to_string(),
                signature_mode,
                display_name: display_name.to_string(),
                created_at: Utc::now(),
                last_login: None,
            })
            .await?;

        info!(user_id, "Credentials registered");
        Ok(())
    }

    /// Unlock a session by decrypting the stored secret and building the
    /// signing handle. Returns the live session if one already exists.
    pub async fn unlock(&self, user_id: i64, password: &str) -> Result<Arc<UserSession>> {
        if let Some(session) = self.session(user_id).await {
            return Ok(session);
        }

        let record = self.users.get(user_id).await?.ok_or_else(|| {
            Error::Validation("no credentials registered for this user".to_string())
        })?;

        let secret = decrypt_secret(&record.encrypted_key, password)?;

        let signer = OrderSigner::from_private_key(
            secret.as_str(),
            Some(record.funder_address.as_str()).filter(|f| !f.is_empty()),
            record.signature_mode,
            self.exchange.chain_id,
        )?;
        // `secret` (Zeroizing) drops here; only the signing handle survives.
        drop(secret);

        let mut client = SignedClient::new(self.clob.clone(), signer);
        let funder_address = client.funder();

        // Best effort at unlock time: a failed handshake is retried by the
        // guarded call path on first use.
        if let Err(e) = client.derive_credentials().await {
            warn!(user_id, error = %e, "Credential handshake failed at unlock");
        }

        let session = Arc::new(UserSession {
            user_id,
            funder_address,
            display_name: record.display_name,
            signature_mode: record.signature_mode,
            session_start: Instant::now(),
            client: RwLock::new(client),
            last_activity: StdMutex::new(Instant::now()),
        });

        self.sessions.write().await.insert(user_id, session.clone());
        self.users.touch_login(user_id).await.ok();

        info!(user_id, funder = %session.funder_address, "Session unlocked");
        Ok(session)
    }

    /// Active session for a user, or `None` when locked or expired.
    /// Expired sessions are torn down as a side effect of the check.
    pub async fn session(&self, user_id: i64) -> Option<Arc<UserSession>> {
        let session = self.sessions.read().await.get(&user_id).cloned()?;
        if session.is_expired(self.timeout()) {
            self.lock(user_id).await;
            return None;
        }
        session.touch();
        Some(session)
    }

    /// Destroy a user's session immediately. Returns whether one existed.
    pub async fn lock(&self, user_id: i64) -> bool {
        let removed = self.sessions.write().await.remove(&user_id).is_some();
        if removed {
            info!(user_id, "Session locked");
        }
        removed
    }

    /// Whether the user has registered credentials (locked or not).
    pub async fn is_registered(&self, user_id: i64) -> Result<bool> {
        self.users.exists(user_id).await
    }

    /// Whether the user currently holds a live session.
    pub async fn is_unlocked(&self, user_id: i64) -> bool {
        self.session(user_id).await.is_some()
    }

    /// Delete a user's credentials and any live session.
    pub async fn delete_credentials(&self, user_id: i64) -> Result<bool> {
        self.lock(user_id).await;
        self.users.delete(user_id).await
    }

    /// Tear down sessions nobody has touched past the timeout. Called on a
    /// fixed interval by the composition root.
    pub async fn cleanup_expired(&self) -> usize {
        let timeout = self.timeout();
        let expired: Vec<i64> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, s)| s.is_expired(timeout))
                .map(|(id, _)| *id)
                .collect()
        };
        for user_id in &expired {
            self.lock(*user_id).await;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Auto-locked expired sessions");
        }
        expired.len()
    }

    /// Count of live sessions, after sweeping expired ones.
    pub async fn active_session_count(&self) -> usize {
        self.cleanup_expired().await;
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_core::config::AppConfig;
    use market_core::db::memory_pool;

    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    async fn manager_with_timeout(timeout_secs: u64) -> SessionManager {
        let cfg = AppConfig::test_config();
        let pool = memory_pool().await.unwrap();
        SessionManager::new(
            SessionConfig {
                timeout_secs,
                ..cfg.session
            },
            cfg.exchange.clone(),
            Arc::new(ClobClient::new(&cfg.exchange)),
            UserRepository::new(pool),
        )
    }

    #[tokio::test]
    async fn short_password_rejected_before_encryption() {
        let manager = manager_with_timeout(1800).await;
        let err = manager
            .register(1, TEST_KEY, "short", "", SignatureMode::Eoa, "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(!manager.is_registered(1).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_secret_key_rejected() {
        let manager = manager_with_timeout(1800).await;
        let err = manager
            .register(1, "0xdeadbeef", "longenough", "", SignatureMode::Eoa, "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn unlock_with_wrong_password_is_generic_failure() {
        let manager = manager_with_timeout(1800).await;
        manager
            .register(1, TEST_KEY, "correct-horse", "", SignatureMode::Eoa, "t")
            .await
            .unwrap();

        let err = manager.unlock(1, "battery-staple").await.unwrap_err();
        assert!(matches!(err, Error::Decrypt));
        assert!(!manager.is_unlocked(1).await);
    }

    #[tokio::test]
    async fn unlock_lock_round_trip() {
        let manager = manager_with_timeout(1800).await;
        manager
            .register(1, TEST_KEY, "correct-horse", "", SignatureMode::Eoa, "t")
            .await
            .unwrap();

        let session = manager.unlock(1, "correct-horse").await.unwrap();
        assert_eq!(session.user_id, 1);
        assert!(session.funder_address.starts_with("0x"));
        assert!(manager.is_unlocked(1).await);

        // A second unlock returns the existing live session.
        let again = manager.unlock(1, "correct-horse").await.unwrap();
        assert!(Arc::ptr_eq(&session, &again));

        assert!(manager.lock(1).await);
        assert!(!manager.is_unlocked(1).await);
        assert!(!manager.lock(1).await);
    }

    #[tokio::test]
    async fn expired_session_is_reported_absent() {
        let manager = manager_with_timeout(1800).await;
        manager
            .register(1, TEST_KEY, "correct-horse", "", SignatureMode::Eoa, "t")
            .await
            .unwrap();
        let session = manager.unlock(1, "correct-horse").await.unwrap();

        session.backdate(Duration::from_secs(3600));
        assert!(manager.session(1).await.is_none());
        // The lazy check tore the session down; a fresh unlock restores it.
        assert_eq!(manager.sessions.read().await.len(), 0);
        assert!(manager.unlock(1, "correct-horse").await.is_ok());
    }

    #[tokio::test]
    async fn sweep_removes_untouched_sessions() {
        let manager = manager_with_timeout(1800).await;
        manager
            .register(1, TEST_KEY, "correct-horse", "", SignatureMode::Eoa, "t")
            .await
            .unwrap();
        let session = manager.unlock(1, "correct-horse").await.unwrap();
        session.backdate(Duration::from_secs(3600));

        assert_eq!(manager.cleanup_expired().await, 1);
        assert_eq!(manager.active_session_count().await, 0);
    }

    #[tokio::test]
    async fn delete_credentials_destroys_session_and_record() {
        let manager = manager_with_timeout(1800).await;
        manager
            .register(1, TEST_KEY, "correct-horse", "", SignatureMode::Eoa, "t")
            .await
            .unwrap();
        manager.unlock(1, "correct-horse").await.unwrap();

        assert!(manager.delete_credentials(1).await.unwrap());
        assert!(!manager.is_unlocked(1).await);
        assert!(!manager.is_registered(1).await.unwrap());
    }
}
