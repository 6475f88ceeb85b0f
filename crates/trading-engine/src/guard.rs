//! Guarded invocation of the signed exchange client.
//!
//! Every trading call goes through [`CallGuard::call`], which judges each
//! invocation independently: success resets the consecutive-error counter,
//! an auth failure refreshes the session's derived credentials and retries
//! exactly once, and a geo-restriction surfaces unretried. The guard never
//! disables further calls, however many errors it has seen.

use auth::UserSession;
use futures_util::future::BoxFuture;
use market_core::api::SignedClient;
use market_core::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{info, warn};

#[derive(Default)]
pub struct CallGuard {
    consecutive_errors: AtomicU32,
}

impl CallGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors seen since the last successful call. Diagnostic only; it
    /// gates nothing.
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    /// Run `op` against the session's signed client.
    ///
    /// On an auth/session-expired signal the session's API credentials are
    /// re-derived and `op` retried once; the retry's own error classification
    /// stands (including re-classification as geo-block). Everything else
    /// propagates unchanged.
    pub async fn call<T, F>(&self, session: &UserSession, op: F) -> Result<T>
    where
        F: for<'c> Fn(&'c SignedClient) -> BoxFuture<'c, Result<T>>,
    {
        let first = {
            let client = session.client().read().await;
            op(&client).await
        };

        match first {
            Ok(value) => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                Ok(value)
            }
            Err(Error::Auth { message }) => {
                info!(
                    user_id = session.user_id,
                    reason = %message,
                    "Auth failure; refreshing derived credentials and retrying once"
                );
                {
                    let mut client = session.client().write().await;
                    client.derive_credentials().await.map_err(|e| {
                        self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
                        e
                    })?;
                }

                let retry = {
                    let client = session.client().read().await;
                    op(&client).await
                };
                match retry {
                    Ok(value) => {
                        self.consecutive_errors.store(0, Ordering::Relaxed);
                        Ok(value)
                    }
                    Err(e) => {
                        self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(user_id = session.user_id, error = %e, "Retry after credential refresh failed");
                        Err(match e {
                            Error::Auth { .. } => Error::Auth {
                                message: "session credentials rejected twice; try /unlock again"
                                    .to_string(),
                            },
                            other => other,
                        })
                    }
                }
            }
            Err(e) => {
                self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth::SessionManager;
    use market_core::config::AppConfig;
    use market_core::db::memory_pool;
    use market_core::db::users::UserRepository;
    use market_core::types::SignatureMode;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    async fn unlocked_session() -> Arc<UserSession> {
        let cfg = AppConfig::test_config();
        let pool = memory_pool().await.unwrap();
        let manager = SessionManager::new(
            cfg.session.clone(),
            cfg.exchange.clone(),
            Arc::new(market_core::api::ClobClient::new(&cfg.exchange)),
            UserRepository::new(pool),
        );
        manager
            .register(1, TEST_KEY, "correct-horse", "", SignatureMode::Eoa, "t")
            .await
            .unwrap();
        manager.unlock(1, "correct-horse").await.unwrap()
    }

    #[tokio::test]
    async fn success_resets_the_error_counter() {
        let session = unlocked_session().await;
        let guard = CallGuard::new();

        let failing = guard
            .call(&session, |_c| {
                Box::pin(async {
                    Err::<(), _>(Error::Order {
                        message: "rejected".into(),
                    })
                })
            })
            .await;
        assert!(failing.is_err());
        assert_eq!(guard.consecutive_errors(), 1);

        let ok = guard
            .call(&session, |_c| Box::pin(async { Ok(7u32) }))
            .await
            .unwrap();
        assert_eq!(ok, 7);
        assert_eq!(guard.consecutive_errors(), 0);

        // No sticky lockout: further calls still go through after errors.
        for _ in 0..5 {
            let _ = guard
                .call(&session, |_c| {
                    Box::pin(async {
                        Err::<(), _>(Error::Order {
                            message: "rejected".into(),
                        })
                    })
                })
                .await;
        }
        assert_eq!(guard.consecutive_errors(), 5);
        assert!(guard
            .call(&session, |_c| Box::pin(async { Ok(()) }))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn geo_block_is_not_retried() {
        let session = unlocked_session().await;
        let guard = CallGuard::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        let result: Result<()> = guard
            .call(&session, move |_c| {
                let counted = counted.clone();
                Box::pin(async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(Error::GeoBlocked {
                        guidance: "use an allowed region".into(),
                    })
                })
            })
            .await;

        assert!(matches!(result, Err(Error::GeoBlocked { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "geo-block must not retry");
    }

    #[tokio::test]
    async fn auth_error_triggers_credential_refresh() {
        let session = unlocked_session().await;
        let guard = CallGuard::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        let result: Result<()> = guard
            .call(&session, move |_c| {
                let counted = counted.clone();
                Box::pin(async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Auth {
                        message: "api key expired".into(),
                    })
                })
            })
            .await;

        // The refresh handshake has no reachable exchange in tests, so the
        // guard surfaces its failure; the op itself must not have been
        // retried before a successful refresh.
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(guard.consecutive_errors(), 1);
    }

    #[tokio::test]
    async fn transient_errors_propagate_unchanged() {
        let session = unlocked_session().await;
        let guard = CallGuard::new();

        let result: Result<()> = guard
            .call(&session, |_c| {
                Box::pin(async {
                    Err(Error::RateLimited {
                        message: "slow down".into(),
                    })
                })
            })
            .await;
        assert!(matches!(result, Err(Error::RateLimited { .. })));
    }
}
