//! Database operations for encrypted user credentials.

use crate::types::{CredentialRecord, SignatureMode};
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

/// Repository for credential records.
///
/// Only the encrypted blob ever touches the store; passwords and plaintext
/// keys never do.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a user's credential record. Re-registration
    /// replaces the previous blob.
    pub async fn upsert(&self, record: &CredentialRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO users
                (user_id, encrypted_key, funder_address, signature_mode, display_name, created_at, last_login)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(record.user_id)
        .bind(&record.encrypted_key)
        .bind(&record.funder_address)
        .bind(record.signature_mode.as_u8() as i64)
        .bind(&record.display_name)
        .bind(record.created_at.to_rfc3339())
        .bind(record.last_login.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch a user's credential record.
    pub async fn get(&self, user_id: i64) -> Result<Option<CredentialRecord>> {
        let row = sqlx::query(
            "SELECT user_id, encrypted_key, funder_address, signature_mode, display_name, created_at, last_login \
             FROM users WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let parse_ts = |s: String| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now())
            };
            CredentialRecord {
                user_id: r.get("user_id"),
                encrypted_key: r.get("encrypted_key"),
                funder_address: r.get("funder_address"),
                signature_mode: SignatureMode::from_u8(r.get::<i64, _>("signature_mode") as u8),
                display_name: r.get("display_name"),
                created_at: parse_ts(r.get("created_at")),
                last_login: r.get::<Option<String>, _>("last_login").map(parse_ts),
            }
        }))
    }

    /// Whether the user has registered credentials.
    pub async fn exists(&self, user_id: i64) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM users WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Record a successful unlock.
    pub async fn touch_login(&self, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET last_login = ?1 WHERE user_id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a user's credentials. Returns whether a row was removed.
    pub async fn delete(&self, user_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Total registered users.
    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    fn record(user_id: i64, blob: &str) -> CredentialRecord {
        CredentialRecord {
            user_id,
            encrypted_key: blob.into(),
            funder_address: "0xfunder".into(),
            signature_mode: SignatureMode::Email,
            display_name: "tester".into(),
            created_at: Utc::now(),
            last_login: None,
        }
    }

    #[tokio::test]
    async fn upsert_get_round_trip() {
        let repo = UserRepository::new(memory_pool().await.unwrap());
        repo.upsert(&record(42, "blob-a")).await.unwrap();

        let got = repo.get(42).await.unwrap().unwrap();
        assert_eq!(got.encrypted_key, "blob-a");
        assert_eq!(got.signature_mode, SignatureMode::Email);
        assert!(got.last_login.is_none());
        assert!(repo.exists(42).await.unwrap());
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reregistration_replaces_blob() {
        let repo = UserRepository::new(memory_pool().await.unwrap());
        repo.upsert(&record(42, "blob-a")).await.unwrap();
        repo.upsert(&record(42, "blob-b")).await.unwrap();

        let got = repo.get(42).await.unwrap().unwrap();
        assert_eq!(got.encrypted_key, "blob-b");
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let repo = UserRepository::new(memory_pool().await.unwrap());
        repo.upsert(&record(42, "blob")).await.unwrap();

        assert!(repo.delete(42).await.unwrap());
        assert!(!repo.delete(42).await.unwrap());
        assert!(repo.get(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn touch_login_sets_timestamp() {
        let repo = UserRepository::new(memory_pool().await.unwrap());
        repo.upsert(&record(42, "blob")).await.unwrap();
        repo.touch_login(42).await.unwrap();

        let got = repo.get(42).await.unwrap().unwrap();
        assert!(got.last_login.is_some());
    }
}
