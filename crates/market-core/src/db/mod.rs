//! Database access layer (SQLite via sqlx).
//!
//! The store owns three concerns: trigger alerts, encrypted user
//! credentials, and the paper-trading account used in simulation mode.

pub mod alerts;
pub mod paper;
pub mod users;

use crate::config::DatabaseConfig;
use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Create a SQLite connection pool, creating the database file if needed.
pub async fn create_pool(config: &DatabaseConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
    // An in-memory database exists per connection; a wider pool would hand
    // out empty databases.
    let max_connections = if config.url.contains(":memory:") {
        1
    } else {
        config.max_connections
    };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Create all tables if they do not exist yet. Idempotent.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            token_id TEXT NOT NULL,
            label TEXT NOT NULL DEFAULT '',
            kind TEXT NOT NULL,
            trigger_price TEXT NOT NULL,
            side TEXT NOT NULL,
            auto_trade INTEGER NOT NULL DEFAULT 0,
            trade_amount TEXT,
            created_at TEXT NOT NULL,
            triggered INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            user_id INTEGER PRIMARY KEY,
            encrypted_key TEXT NOT NULL,
            funder_address TEXT NOT NULL DEFAULT '',
            signature_mode INTEGER NOT NULL DEFAULT 1,
            display_name TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            last_login TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS paper_account (
            user_id INTEGER PRIMARY KEY,
            balance TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS paper_positions (
            user_id INTEGER NOT NULL,
            token_id TEXT NOT NULL,
            market_id TEXT NOT NULL DEFAULT '',
            label TEXT NOT NULL DEFAULT '',
            outcome TEXT NOT NULL DEFAULT '',
            size TEXT NOT NULL,
            avg_price TEXT NOT NULL,
            PRIMARY KEY (user_id, token_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// In-memory pool for tests. A single connection keeps the shared schema
/// alive for the pool's lifetime.
pub async fn memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let pool = memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        init_schema(&pool).await.unwrap();
    }
}
