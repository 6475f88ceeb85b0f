//! Database operations for the paper-trading account.
//!
//! Simulation mode keeps its balance and positions here so they survive
//! restarts; nothing in this table is custodied by the exchange.

use crate::Result;
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};

/// A simulated position held by the paper account.
#[derive(Debug, Clone)]
pub struct PaperPosition {
    pub user_id: i64,
    pub token_id: String,
    pub market_id: String,
    pub label: String,
    pub outcome: String,
    pub size: Decimal,
    pub avg_price: Decimal,
}

/// Repository for paper balances and positions.
#[derive(Clone)]
pub struct PaperRepository {
    pool: SqlitePool,
}

impl PaperRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Current paper balance, seeding `starting_balance` on first touch.
    pub async fn balance(&self, user_id: i64, starting_balance: Decimal) -> Result<Decimal> {
        let row = sqlx::query("SELECT balance FROM paper_account WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(r
                .get::<String, _>("balance")
                .parse()
                .unwrap_or(starting_balance)),
            None => {
                self.set_balance(user_id, starting_balance).await?;
                Ok(starting_balance)
            }
        }
    }

    pub async fn set_balance(&self, user_id: i64, balance: Decimal) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO paper_account (user_id, balance) VALUES (?1, ?2)")
            .bind(user_id)
            .bind(balance.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn position(&self, user_id: i64, token_id: &str) -> Result<Option<PaperPosition>> {
        let row = sqlx::query(
            "SELECT user_id, token_id, market_id, label, outcome, size, avg_price \
             FROM paper_positions WHERE user_id = ?1 AND token_id = ?2",
        )
        .bind(user_id)
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().and_then(row_to_position))
    }

    pub async fn positions(&self, user_id: i64) -> Result<Vec<PaperPosition>> {
        let rows = sqlx::query(
            "SELECT user_id, token_id, market_id, label, outcome, size, avg_price \
             FROM paper_positions WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(row_to_position).collect())
    }

    pub async fn upsert_position(&self, position: &PaperPosition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO paper_positions
                (user_id, token_id, market_id, label, outcome, size, avg_price)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(position.user_id)
        .bind(&position.token_id)
        .bind(&position.market_id)
        .bind(&position.label)
        .bind(&position.outcome)
        .bind(position.size.to_string())
        .bind(position.avg_price.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_position(&self, user_id: i64, token_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM paper_positions WHERE user_id = ?1 AND token_id = ?2")
            .bind(user_id)
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_position(r: &sqlx::sqlite::SqliteRow) -> Option<PaperPosition> {
    Some(PaperPosition {
        user_id: r.get("user_id"),
        token_id: r.get("token_id"),
        market_id: r.get("market_id"),
        label: r.get("label"),
        outcome: r.get("outcome"),
        size: r.get::<String, _>("size").parse().ok()?,
        avg_price: r.get::<String, _>("avg_price").parse().ok()?,
    })
}
