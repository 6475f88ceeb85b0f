//! Database operations for trigger alerts.

use crate::types::{Alert, AlertKind, AlertSide};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};

/// A new alert to be persisted.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub user_id: i64,
    pub token_id: String,
    pub label: String,
    pub kind: AlertKind,
    pub trigger_price: Decimal,
    pub side: AlertSide,
    pub auto_trade: bool,
    pub trade_amount: Option<Decimal>,
}

/// Repository for alert data.
#[derive(Clone)]
pub struct AlertRepository {
    pool: SqlitePool,
}

impl AlertRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new alert, returning its id.
    ///
    /// Trigger prices outside [0.01, 0.99] are rejected before touching the
    /// store.
    pub async fn insert(&self, alert: NewAlert) -> Result<i64> {
        let min = crate::types::min_price();
        let max = crate::types::max_price();
        if alert.trigger_price < min || alert.trigger_price > max {
            return Err(Error::Validation(format!(
                "trigger price must be between {min} and {max}, got {}",
                alert.trigger_price
            )));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO alerts
                (user_id, token_id, label, kind, trigger_price, side, auto_trade, trade_amount, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(alert.user_id)
        .bind(&alert.token_id)
        .bind(&alert.label)
        .bind(alert.kind.as_str())
        .bind(alert.trigger_price.to_string())
        .bind(alert.side.as_str())
        .bind(alert.auto_trade as i64)
        .bind(alert.trade_amount.map(|a| a.to_string()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// All active (not yet triggered) alerts across users.
    pub async fn active(&self) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT id, user_id, token_id, label, kind, trigger_price, side, auto_trade, trade_amount, created_at, triggered \
             FROM alerts WHERE triggered = 0",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().filter_map(row_to_alert).collect())
    }

    /// Alerts for one user, optionally including already-triggered history.
    pub async fn for_user(&self, user_id: i64, active_only: bool) -> Result<Vec<Alert>> {
        let query = if active_only {
            "SELECT id, user_id, token_id, label, kind, trigger_price, side, auto_trade, trade_amount, created_at, triggered \
             FROM alerts WHERE user_id = ?1 AND triggered = 0"
        } else {
            "SELECT id, user_id, token_id, label, kind, trigger_price, side, auto_trade, trade_amount, created_at, triggered \
             FROM alerts WHERE user_id = ?1"
        };
        let rows = sqlx::query(query).bind(user_id).fetch_all(&self.pool).await?;
        Ok(rows.iter().filter_map(row_to_alert).collect())
    }

    /// Delete an alert owned by `user_id`. Returns whether a row was removed.
    pub async fn remove(&self, alert_id: i64, user_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM alerts WHERE id = ?1 AND user_id = ?2")
            .bind(alert_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark an alert triggered. The flag only ever moves false -> true.
    pub async fn mark_triggered(&self, alert_id: i64) -> Result<()> {
        sqlx::query("UPDATE alerts SET triggered = 1 WHERE id = ?1")
            .bind(alert_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_alert(r: &sqlx::sqlite::SqliteRow) -> Option<Alert> {
    let kind = AlertKind::parse(&r.get::<String, _>("kind"))?;
    let side = AlertSide::parse(&r.get::<String, _>("side"))?;
    let trigger_price: Decimal = r.get::<String, _>("trigger_price").parse().ok()?;
    let trade_amount = r
        .get::<Option<String>, _>("trade_amount")
        .and_then(|s| s.parse().ok());
    let created_at = DateTime::parse_from_rfc3339(&r.get::<String, _>("created_at"))
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Some(Alert {
        id: r.get("id"),
        user_id: r.get("user_id"),
        token_id: r.get("token_id"),
        label: r.get("label"),
        kind,
        trigger_price,
        side,
        auto_trade: r.get::<i64, _>("auto_trade") != 0,
        trade_amount,
        created_at,
        triggered: r.get::<i64, _>("triggered") != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use rust_decimal_macros::dec;

    fn take_profit(user_id: i64, token: &str, price: Decimal) -> NewAlert {
        NewAlert {
            user_id,
            token_id: token.into(),
            label: "Will it happen?".into(),
            kind: AlertKind::TakeProfit,
            trigger_price: price,
            side: AlertSide::Above,
            auto_trade: true,
            trade_amount: None,
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_round_trip() {
        let repo = AlertRepository::new(memory_pool().await.unwrap());
        let id = repo.insert(take_profit(7, "tok-1", dec!(0.65))).await.unwrap();
        assert!(id > 0);

        let alerts = repo.active().await.unwrap();
        assert_eq!(alerts.len(), 1);
        let a = &alerts[0];
        assert_eq!(a.id, id);
        assert_eq!(a.user_id, 7);
        assert_eq!(a.trigger_price, dec!(0.65));
        assert_eq!(a.kind, AlertKind::TakeProfit);
        assert!(a.auto_trade);
        assert!(!a.triggered);
    }

    #[tokio::test]
    async fn trigger_price_bounds_enforced() {
        let repo = AlertRepository::new(memory_pool().await.unwrap());
        let err = repo
            .insert(take_profit(1, "tok", dec!(0.995)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = repo
            .insert(take_profit(1, "tok", dec!(0.005)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn triggered_alerts_leave_active_set() {
        let repo = AlertRepository::new(memory_pool().await.unwrap());
        let id = repo.insert(take_profit(7, "tok-1", dec!(0.65))).await.unwrap();

        repo.mark_triggered(id).await.unwrap();
        // Idempotent: marking twice stays triggered.
        repo.mark_triggered(id).await.unwrap();

        assert!(repo.active().await.unwrap().is_empty());
        let history = repo.for_user(7, false).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].triggered);
    }

    #[tokio::test]
    async fn remove_respects_ownership() {
        let repo = AlertRepository::new(memory_pool().await.unwrap());
        let id = repo.insert(take_profit(7, "tok-1", dec!(0.65))).await.unwrap();

        assert!(!repo.remove(id, 999).await.unwrap());
        assert!(repo.remove(id, 7).await.unwrap());
        assert!(repo.active().await.unwrap().is_empty());
    }
}
