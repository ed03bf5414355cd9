//! PostgreSQL-backed notification store.
//!
//! Headers are stored as JSONB; rows are read back ordered by `received_at`
//! with id as a tiebreaker so a push batch preserves arrival order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseConfig;

use super::{NewNotification, Notification, NotificationStore, StoreError};

pub struct PostgresStore {
    pool: PgPool,
}

type NotificationRow = (
    i64,
    String,
    String,
    Option<String>,
    String,
    serde_json::Value,
    DateTime<Utc>,
);

impl PostgresStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the notifications table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id BIGSERIAL PRIMARY KEY,
                handler TEXT NOT NULL,
                path TEXT NOT NULL,
                content_type TEXT,
                payload TEXT NOT NULL,
                headers JSONB NOT NULL DEFAULT '{}'::jsonb,
                received_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_notifications_received_at \
             ON notifications (received_at, id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn from_row(row: NotificationRow) -> Result<Notification, StoreError> {
        let (id, handler, path, content_type, payload, headers, received_at) = row;
        Ok(Notification {
            id,
            handler,
            path,
            content_type,
            payload,
            headers: serde_json::from_value(headers)?,
            received_at,
        })
    }
}

#[async_trait]
impl NotificationStore for PostgresStore {
    async fn insert(&self, notification: NewNotification) -> Result<i64, StoreError> {
        let headers = serde_json::to_value(&notification.headers)?;

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO notifications (handler, path, content_type, payload, headers, received_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&notification.handler)
        .bind(&notification.path)
        .bind(&notification.content_type)
        .bind(&notification.payload)
        .bind(&headers)
        .bind(notification.received_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn list_undelivered(&self) -> Result<Vec<Notification>, StoreError> {
        let rows: Vec<NotificationRow> = sqlx::query_as(
            r#"
            SELECT id, handler, path, content_type, payload, headers, received_at
            FROM notifications
            ORDER BY received_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::from_row).collect()
    }

    async fn get(&self, id: i64) -> Result<Option<Notification>, StoreError> {
        let row: Option<NotificationRow> = sqlx::query_as(
            r#"
            SELECT id, handler, path, content_type, payload, headers, received_at
            FROM notifications
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::from_row).transpose()
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notifications")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
