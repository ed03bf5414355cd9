//! Notification persistence.
//!
//! Notifications are owned by the store: the relay core only reads them and
//! requests deletion by id once a consumer acknowledges them. Ids are assigned
//! by the store and increase monotonically.

mod memory;
mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// One captured inbound webhook call, persisted until acknowledged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub handler: String,
    pub path: String,
    pub content_type: Option<String>,
    pub payload: String,
    pub headers: BTreeMap<String, String>,
    pub received_at: DateTime<Utc>,
}

/// A notification as captured by the ingest endpoint, before the store
/// assigns it an id.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub handler: String,
    pub path: String,
    pub content_type: Option<String>,
    pub payload: String,
    pub headers: BTreeMap<String, String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Ordered, append-only notification storage.
///
/// `list_undelivered` returns every row ordered by `received_at` ascending;
/// deletion happens only through acknowledgement.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a notification and return its assigned id.
    async fn insert(&self, notification: NewNotification) -> Result<i64, StoreError>;

    /// All notifications not yet acknowledged, ordered by `received_at` ascending.
    async fn list_undelivered(&self) -> Result<Vec<Notification>, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<Notification>, StoreError>;

    /// Delete by id. Returns false when the id does not exist.
    async fn delete(&self, id: i64) -> Result<bool, StoreError>;

    async fn count(&self) -> Result<i64, StoreError>;
}
