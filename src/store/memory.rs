//! In-memory notification store, used by tests and local development.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{NewNotification, Notification, NotificationStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    rows: Vec<Notification>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert(&self, notification: NewNotification) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.rows.push(Notification {
            id,
            handler: notification.handler,
            path: notification.path,
            content_type: notification.content_type,
            payload: notification.payload,
            headers: notification.headers,
            received_at: notification.received_at,
        });
        Ok(id)
    }

    async fn list_undelivered(&self) -> Result<Vec<Notification>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows = inner.rows.clone();
        rows.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(rows)
    }

    async fn get(&self, id: i64) -> Result<Option<Notification>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.iter().find(|n| n.id == id).cloned())
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.rows.len();
        inner.rows.retain(|n| n.id != id);
        Ok(inner.rows.len() < before)
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.len() as i64)
    }
}
