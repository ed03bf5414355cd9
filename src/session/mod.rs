//! Streaming delivery sessions.
//!
//! Each accepted `/retrieve-ws` connection gets one `DeliverySession`: a push
//! loop that polls the store and streams undelivered notifications as JSON
//! batches, and a receive loop that applies acknowledgement batches. The set
//! of ids already pushed is session-scoped and rebuilt empty on every new
//! connection, so anything unacknowledged when a consumer disconnects is
//! redelivered on the next connection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::server::AppState;
use crate::stats::RelayStats;
use crate::store::NotificationStore;

/// An acknowledgement batch: `{"ack": [id, ...]}`. A parseable body without
/// an `ack` key is an empty batch.
#[derive(Debug, Deserialize)]
struct AckBatch {
    #[serde(default)]
    ack: Vec<i64>,
}

/// State for one streaming consumer connection.
pub struct DeliverySession {
    pub id: Uuid,
    poll_interval: Duration,
    max_lifetime: Duration,
    started: Instant,
    /// Ids pushed on this connection and not yet observed as acknowledged.
    /// Replaced with the full undelivered set on every poll.
    delivered_ids: Mutex<HashSet<i64>>,
}

impl DeliverySession {
    pub fn new(poll_interval: Duration, max_lifetime: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            poll_interval,
            max_lifetime,
            started: Instant::now(),
            delivered_ids: Mutex::new(HashSet::new()),
        }
    }

    fn lifetime_expired(&self) -> bool {
        !self.max_lifetime.is_zero() && self.started.elapsed() >= self.max_lifetime
    }

    /// How long the push loop may wait before it must act again: the poll
    /// interval, shortened so lifetime expiry is observed on time.
    fn next_wait(&self) -> Duration {
        if self.max_lifetime.is_zero() {
            return self.poll_interval;
        }
        let remaining = self.max_lifetime.saturating_sub(self.started.elapsed());
        self.poll_interval.min(remaining)
    }
}

/// WebSocket upgrade handler for `GET /retrieve-ws`.
pub async fn retrieve_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[tracing::instrument(name = "session.connection", skip(socket, state))]
async fn handle_socket(socket: WebSocket, state: AppState) {
    let session = Arc::new(DeliverySession::new(
        state.settings.relay.poll_interval(),
        state.settings.relay.max_lifetime(),
    ));
    let connection_start = Instant::now();

    tracing::info!(session_id = %session.id, "Consumer connection established");

    let (sender, receiver) = socket.split();
    let (close_tx, close_rx) = watch::channel(false);

    let mut push_task = tokio::spawn(push_loop(
        session.clone(),
        state.store.clone(),
        sender,
        close_rx.clone(),
    ));
    let mut recv_task = tokio::spawn(recv_loop(
        receiver,
        state.store.clone(),
        state.stats.clone(),
        session.id,
        close_rx,
    ));

    // Whichever side finishes first wakes the other out of its wait, then we
    // drain both so no store access happens after close.
    tokio::select! {
        _ = &mut push_task => {
            let _ = close_tx.send(true);
            let _ = recv_task.await;
        }
        _ = &mut recv_task => {
            let _ = close_tx.send(true);
            let _ = push_task.await;
        }
    }

    tracing::info!(
        session_id = %session.id,
        duration_secs = connection_start.elapsed().as_secs_f64(),
        "Consumer connection closed"
    );
}

/// Timer-driven producer: poll the store, push what this session has not
/// pushed yet, track it, wait. Exits on close or lifetime expiry.
async fn push_loop(
    session: Arc<DeliverySession>,
    store: Arc<dyn NotificationStore>,
    mut sender: SplitSink<WebSocket, Message>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        match store.count().await {
            Ok(count) if count > 0 => {
                match store.list_undelivered().await {
                    Ok(undelivered) => {
                        let batch = {
                            let delivered = session.delivered_ids.lock().await;
                            undelivered
                                .iter()
                                .filter(|n| !delivered.contains(&n.id))
                                .cloned()
                                .collect::<Vec<_>>()
                        };

                        if !batch.is_empty() {
                            for n in &batch {
                                tracing::info!(
                                    session_id = %session.id,
                                    notification_id = n.id,
                                    handler = %n.handler,
                                    path = %n.path,
                                    "Delivering notification"
                                );
                            }
                            match serde_json::to_string(&batch) {
                                Ok(json) => {
                                    if sender.send(Message::Text(json.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    tracing::error!(
                                        session_id = %session.id,
                                        error = %e,
                                        "Failed to serialize push batch"
                                    );
                                }
                            }
                        }

                        // Track the full undelivered set: ids acknowledged in
                        // the meantime drop out naturally on the next poll.
                        let mut delivered = session.delivered_ids.lock().await;
                        *delivered = undelivered.iter().map(|n| n.id).collect();
                    }
                    Err(e) => {
                        tracing::warn!(
                            session_id = %session.id,
                            error = %e,
                            "Failed to list undelivered notifications"
                        );
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "Store count failed");
            }
        }

        // Sleep until the next poll, woken early when the connection closes.
        tokio::select! {
            _ = tokio::time::sleep(session.next_wait()) => {}
            _ = close_rx.changed() => {}
        }

        if *close_rx.borrow() {
            break;
        }
        if session.lifetime_expired() {
            tracing::info!(
                session_id = %session.id,
                "Session exceeded max lifetime, forcing reconnect"
            );
            let _ = sender.send(Message::Close(None)).await;
            break;
        }
    }
}

/// Consumer of incoming acknowledgement batches. Exits when the peer closes
/// or when the session's close signal fires, so a forced close never leaves
/// this side applying acks while waiting on an unresponsive peer.
async fn recv_loop(
    mut receiver: SplitStream<WebSocket>,
    store: Arc<dyn NotificationStore>,
    stats: Arc<RelayStats>,
    session_id: Uuid,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        let incoming = tokio::select! {
            incoming = receiver.next() => incoming,
            _ = close_rx.changed() => {
                if *close_rx.borrow() {
                    break;
                }
                continue;
            }
        };
        let Some(result) = incoming else { break };
        match result {
            Ok(Message::Text(text)) => {
                // A malformed batch is logged and ignored; the session
                // continues.
                acknowledge(store.as_ref(), &stats, &text).await;
            }
            Ok(Message::Close(_)) => {
                tracing::debug!(session_id = %session_id, "Received close frame");
                break;
            }
            // Pings are answered by axum itself.
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }
}

/// Apply one acknowledgement batch: delete each acked notification from the
/// store. Unknown or already-deleted ids are a no-op. Returns false when the
/// payload cannot be parsed or a deletion failed.
pub async fn acknowledge(store: &dyn NotificationStore, stats: &RelayStats, raw: &str) -> bool {
    let batch: AckBatch = match serde_json::from_str(raw) {
        Ok(batch) => batch,
        Err(_) => {
            tracing::error!(payload = %raw, "Don't know how to acknowledge");
            return false;
        }
    };

    let mut ok = true;
    for id in batch.ack {
        match store.get(id).await {
            Ok(Some(notification)) => {
                tracing::info!(
                    notification_id = id,
                    handler = %notification.handler,
                    path = %notification.path,
                    "Acknowledged notification"
                );
                match store.delete(id).await {
                    Ok(deleted) => {
                        if deleted {
                            stats.record_acked(id);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(notification_id = id, error = %e, "Failed to delete notification");
                        ok = false;
                    }
                }
            }
            Ok(None) => {} // already gone: acknowledgement is idempotent
            Err(e) => {
                tracing::warn!(notification_id = id, error = %e, "Failed to look up notification");
                ok = false;
            }
        }
    }

    ok
}
