//! Consumer client: pulls notifications from the relay server, routes and
//! delivers them, and acknowledges what it has processed.
//!
//! Two modes share the same processing pipeline. Polling fetches the full
//! undelivered backlog over HTTP on an interval; streaming holds a WebSocket
//! open and reacts to pushed batches. In both, a notification is acknowledged
//! only after every resolved target has been attempted, so an interrupted
//! consumer sees the batch again on the next fetch or connection.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;

use crate::config::Settings;
use crate::dispatch::NotificationProcessor;
use crate::error::{AppError, Result};
use crate::store::Notification;
use crate::transport::{Transport, TransportEvent};

pub struct RelayClient {
    settings: Arc<Settings>,
    processor: NotificationProcessor,
    http: reqwest::Client,
    shutdown: watch::Receiver<bool>,
}

impl RelayClient {
    pub fn new(
        settings: Arc<Settings>,
        processor: NotificationProcessor,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.relay.request_timeout())
            .build()?;
        Ok(Self {
            settings,
            processor,
            http,
            shutdown,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.settings.relay.server_url.trim_end_matches('/'),
            path
        )
    }

    /// Fetch the full undelivered backlog from the server.
    pub async fn fetch_notifications(&self) -> Result<Vec<Notification>> {
        let response = self
            .http
            .get(self.endpoint("retrieve"))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Acknowledge processed notifications. A no-op for an empty batch.
    pub async fn ack_notifications(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let response = self
            .http
            .put(self.endpoint("ack"))
            .json(&json!({ "ack": ids }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AppError::Internal(format!(
                "Acknowledgement rejected with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// One fetch-process-ack cycle. Returns how many notifications were
    /// acknowledged.
    pub async fn process_pending(&self) -> Result<usize> {
        let batch = self.fetch_notifications().await?;
        if batch.is_empty() {
            return Ok(0);
        }
        let ids = self.processor.process_batch(&batch).await;
        let count = ids.len();
        self.ack_notifications(&ids).await?;
        Ok(count)
    }

    /// Polling mode: process the backlog on every poll interval until
    /// shutdown.
    pub async fn run_polling(&mut self) -> Result<()> {
        tracing::info!(
            server_url = %self.settings.relay.server_url,
            interval_secs = self.settings.relay.poll_interval,
            "Polling for notifications"
        );

        loop {
            match self.process_pending().await {
                Ok(count) if count > 0 => {
                    tracing::info!(count = count, "Processed notifications");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Poll cycle failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.relay.poll_interval()) => {}
                _ = self.shutdown.changed() => {}
            }
            if *self.shutdown.borrow() {
                break;
            }
        }

        tracing::info!("Polling stopped");
        Ok(())
    }

    /// Streaming mode: hold a WebSocket session open and process pushed
    /// batches, reconnecting after session close while auto-reconnect is
    /// enabled.
    pub async fn run_streaming(&mut self) -> Result<()> {
        let ws_endpoint = self.endpoint("retrieve-ws");

        loop {
            tracing::info!(url = %ws_endpoint, "Connecting to relay server");
            match Transport::connect(&ws_endpoint).await {
                Ok(transport) => {
                    self.run_session(transport).await;
                }
                Err(e) => {
                    tracing::warn!(url = %ws_endpoint, error = %e, "Connection failed");
                }
            }

            if *self.shutdown.borrow() {
                break;
            }
            if !self.settings.relay.ws_auto_reconnect {
                tracing::info!("Auto-reconnect disabled, exiting");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.relay.reconnect_backoff()) => {}
                _ = self.shutdown.changed() => {}
            }
            if *self.shutdown.borrow() {
                break;
            }
        }

        Ok(())
    }

    /// Drive one streaming session to completion.
    async fn run_session(&mut self, mut transport: Transport) {
        loop {
            tokio::select! {
                event = transport.next_event() => {
                    match event {
                        Some(TransportEvent::Open) => {
                            tracing::info!("Connected, waiting for notifications");
                        }
                        Some(TransportEvent::Message(text)) => {
                            self.handle_push(&transport, &text).await;
                        }
                        Some(TransportEvent::Error(message)) => {
                            tracing::warn!(error = %message, "Transport error");
                        }
                        Some(TransportEvent::Closed(reason)) => {
                            match reason {
                                Some(reason) => {
                                    tracing::warn!(reason = %reason, "Connection closed")
                                }
                                None => tracing::info!("Connection closed"),
                            }
                            break;
                        }
                        None => break,
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        transport.close(true);
                        // Drain remaining events so the close completes.
                        while let Some(event) = transport.next_event().await {
                            if matches!(event, TransportEvent::Closed(_)) {
                                break;
                            }
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Process one pushed batch and acknowledge it over the same connection.
    async fn handle_push(&self, transport: &Transport, text: &str) {
        let batch: Vec<Notification> = match serde_json::from_str(text) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(error = %e, "Don't know how to process message");
                return;
            }
        };

        if batch.is_empty() {
            return;
        }

        let ids = self.processor.process_batch(&batch).await;
        if !ids.is_empty() {
            transport.send(json!({ "ack": ids }).to_string());
        }
    }

    pub fn processor(&self) -> &NotificationProcessor {
        &self.processor
    }
}
