//! Outbound delivery: one HTTP request per resolved target.
//!
//! Delivery is fire-and-forget fan-out: every failure is classified and
//! logged per target, never retried within the attempt, and never escalated.
//! Redelivery relies entirely on the store's at-least-once semantics.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};

use crate::routing::{ResolvedTarget, RoutingTable, TargetMethod};
use crate::store::Notification;

/// Classified outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 2xx response.
    Delivered(u16),
    /// Non-2xx response; logged as a warning, still counts as processed.
    Rejected(u16),
    /// Timeout, connection reset/refused, DNS or protocol failure.
    Unreachable,
}

pub struct Dispatcher {
    verified: reqwest::Client,
    insecure: reqwest::Client,
}

impl Dispatcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let verified = reqwest::Client::builder().timeout(timeout).build()?;
        let insecure = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { verified, insecure })
    }

    /// Perform one outbound request for one target.
    ///
    /// GET sends no body; POST sends the notification payload with its
    /// captured content type. Header collisions were already settled by the
    /// router (rule headers win).
    pub async fn deliver(
        &self,
        notification: &Notification,
        target: &ResolvedTarget,
    ) -> DeliveryOutcome {
        let client = if target.verify_tls {
            &self.verified
        } else {
            &self.insecure
        };

        let mut headers = HeaderMap::new();
        if target.method == TargetMethod::Post {
            if let Some(content_type) = &notification.content_type {
                if let Ok(value) = HeaderValue::from_str(content_type) {
                    headers.insert(CONTENT_TYPE, value);
                }
            }
        }
        for (key, value) in &target.headers {
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => {
                    tracing::warn!(
                        notification_id = notification.id,
                        header = %key,
                        "Skipping header that is not valid for HTTP"
                    );
                }
            }
        }

        let request = match target.method {
            TargetMethod::Get => client.get(&target.url),
            TargetMethod::Post => client.post(&target.url).body(notification.payload.clone()),
        }
        .headers(headers);

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if response.status().is_success() {
                    tracing::info!(
                        notification_id = notification.id,
                        url = %target.url,
                        status = status,
                        "Processed notification"
                    );
                    DeliveryOutcome::Delivered(status)
                } else {
                    tracing::warn!(
                        notification_id = notification.id,
                        url = %target.url,
                        status = status,
                        "Error status notifying target"
                    );
                    DeliveryOutcome::Rejected(status)
                }
            }
            Err(e) => {
                tracing::warn!(
                    notification_id = notification.id,
                    url = %target.url,
                    error = %e,
                    "Error notifying target"
                );
                DeliveryOutcome::Unreachable
            }
        }
    }
}

/// Drives one notification through routing and delivery.
///
/// Always reports the notification as processed once every target has been
/// attempted, regardless of individual outcomes; routing failures are logged
/// warnings, not errors.
pub struct NotificationProcessor {
    router: RoutingTable,
    dispatcher: Dispatcher,
}

impl NotificationProcessor {
    pub fn new(router: RoutingTable, dispatcher: Dispatcher) -> Self {
        Self { router, dispatcher }
    }

    /// Process a single notification. Returns true unconditionally so the
    /// caller acknowledges it either way.
    #[tracing::instrument(
        name = "dispatch.process",
        skip(self, notification),
        fields(notification_id = notification.id, handler = %notification.handler)
    )]
    pub async fn process(&self, notification: &Notification) -> bool {
        let targets = match self.router.resolve(notification) {
            Ok(targets) => targets,
            Err(e) => {
                tracing::warn!(
                    notification_id = notification.id,
                    path = %notification.path,
                    "{e}"
                );
                return true;
            }
        };

        if targets.is_empty() {
            tracing::warn!(
                notification_id = notification.id,
                handler = %notification.handler,
                "No targets resolved for notification"
            );
            return true;
        }

        // Targets are independent; one failure never affects another.
        for target in &targets {
            self.dispatcher.deliver(notification, target).await;
        }

        true
    }

    /// Process a batch in order and return the ids to acknowledge.
    pub async fn process_batch(&self, batch: &[Notification]) -> Vec<i64> {
        let mut ids = Vec::with_capacity(batch.len());
        for notification in batch {
            if self.process(notification).await {
                ids.push(notification.id);
            }
        }
        ids
    }

    pub fn router(&self) -> &RoutingTable {
        &self.router
    }
}
