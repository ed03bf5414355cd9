//! Inbound HTTP surface: ingest, polling retrieval, acknowledgement, status.

use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde_json::json;

use super::state::AppState;
use crate::error::Result;
use crate::session;
use crate::store::{NewNotification, Notification};

/// `GET /` identification banner.
pub async fn root() -> &'static str {
    "hook-relay"
}

/// `POST /{handler}/{*path}`: accept a webhook and persist it.
///
/// Ingest never routes and never contacts targets; it stores the notification
/// and returns as soon as the write is durable. The query string, when
/// present, is kept as part of the stored path so routing rules can match on
/// it.
pub async fn ingest(
    Path((handler, path)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    let path = match query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path,
    };

    let max = state.settings.relay.max_payload_size;
    let payload = truncate_payload(&body, max);
    if body.len() > max {
        tracing::error!(
            handler = %handler,
            path = %path,
            size = body.len(),
            max = max,
            "Payload exceeds maximum size, truncating"
        );
    }

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let notification = NewNotification {
        handler: handler.clone(),
        path: path.clone(),
        content_type,
        payload,
        headers: capture_headers(&headers),
        received_at: Utc::now(),
    };

    let id = state.store.insert(notification).await?;
    state.stats.record_received(id);

    tracing::info!(
        notification_id = id,
        handler = %handler,
        path = %path,
        "Received notification"
    );

    Ok(StatusCode::OK)
}

/// `GET /retrieve`: the polling consumer surface. Returns every undelivered
/// notification in ingest order.
pub async fn retrieve(State(state): State<AppState>) -> Result<Json<Vec<Notification>>> {
    let notifications = state.store.list_undelivered().await?;
    Ok(Json(notifications))
}

/// `PUT /ack`: apply an acknowledgement batch `{"ack": [id, ...]}`.
pub async fn ack(State(state): State<AppState>, body: String) -> Response {
    if session::acknowledge(state.store.as_ref(), &state.stats, &body).await {
        StatusCode::OK.into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "An error occurred while acknowledging notifications",
        )
            .into_response()
    }
}

/// `GET /status`: pending count plus high-water marks, for diagnostics.
pub async fn status(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let pending = state.store.count().await?;
    let snapshot = state.stats.snapshot();
    Ok(Json(json!({
        "pending": pending,
        "highest_received": snapshot.highest_received,
        "highest_acked": snapshot.highest_acked,
    })))
}

/// Cap the stored payload at `max` bytes. The cut never splits a character:
/// when byte `max` lands inside a multi-byte sequence the cut backs off to
/// the previous boundary, so the result is always valid UTF-8 of at most
/// `max` bytes.
fn truncate_payload(body: &[u8], max: usize) -> String {
    let mut payload = String::from_utf8_lossy(body).into_owned();
    if payload.len() > max {
        let mut end = max;
        while !payload.is_char_boundary(end) {
            end -= 1;
        }
        payload.truncate(end);
    }
    payload
}

/// Keep the headers a delivery target may need: `X-*` extension headers and
/// the User-Agent. Names are stored in canonical capitalization so routing
/// rule overlays behave the same no matter how the producer spelled them.
fn capture_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut captured = BTreeMap::new();
    for (name, value) in headers {
        let lower = name.as_str();
        if !(lower.starts_with("x-") || lower == "user-agent") {
            continue;
        }
        if let Ok(value) = value.to_str() {
            captured.insert(canonical_header_name(lower), value.to_string());
        }
    }
    captured
}

fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_truncate_payload_is_byte_exact_for_ascii() {
        let body = "x".repeat(20);
        let payload = truncate_payload(body.as_bytes(), 16);
        assert_eq!(payload.len(), 16);
        assert_eq!(payload, "x".repeat(16));
    }

    #[test]
    fn test_truncate_payload_never_splits_a_character() {
        // 15 ASCII bytes followed by two-byte characters; byte 16 lands in
        // the middle of the first one.
        let body = format!("{}ééééééééé", "x".repeat(15));
        let payload = truncate_payload(body.as_bytes(), 16);
        assert!(payload.len() <= 16);
        assert_eq!(payload, "x".repeat(15));
    }

    #[test]
    fn test_truncate_payload_keeps_small_bodies_whole() {
        assert_eq!(truncate_payload(b"abc", 16), "abc");
    }

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("x-github-event"), "X-Github-Event");
        assert_eq!(canonical_header_name("user-agent"), "User-Agent");
        assert_eq!(canonical_header_name("x-token"), "X-Token");
    }

    #[test]
    fn test_capture_headers_keeps_extension_and_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", HeaderValue::from_static("push"));
        headers.insert("user-agent", HeaderValue::from_static("GitHub-Hookshot"));
        headers.insert("content-length", HeaderValue::from_static("42"));
        headers.insert("authorization", HeaderValue::from_static("secret"));

        let captured = capture_headers(&headers);
        assert_eq!(captured.len(), 2);
        assert_eq!(captured.get("X-Github-Event").unwrap(), "push");
        assert_eq!(captured.get("User-Agent").unwrap(), "GitHub-Hookshot");
    }
}
