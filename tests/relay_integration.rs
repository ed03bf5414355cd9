//! End-to-end tests: a relay server on an ephemeral port, exercised over
//! plain HTTP and over the streaming transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use wiremock::matchers::{body_string, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hook_relay::client::RelayClient;
use hook_relay::config::Settings;
use hook_relay::dispatch::{Dispatcher, NotificationProcessor};
use hook_relay::routing::{HandlerRules, RoutingTable, RuleConfig, TargetMethod, UrlTemplates};
use hook_relay::server::{create_app, AppState};
use hook_relay::store::{MemoryStore, Notification};
use hook_relay::transport::{Transport, TransportEvent};

/// Start a relay server backed by an in-memory store on an ephemeral port.
/// Returns its base URL.
async fn spawn_app(mut settings: Settings) -> String {
    settings.server.host = "127.0.0.1".to_string();
    let state = AppState::new(Arc::new(settings), Arc::new(MemoryStore::new()));
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}")
}

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.relay.poll_interval = 1;
    settings
}

fn processor_for(handler: &str, rule: RuleConfig) -> NotificationProcessor {
    let mut config = HashMap::new();
    config.insert(handler.to_string(), HandlerRules::One(rule));
    NotificationProcessor::new(
        RoutingTable::compile(&config).unwrap(),
        Dispatcher::new(Duration::from_secs(2)).unwrap(),
    )
}

async fn retrieve(base: &str) -> Vec<Notification> {
    reqwest::get(format!("{base}/retrieve"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

/// Wait for the next pushed batch, skipping lifecycle events.
async fn next_batch(transport: &mut Transport) -> Vec<Notification> {
    loop {
        let event = timeout(Duration::from_secs(5), transport.next_event())
            .await
            .expect("timed out waiting for a pushed batch")
            .expect("transport closed while waiting for a batch");
        match event {
            TransportEvent::Message(text) => return serde_json::from_str(&text).unwrap(),
            TransportEvent::Open => {}
            other => panic!("unexpected transport event: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_end_to_end_ingest_process_ack() {
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sync/77"))
        .and(body_string(r#"{"k":1}"#))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&target)
        .await;

    let base = spawn_app(fast_settings()).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{base}/jira/77/sync"))
        .header("content-type", "application/json")
        .header("x-request-id", "abc123")
        .body(r#"{"k":1}"#)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    // The webhook is stored with its handler, path, and captured headers.
    let pending = retrieve(&base).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].handler, "jira");
    assert_eq!(pending[0].path, "77/sync");
    assert_eq!(pending[0].headers.get("X-Request-Id").unwrap(), "abc123");

    let mut settings = fast_settings();
    settings.relay.server_url = base.clone();
    let (_tx, rx) = watch::channel(false);
    let client = RelayClient::new(
        Arc::new(settings),
        processor_for(
            "jira",
            RuleConfig {
                pattern: r"^(\d+)/sync$".to_string(),
                url: UrlTemplates::One(format!("{}/sync/$1", target.uri())),
                method: TargetMethod::Post,
                headers: Default::default(),
                verify_ssl: true,
            },
        ),
        rx,
    )
    .unwrap();

    assert_eq!(client.process_pending().await.unwrap(), 1);

    // Processed means acknowledged means deleted.
    assert!(retrieve(&base).await.is_empty());
}

#[tokio::test]
async fn test_oversized_payload_is_truncated() {
    let mut settings = fast_settings();
    settings.relay.max_payload_size = 16;
    let base = spawn_app(settings).await;

    let body = "x".repeat(100);
    reqwest::Client::new()
        .post(format!("{base}/jira/1/sync"))
        .body(body)
        .send()
        .await
        .unwrap();

    let pending = retrieve(&base).await;
    assert_eq!(pending[0].payload.len(), 16);
    assert_eq!(pending[0].payload, "x".repeat(16));
}

#[tokio::test]
async fn test_truncation_never_exceeds_the_cap_on_multibyte_input() {
    let mut settings = fast_settings();
    settings.relay.max_payload_size = 16;
    let base = spawn_app(settings).await;

    // Byte 16 falls inside the first two-byte character; the stored payload
    // must back off to the boundary rather than grow past the cap.
    let body = format!("{}ééééééééé", "x".repeat(15));
    reqwest::Client::new()
        .post(format!("{base}/jira/1/sync"))
        .body(body)
        .send()
        .await
        .unwrap();

    let pending = retrieve(&base).await;
    assert!(pending[0].payload.len() <= 16);
    assert_eq!(pending[0].payload, "x".repeat(15));
}

#[tokio::test]
async fn test_query_string_is_part_of_the_path() {
    let base = spawn_app(fast_settings()).await;

    reqwest::Client::new()
        .post(format!("{base}/jira/1/sync?source=ci&dry=1"))
        .body("{}")
        .send()
        .await
        .unwrap();

    let pending = retrieve(&base).await;
    assert_eq!(pending[0].path, "1/sync?source=ci&dry=1");
}

#[tokio::test]
async fn test_ack_is_idempotent_over_http() {
    let base = spawn_app(fast_settings()).await;
    let http = reqwest::Client::new();

    http.post(format!("{base}/jira/1/sync"))
        .body("{}")
        .send()
        .await
        .unwrap();
    let id = retrieve(&base).await[0].id;

    let ack = json!({ "ack": [id] });
    for _ in 0..2 {
        let response = http
            .put(format!("{base}/ack"))
            .json(&ack)
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
    }

    // Unknown ids are a no-op as well.
    let response = http
        .put(format!("{base}/ack"))
        .json(&json!({ "ack": [9999] }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert!(retrieve(&base).await.is_empty());
}

#[tokio::test]
async fn test_malformed_ack_is_rejected() {
    let base = spawn_app(fast_settings()).await;
    let http = reqwest::Client::new();

    http.post(format!("{base}/jira/1/sync"))
        .body("{}")
        .send()
        .await
        .unwrap();

    let response = http
        .put(format!("{base}/ack"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 500);

    // A parseable body without an ack key is an empty batch, not an error.
    let response = http
        .put(format!("{base}/ack"))
        .json(&json!({ "foo": 1 }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    // Nothing was deleted.
    assert_eq!(retrieve(&base).await.len(), 1);
}

#[tokio::test]
async fn test_status_reports_pending_and_high_water_marks() {
    let base = spawn_app(fast_settings()).await;
    let http = reqwest::Client::new();

    http.post(format!("{base}/jira/1/sync"))
        .body("{}")
        .send()
        .await
        .unwrap();
    http.post(format!("{base}/jira/2/sync"))
        .body("{}")
        .send()
        .await
        .unwrap();

    let first = retrieve(&base).await[0].id;
    http.put(format!("{base}/ack"))
        .json(&json!({ "ack": [first] }))
        .send()
        .await
        .unwrap();

    let status: Value = http
        .get(format!("{base}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["pending"], 1);
    assert_eq!(status["highest_received"], first + 1);
    assert_eq!(status["highest_acked"], first);
}

#[tokio::test]
async fn test_streaming_pushes_batch_in_order() {
    let base = spawn_app(fast_settings()).await;
    let http = reqwest::Client::new();

    http.post(format!("{base}/jira/1/sync"))
        .body("first")
        .send()
        .await
        .unwrap();
    http.post(format!("{base}/jira/2/sync"))
        .body("second")
        .send()
        .await
        .unwrap();

    let mut transport = Transport::connect(&format!("{base}/retrieve-ws"))
        .await
        .unwrap();
    let batch = next_batch(&mut transport).await;

    assert_eq!(batch.len(), 2);
    assert!(batch[0].id < batch[1].id);
    assert_eq!(batch[0].payload, "first");
    assert_eq!(batch[1].payload, "second");

    transport.close(true);
}

#[tokio::test]
async fn test_streaming_does_not_redeliver_within_a_session() {
    let base = spawn_app(fast_settings()).await;
    reqwest::Client::new()
        .post(format!("{base}/jira/1/sync"))
        .body("{}")
        .send()
        .await
        .unwrap();

    let mut transport = Transport::connect(&format!("{base}/retrieve-ws"))
        .await
        .unwrap();
    let batch = next_batch(&mut transport).await;
    assert_eq!(batch.len(), 1);

    // Let at least two poll cycles pass without acknowledging; the session
    // must not push the same notification again.
    let extra = timeout(Duration::from_millis(2500), async {
        loop {
            match transport.next_event().await {
                Some(TransportEvent::Message(_)) => break true,
                Some(_) => {}
                None => break false,
            }
        }
    })
    .await;
    assert!(extra.is_err(), "notification was redelivered within the session");

    transport.close(true);
}

#[tokio::test]
async fn test_streaming_redelivers_on_reconnect() {
    let base = spawn_app(fast_settings()).await;
    reqwest::Client::new()
        .post(format!("{base}/jira/1/sync"))
        .body("{}")
        .send()
        .await
        .unwrap();

    let mut first = Transport::connect(&format!("{base}/retrieve-ws"))
        .await
        .unwrap();
    let batch = next_batch(&mut first).await;
    let id = batch[0].id;
    // Disconnect without acknowledging.
    first.close(true);

    let mut second = Transport::connect(&format!("{base}/retrieve-ws"))
        .await
        .unwrap();
    let batch = next_batch(&mut second).await;
    assert_eq!(batch[0].id, id);

    second.close(true);
}

#[tokio::test]
async fn test_streaming_ack_deletes_from_store() {
    let base = spawn_app(fast_settings()).await;
    reqwest::Client::new()
        .post(format!("{base}/jira/1/sync"))
        .body("{}")
        .send()
        .await
        .unwrap();

    let mut transport = Transport::connect(&format!("{base}/retrieve-ws"))
        .await
        .unwrap();
    let batch = next_batch(&mut transport).await;
    transport.send(json!({ "ack": [batch[0].id] }).to_string());

    // Acknowledgement is applied asynchronously; wait for the delete.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if retrieve(&base).await.is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "acknowledged notification was not deleted"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    transport.close(true);
}

#[tokio::test]
async fn test_session_closes_at_max_lifetime() {
    let mut settings = fast_settings();
    settings.relay.ws_max_lifetime = 1;
    let base = spawn_app(settings).await;

    let mut transport = Transport::connect(&format!("{base}/retrieve-ws"))
        .await
        .unwrap();

    let closed = timeout(Duration::from_secs(3), async {
        loop {
            match transport.next_event().await {
                Some(TransportEvent::Closed(_)) | None => break,
                Some(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "session was not closed at max lifetime");
}

#[tokio::test]
async fn test_forced_close_bounds_the_receive_side() {
    let mut settings = fast_settings();
    settings.relay.ws_max_lifetime = 1;
    let base = spawn_app(settings).await;

    reqwest::Client::new()
        .post(format!("{base}/jira/1/sync"))
        .body("{}")
        .send()
        .await
        .unwrap();

    // A raw socket lets us keep the connection open without answering the
    // server's close frame.
    let ws_url = format!("ws://{}", base.strip_prefix("http://").unwrap());
    let (mut ws, _) = connect_async(format!("{ws_url}/retrieve-ws")).await.unwrap();

    let id = loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for the pushed batch")
            .unwrap()
            .unwrap();
        if let WsMessage::Text(text) = message {
            let batch: Vec<Notification> = serde_json::from_str(text.as_str()).unwrap();
            break batch[0].id;
        }
    };

    // Let the lifetime close fire while the close frame sits unread.
    tokio::time::sleep(Duration::from_secs(2)).await;

    // An ack arriving after the forced close must not be applied; the
    // session's receive side has already shut down.
    let _ = ws.send(WsMessage::text(format!(r#"{{"ack":[{id}]}}"#))).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(retrieve(&base).await.len(), 1);
}

#[tokio::test]
async fn test_zero_lifetime_disables_expiry() {
    let mut settings = fast_settings();
    settings.relay.ws_max_lifetime = 0;
    let base = spawn_app(settings).await;

    let mut transport = Transport::connect(&format!("{base}/retrieve-ws"))
        .await
        .unwrap();

    // The session must stay open well past several poll cycles.
    let closed = timeout(Duration::from_millis(2500), async {
        loop {
            match transport.next_event().await {
                Some(TransportEvent::Closed(_)) | None => break,
                Some(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_err(), "session closed despite lifetime being disabled");

    transport.close(true);
}
