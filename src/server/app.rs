use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::state::AppState;
use crate::session;

/// Build the relay server router.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/retrieve", get(handlers::retrieve))
        .route("/retrieve-ws", get(session::retrieve_ws))
        .route("/ack", put(handlers::ack))
        .route("/status", get(handlers::status))
        .route("/{handler}/{*path}", post(handlers::ingest))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
