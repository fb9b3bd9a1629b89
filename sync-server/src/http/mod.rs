//! HTTP endpoints for the sync server.
//!
//! Public: health and metrics. Authenticated (bearer token): push, pull,
//! status and the change stream.

mod api;
pub mod health;
mod metrics;

use crate::auth::{auth_middleware, TokenStore};
use crate::server::SyncServer;
use axum::extract::DefaultBodyLimit;
use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub use health::{HealthState, HealthStatus};

/// Request body slack on top of the payload budget (envelope, ids, keys).
const BODY_OVERHEAD_PER_EVENT: usize = 1024;

/// Build the HTTP router with all endpoints.
pub fn build_router(server: Arc<SyncServer>, tokens: Arc<TokenStore>) -> Router {
    let storage = &server.config().storage;
    let body_limit = storage
        .max_batch_size
        .saturating_mul(storage.max_payload_bytes.saturating_add(BODY_OVERHEAD_PER_EVENT));

    let api = Router::new()
        .route("/v1/push", post(api::push_handler))
        .route("/v1/pull", post(api::pull_handler))
        .route("/v1/status", get(api::status_handler))
        .route("/v1/stream", get(api::stream_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(tokens, auth_middleware));

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .merge(api)
        .layer(Extension(server))
        .layer(TraceLayer::new_for_http())
}
