//! Health check endpoint.
//!
//! Answers 200 only while the server takes new work: the hub is accepting
//! sessions and storage answers a query. Load balancers stop routing on 503.

use crate::server::SyncServer;
use crate::storage::SyncStorage;
use axum::{http::StatusCode, Extension, Json};
use serde::Serialize;
use std::sync::Arc;

/// Overall state reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Ok,
    /// Shutdown started; streams are closed and new ones refused.
    Draining,
    /// Storage did not answer.
    Degraded,
}

impl HealthState {
    pub fn status_code(self) -> StatusCode {
        match self {
            HealthState::Ok => StatusCode::OK,
            HealthState::Draining | HealthState::Degraded => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Storage row counts, absent when the query failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageHealth {
    pub families: u64,
    pub records: u64,
    pub changes: u64,
}

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub version: &'static str,
    pub uptime_seconds: u64,
    /// Live streaming sessions.
    pub sessions: usize,
    /// Families with at least one live session.
    pub stream_families: usize,
    pub storage: Option<StorageHealth>,
}

impl HealthStatus {
    /// Sample the hub and storage of `server`.
    pub async fn snapshot(server: &SyncServer) -> Self {
        let hub = server.hub();
        let storage = match server.storage().stats().await {
            Ok(stats) => Some(StorageHealth {
                families: stats.families,
                records: stats.records,
                changes: stats.changes,
            }),
            Err(e) => {
                tracing::warn!("Health check storage query failed: {}", e);
                None
            }
        };

        let status = if hub.is_draining() {
            HealthState::Draining
        } else if storage.is_none() {
            HealthState::Degraded
        } else {
            HealthState::Ok
        };

        Self {
            status,
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds: server.uptime().as_secs(),
            sessions: hub.session_count(),
            stream_families: hub.family_count(),
            storage,
        }
    }
}

pub async fn health_handler(
    Extension(server): Extension<Arc<SyncServer>>,
) -> (StatusCode, Json<HealthStatus>) {
    let health = HealthStatus::snapshot(&server).await;
    (health.status.status_code(), Json(health))
}
