//! # carelog-sync-server
//!
//! Authoritative sync server for carelog.
//!
//! This crate implements the server side of the sync protocol:
//! - Accepts batches of mutation events from devices and commits them
//!   under optimistic version checks
//! - Assigns every committed change a gapless per-family sequence number
//! - Serves the change log from a cursor
//! - Hints live devices over server-sent events when something changes
//!
//! ## Architecture
//!
//! ```text
//! Device A ──┐    HTTP + SSE      ┌── Device B
//!            ├───────────────────►│
//!        ┌───┴────────────────────┴───┐
//!        │     carelog-sync-server    │
//!        │  ┌────────────┐ ┌──────┐   │
//!        │  │ SyncServer │ │ Hub  │   │
//!        │  └─────┬──────┘ └──────┘   │
//!        │  ┌─────▼───────────────┐   │
//!        │  │ SQLite (records,    │   │
//!        │  │ change log)         │   │
//!        │  └─────────────────────┘   │
//!        └────────────────────────────┘
//! ```
//!
//! ## Endpoints
//!
//! - `POST /v1/push` → per-event ack, conflict, reject or retry
//! - `POST /v1/pull` → change log page from a cursor
//! - `GET /v1/status` → family head and stream count
//! - `GET /v1/stream` → `connected`, then `change` hints

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod hub;
pub mod server;
pub mod session;
pub mod storage;

pub use auth::{AuthUser, TokenStore};
pub use config::Config;
pub use error::{ServerError, StorageError, ValidationError};
pub use http::build_router;
pub use hub::NotificationHub;
pub use server::SyncServer;
pub use storage::{SqliteStorage, SyncStorage};

use std::future::Future;
use std::sync::Arc;

/// Open storage, bind the listener and serve until `shutdown` resolves.
///
/// On shutdown the hub drains first so open change streams end and the
/// graceful shutdown can complete.
pub async fn run<F>(config: Config, shutdown: F) -> error::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let storage = SqliteStorage::new(std::path::Path::new(&config.storage.database)).await?;
    let tokens = Arc::new(TokenStore::from_config(&config.auth));
    if tokens.is_empty() {
        tracing::warn!("No auth tokens configured; every API request will be rejected");
    }

    let bind_address = config.server.bind_address.clone();
    let server = Arc::new(SyncServer::new(config, storage));
    let router = build_router(Arc::clone(&server), tokens);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Listening on {}", bind_address);

    let hub = Arc::clone(server.hub());
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.await;
            let closed = hub.drain();
            tracing::info!("Shutting down, closed {} streams", closed);
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}
