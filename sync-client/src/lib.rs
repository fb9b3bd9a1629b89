//! # sync-client
//!
//! Device side of the carelog offline-first sync engine.
//!
//! This is the main library that applications use to record and sync
//! child-care events.
//!
//! ## Features
//!
//! - **Local Event Store**: durable SQLite queue plus an optimistic entity
//!   cache that always equals the server snapshot with local changes on top
//! - **Push/Pull Cycles**: batched, idempotent push with conflict rebase;
//!   contiguous, paged pull
//! - **Transport Abstraction**: pluggable transport layer (HTTP, mock)
//! - **Change Stream**: server-sent events turned into connectivity and
//!   change signals
//! - **Pure State Machine**: uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use sync_client::{spawn_driver, ClientConfig, HttpTransport, HttpTransportConfig,
//!     SqliteLocalStore, SyncClient};
//!
//! let store = SqliteLocalStore::new(&data_dir.join("local.db")).await?;
//! let transport = HttpTransport::new(HttpTransportConfig::new(server_url, token))?;
//! let client = Arc::new(SyncClient::open(ClientConfig::new(device_id), transport, store).await?);
//!
//! let driver = spawn_driver(Arc::clone(&client));
//! client.record(EntityType::Feeding, json!({"ml": 120})).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod driver;
pub mod store;
pub mod transport;

pub use client::{ClientError, PullReport, PushReport, SyncClient, SyncReport, SyncStatus};
pub use config::ClientConfig;
pub use driver::{spawn_driver, DriverHandle};
pub use store::{
    CachedEntity, IssueKind, LocalStore, PendingEvent, QueueCounts, QueueStatus,
    SqliteLocalStore, StoreError, SyncIssue,
};
pub use transport::{
    ChangeListener, HttpTransport, HttpTransportConfig, MockTransport, Signal, Transport,
    TransportError,
};
