//! # sync-core
//!
//! Pure logic for carelog sync (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms for sync
//! without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (network, disk) is performed by `sync-client` and
//! `sync-server`, which interpret the results produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod conflict;
pub mod cursor;
pub mod merge;
pub mod state;

pub use backoff::RetryPolicy;
pub use conflict::{resolve_conflict, ConflictPolicy, ConflictReason, PendingChange, Resolution};
pub use cursor::{CursorStep, CursorTracker};
pub use merge::{apply_mutation, check_payload, merge_patch, touched_fields, EntityState, MergeError};
pub use state::{Action, Event, SyncEvent, SyncState};
