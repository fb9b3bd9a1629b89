//! # sync-types
//!
//! Wire format and data model types for the carelog offline-first sync protocol.
//!
//! This crate provides the foundational types used across all carelog sync crates:
//! - [`DeviceId`], [`FamilyId`], [`MutationId`], [`GlobalSeq`], [`Version`] - Identity and ordering types
//! - [`MutationEvent`], [`ServerRecord`], [`ChangeLogEntry`] - Data model
//! - [`PushRequest`], [`PullRequest`], [`StreamFrame`] - Protocol messages
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;
mod model;

pub use error::SyncError;
pub use ids::{
    DeviceId, EntityId, FamilyId, FrameId, GlobalSeq, MutationId, SessionId, UserId, Version,
    MAX_ENTITY_ID_LEN,
};
pub use messages::{
    decode, encode, ChangeHint, FrameKind, MutationResult, PullRequest, PullResponse,
    PushRequest, PushResponse, StatusResponse, StreamFrame, CONTENT_TYPE_MSGPACK,
};
pub use model::{now_millis, ChangeLogEntry, EntityType, MutationEvent, Operation, ServerRecord};
