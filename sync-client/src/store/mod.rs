//! Local Event Store.
//!
//! The device-resident durable state of the sync engine:
//! - **Pending queue**: unacknowledged mutations in `local_seq` order,
//!   surviving restarts, each with an attempt counter and a status
//! - **Entity cache**: the read model shown to the user, always equal to the
//!   last confirmed server snapshot with the queued local changes replayed on
//!   top of it
//! - **Cursor**: the last applied family `GlobalSeq`, persisted atomically
//!   with the entry it belongs to
//! - **Issues**: conflicts, rejections and dead-lettered events surfaced to
//!   the user
//!
//! The queue is owned exclusively by this device; nothing else writes it.

mod sqlite;

pub use sqlite::SqliteLocalStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use sync_types::{
    ChangeLogEntry, EntityId, EntityType, GlobalSeq, MutationEvent, MutationId, Operation,
    ServerRecord, Version,
};
use thiserror::Error;

/// Meta key holding the time of the last successful sync cycle.
pub const META_LAST_SYNC_AT: &str = "last_sync_at";
/// Meta key holding the last sync error message.
pub const META_LAST_ERROR: &str = "last_error";

/// Local store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// Stored JSON could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[source] serde_json::Error),

    /// A stored row does not decode into the model.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Lifecycle of a queued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be pushed.
    Pending,
    /// Attempt ceiling reached; kept until a manual retry.
    Stalled,
    /// Older than the queue age limit; no longer pushed or shown.
    DeadLetter,
}

impl QueueStatus {
    /// Stable name used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Stalled => "stalled",
            QueueStatus::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "stalled" => Ok(QueueStatus::Stalled),
            "dead_letter" => Ok(QueueStatus::DeadLetter),
            other => Err(StoreError::Corrupt(format!("unknown queue status: {other}"))),
        }
    }
}

/// A queued mutation with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    /// The mutation as it will be pushed.
    pub event: MutationEvent,
    /// Entity fields the change was made against, if the entity existed.
    pub base_fields: Option<serde_json::Value>,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    /// Queue status.
    pub status: QueueStatus,
    /// Last delivery failure.
    pub last_error: Option<String>,
    /// Enqueue time, in milliseconds.
    pub enqueued_at: u64,
}

/// An entity in the local read model.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity {
    /// Kind of entity.
    pub entity_type: EntityType,
    /// Entity identifier.
    pub entity_id: EntityId,
    /// Last confirmed server version (`0` if never confirmed).
    pub version: Version,
    /// Fields as shown to the user.
    pub fields: serde_json::Value,
    /// Tombstone flag as shown to the user.
    pub deleted: bool,
    /// Whether queued local changes are replayed on top of the server state.
    pub has_pending: bool,
}

/// Kind of problem surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// The change was discarded after a conflict.
    Conflict,
    /// The server rejected the change as invalid.
    Rejected,
    /// The change aged out of the queue.
    DeadLetter,
}

impl IssueKind {
    /// Stable name used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Conflict => "conflict",
            IssueKind::Rejected => "rejected",
            IssueKind::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conflict" => Ok(IssueKind::Conflict),
            "rejected" => Ok(IssueKind::Rejected),
            "dead_letter" => Ok(IssueKind::DeadLetter),
            other => Err(StoreError::Corrupt(format!("unknown issue kind: {other}"))),
        }
    }
}

/// Issue to record when an event leaves the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIssue {
    /// Kind of problem.
    pub kind: IssueKind,
    /// Human-readable reason.
    pub reason: String,
}

impl NewIssue {
    /// A discarded conflict.
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Conflict,
            reason: reason.into(),
        }
    }

    /// A server rejection.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Rejected,
            reason: reason.into(),
        }
    }
}

/// A recorded conflict, rejection or dead-lettered event.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncIssue {
    /// Local issue id.
    pub id: i64,
    /// Kind of problem.
    pub kind: IssueKind,
    /// Mutation concerned.
    pub mutation_id: MutationId,
    /// Kind of entity.
    pub entity_type: EntityType,
    /// Entity concerned.
    pub entity_id: EntityId,
    /// Operation of the local change.
    pub operation: Operation,
    /// Payload of the local change.
    pub local_payload: serde_json::Value,
    /// Server fields at the time, for conflicts.
    pub server_fields: Option<serde_json::Value>,
    /// Server version at the time, for conflicts.
    pub server_version: Option<Version>,
    /// Human-readable reason.
    pub reason: String,
    /// When the issue was recorded, in milliseconds.
    pub recorded_at: u64,
}

/// Queue size by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Waiting to be pushed.
    pub pending: u64,
    /// Waiting for a manual retry.
    pub stalled: u64,
    /// Aged out.
    pub dead_letter: u64,
}

impl QueueCounts {
    /// All queued events regardless of status.
    pub fn total(&self) -> u64 {
        self.pending + self.stalled + self.dead_letter
    }
}

/// Trait for device-local durable storage backends.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Append an event to the queue and apply it to the cache, atomically.
    ///
    /// Assigns `local_seq` and takes `based_on_version` and the base fields
    /// from the cached entity. Returns the queued event.
    async fn enqueue(&self, event: MutationEvent) -> Result<PendingEvent, StoreError>;

    /// Up to `limit` pushable events in `local_seq` order, at most one per
    /// entity (an entity's later events wait for the earlier one to settle).
    async fn next_batch(&self, limit: usize) -> Result<Vec<PendingEvent>, StoreError>;

    /// Every queued event regardless of status, in `local_seq` order.
    async fn queued(&self) -> Result<Vec<PendingEvent>, StoreError>;

    /// A queued event by id.
    async fn pending_event(&self, id: &MutationId) -> Result<Option<PendingEvent>, StoreError>;

    /// Remove an acknowledged event, stamp the entity with the committed
    /// version and move the entity's later events onto that version.
    async fn acknowledge(&self, id: &MutationId, version: Version) -> Result<(), StoreError>;

    /// Re-base an event onto the current server record.
    async fn rebase(&self, id: &MutationId, current: &ServerRecord) -> Result<(), StoreError>;

    /// Remove an event from the queue, optionally adopting a server snapshot
    /// and recording an issue. Returns false if the event was not queued.
    async fn drop_event(
        &self,
        id: &MutationId,
        current: Option<&ServerRecord>,
        issue: Option<NewIssue>,
    ) -> Result<bool, StoreError>;

    /// Count a failed delivery attempt; events reaching `max_attempts` stall.
    ///
    /// Returns the events that stalled because of this call.
    async fn record_failure(
        &self,
        ids: &[MutationId],
        error: &str,
        max_attempts: u32,
    ) -> Result<Vec<MutationId>, StoreError>;

    /// Put stalled and dead-lettered events back into the pending state.
    async fn retry_stalled(&self) -> Result<u64, StoreError>;

    /// Move events enqueued before `cutoff` (milliseconds) to dead-letter.
    async fn expire_pending(&self, cutoff: u64) -> Result<Vec<MutationId>, StoreError>;

    /// Apply a pulled change log entry and advance the cursor to it.
    async fn apply_remote(&self, entry: &ChangeLogEntry) -> Result<(), StoreError>;

    /// Last applied family sequence number.
    async fn cursor(&self) -> Result<GlobalSeq, StoreError>;

    /// A cached entity.
    async fn entity(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Option<CachedEntity>, StoreError>;

    /// Cached entities, optionally of one type, tombstones excluded.
    async fn entities(
        &self,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<CachedEntity>, StoreError>;

    /// Queue size by status.
    async fn counts(&self) -> Result<QueueCounts, StoreError>;

    /// Recorded issues, oldest first.
    async fn issues(&self) -> Result<Vec<SyncIssue>, StoreError>;

    /// Forget a recorded issue. Returns false if it did not exist.
    async fn dismiss_issue(&self, id: i64) -> Result<bool, StoreError>;

    /// Read a meta value.
    async fn meta(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write or clear a meta value.
    async fn set_meta(&self, key: &str, value: Option<&str>) -> Result<(), StoreError>;
}
