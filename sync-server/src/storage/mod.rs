//! Storage layer for the sync server.
//!
//! Holds the authoritative records, the per-family change log and the
//! idempotency log. A commit touches all three in one transaction.

mod sqlite;

pub use sqlite::SqliteStorage;

use crate::error::{StorageError, ValidationError};
use async_trait::async_trait;
use sync_types::{
    ChangeLogEntry, DeviceId, EntityId, EntityType, FamilyId, GlobalSeq, MutationEvent,
    MutationId, ServerRecord, UserId, Version,
};

/// One event to commit, with the identity that submitted it.
#[derive(Debug, Clone, Copy)]
pub struct Commit<'a> {
    /// Family the event belongs to (from the auth layer).
    pub family_id: &'a FamilyId,
    /// User who submitted it (from the auth layer).
    pub user_id: &'a UserId,
    /// Device that pushed it.
    pub device_id: DeviceId,
    /// The event itself.
    pub event: &'a MutationEvent,
    /// Server commit time, in milliseconds.
    pub committed_at: u64,
}

/// Result of a commit attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Applied now; the new change log entry.
    Committed(ChangeLogEntry),
    /// Already applied by an earlier delivery; the original acknowledgement.
    Duplicate {
        /// Version produced by the original commit.
        version: Version,
        /// Position of the original commit.
        global_seq: GlobalSeq,
    },
    /// `based_on_version` is stale; the current record.
    Conflict(ServerRecord),
    /// The event can never be applied.
    Rejected(ValidationError),
}

/// Row counts reported on the metrics endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Families with at least one commit.
    pub families: u64,
    /// Records, tombstones included.
    pub records: u64,
    /// Change log entries.
    pub changes: u64,
}

/// Trait for sync storage backends.
#[async_trait]
pub trait SyncStorage: Send + Sync {
    /// Commit one event: idempotency check, version check, apply, append.
    ///
    /// Callers serialize commits per family.
    async fn commit(&self, commit: Commit<'_>) -> Result<CommitOutcome, StorageError>;

    /// Original `(version, global_seq)` of a mutation this family already
    /// committed. `None` if it was never committed by this family.
    async fn applied(
        &self,
        family_id: &FamilyId,
        mutation_id: &MutationId,
    ) -> Result<Option<(Version, GlobalSeq)>, StorageError>;

    /// Change log entries with `global_seq > since`, ascending, at most `limit`.
    async fn changes_since(
        &self,
        family_id: &FamilyId,
        since: GlobalSeq,
        limit: u32,
    ) -> Result<Vec<ChangeLogEntry>, StorageError>;

    /// Highest committed `global_seq` of a family (zero when none).
    async fn head(&self, family_id: &FamilyId) -> Result<GlobalSeq, StorageError>;

    /// Current record of an entity, tombstones included.
    async fn record(
        &self,
        family_id: &FamilyId,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Option<ServerRecord>, StorageError>;

    /// Row counts across all families.
    async fn stats(&self) -> Result<StorageStats, StorageError>;
}
