//! Main SyncServer coordination.
//!
//! SyncServer owns storage, the notification hub and the operational
//! metrics. It validates and commits pushed batches, serves change feeds and
//! hands committed changes to the hub.

use crate::auth::AuthUser;
use crate::config::Config;
use crate::error::{StorageError, ValidationError};
use crate::hub::NotificationHub;
use crate::storage::{Commit, CommitOutcome, SqliteStorage, SyncStorage};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_core::check_payload;
use sync_types::{
    now_millis, ChangeHint, FamilyId, GlobalSeq, MutationEvent, MutationResult, Operation,
    PullRequest, PullResponse, PushRequest, PushResponse, StatusResponse, StreamFrame, Version,
};
use tokio::sync::Mutex;

/// Operational metrics for monitoring server activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Push requests handled.
    pub pushes_total: AtomicU64,
    /// Pull requests handled.
    pub pulls_total: AtomicU64,
    /// Events committed.
    pub commits_total: AtomicU64,
    /// Replayed events answered from the idempotency log.
    pub duplicates_total: AtomicU64,
    /// Events answered with a conflict.
    pub conflicts_total: AtomicU64,
    /// Events rejected by validation.
    pub rejections_total: AtomicU64,
    /// Events answered with a per-event retry.
    pub retries_total: AtomicU64,
    /// Change log entries served by pulls.
    pub entries_served: AtomicU64,
    /// Streaming sessions opened.
    pub sessions_opened: AtomicU64,
    /// Change frames queued on sessions.
    pub notifications_sent: AtomicU64,
    /// Change frames dropped on full session buffers.
    pub notifications_dropped: AtomicU64,
}

impl ServerMetrics {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Main sync server.
pub struct SyncServer {
    config: Config,
    storage: Arc<SqliteStorage>,
    hub: Arc<NotificationHub>,
    metrics: ServerMetrics,
    /// Commit serialization per family.
    family_locks: DashMap<FamilyId, Arc<Mutex<()>>>,
    started: Instant,
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("config", &self.config)
            .field("hub", &self.hub)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl SyncServer {
    /// Create a new SyncServer with the given config and storage.
    pub fn new(config: Config, storage: SqliteStorage) -> Self {
        let hub = Arc::new(NotificationHub::new(config.hub.clone()));
        Self {
            config,
            storage: Arc::new(storage),
            hub,
            metrics: ServerMetrics::default(),
            family_locks: DashMap::new(),
            started: Instant::now(),
        }
    }

    /// Time since this server was constructed.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Get the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the storage layer.
    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Get the notification hub.
    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    fn family_lock(&self, family_id: &FamilyId) -> Arc<Mutex<()>> {
        self.family_locks
            .entry(family_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Process a pushed batch.
    ///
    /// Returns one result per event, in input order. Failures are isolated
    /// per event; only an oversized batch fails as a whole. Commits for a
    /// family are serialized, and change hints go out after the family lock
    /// is released.
    pub async fn accept_batch(
        &self,
        user: &AuthUser,
        request: PushRequest,
    ) -> Result<PushResponse, ValidationError> {
        let limit = self.config.storage.max_batch_size;
        if request.events.len() > limit {
            return Err(ValidationError::BatchTooLarge {
                size: request.events.len(),
                limit,
            });
        }
        ServerMetrics::bump(&self.metrics.pushes_total, 1);

        let mut results = Vec::with_capacity(request.events.len());
        let mut hints = Vec::new();
        {
            let lock = self.family_lock(&user.family_id);
            let _guard = lock.lock().await;

            for event in &request.events {
                // A committed mutation acks from the log even if current limits
                // would now reject it.
                match self.storage.applied(&user.family_id, &event.id).await {
                    Ok(Some((version, global_seq))) => {
                        results.push(self.duplicate(event, version, global_seq));
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        results.push(self.retry(event, e));
                        continue;
                    }
                }
                if let Err(e) = self.validate(event) {
                    results.push(self.rejected(event, e));
                    continue;
                }

                let commit = Commit {
                    family_id: &user.family_id,
                    user_id: &user.user_id,
                    device_id: request.device_id,
                    event,
                    committed_at: now_millis(),
                };
                let result = match self.storage.commit(commit).await {
                    Ok(CommitOutcome::Committed(entry)) => {
                        ServerMetrics::bump(&self.metrics.commits_total, 1);
                        hints.push(ChangeHint {
                            family_id: entry.family_id.clone(),
                            global_seq: entry.global_seq,
                            entity_type: entry.entity_type,
                            entity_id: entry.entity_id.clone(),
                            origin_device: entry.origin_device,
                        });
                        MutationResult::Ack {
                            mutation_id: event.id,
                            version: entry.version,
                            global_seq: entry.global_seq,
                        }
                    }
                    Ok(CommitOutcome::Duplicate {
                        version,
                        global_seq,
                    }) => self.duplicate(event, version, global_seq),
                    Ok(CommitOutcome::Conflict(current)) => {
                        ServerMetrics::bump(&self.metrics.conflicts_total, 1);
                        tracing::debug!(
                            "Conflict on {} {}: based on {}, current {}",
                            event.entity_type,
                            event.entity_id,
                            event.based_on_version,
                            current.version
                        );
                        MutationResult::Conflict {
                            mutation_id: event.id,
                            current,
                        }
                    }
                    Ok(CommitOutcome::Rejected(e)) => self.rejected(event, e),
                    Err(e) => self.retry(event, e),
                };
                results.push(result);
            }
        }

        tracing::debug!(
            "Batch from {} in family {}: {} events, {} committed",
            request.device_id,
            user.family_id,
            request.events.len(),
            hints.len()
        );

        for hint in hints {
            let origin = hint.origin_device;
            let family_id = hint.family_id.clone();
            let delivery = self
                .hub
                .broadcast(&family_id, &StreamFrame::change(hint), Some(origin));
            ServerMetrics::bump(&self.metrics.notifications_sent, delivery.delivered as u64);
            ServerMetrics::bump(&self.metrics.notifications_dropped, delivery.dropped as u64);
        }

        Ok(PushResponse { results })
    }

    fn duplicate(
        &self,
        event: &MutationEvent,
        version: Version,
        global_seq: GlobalSeq,
    ) -> MutationResult {
        ServerMetrics::bump(&self.metrics.duplicates_total, 1);
        tracing::debug!("Replayed mutation {} acked from log", event.id);
        MutationResult::Ack {
            mutation_id: event.id,
            version,
            global_seq,
        }
    }

    fn validate(&self, event: &MutationEvent) -> Result<(), ValidationError> {
        if !event.entity_id.is_valid() {
            return Err(ValidationError::InvalidEntityId(
                event.entity_id.as_str().chars().take(64).collect(),
            ));
        }
        check_payload(event.operation, &event.payload)?;
        if event.operation == Operation::Create && event.based_on_version != Version::initial() {
            return Err(ValidationError::CreateNotInitial(event.based_on_version));
        }

        let size = serde_json::to_vec(&event.payload)
            .map(|bytes| bytes.len())
            .unwrap_or(usize::MAX);
        let limit = self.config.storage.max_payload_bytes;
        if size > limit {
            return Err(ValidationError::PayloadTooLarge { size, limit });
        }
        Ok(())
    }

    fn rejected(&self, event: &MutationEvent, error: ValidationError) -> MutationResult {
        ServerMetrics::bump(&self.metrics.rejections_total, 1);
        tracing::warn!(
            "Rejected {} {} {} ({}): {}",
            event.operation,
            event.entity_type,
            event.entity_id,
            event.id,
            error
        );
        MutationResult::Rejected {
            mutation_id: event.id,
            reason: error.to_string(),
        }
    }

    fn retry(&self, event: &MutationEvent, error: StorageError) -> MutationResult {
        ServerMetrics::bump(&self.metrics.retries_total, 1);
        tracing::error!("Commit of {} failed: {}", event.id, error);
        MutationResult::Retry {
            mutation_id: event.id,
            reason: "temporary storage failure".to_string(),
        }
    }

    /// Serve change log entries after `request.since` for the user's family.
    ///
    /// The page size is clamped to `[1, max_pull_limit]`.
    pub async fn get_changes(
        &self,
        family_id: &FamilyId,
        request: PullRequest,
    ) -> Result<PullResponse, StorageError> {
        let limit = request.limit.clamp(1, self.config.storage.max_pull_limit.max(1));

        let mut entries = self
            .storage
            .changes_since(family_id, request.since, limit.saturating_add(1))
            .await?;
        let has_more = entries.len() > limit as usize;
        entries.truncate(limit as usize);

        let cursor = entries
            .last()
            .map(|entry| entry.global_seq)
            .unwrap_or(request.since);

        ServerMetrics::bump(&self.metrics.pulls_total, 1);
        ServerMetrics::bump(&self.metrics.entries_served, entries.len() as u64);
        tracing::debug!(
            "Pull for family {} since {}: {} entries, cursor {}, more={}",
            family_id,
            request.since,
            entries.len(),
            cursor,
            has_more
        );

        Ok(PullResponse {
            entries,
            cursor,
            has_more,
        })
    }

    /// Diagnostic snapshot of a family.
    pub async fn status(&self, family_id: &FamilyId) -> Result<StatusResponse, StorageError> {
        let head = self.storage.head(family_id).await?;
        Ok(StatusResponse {
            family_id: family_id.clone(),
            head,
            sessions: self.hub.family_sessions(family_id).len(),
            server_time: now_millis(),
        })
    }

    /// Highest committed sequence of a family.
    pub async fn head(&self, family_id: &FamilyId) -> Result<GlobalSeq, StorageError> {
        self.storage.head(family_id).await
    }

    /// Record a newly opened streaming session.
    pub fn session_opened(&self) {
        ServerMetrics::bump(&self.metrics.sessions_opened, 1);
    }
}
