//! SyncClient - the main interface for carelog sync.
//!
//! This module provides [`SyncClient`], the primary API for applications
//! to record child-care events offline and reconcile them with the server.
//!
//! # Architecture
//!
//! SyncClient uses a pure state machine (from sync-core) for lifecycle logic
//! and interprets the actions to perform actual I/O via the Transport and
//! LocalStore traits.
//!
//! ```text
//! Application → SyncClient → LocalStore (optimistic, durable)
//!                   ↓
//!               Transport → Network
//!                   ↓
//!              sync-core (state machine, merge, conflict rebase)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sync_client::{ClientConfig, MockTransport, SqliteLocalStore, SyncClient};
//!
//! let store = SqliteLocalStore::in_memory().await?;
//! let client = SyncClient::open(ClientConfig::new(device_id), MockTransport::new(), store).await?;
//!
//! // Works offline: applied to the cache and queued.
//! client.record(EntityType::Feeding, json!({"ml": 120})).await?;
//!
//! client.set_online(true).await;
//! let report = client.sync().await?;
//! ```

use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use sync_core::{
    check_payload, resolve_conflict, Action, CursorStep, CursorTracker, Event, MergeError,
    PendingChange, Resolution, SyncEvent, SyncState,
};
use sync_types::{
    now_millis, ChangeHint, EntityId, EntityType, GlobalSeq, MutationEvent, MutationId,
    MutationResult, Operation, PullRequest, PushRequest, Version,
};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, Notify};

use crate::config::ClientConfig;
use crate::store::{
    CachedEntity, LocalStore, NewIssue, PendingEvent, StoreError, SyncIssue, META_LAST_ERROR,
    META_LAST_SYNC_AT,
};
use crate::transport::{Transport, TransportError};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The pending queue is at its size cap.
    #[error("pending queue is full ({limit} events)")]
    QueueFull {
        /// Configured cap.
        limit: u64,
    },

    /// No connectivity; the change stays queued.
    #[error("offline")]
    Offline,

    /// Sync is paused until re-authentication.
    #[error("sync paused: re-authentication required")]
    AuthPaused,

    /// Update or delete of an entity this device does not know.
    #[error("{entity_type} {entity_id} not found")]
    NotFound {
        /// Kind of entity.
        entity_type: EntityType,
        /// Entity identifier.
        entity_id: EntityId,
    },

    /// Create of an entity that already exists.
    #[error("{entity_type} {entity_id} already exists")]
    AlreadyExists {
        /// Kind of entity.
        entity_type: EntityType,
        /// Entity identifier.
        entity_id: EntityId,
    },

    /// Payload has the wrong shape for its operation.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] MergeError),

    /// Entity id is empty, too long or contains control characters.
    #[error("invalid entity id: {0:?}")]
    InvalidEntityId(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Outcome of one push cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    /// Events committed by the server.
    pub acked: usize,
    /// Events re-based after a conflict (resubmitted in a later round).
    pub rebased: usize,
    /// Events discarded after an irreconcilable conflict.
    pub conflicts: usize,
    /// Events rejected as invalid.
    pub rejected: usize,
    /// Events the server asked to retry.
    pub retried: usize,
    /// Events that reached the attempt ceiling.
    pub stalled: usize,
}

/// Outcome of one pull cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    /// Entries applied to the local store.
    pub applied: usize,
    /// Entries already applied before.
    pub duplicates: usize,
    /// Cursor after the cycle.
    pub cursor: GlobalSeq,
    /// Set when an entry did not continue the cursor: the missing sequence.
    pub gap: Option<GlobalSeq>,
}

/// Outcome of a full sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Events that aged out to dead-letter.
    pub expired: usize,
    /// Push half.
    pub push: PushReport,
    /// Pull half.
    pub pull: PullReport,
}

/// Observable sync status, computed from local state only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    /// Lifecycle state.
    pub state: SyncState,
    /// Events waiting to be pushed.
    pub pending: u64,
    /// Events waiting for a manual retry.
    pub stalled: u64,
    /// Events that aged out.
    pub dead_letter: u64,
    /// Recorded conflicts, rejections and dead-letters.
    pub issues: usize,
    /// Last successful cycle, in milliseconds.
    pub last_synced_at: Option<u64>,
    /// Last cycle error.
    pub last_error: Option<String>,
    /// Last applied family sequence.
    pub cursor: GlobalSeq,
    /// Highest family sequence heard of.
    pub head: GlobalSeq,
}

/// The main sync client.
///
/// Manages the local store, the lifecycle state machine and push/pull cycles.
/// Cycles are serialized; `enqueue` never waits on the network.
pub struct SyncClient<T: Transport, S: LocalStore> {
    config: ClientConfig,
    transport: T,
    store: S,
    state: Mutex<SyncState>,
    cursor: Mutex<CursorTracker>,
    cycle: Mutex<()>,
    retry_after: Mutex<Option<Duration>>,
    states: watch::Sender<SyncState>,
    events: broadcast::Sender<SyncEvent>,
    wake: Notify,
}

impl<T: Transport, S: LocalStore> SyncClient<T, S> {
    /// Open a client over an existing store, resuming from its cursor.
    pub async fn open(config: ClientConfig, transport: T, store: S) -> Result<Self, ClientError> {
        let cursor = store.cursor().await?;
        let (states, _) = watch::channel(SyncState::new());
        let (events, _) = broadcast::channel(64);

        tracing::debug!("Opened sync client for device {} at cursor {}", config.device_id, cursor);

        Ok(Self {
            config,
            transport,
            store,
            state: Mutex::new(SyncState::new()),
            cursor: Mutex::new(CursorTracker::with_cursor(cursor)),
            cycle: Mutex::new(()),
            retry_after: Mutex::new(None),
            states,
            events,
            wake: Notify::new(),
        })
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The underlying local store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Watch lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.states.subscribe()
    }

    /// Receive lifecycle events (online, synced, failures).
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> SyncState {
        self.state.lock().await.clone()
    }

    /// Wait until new local work was queued.
    pub async fn work_queued(&self) {
        self.wake.notified().await;
    }

    // ===========================================
    // Local mutations
    // ===========================================

    /// Record a mutation: validate, apply to the cache and queue it.
    ///
    /// Works offline and never touches the network.
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: EntityId,
        operation: Operation,
        payload: Value,
    ) -> Result<PendingEvent, ClientError> {
        if !entity_id.is_valid() {
            return Err(ClientError::InvalidEntityId(entity_id.as_str().to_string()));
        }
        check_payload(operation, &payload)?;

        let counts = self.store.counts().await?;
        if counts.total() >= self.config.max_pending {
            return Err(ClientError::QueueFull {
                limit: self.config.max_pending,
            });
        }

        let cached = self.store.entity(entity_type, &entity_id).await?;
        let live = cached.as_ref().is_some_and(|e| !e.deleted);
        match operation {
            Operation::Create if cached.is_some() => {
                return Err(ClientError::AlreadyExists {
                    entity_type,
                    entity_id,
                });
            }
            Operation::Update | Operation::Delete if !live => {
                return Err(ClientError::NotFound {
                    entity_type,
                    entity_id,
                });
            }
            _ => {}
        }

        let event = MutationEvent::new(
            entity_type,
            entity_id,
            operation,
            payload,
            Version::initial(),
        );
        let queued = self.store.enqueue(event).await?;
        self.wake.notify_one();
        Ok(queued)
    }

    /// Record a new entity under a fresh id.
    pub async fn record(
        &self,
        entity_type: EntityType,
        fields: Value,
    ) -> Result<PendingEvent, ClientError> {
        self.enqueue(entity_type, EntityId::random(), Operation::Create, fields)
            .await
    }

    /// A cached entity as shown to the user.
    pub async fn entity(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Option<CachedEntity>, ClientError> {
        Ok(self.store.entity(entity_type, entity_id).await?)
    }

    /// Cached live entities, optionally of one type.
    pub async fn entities(
        &self,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<CachedEntity>, ClientError> {
        Ok(self.store.entities(entity_type).await?)
    }

    // ===========================================
    // Lifecycle signals
    // ===========================================

    /// Report a connectivity change. Returns true if a cycle should run.
    pub async fn set_online(&self, online: bool) -> bool {
        let event = if online {
            Event::WentOnline
        } else {
            Event::WentOffline
        };
        self.transition(event).await
    }

    /// Feed the retry timer. Returns true if a cycle should run.
    pub async fn retry_timer(&self) -> bool {
        self.transition(Event::RetryTimer).await
    }

    /// Resume after new credentials. Returns true if a cycle should run.
    pub async fn reauthenticated(&self) -> bool {
        self.transition(Event::Reauthenticated).await
    }

    /// Note a change hint. Returns true if the device is now behind.
    pub async fn note_hint(&self, hint: &ChangeHint) -> bool {
        if hint.origin_device == self.config.device_id {
            return false;
        }
        let mut cursor = self.cursor.lock().await;
        cursor.observe(hint.global_seq);
        cursor.is_behind()
    }

    /// Delay requested by the last failed cycle, if a retry is pending.
    pub async fn retry_after(&self) -> Option<Duration> {
        *self.retry_after.lock().await
    }

    async fn transition(&self, event: Event) -> bool {
        let actions = {
            let mut state = self.state.lock().await;
            let (next, actions) = state.clone().on_event(event, &self.config.retry);
            if *state != next {
                tracing::debug!("Sync state {} -> {}", state.label(), next.label());
            }
            *state = next.clone();
            self.states.send_replace(next);
            actions
        };

        let mut run = false;
        for action in actions {
            match action {
                Action::RunSync => run = true,
                Action::StartRetryTimer { delay } => {
                    *self.retry_after.lock().await = Some(delay);
                }
                Action::CancelRetry => {
                    *self.retry_after.lock().await = None;
                }
                Action::Emit(event) => {
                    match &event {
                        SyncEvent::Online => tracing::info!("Online"),
                        SyncEvent::Offline => tracing::info!("Offline; changes stay queued"),
                        SyncEvent::Synced { pending } => {
                            tracing::debug!("Sync complete ({} still queued)", pending)
                        }
                        SyncEvent::SyncFailed { attempt, error } => {
                            tracing::warn!("Sync failed (attempt {}): {}", attempt, error)
                        }
                        SyncEvent::AuthRequired => {
                            tracing::warn!("Server rejected credentials; sync paused")
                        }
                    }
                    // No receivers is fine.
                    let _ = self.events.send(event);
                }
            }
        }
        run
    }

    // ===========================================
    // Sync cycles
    // ===========================================

    /// Run one full cycle: expire stale events, push, then pull.
    pub async fn sync(&self) -> Result<SyncReport, ClientError> {
        let _cycle = self.cycle.lock().await;
        self.begin_cycle().await?;

        match self.run_cycle().await {
            Ok(report) => {
                let counts = self.store.counts().await?;
                let pending = (counts.pending + counts.stalled) as usize;
                self.transition(Event::SyncSucceeded { pending }).await;
                self.store
                    .set_meta(META_LAST_SYNC_AT, Some(&now_millis().to_string()))
                    .await?;
                self.store.set_meta(META_LAST_ERROR, None).await?;
                Ok(report)
            }
            Err(e) => {
                self.fail_cycle(&e).await;
                Err(e)
            }
        }
    }

    async fn begin_cycle(&self) -> Result<(), ClientError> {
        let state = self.state.lock().await.clone();
        match state {
            SyncState::Offline => Err(ClientError::Offline),
            SyncState::AuthRequired => Err(ClientError::AuthPaused),
            SyncState::Syncing { .. } => Ok(()),
            SyncState::Idle | SyncState::Synced | SyncState::Backoff { .. } => {
                self.transition(Event::SyncRequested).await;
                Ok(())
            }
        }
    }

    async fn run_cycle(&self) -> Result<SyncReport, ClientError> {
        let expired = self.expire_stale().await?;
        let push = self.push_cycle().await?;
        let pull = self.pull_cycle().await?;
        Ok(SyncReport {
            expired,
            push,
            pull,
        })
    }

    async fn fail_cycle(&self, error: &ClientError) {
        let event = match error {
            ClientError::Transport(e) if e.is_auth() => Event::AuthFailed,
            other => Event::TransientFailure {
                error: other.to_string(),
            },
        };
        self.transition(event).await;

        if let Err(e) = self
            .store
            .set_meta(META_LAST_ERROR, Some(&error.to_string()))
            .await
        {
            tracing::error!("Failed to record sync error: {}", e);
        }
    }

    async fn request<R, F>(&self, request: F) -> Result<R, TransportError>
    where
        F: Future<Output = Result<R, TransportError>>,
    {
        tokio::time::timeout(self.config.request_timeout, request)
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    /// Push queued events until the queue is drained or stops moving.
    pub async fn push_cycle(&self) -> Result<PushReport, ClientError> {
        let mut report = PushReport::default();

        for _ in 0..self.config.max_push_rounds {
            let batch = self.store.next_batch(self.config.push_batch_size).await?;
            if batch.is_empty() {
                break;
            }
            if !self.push_batch(batch, &mut report).await? {
                break;
            }
        }

        if report != PushReport::default() {
            tracing::debug!(
                "Push: {} acked, {} rebased, {} conflicts, {} rejected, {} retried",
                report.acked,
                report.rebased,
                report.conflicts,
                report.rejected,
                report.retried
            );
        }
        Ok(report)
    }

    /// Push one batch. Returns whether any event left the pending state.
    async fn push_batch(
        &self,
        batch: Vec<PendingEvent>,
        report: &mut PushReport,
    ) -> Result<bool, ClientError> {
        let ids: Vec<MutationId> = batch.iter().map(|p| p.event.id).collect();
        let request = PushRequest {
            device_id: self.config.device_id,
            events: batch.iter().map(|p| p.event.clone()).collect(),
        };

        let response = match self.request(self.transport.push(request)).await {
            Ok(response) => response,
            Err(e) => {
                if e.counts_attempt() && !e.is_auth() {
                    report.stalled += self.record_failure(&ids, &e.to_string()).await?;
                }
                return Err(e.into());
            }
        };

        if response.results.len() != batch.len() {
            report.stalled += self
                .record_failure(&ids, "malformed push response")
                .await?;
            return Err(ClientError::Protocol(format!(
                "push returned {} results for {} events",
                response.results.len(),
                batch.len()
            )));
        }
        if let Some((pending, result)) = batch
            .iter()
            .zip(&response.results)
            .find(|(p, r)| p.event.id != r.mutation_id())
        {
            report.stalled += self
                .record_failure(&ids, "malformed push response")
                .await?;
            return Err(ClientError::Protocol(format!(
                "result for {} out of order (expected {})",
                result.mutation_id(),
                pending.event.id
            )));
        }

        let mut progressed = false;
        for (pending, result) in batch.iter().zip(response.results) {
            let id = pending.event.id;
            match result {
                MutationResult::Ack {
                    version,
                    global_seq,
                    ..
                } => {
                    self.store.acknowledge(&id, version).await?;
                    self.cursor.lock().await.observe(global_seq);
                    report.acked += 1;
                    progressed = true;
                }
                MutationResult::Conflict { current, .. } => {
                    let change = PendingChange {
                        operation: pending.event.operation,
                        payload: &pending.event.payload,
                        base_fields: pending.base_fields.as_ref(),
                        client_timestamp: pending.event.client_timestamp,
                    };
                    match resolve_conflict(&change, &current, self.config.conflict_policy) {
                        Resolution::Rebase { based_on_version } => {
                            tracing::debug!(
                                "Rebasing {} {} onto {}",
                                pending.event.entity_type,
                                pending.event.entity_id,
                                based_on_version
                            );
                            self.store.rebase(&id, &current).await?;
                            report.rebased += 1;
                        }
                        Resolution::Satisfied => {
                            self.store.drop_event(&id, Some(&current), None).await?;
                        }
                        Resolution::Discard(reason) => {
                            tracing::warn!(
                                "Discarding {} of {} {}: {}",
                                pending.event.operation,
                                pending.event.entity_type,
                                pending.event.entity_id,
                                reason
                            );
                            self.store
                                .drop_event(
                                    &id,
                                    Some(&current),
                                    Some(NewIssue::conflict(reason.to_string())),
                                )
                                .await?;
                            report.conflicts += 1;
                        }
                    }
                    progressed = true;
                }
                MutationResult::Rejected { reason, .. } => {
                    tracing::warn!(
                        "Server rejected {} of {} {}: {}",
                        pending.event.operation,
                        pending.event.entity_type,
                        pending.event.entity_id,
                        reason
                    );
                    self.store
                        .drop_event(&id, None, Some(NewIssue::rejected(reason)))
                        .await?;
                    report.rejected += 1;
                    progressed = true;
                }
                MutationResult::Retry { reason, .. } => {
                    report.stalled += self.record_failure(&[id], &reason).await?;
                    report.retried += 1;
                }
            }
        }

        Ok(progressed)
    }

    async fn record_failure(&self, ids: &[MutationId], error: &str) -> Result<usize, ClientError> {
        let stalled = self
            .store
            .record_failure(ids, error, self.config.max_attempts)
            .await?;
        for id in &stalled {
            tracing::warn!(
                "Event {} stalled after {} attempts: {}",
                id,
                self.config.max_attempts,
                error
            );
        }
        Ok(stalled.len())
    }

    /// Pull and apply every change after the cursor, page by page.
    pub async fn pull_cycle(&self) -> Result<PullReport, ClientError> {
        let mut report = PullReport::default();
        let mut tracker = self.cursor.lock().await;

        loop {
            let since = tracker.cursor();
            let response = self
                .request(self.transport.pull(PullRequest {
                    since,
                    limit: self.config.pull_limit,
                }))
                .await?;
            tracker.observe(response.cursor);

            for entry in &response.entries {
                match tracker.offer(entry.global_seq) {
                    CursorStep::Apply => {
                        if let Err(e) = self.store.apply_remote(entry).await {
                            let persisted = self.store.cursor().await.unwrap_or(since);
                            tracker.reset(persisted);
                            return Err(e.into());
                        }
                        report.applied += 1;
                    }
                    CursorStep::Duplicate => report.duplicates += 1,
                    CursorStep::Gap { expected } => {
                        tracing::warn!(
                            "Change log gap: expected {}, got {}",
                            expected,
                            entry.global_seq
                        );
                        report.gap = Some(expected);
                        report.cursor = tracker.cursor();
                        return Ok(report);
                    }
                }
            }

            if !response.has_more || tracker.cursor() == since {
                break;
            }
        }

        report.cursor = tracker.cursor();
        if report.applied > 0 {
            tracing::debug!("Pull: applied {} entries, cursor {}", report.applied, report.cursor);
        }
        Ok(report)
    }

    // ===========================================
    // Queue maintenance and status
    // ===========================================

    /// Move events older than the configured age to dead-letter.
    pub async fn expire_stale(&self) -> Result<usize, ClientError> {
        let age = self.config.max_pending_age.as_millis() as u64;
        let cutoff = now_millis().saturating_sub(age);
        let expired = self.store.expire_pending(cutoff).await?;
        for id in &expired {
            tracing::warn!("Event {} moved to dead-letter", id);
        }
        Ok(expired.len())
    }

    /// Put stalled and dead-lettered events back in the queue.
    pub async fn retry_stalled(&self) -> Result<u64, ClientError> {
        let count = self.store.retry_stalled().await?;
        if count > 0 {
            tracing::info!("Requeued {} stalled events", count);
            self.wake.notify_one();
        }
        Ok(count)
    }

    /// Give up on a queued event; the cache reverts to the server state.
    pub async fn discard(&self, id: &MutationId) -> Result<bool, ClientError> {
        Ok(self.store.drop_event(id, None, None).await?)
    }

    /// Recorded conflicts, rejections and dead-letters.
    pub async fn conflicts(&self) -> Result<Vec<SyncIssue>, ClientError> {
        Ok(self.store.issues().await?)
    }

    /// Forget a recorded issue.
    pub async fn dismiss_issue(&self, id: i64) -> Result<bool, ClientError> {
        Ok(self.store.dismiss_issue(id).await?)
    }

    /// Status snapshot; never touches the network.
    pub async fn status(&self) -> Result<SyncStatus, ClientError> {
        let counts = self.store.counts().await?;
        let issues = self.store.issues().await?.len();
        let last_synced_at = self
            .store
            .meta(META_LAST_SYNC_AT)
            .await?
            .and_then(|v| v.parse().ok());
        let last_error = self.store.meta(META_LAST_ERROR).await?;
        let (cursor, head) = {
            let tracker = self.cursor.lock().await;
            (tracker.cursor(), tracker.head())
        };

        Ok(SyncStatus {
            state: self.state().await,
            pending: counts.pending,
            stalled: counts.stalled,
            dead_letter: counts.dead_letter,
            issues,
            last_synced_at,
            last_error,
            cursor,
            head,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IssueKind, QueueStatus, SqliteLocalStore};
    use crate::transport::MockTransport;
    use serde_json::json;
    use sync_core::ConflictPolicy;
    use sync_types::{
        ChangeLogEntry, DeviceId, FamilyId, PullResponse, PushResponse, ServerRecord, UserId,
    };

    type TestClient = SyncClient<MockTransport, SqliteLocalStore>;

    async fn client_with(config: ClientConfig) -> (TestClient, MockTransport, SqliteLocalStore) {
        let transport = MockTransport::new();
        let store = SqliteLocalStore::in_memory().await.unwrap();
        let client = SyncClient::open(config, transport.clone(), store.clone())
            .await
            .unwrap();
        (client, transport, store)
    }

    async fn online_client() -> (TestClient, MockTransport, SqliteLocalStore) {
        let (client, transport, store) = client_with(ClientConfig::new(DeviceId::new())).await;
        client.set_online(true).await;
        (client, transport, store)
    }

    fn entry(seq: u64, entity_id: &str, version: u64, fields: Value) -> ChangeLogEntry {
        ChangeLogEntry {
            family_id: FamilyId::new("smith"),
            global_seq: GlobalSeq::new(seq),
            mutation_id: MutationId::new(),
            entity_type: EntityType::Feeding,
            entity_id: EntityId::new(entity_id),
            operation: if version == 1 {
                Operation::Create
            } else {
                Operation::Update
            },
            payload: fields.clone(),
            version: Version::new(version),
            fields,
            deleted: false,
            user_id: UserId::new("bob"),
            origin_device: DeviceId::new(),
            client_timestamp: 1,
            committed_at: 2,
        }
    }

    fn server_record(entity_id: &str, version: u64, fields: Value) -> ServerRecord {
        ServerRecord {
            family_id: FamilyId::new("smith"),
            entity_type: EntityType::Feeding,
            entity_id: EntityId::new(entity_id),
            version: Version::new(version),
            fields,
            deleted: false,
            updated_at: 5,
            updated_by: DeviceId::new(),
            client_timestamp: 5,
        }
    }

    fn page(entries: Vec<ChangeLogEntry>, has_more: bool) -> PullResponse {
        let cursor = entries
            .last()
            .map(|e| e.global_seq)
            .unwrap_or_else(GlobalSeq::zero);
        PullResponse {
            entries,
            cursor,
            has_more,
        }
    }

    // ===========================================
    // Offline behaviour
    // ===========================================

    #[tokio::test]
    async fn enqueue_offline_never_touches_network() {
        let (client, transport, _) = client_with(ClientConfig::new(DeviceId::new())).await;

        let queued = client
            .record(EntityType::Feeding, json!({"ml": 90}))
            .await
            .unwrap();

        assert!(transport.pushes().is_empty());
        let cached = client
            .entity(EntityType::Feeding, &queued.event.entity_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.fields, json!({"ml": 90}));

        assert!(matches!(client.sync().await, Err(ClientError::Offline)));
        let status = client.status().await.unwrap();
        assert_eq!(status.pending, 1);
        assert_eq!(status.state, SyncState::Offline);
    }

    #[tokio::test]
    async fn reconnect_pushes_and_acknowledges() {
        let (client, transport, _) = client_with(ClientConfig::new(DeviceId::new())).await;
        let queued = client
            .enqueue(
                EntityType::Feeding,
                EntityId::new("f1"),
                Operation::Create,
                json!({"ml": 90}),
            )
            .await
            .unwrap();

        assert!(client.set_online(true).await);
        let report = client.sync().await.unwrap();

        assert_eq!(report.push.acked, 1);
        assert_eq!(transport.pushes().len(), 1);
        assert_eq!(transport.pushes()[0].events[0].id, queued.event.id);

        let cached = client
            .entity(EntityType::Feeding, &EntityId::new("f1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.version, Version::new(1));
        assert!(!cached.has_pending);

        let status = client.status().await.unwrap();
        assert_eq!(status.state, SyncState::Synced);
        assert_eq!(status.pending, 0);
        assert!(status.last_synced_at.is_some());
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn consecutive_edits_push_in_order() {
        let (client, transport, _) = online_client().await;
        let id = EntityId::new("f1");
        client
            .enqueue(EntityType::Feeding, id.clone(), Operation::Create, json!({"ml": 1}))
            .await
            .unwrap();
        client
            .enqueue(EntityType::Feeding, id.clone(), Operation::Update, json!({"ml": 2}))
            .await
            .unwrap();

        let report = client.sync().await.unwrap();

        assert_eq!(report.push.acked, 2);
        let pushes = transport.pushes();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[0].events[0].operation, Operation::Create);
        assert_eq!(pushes[1].events[0].based_on_version, Version::new(1));

        let cached = client.entity(EntityType::Feeding, &id).await.unwrap().unwrap();
        assert_eq!(cached.version, Version::new(2));
        assert_eq!(cached.fields, json!({"ml": 2}));
    }

    // ===========================================
    // Validation
    // ===========================================

    #[tokio::test]
    async fn enqueue_validates_locally() {
        let (client, _, _) = online_client().await;

        let missing = client
            .enqueue(
                EntityType::Sleep,
                EntityId::new("nope"),
                Operation::Update,
                json!({"minutes": 30}),
            )
            .await;
        assert!(matches!(missing, Err(ClientError::NotFound { .. })));

        let bad_payload = client
            .enqueue(EntityType::Sleep, EntityId::new("s1"), Operation::Create, json!(42))
            .await;
        assert!(matches!(bad_payload, Err(ClientError::InvalidPayload(_))));

        let bad_id = client
            .enqueue(EntityType::Sleep, EntityId::new(""), Operation::Create, json!({}))
            .await;
        assert!(matches!(bad_id, Err(ClientError::InvalidEntityId(_))));

        client
            .enqueue(EntityType::Sleep, EntityId::new("s1"), Operation::Create, json!({}))
            .await
            .unwrap();
        let duplicate = client
            .enqueue(EntityType::Sleep, EntityId::new("s1"), Operation::Create, json!({}))
            .await;
        assert!(matches!(duplicate, Err(ClientError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn queue_cap_is_enforced() {
        let (client, _, _) =
            client_with(ClientConfig::new(DeviceId::new()).with_max_pending(2)).await;

        client.record(EntityType::Note, json!({"text": "a"})).await.unwrap();
        client.record(EntityType::Note, json!({"text": "b"})).await.unwrap();
        let result = client.record(EntityType::Note, json!({"text": "c"})).await;

        assert!(matches!(result, Err(ClientError::QueueFull { limit: 2 })));
    }

    // ===========================================
    // Conflicts and rejections
    // ===========================================

    #[tokio::test]
    async fn conflict_on_untouched_field_rebases_and_resubmits() {
        let (client, transport, store) = online_client().await;
        store
            .apply_remote(&entry(1, "f1", 1, json!({"ml": 90, "side": "left"})))
            .await
            .unwrap();
        let edit = client
            .enqueue(
                EntityType::Feeding,
                EntityId::new("f1"),
                Operation::Update,
                json!({"ml": 120}),
            )
            .await
            .unwrap();

        transport.queue_push(PushResponse {
            results: vec![MutationResult::Conflict {
                mutation_id: edit.event.id,
                current: server_record("f1", 2, json!({"ml": 90, "side": "right"})),
            }],
        });

        let report = client.sync().await.unwrap();

        assert_eq!(report.push.rebased, 1);
        assert_eq!(report.push.acked, 1);
        let pushes = transport.pushes();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[1].events[0].based_on_version, Version::new(2));

        let cached = client
            .entity(EntityType::Feeding, &EntityId::new("f1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.version, Version::new(3));
        assert_eq!(cached.fields, json!({"ml": 120, "side": "right"}));
    }

    #[tokio::test]
    async fn clashing_conflict_is_discarded_and_surfaced() {
        let (client, transport, store) = online_client().await;
        store
            .apply_remote(&entry(1, "f1", 1, json!({"ml": 90})))
            .await
            .unwrap();
        let edit = client
            .enqueue(
                EntityType::Feeding,
                EntityId::new("f1"),
                Operation::Update,
                json!({"ml": 120}),
            )
            .await
            .unwrap();

        transport.queue_push(PushResponse {
            results: vec![MutationResult::Conflict {
                mutation_id: edit.event.id,
                current: server_record("f1", 2, json!({"ml": 100})),
            }],
        });

        let report = client.sync().await.unwrap();
        assert_eq!(report.push.conflicts, 1);

        let cached = client
            .entity(EntityType::Feeding, &EntityId::new("f1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.fields, json!({"ml": 100}));

        let issues = client.conflicts().await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::Conflict);
        assert!(issues[0].reason.contains("ml"));
        assert_eq!(client.status().await.unwrap().issues, 1);
    }

    #[tokio::test]
    async fn last_writer_wins_keeps_newer_local_change() {
        let config = ClientConfig::new(DeviceId::new())
            .with_conflict_policy(ConflictPolicy::LastWriterWins);
        let (client, transport, store) = client_with(config).await;
        client.set_online(true).await;
        store
            .apply_remote(&entry(1, "f1", 1, json!({"ml": 90})))
            .await
            .unwrap();
        let edit = client
            .enqueue(
                EntityType::Feeding,
                EntityId::new("f1"),
                Operation::Update,
                json!({"ml": 120}),
            )
            .await
            .unwrap();

        // The server change carries an older client timestamp.
        transport.queue_push(PushResponse {
            results: vec![MutationResult::Conflict {
                mutation_id: edit.event.id,
                current: server_record("f1", 2, json!({"ml": 100})),
            }],
        });

        let report = client.sync().await.unwrap();
        assert_eq!(report.push.rebased, 1);
        assert_eq!(report.push.acked, 1);
        assert!(client.conflicts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejection_drops_event_and_reverts_cache() {
        let (client, transport, _) = online_client().await;
        let queued = client
            .record(EntityType::Medication, json!({"dose": -1}))
            .await
            .unwrap();

        transport.queue_push(PushResponse {
            results: vec![MutationResult::Rejected {
                mutation_id: queued.event.id,
                reason: "dose must be positive".into(),
            }],
        });

        let report = client.sync().await.unwrap();
        assert_eq!(report.push.rejected, 1);
        assert!(client
            .entity(EntityType::Medication, &queued.event.entity_id)
            .await
            .unwrap()
            .is_none());

        let issues = client.conflicts().await.unwrap();
        assert_eq!(issues[0].kind, IssueKind::Rejected);
        assert!(client.dismiss_issue(issues[0].id).await.unwrap());
    }

    #[tokio::test]
    async fn mismatched_results_are_a_protocol_error() {
        let (client, transport, _) = online_client().await;
        client.record(EntityType::Note, json!({"text": "a"})).await.unwrap();

        transport.queue_push(PushResponse { results: vec![] });

        let result = client.sync().await;
        assert!(matches!(result, Err(ClientError::Protocol(_))));
        assert!(matches!(client.state().await, SyncState::Backoff { .. }));
    }

    // ===========================================
    // Failures, retries and stalling
    // ===========================================

    #[tokio::test]
    async fn timeout_backs_off_and_counts_attempt() {
        let (client, transport, _) = online_client().await;
        let queued = client.record(EntityType::Note, json!({"text": "a"})).await.unwrap();

        transport.fail_next_push(TransportError::Timeout);
        let result = client.sync().await;

        assert!(matches!(
            result,
            Err(ClientError::Transport(TransportError::Timeout))
        ));
        assert!(matches!(
            client.state().await,
            SyncState::Backoff { attempt: 1, .. }
        ));
        assert!(client.retry_after().await.is_some());

        let pending = client
            .store()
            .pending_event(&queued.event.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.attempts, 1);
        assert!(client.status().await.unwrap().last_error.is_some());

        // Retry timer resumes and the default mock ack succeeds.
        assert!(client.retry_timer().await);
        client.sync().await.unwrap();
        assert_eq!(client.status().await.unwrap().pending, 0);
        assert!(client.retry_after().await.is_none());
    }

    #[tokio::test]
    async fn connection_failures_do_not_count_attempts() {
        let (client, transport, _) = online_client().await;
        let queued = client.record(EntityType::Note, json!({"text": "a"})).await.unwrap();

        transport.fail_next_push(TransportError::ConnectionFailed("refused".into()));
        assert!(client.sync().await.is_err());

        let pending = client
            .store()
            .pending_event(&queued.event.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.attempts, 0);
    }

    #[tokio::test]
    async fn attempt_ceiling_stalls_until_manual_retry() {
        let config = ClientConfig::new(DeviceId::new()).with_max_attempts(2);
        let (client, transport, _) = client_with(config).await;
        client.set_online(true).await;
        let queued = client.record(EntityType::Note, json!({"text": "a"})).await.unwrap();

        for _ in 0..2 {
            transport.queue_push(PushResponse {
                results: vec![MutationResult::Retry {
                    mutation_id: queued.event.id,
                    reason: "database busy".into(),
                }],
            });
            client.sync().await.unwrap();
        }

        let stalled = client
            .store()
            .pending_event(&queued.event.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stalled.status, QueueStatus::Stalled);
        let status = client.status().await.unwrap();
        assert_eq!(status.stalled, 1);
        assert_eq!(status.state, SyncState::Idle);

        // Stalled events are not pushed again on their own.
        let pushes_before = transport.pushes().len();
        client.sync().await.unwrap();
        assert_eq!(transport.pushes().len(), pushes_before);

        assert_eq!(client.retry_stalled().await.unwrap(), 1);
        let report = client.sync().await.unwrap();
        assert_eq!(report.push.acked, 1);
    }

    #[tokio::test]
    async fn unauthorized_pauses_sync() {
        let (client, transport, _) = online_client().await;
        client.record(EntityType::Note, json!({"text": "a"})).await.unwrap();

        transport.fail_next_push(TransportError::Unauthorized);
        assert!(client.sync().await.is_err());
        assert_eq!(client.state().await, SyncState::AuthRequired);
        assert!(matches!(client.sync().await, Err(ClientError::AuthPaused)));

        assert!(client.reauthenticated().await);
        client.sync().await.unwrap();
        assert_eq!(client.status().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn stale_events_move_to_dead_letter() {
        let config = ClientConfig::new(DeviceId::new()).with_max_pending_age(Duration::ZERO);
        let (client, transport, _) = client_with(config).await;
        let queued = client.record(EntityType::Note, json!({"text": "a"})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        client.set_online(true).await;
        let report = client.sync().await.unwrap();

        assert_eq!(report.expired, 1);
        assert!(transport.pushes().is_empty());
        assert!(client
            .entity(EntityType::Note, &queued.event.entity_id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(client.status().await.unwrap().dead_letter, 1);
    }

    #[tokio::test]
    async fn discard_reverts_local_change() {
        let (client, _, _) = client_with(ClientConfig::new(DeviceId::new())).await;
        let queued = client.record(EntityType::Note, json!({"text": "a"})).await.unwrap();

        assert!(client.discard(&queued.event.id).await.unwrap());
        assert!(!client.discard(&queued.event.id).await.unwrap());
        assert_eq!(client.status().await.unwrap().pending, 0);
    }

    // ===========================================
    // Pull
    // ===========================================

    #[tokio::test]
    async fn pull_applies_pages_in_order() {
        let (client, transport, _) = online_client().await;
        transport.queue_pull(page(
            vec![
                entry(1, "f1", 1, json!({"ml": 1})),
                entry(2, "f2", 1, json!({"ml": 2})),
            ],
            true,
        ));
        transport.queue_pull(page(vec![entry(3, "f1", 2, json!({"ml": 3}))], false));

        let report = client.sync().await.unwrap();

        assert_eq!(report.pull.applied, 3);
        assert_eq!(report.pull.cursor, GlobalSeq::new(3));
        let pulls = transport.pulls();
        assert_eq!(pulls[0].since, GlobalSeq::zero());
        assert_eq!(pulls[1].since, GlobalSeq::new(2));

        let f1 = client
            .entity(EntityType::Feeding, &EntityId::new("f1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f1.fields, json!({"ml": 3}));
        assert_eq!(client.store().cursor().await.unwrap(), GlobalSeq::new(3));
    }

    #[tokio::test]
    async fn pull_stops_at_gap() {
        let (client, transport, _) = online_client().await;
        transport.queue_pull(page(
            vec![
                entry(1, "f1", 1, json!({"ml": 1})),
                entry(3, "f2", 1, json!({"ml": 3})),
            ],
            false,
        ));

        let report = client.sync().await.unwrap();

        assert_eq!(report.pull.applied, 1);
        assert_eq!(report.pull.gap, Some(GlobalSeq::new(2)));
        assert_eq!(client.store().cursor().await.unwrap(), GlobalSeq::new(1));
        assert!(client
            .entity(EntityType::Feeding, &EntityId::new("f2"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn pulled_change_keeps_local_edit_on_top() {
        let store = SqliteLocalStore::in_memory().await.unwrap();
        store
            .apply_remote(&entry(1, "f1", 1, json!({"ml": 90, "side": "left"})))
            .await
            .unwrap();
        let transport = MockTransport::new();
        let client = SyncClient::open(ClientConfig::new(DeviceId::new()), transport.clone(), store)
            .await
            .unwrap();
        client
            .enqueue(
                EntityType::Feeding,
                EntityId::new("f1"),
                Operation::Update,
                json!({"ml": 120}),
            )
            .await
            .unwrap();

        transport.queue_pull(page(
            vec![entry(2, "f1", 2, json!({"ml": 90, "side": "right"}))],
            false,
        ));
        let report = client.pull_cycle().await.unwrap();
        assert_eq!(report.applied, 1);

        let cached = client
            .entity(EntityType::Feeding, &EntityId::new("f1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.fields, json!({"ml": 120, "side": "right"}));
        assert!(cached.has_pending);
    }

    #[tokio::test]
    async fn hints_from_other_devices_mark_behind() {
        let device = DeviceId::new();
        let (client, _, _) = client_with(ClientConfig::new(device)).await;

        let mut hint = ChangeHint {
            family_id: FamilyId::new("smith"),
            global_seq: GlobalSeq::new(5),
            entity_type: EntityType::Sleep,
            entity_id: EntityId::new("s1"),
            origin_device: device,
        };
        assert!(!client.note_hint(&hint).await);

        hint.origin_device = DeviceId::new();
        assert!(client.note_hint(&hint).await);
        assert_eq!(client.status().await.unwrap().head, GlobalSeq::new(5));
    }

    #[tokio::test]
    async fn state_changes_are_observable() {
        let (client, _, _) = client_with(ClientConfig::new(DeviceId::new())).await;
        let states = client.subscribe();
        let mut events = client.events();

        client.set_online(true).await;
        assert!(states.borrow().is_online());
        assert_eq!(events.recv().await.unwrap(), SyncEvent::Online);

        client.sync().await.unwrap();
        assert_eq!(*states.borrow(), SyncState::Synced);
    }

    // ===========================================
    // Durability
    // ===========================================

    #[tokio::test]
    async fn queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.db");
        let device = DeviceId::new();

        {
            let store = SqliteLocalStore::new(&path).await.unwrap();
            let client = SyncClient::open(ClientConfig::new(device), MockTransport::new(), store)
                .await
                .unwrap();
            client
                .record(EntityType::Vaccination, json!({"name": "MMR"}))
                .await
                .unwrap();
        }

        let store = SqliteLocalStore::new(&path).await.unwrap();
        let transport = MockTransport::new();
        let client = SyncClient::open(ClientConfig::new(device), transport.clone(), store)
            .await
            .unwrap();
        assert_eq!(client.status().await.unwrap().pending, 1);

        client.set_online(true).await;
        client.sync().await.unwrap();
        assert_eq!(transport.pushes()[0].events.len(), 1);
        assert_eq!(client.status().await.unwrap().pending, 0);
    }
}
