//! Client sync state machine for carelog sync.
//!
//! This module provides a pure, side-effect-free state machine for the
//! device's sync lifecycle. The state machine takes events as input and
//! produces a new state plus a list of actions to execute.
//!
//! The actual I/O (pushing, pulling, timers) is performed by sync-client,
//! not by this module. This enables instant unit testing without network mocks.
//!
//! ```text
//!            WentOnline                 SyncRequested
//! Offline ─────────────▶ Syncing ◀──────────────────── Idle / Synced
//!    ▲                    │  │  ▲                           ▲
//!    │ WentOffline        │  │  │ RetryTimer                │ SyncSucceeded
//!    │ (from any)         │  │  └──────── Backoff ◀─────────┼── TransientFailure
//!    │                    │  └──────────────────────────────┘
//!    │                    └─ AuthFailed ─▶ AuthRequired ── Reauthenticated ─▶ Syncing
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::RetryPolicy;

/// Sync state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    /// No connectivity; pushing is paused.
    Offline,
    /// Online, no cycle has completed since going online.
    Idle,
    /// A push/pull cycle is running.
    Syncing {
        /// Consecutive failed cycles before this one.
        attempt: u32,
    },
    /// Last cycle succeeded and nothing was left to push.
    Synced,
    /// Last cycle failed transiently; waiting for the retry timer.
    Backoff {
        /// Consecutive failed cycles.
        attempt: u32,
        /// Last failure.
        error: String,
    },
    /// The server rejected our credentials; sync is paused.
    AuthRequired,
}

impl SyncState {
    /// Create a new state machine in the Offline state.
    pub fn new() -> Self {
        Self::Offline
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: Event, retry: &RetryPolicy) -> (Self, Vec<Action>) {
        match (self, event) {
            // Connectivity
            (Self::Offline, Event::WentOnline) => (
                Self::Syncing { attempt: 0 },
                vec![Action::Emit(SyncEvent::Online), Action::RunSync],
            ),
            (Self::Offline, _) => (Self::Offline, vec![]),
            (_, Event::WentOffline) => (
                Self::Offline,
                vec![Action::CancelRetry, Action::Emit(SyncEvent::Offline)],
            ),

            // Explicit requests
            (Self::Idle | Self::Synced, Event::SyncRequested) => {
                (Self::Syncing { attempt: 0 }, vec![Action::RunSync])
            }
            (Self::Backoff { attempt, .. }, Event::SyncRequested | Event::RetryTimer) => (
                Self::Syncing { attempt },
                vec![Action::CancelRetry, Action::RunSync],
            ),

            // Cycle outcomes
            (Self::Syncing { .. }, Event::SyncSucceeded { pending }) => {
                let next = if pending == 0 { Self::Synced } else { Self::Idle };
                (next, vec![Action::Emit(SyncEvent::Synced { pending })])
            }
            (Self::Syncing { attempt }, Event::TransientFailure { error }) => {
                let next_attempt = attempt.saturating_add(1);
                (
                    Self::Backoff {
                        attempt: next_attempt,
                        error: error.clone(),
                    },
                    vec![
                        Action::Emit(SyncEvent::SyncFailed {
                            attempt: next_attempt,
                            error,
                        }),
                        Action::StartRetryTimer {
                            delay: retry.delay(next_attempt),
                        },
                    ],
                )
            }
            (Self::Syncing { .. }, Event::AuthFailed) => (
                Self::AuthRequired,
                vec![Action::CancelRetry, Action::Emit(SyncEvent::AuthRequired)],
            ),

            // Authentication
            (Self::AuthRequired, Event::Reauthenticated) => {
                (Self::Syncing { attempt: 0 }, vec![Action::RunSync])
            }

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if the device believes it is online.
    pub fn is_online(&self) -> bool {
        !matches!(self, Self::Offline)
    }

    /// Check if a cycle is running.
    pub fn is_syncing(&self) -> bool {
        matches!(self, Self::Syncing { .. })
    }

    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Idle => "idle",
            Self::Syncing { .. } => "syncing",
            Self::Synced => "synced",
            Self::Backoff { .. } => "error",
            Self::AuthRequired => "auth required",
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

/// Events that can occur in the sync lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Connectivity came back.
    WentOnline,
    /// Connectivity was lost.
    WentOffline,
    /// A cycle was requested (timer, hint, enqueue or user).
    SyncRequested,
    /// A cycle completed.
    SyncSucceeded {
        /// Events still in the queue (stalled or over the batch size).
        pending: usize,
    },
    /// A cycle failed with a transient network error.
    TransientFailure {
        /// Error message describing the failure.
        error: String,
    },
    /// The server rejected our credentials.
    AuthFailed,
    /// New credentials are available.
    Reauthenticated,
    /// Retry timer fired.
    RetryTimer,
}

/// Actions to be executed by the sync-client.
///
/// These are instructions, not side effects. The sync-client interprets
/// these and performs the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run a push/pull cycle.
    RunSync,
    /// Start a timer that feeds [`Event::RetryTimer`].
    StartRetryTimer {
        /// Delay before retrying.
        delay: Duration,
    },
    /// Cancel any pending retry timer.
    CancelRetry,
    /// Emit an event to the application.
    Emit(SyncEvent),
}

/// Events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Connectivity came back.
    Online,
    /// Connectivity was lost.
    Offline,
    /// A cycle completed.
    Synced {
        /// Events still in the queue.
        pending: usize,
    },
    /// A cycle failed.
    SyncFailed {
        /// Which consecutive failure this was.
        attempt: u32,
        /// Error message describing the failure.
        error: String,
    },
    /// Credentials must be renewed before sync resumes.
    AuthRequired,
}
