//! Notification hub.
//!
//! Registry of live streaming sessions, grouped by family. The hub is an
//! ordinary value owned by the server and shared through `Arc`; locking is
//! per family entry.
//!
//! Broadcast never waits: each session has a bounded outbound channel and a
//! frame that does not fit is dropped for that session only. Devices recover
//! from a dropped hint on their next pull.

use crate::config::HubConfig;
use crate::error::HubError;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use sync_types::{DeviceId, FamilyId, SessionId, StreamFrame, UserId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Identity of one registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session id.
    pub session_id: SessionId,
    /// Authenticated user.
    pub user_id: UserId,
    /// Family the session listens to.
    pub family_id: FamilyId,
    /// Device holding the connection.
    pub device_id: DeviceId,
    /// Connect time, in milliseconds.
    pub connected_at: u64,
}

struct Registered {
    info: SessionInfo,
    outbound: mpsc::Sender<StreamFrame>,
}

/// Per-broadcast delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Frames queued on a session.
    pub delivered: usize,
    /// Frames dropped because a session's buffer was full.
    pub dropped: usize,
    /// Sessions found closed and removed.
    pub closed: usize,
}

/// Registry of live sessions.
pub struct NotificationHub {
    config: HubConfig,
    families: DashMap<FamilyId, HashMap<SessionId, Registered>>,
    live: AtomicUsize,
    draining: AtomicBool,
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub")
            .field("config", &self.config)
            .field("families", &self.families.len())
            .field("sessions", &self.session_count())
            .field("draining", &self.is_draining())
            .finish()
    }
}

impl NotificationHub {
    /// Create an empty hub.
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            families: DashMap::new(),
            live: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
        }
    }

    /// Capacity of a session's outbound channel.
    pub fn session_buffer(&self) -> usize {
        self.config.session_buffer.max(1)
    }

    /// Register a session with its outbound channel.
    ///
    /// Returns `false` if the session id is already registered (the existing
    /// registration is kept).
    pub fn register(
        &self,
        info: SessionInfo,
        outbound: mpsc::Sender<StreamFrame>,
    ) -> Result<bool, HubError> {
        if self.is_draining() {
            return Err(HubError::Draining);
        }

        let limit = self.config.max_sessions;
        if self.live.fetch_add(1, Ordering::SeqCst) >= limit {
            self.release(1);
            return Err(HubError::TooManySessions { limit });
        }

        let family_id = info.family_id.clone();
        let session_id = info.session_id;
        let inserted = {
            let mut sessions = self.families.entry(family_id.clone()).or_default();
            if sessions.contains_key(&session_id) {
                false
            } else {
                sessions.insert(session_id, Registered { info, outbound });
                true
            }
        };

        if !inserted {
            self.release(1);
            return Ok(false);
        }

        // drain() may have run between the check above and the insert
        if self.is_draining() {
            self.unregister(&family_id, &session_id);
            return Err(HubError::Draining);
        }

        tracing::debug!(
            "Registered session {} in family {} ({} live)",
            session_id,
            family_id,
            self.session_count()
        );
        Ok(true)
    }

    /// Remove a session and release its outbound channel.
    ///
    /// Returns `false` if it was not registered.
    pub fn unregister(&self, family_id: &FamilyId, session_id: &SessionId) -> bool {
        let removed = self
            .families
            .get_mut(family_id)
            .and_then(|mut sessions| sessions.remove(session_id))
            .is_some();

        if removed {
            self.release(1);
            self.families.remove_if(family_id, |_, sessions| sessions.is_empty());
            tracing::debug!("Unregistered session {} from family {}", session_id, family_id);
        }
        removed
    }

    /// Fan `frame` out to every session of the family except those of
    /// `exclude_device`.
    pub fn broadcast(
        &self,
        family_id: &FamilyId,
        frame: &StreamFrame,
        exclude_device: Option<DeviceId>,
    ) -> Delivery {
        let mut delivery = Delivery::default();

        if let Some(mut sessions) = self.families.get_mut(family_id) {
            sessions.retain(|session_id, session| {
                if Some(session.info.device_id) == exclude_device {
                    return true;
                }
                match session.outbound.try_send(frame.clone()) {
                    Ok(()) => {
                        delivery.delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!("Session {} buffer full, dropping frame {}", session_id, frame.id);
                        delivery.dropped += 1;
                        true
                    }
                    Err(TrySendError::Closed(_)) => {
                        delivery.closed += 1;
                        false
                    }
                }
            });
        }

        if delivery.closed > 0 {
            self.release(delivery.closed);
            self.families.remove_if(family_id, |_, sessions| sessions.is_empty());
        }

        tracing::debug!(
            "Broadcast {} to family {}: {} delivered, {} dropped",
            frame.event_name(),
            family_id,
            delivery.delivered,
            delivery.dropped
        );
        delivery
    }

    /// Stop accepting sessions and unregister every live one.
    ///
    /// Returns the number of sessions released.
    pub fn drain(&self) -> usize {
        self.draining.store(true, Ordering::SeqCst);

        let released: usize = self.families.iter().map(|entry| entry.value().len()).sum();
        self.families.clear();
        self.live.store(0, Ordering::SeqCst);

        tracing::info!("Notification hub drained ({} sessions released)", released);
        released
    }

    // drain() zeroes the count, so a session it already released can still
    // be unregistered afterwards
    fn release(&self, n: usize) {
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                Some(live.saturating_sub(n))
            });
    }

    /// Whether [`drain`](Self::drain) has been called.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Live sessions across all families.
    pub fn session_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Families with at least one live session.
    pub fn family_count(&self) -> usize {
        self.families.len()
    }

    /// Live sessions of one family.
    pub fn family_sessions(&self, family_id: &FamilyId) -> Vec<SessionInfo> {
        self.families
            .get(family_id)
            .map(|sessions| sessions.values().map(|s| s.info.clone()).collect())
            .unwrap_or_default()
    }
}
