//! Streaming session management.
//!
//! Each `GET /v1/stream` connection gets a [`Session`]. Its lifecycle:
//!
//! ```text
//! Connecting ──open()──▶ Open ──disconnect / drain──▶ Closed
//! ```
//!
//! A session is `Open` once the hub has it registered and the initial
//! `connected` frame is queued ahead of any change frame. It closes when the
//! device disconnects (the stream is dropped), when writing fails (same), or
//! when the hub drains (its channel is released).

use crate::auth::AuthUser;
use crate::error::HubError;
use crate::hub::{NotificationHub, SessionInfo};
use axum::response::sse::Event;
use futures_util::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use sync_types::{now_millis, DeviceId, GlobalSeq, SessionId, StreamFrame};
use tokio::sync::mpsc;

/// Session state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, not yet registered.
    Connecting,
    /// Registered and streaming.
    Open,
    /// Unregistered; no more frames.
    Closed,
}

/// One live streaming connection.
pub struct Session {
    info: SessionInfo,
    state: SessionState,
    hub: Arc<NotificationHub>,
    outbound: Option<mpsc::Sender<StreamFrame>>,
    inbound: mpsc::Receiver<StreamFrame>,
}

impl Session {
    /// Accept a connection from `device_id` for an authenticated user.
    pub fn connect(hub: Arc<NotificationHub>, user: &AuthUser, device_id: DeviceId) -> Self {
        let (outbound, inbound) = mpsc::channel(hub.session_buffer());
        Self {
            info: SessionInfo {
                session_id: SessionId::new(),
                user_id: user.user_id.clone(),
                family_id: user.family_id.clone(),
                device_id,
                connected_at: now_millis(),
            },
            state: SessionState::Connecting,
            hub,
            outbound: Some(outbound),
            inbound,
        }
    }

    /// Queue the `connected` frame and register with the hub.
    ///
    /// `head` is the family head at connect time. A change committed between
    /// reading it and registering is not hinted, but the device pulls on
    /// connect anyway.
    pub fn open(&mut self, head: GlobalSeq) -> Result<(), HubError> {
        let Some(outbound) = self.outbound.take() else {
            return Ok(());
        };

        let connected = StreamFrame::connected(self.info.session_id, head);
        if outbound.try_send(connected).is_err() {
            self.state = SessionState::Closed;
            return Ok(());
        }

        if let Err(e) = self.hub.register(self.info.clone(), outbound) {
            self.state = SessionState::Closed;
            return Err(e);
        }

        self.state = SessionState::Open;
        tracing::info!(
            "Session {} opened: user={} family={} device={}",
            self.info.session_id,
            self.info.user_id,
            self.info.family_id,
            self.info.device_id
        );
        Ok(())
    }

    /// Session identity.
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Wait for the next outbound frame. `None` once the session is closed.
    pub async fn next_frame(&mut self) -> Option<StreamFrame> {
        if self.state != SessionState::Open {
            return None;
        }
        match self.inbound.recv().await {
            Some(frame) => Some(frame),
            None => {
                self.close();
                None
            }
        }
    }

    /// Unregister from the hub. Idempotent.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let was_open = self.state == SessionState::Open;
        self.state = SessionState::Closed;
        self.hub
            .unregister(&self.info.family_id, &self.info.session_id);

        if was_open {
            let duration_ms = now_millis().saturating_sub(self.info.connected_at);
            tracing::info!(
                "Session {} closed after {}ms",
                self.info.session_id,
                duration_ms
            );
        }
    }

    /// Turn the session into a server-sent event stream.
    ///
    /// Dropping the stream (client gone) closes the session.
    pub fn into_event_stream(self) -> impl Stream<Item = Result<Event, Infallible>> + Send {
        futures_util::stream::unfold(self, |mut session| async move {
            let frame = session.next_frame().await?;
            Some((Ok(sse_event(&frame)), session))
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// SSE form of a frame: event name, frame id and JSON data.
pub fn sse_event(frame: &StreamFrame) -> Event {
    let event = Event::default()
        .event(frame.event_name())
        .id(frame.id.to_string());

    match frame.to_json() {
        Ok(data) => event.data(data),
        Err(e) => {
            tracing::error!("Failed to encode frame {}: {}", frame.id, e);
            Event::default().comment("unencodable frame")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use futures_util::StreamExt;
    use sync_types::{ChangeHint, EntityId, EntityType, FamilyId, FrameKind, UserId};

    fn user() -> AuthUser {
        AuthUser {
            user_id: UserId::new("alice"),
            family_id: FamilyId::new("smith"),
        }
    }

    fn hub() -> Arc<NotificationHub> {
        Arc::new(NotificationHub::new(HubConfig::default()))
    }

    #[tokio::test]
    async fn open_sends_connected_frame_first() {
        let hub = hub();
        let mut session = Session::connect(Arc::clone(&hub), &user(), DeviceId::new());
        assert_eq!(session.state(), SessionState::Connecting);

        session.open(GlobalSeq::new(100)).unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(hub.session_count(), 1);

        hub.broadcast(
            &FamilyId::new("smith"),
            &StreamFrame::change(ChangeHint {
                family_id: FamilyId::new("smith"),
                global_seq: GlobalSeq::new(101),
                entity_type: EntityType::Feeding,
                entity_id: EntityId::new("f1"),
                origin_device: DeviceId::new(),
            }),
            None,
        );

        let first = session.next_frame().await.unwrap();
        assert_eq!(
            first.kind,
            FrameKind::Connected {
                session_id: session.info().session_id,
                head: GlobalSeq::new(100),
            }
        );
        let second = session.next_frame().await.unwrap();
        assert!(matches!(second.kind, FrameKind::Change(ref h) if h.global_seq == GlobalSeq::new(101)));
    }

    #[tokio::test]
    async fn dropping_the_session_unregisters() {
        let hub = hub();
        let mut session = Session::connect(Arc::clone(&hub), &user(), DeviceId::new());
        session.open(GlobalSeq::zero()).unwrap();
        assert_eq!(hub.session_count(), 1);

        drop(session);
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn drain_closes_open_streams() {
        let hub = hub();
        let mut session = Session::connect(Arc::clone(&hub), &user(), DeviceId::new());
        session.open(GlobalSeq::zero()).unwrap();

        let mut stream = Box::pin(session.into_event_stream());
        assert!(stream.next().await.is_some());

        hub.drain();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn open_fails_while_draining() {
        let hub = hub();
        hub.drain();

        let mut session = Session::connect(Arc::clone(&hub), &user(), DeviceId::new());
        assert_eq!(session.open(GlobalSeq::zero()), Err(HubError::Draining));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.next_frame().await.is_none());
    }
}
