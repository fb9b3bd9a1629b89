//! Change stream listener.
//!
//! Holds the device's `text/event-stream` connection open and turns frames
//! into [`Signal`]s for the sync driver:
//! - `connected` frame: the server is reachable ([`Signal::Online`])
//! - `change` frame: another device committed something ([`Signal::Hint`])
//! - stream error or end: connectivity lost ([`Signal::Offline`]), then
//!   reconnect with backoff

use super::http::{check_status, map_send_error};
use super::TransportError;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use sync_core::RetryPolicy;
use sync_types::{ChangeHint, DeviceId, FrameKind, StreamFrame};
use tokio::sync::{mpsc, watch};

/// Input to the sync driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// The server became reachable.
    Online,
    /// The server became unreachable.
    Offline,
    /// A change was committed by another device.
    Hint(ChangeHint),
    /// Run a cycle now.
    SyncNow,
}

/// One parsed server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser.
///
/// Chunks may split lines (and UTF-8 sequences) anywhere.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: Vec<u8>,
    current: SseEvent,
    has_data: bool,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');

            if line.is_empty() {
                if self.has_data {
                    events.push(std::mem::take(&mut self.current));
                }
                self.current = SseEvent::default();
                self.has_data = false;
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.current.event = Some(value.to_string()),
                "id" => self.current.id = Some(value.to_string()),
                "data" => {
                    if self.has_data {
                        self.current.data.push('\n');
                    }
                    self.current.data.push_str(value);
                    self.has_data = true;
                }
                _ => {}
            }
        }

        events
    }
}

/// Listens to the server change stream and reconnects when it drops.
pub struct ChangeListener {
    client: reqwest::Client,
    url: String,
    token: String,
    device_id: DeviceId,
    retry: RetryPolicy,
}

impl ChangeListener {
    pub(super) fn new(
        client: reqwest::Client,
        url: String,
        token: String,
        device_id: DeviceId,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            url,
            token,
            device_id,
            retry,
        }
    }

    /// Run until `shutdown` flips to true or the signal receiver is dropped.
    pub async fn run(self, signals: mpsc::Sender<Signal>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = tokio::select! {
                outcome = self.stream_once(&signals, &mut attempt) => outcome,
                _ = shutdown.changed() => break,
            };
            match outcome {
                Ok(()) => break,
                Err(TransportError::Unauthorized) => {
                    tracing::warn!("Change stream rejected our credentials");
                }
                Err(e) => tracing::debug!("Change stream ended: {}", e),
            }

            if signals.send(Signal::Offline).await.is_err() {
                break;
            }

            attempt = attempt.saturating_add(1);
            let delay = self.retry.delay(attempt);
            tracing::debug!("Reconnecting change stream in {:?} (attempt {})", delay, attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Stream frames until the connection ends. `Ok` means the driver is gone.
    async fn stream_once(
        &self,
        signals: &mpsc::Sender<Signal>,
        attempt: &mut u32,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("device_id", self.device_id.to_string())])
            .bearer_auth(&self.token)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(map_send_error)?;
        let response = check_status(response).await?;

        let mut body = response.bytes_stream();
        let mut parser = SseParser::default();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|_| TransportError::Closed)?;
            for event in parser.feed(&chunk) {
                tracing::trace!("Stream event {:?} (id {:?})", event.event, event.id);
                let frame = match StreamFrame::from_json(&event.data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("Ignoring malformed stream frame: {}", e);
                        continue;
                    }
                };

                let signal = match frame.kind {
                    FrameKind::Connected { session_id, head } => {
                        tracing::info!("Change stream open (session {}, head {})", session_id, head);
                        *attempt = 0;
                        Signal::Online
                    }
                    FrameKind::Change(hint) => Signal::Hint(hint),
                };
                if signals.send(signal).await.is_err() {
                    return Ok(());
                }
            }
        }

        Err(TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{EntityId, EntityType, FamilyId, GlobalSeq, SessionId};

    #[test]
    fn parses_complete_events() {
        let mut parser = SseParser::default();
        let events = parser.feed(b"event: connected\nid: 1\ndata: {\"a\":1}\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("connected"));
        assert_eq!(events[0].id.as_deref(), Some("1"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn handles_split_chunks_and_crlf() {
        let mut parser = SseParser::default();

        assert!(parser.feed(b"event: cha").is_empty());
        assert!(parser.feed(b"nge\r\ndata: x").is_empty());
        let events = parser.feed(b"yz\r\n\r\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("change"));
        assert_eq!(events[0].data, "xyz");
    }

    #[test]
    fn skips_keep_alive_comments() {
        let mut parser = SseParser::default();
        let events = parser.feed(b": keep-alive\n\n: keep-alive\n\ndata: a\ndata: b\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn frames_survive_the_parser() {
        let connected = StreamFrame::connected(SessionId::new(), GlobalSeq::new(100));
        let change = StreamFrame::change(ChangeHint {
            family_id: FamilyId::new("smith"),
            global_seq: GlobalSeq::new(101),
            entity_type: EntityType::Feeding,
            entity_id: EntityId::new("f1"),
            origin_device: DeviceId::new(),
        });

        let mut wire = String::new();
        for frame in [&connected, &change] {
            wire.push_str(&format!(
                "event: {}\nid: {}\ndata: {}\n\n",
                frame.event_name(),
                frame.id,
                frame.to_json().unwrap()
            ));
        }

        let mut parser = SseParser::default();
        let parsed: Vec<StreamFrame> = parser
            .feed(wire.as_bytes())
            .iter()
            .map(|e| StreamFrame::from_json(&e.data).unwrap())
            .collect();

        assert_eq!(parsed, vec![connected, change]);
    }
}
