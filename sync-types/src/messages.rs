//! Protocol messages for carelog sync.
//!
//! Push and pull bodies travel as MessagePack with named fields
//! ([`CONTENT_TYPE_MSGPACK`]). Stream frames travel as JSON inside
//! server-sent events.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{
    ChangeLogEntry, DeviceId, EntityId, EntityType, FamilyId, FrameId, GlobalSeq, MutationEvent,
    MutationId, ServerRecord, SessionId, SyncError, Version,
};

/// Content type of MessagePack request and response bodies.
pub const CONTENT_TYPE_MSGPACK: &str = "application/msgpack";

/// Serialize a message to MessagePack bytes (map encoding, named fields).
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, SyncError> {
    rmp_serde::to_vec_named(message).map_err(SyncError::Serialization)
}

/// Deserialize a message from MessagePack bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SyncError> {
    rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
}

/// A batch of mutations from one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Device submitting the batch.
    pub device_id: DeviceId,
    /// Events in `local_seq` order.
    pub events: Vec<MutationEvent>,
}

/// One result per pushed event, in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Results, positionally matching the request's events.
    pub results: Vec<MutationResult>,
}

/// Outcome of a single pushed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationResult {
    /// Committed (now or by an earlier delivery of the same id).
    Ack {
        /// Event acknowledged.
        mutation_id: MutationId,
        /// Record version produced by the commit.
        version: Version,
        /// Position of the commit in the family change log.
        global_seq: GlobalSeq,
    },
    /// `based_on_version` did not match the current record.
    Conflict {
        /// Event in conflict.
        mutation_id: MutationId,
        /// Current authoritative snapshot.
        current: ServerRecord,
    },
    /// The event can never be committed and must be dropped.
    Rejected {
        /// Event rejected.
        mutation_id: MutationId,
        /// Human-readable validation failure.
        reason: String,
    },
    /// Transient server-side failure for this event only; resubmit later.
    Retry {
        /// Event to retry.
        mutation_id: MutationId,
        /// Human-readable failure description.
        reason: String,
    },
}

impl MutationResult {
    /// Event this result refers to.
    pub fn mutation_id(&self) -> MutationId {
        match self {
            MutationResult::Ack { mutation_id, .. }
            | MutationResult::Conflict { mutation_id, .. }
            | MutationResult::Rejected { mutation_id, .. }
            | MutationResult::Retry { mutation_id, .. } => *mutation_id,
        }
    }

    /// True for an acknowledgement.
    pub fn is_ack(&self) -> bool {
        matches!(self, MutationResult::Ack { .. })
    }
}

/// Request change log entries after a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Return entries with `global_seq` > this value.
    pub since: GlobalSeq,
    /// Maximum number of entries to return (capped by the server).
    pub limit: u32,
}

/// Response to a pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Entries in ascending `global_seq` order.
    pub entries: Vec<ChangeLogEntry>,
    /// Highest `global_seq` in this page, or `since` when empty.
    pub cursor: GlobalSeq,
    /// Whether more entries are available after `cursor`.
    pub has_more: bool,
}

/// Read-only diagnostic snapshot of a family on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Family queried.
    pub family_id: FamilyId,
    /// Highest committed `global_seq`.
    pub head: GlobalSeq,
    /// Live streaming sessions of the family.
    pub sessions: usize,
    /// Server wall clock, in milliseconds.
    pub server_time: u64,
}

/// Family-scoped notice that a change was committed.
///
/// Carries no record data: receivers pull the authoritative change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeHint {
    /// Family the change belongs to.
    pub family_id: FamilyId,
    /// Position of the change.
    pub global_seq: GlobalSeq,
    /// Kind of entity changed.
    pub entity_type: EntityType,
    /// Entity changed.
    pub entity_id: EntityId,
    /// Device that pushed the change.
    pub origin_device: DeviceId,
}

/// One frame on a streaming connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame {
    /// Unique frame id (the SSE `id:` field).
    pub id: FrameId,
    /// Frame content.
    pub kind: FrameKind,
}

/// Content of a stream frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameKind {
    /// First frame of every session.
    Connected {
        /// Session that was opened.
        session_id: SessionId,
        /// Family head at connect time.
        head: GlobalSeq,
    },
    /// A change was committed in the family.
    Change(ChangeHint),
}

impl StreamFrame {
    /// Build the initial frame of a session.
    pub fn connected(session_id: SessionId, head: GlobalSeq) -> Self {
        Self {
            id: FrameId::new(),
            kind: FrameKind::Connected { session_id, head },
        }
    }

    /// Build a change notification frame.
    pub fn change(hint: ChangeHint) -> Self {
        Self {
            id: FrameId::new(),
            kind: FrameKind::Change(hint),
        }
    }

    /// SSE event name for this frame.
    pub fn event_name(&self) -> &'static str {
        match self.kind {
            FrameKind::Connected { .. } => "connected",
            FrameKind::Change(_) => "change",
        }
    }

    /// JSON form carried in the SSE `data:` field.
    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(SyncError::Json)
    }

    /// Parse the JSON form carried in the SSE `data:` field.
    pub fn from_json(data: &str) -> Result<Self, SyncError> {
        serde_json::from_str(data).map_err(SyncError::Json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Operation, UserId};
    use serde_json::json;

    fn sample_record() -> ServerRecord {
        ServerRecord {
            family_id: FamilyId::new("smith"),
            entity_type: EntityType::Sleep,
            entity_id: EntityId::new("s1"),
            version: Version::new(3),
            fields: json!({"start": "20:00", "quality": "good"}),
            deleted: false,
            updated_at: 1_700_000_000_000,
            updated_by: DeviceId::new(),
            client_timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn push_request_survives_msgpack() {
        let request = PushRequest {
            device_id: DeviceId::new(),
            events: vec![MutationEvent::new(
                EntityType::Feeding,
                EntityId::new("f1"),
                Operation::Create,
                json!({"amount_ml": 90, "side": null, "notes": ["burped"]}),
                Version::initial(),
            )],
        };

        let bytes = encode(&request).unwrap();
        let restored: PushRequest = decode(&bytes).unwrap();
        assert_eq!(request, restored);
    }

    #[test]
    fn push_response_keeps_result_order_and_kinds() {
        let response = PushResponse {
            results: vec![
                MutationResult::Ack {
                    mutation_id: MutationId::new(),
                    version: Version::new(1),
                    global_seq: GlobalSeq::new(101),
                },
                MutationResult::Conflict {
                    mutation_id: MutationId::new(),
                    current: sample_record(),
                },
                MutationResult::Rejected {
                    mutation_id: MutationId::new(),
                    reason: "payload must be an object".into(),
                },
                MutationResult::Retry {
                    mutation_id: MutationId::new(),
                    reason: "database busy".into(),
                },
            ],
        };

        let restored: PushResponse = decode(&encode(&response).unwrap()).unwrap();
        assert_eq!(response, restored);
        assert!(restored.results[0].is_ack());
        assert!(!restored.results[1].is_ack());
    }

    #[test]
    fn pull_response_survives_msgpack() {
        let response = PullResponse {
            entries: vec![ChangeLogEntry {
                family_id: FamilyId::new("smith"),
                global_seq: GlobalSeq::new(1),
                mutation_id: MutationId::new(),
                entity_type: EntityType::Note,
                entity_id: EntityId::new("n1"),
                operation: Operation::Create,
                payload: json!({"text": "first tooth"}),
                version: Version::new(1),
                fields: json!({"text": "first tooth"}),
                deleted: false,
                user_id: UserId::new("alice"),
                origin_device: DeviceId::new(),
                client_timestamp: 1,
                committed_at: 2,
            }],
            cursor: GlobalSeq::new(1),
            has_more: false,
        };

        let restored: PullResponse = decode(&encode(&response).unwrap()).unwrap();
        assert_eq!(response, restored);
    }

    #[test]
    fn decode_garbage_fails() {
        let result: Result<PushRequest, _> = decode(&[0xc1, 0x00, 0xff]);
        assert!(matches!(result, Err(SyncError::Deserialization(_))));
    }

    #[test]
    fn connected_frame_json() {
        let session = SessionId::new();
        let frame = StreamFrame::connected(session, GlobalSeq::new(100));
        assert_eq!(frame.event_name(), "connected");

        let json = frame.to_json().unwrap();
        assert!(json.contains("\"type\":\"connected\""));
        assert_eq!(StreamFrame::from_json(&json).unwrap(), frame);
    }

    #[test]
    fn change_frame_json() {
        let frame = StreamFrame::change(ChangeHint {
            family_id: FamilyId::new("smith"),
            global_seq: GlobalSeq::new(101),
            entity_type: EntityType::Feeding,
            entity_id: EntityId::new("f1"),
            origin_device: DeviceId::new(),
        });
        assert_eq!(frame.event_name(), "change");

        let restored = StreamFrame::from_json(&frame.to_json().unwrap()).unwrap();
        assert_eq!(restored, frame);
    }

    #[test]
    fn frames_have_unique_ids() {
        let a = StreamFrame::connected(SessionId::new(), GlobalSeq::zero());
        let b = StreamFrame::connected(SessionId::new(), GlobalSeq::zero());
        assert_ne!(a.id, b.id);
    }
}
