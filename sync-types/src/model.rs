//! Data model shared by devices and the server.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{DeviceId, EntityId, FamilyId, GlobalSeq, MutationId, SyncError, UserId, Version};

/// Milliseconds since the Unix epoch, as used for every timestamp in the model.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Kind of child-care entity a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Breast, bottle or solid feeding.
    Feeding,
    /// Nap or night sleep.
    Sleep,
    /// Medication dose.
    Medication,
    /// Vaccination record.
    Vaccination,
    /// Doctor or clinic appointment.
    Appointment,
    /// Free-form note.
    Note,
}

impl EntityType {
    /// All entity types, in declaration order.
    pub const ALL: [EntityType; 6] = [
        EntityType::Feeding,
        EntityType::Sleep,
        EntityType::Medication,
        EntityType::Vaccination,
        EntityType::Appointment,
        EntityType::Note,
    ];

    /// Stable lowercase name used on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Feeding => "feeding",
            EntityType::Sleep => "sleep",
            EntityType::Medication => "medication",
            EntityType::Vaccination => "vaccination",
            EntityType::Appointment => "appointment",
            EntityType::Note => "note",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SyncError::InvalidData(format!("unknown entity type: {s}")))
    }
}

/// What a mutation does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Bring a new entity into existence.
    Create,
    /// Merge-patch fields of an existing entity.
    Update,
    /// Tombstone an existing entity.
    Delete,
}

impl Operation {
    /// Stable lowercase name used on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(SyncError::InvalidData(format!("unknown operation: {other}"))),
        }
    }
}

/// A single client-originated change request.
///
/// The `id` is the idempotency key: the server commits a given id at most
/// once and answers any replay with the original acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    /// Client-generated idempotency key.
    pub id: MutationId,
    /// Kind of entity targeted.
    pub entity_type: EntityType,
    /// Entity targeted.
    pub entity_id: EntityId,
    /// Create, update or delete.
    pub operation: Operation,
    /// Field values for create, merge patch for update, ignored for delete.
    pub payload: serde_json::Value,
    /// Server version the change was made against (`0` for create).
    pub based_on_version: Version,
    /// Device wall clock at enqueue time, in milliseconds.
    pub client_timestamp: u64,
    /// Device-local enqueue order.
    pub local_seq: u64,
}

impl MutationEvent {
    /// Create a new event with a fresh id and the current timestamp.
    ///
    /// `local_seq` is assigned by the local store on enqueue.
    pub fn new(
        entity_type: EntityType,
        entity_id: EntityId,
        operation: Operation,
        payload: serde_json::Value,
        based_on_version: Version,
    ) -> Self {
        Self {
            id: MutationId::new(),
            entity_type,
            entity_id,
            operation,
            payload,
            based_on_version,
            client_timestamp: now_millis(),
            local_seq: 0,
        }
    }
}

/// Authoritative server row for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Owning family.
    pub family_id: FamilyId,
    /// Kind of entity.
    pub entity_type: EntityType,
    /// Entity identifier.
    pub entity_id: EntityId,
    /// Incremented on every committed write.
    pub version: Version,
    /// Current field values (a JSON object).
    pub fields: serde_json::Value,
    /// Tombstone flag set by a committed delete.
    pub deleted: bool,
    /// Server commit time of the last write, in milliseconds.
    pub updated_at: u64,
    /// Device that made the last write.
    pub updated_by: DeviceId,
    /// Client timestamp carried by the last committed mutation.
    pub client_timestamp: u64,
}

/// Immutable record of a committed mutation.
///
/// Carries the post-commit snapshot of the record so pull consumers never
/// need earlier history to apply it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// Owning family.
    pub family_id: FamilyId,
    /// Per-family position, strictly increasing with no gaps.
    pub global_seq: GlobalSeq,
    /// Mutation that produced this entry.
    pub mutation_id: MutationId,
    /// Kind of entity.
    pub entity_type: EntityType,
    /// Entity identifier.
    pub entity_id: EntityId,
    /// Operation applied.
    pub operation: Operation,
    /// Payload as submitted.
    pub payload: serde_json::Value,
    /// Record version after the commit.
    pub version: Version,
    /// Record fields after the commit.
    pub fields: serde_json::Value,
    /// Record tombstone flag after the commit.
    pub deleted: bool,
    /// User who submitted the mutation.
    pub user_id: UserId,
    /// Device that submitted the mutation.
    pub origin_device: DeviceId,
    /// Mutation's client timestamp.
    pub client_timestamp: u64,
    /// Server commit time, in milliseconds.
    pub committed_at: u64,
}

impl ChangeLogEntry {
    /// The server record as it stood right after this entry committed.
    pub fn record(&self) -> ServerRecord {
        ServerRecord {
            family_id: self.family_id.clone(),
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
            version: self.version,
            fields: self.fields.clone(),
            deleted: self.deleted,
            updated_at: self.committed_at,
            updated_by: self.origin_device,
            client_timestamp: self.client_timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_type_parses_its_name() {
        for t in EntityType::ALL {
            assert_eq!(t.as_str().parse::<EntityType>().unwrap(), t);
        }
        assert!("diaper".parse::<EntityType>().is_err());
    }

    #[test]
    fn entity_type_serializes_snake_case() {
        let json = serde_json::to_string(&EntityType::Vaccination).unwrap();
        assert_eq!(json, "\"vaccination\"");
    }

    #[test]
    fn operation_parses_its_name() {
        assert_eq!("update".parse::<Operation>().unwrap(), Operation::Update);
        assert!("upsert".parse::<Operation>().is_err());
    }

    #[test]
    fn new_event_has_fresh_id_and_timestamp() {
        let a = MutationEvent::new(
            EntityType::Feeding,
            EntityId::new("f1"),
            Operation::Create,
            json!({"amount_ml": 120}),
            Version::initial(),
        );
        let b = MutationEvent::new(
            EntityType::Feeding,
            EntityId::new("f1"),
            Operation::Create,
            json!({"amount_ml": 120}),
            Version::initial(),
        );
        assert_ne!(a.id, b.id);
        assert!(a.client_timestamp > 0);
        assert_eq!(a.local_seq, 0);
    }

    #[test]
    fn change_log_entry_yields_record_snapshot() {
        let device = DeviceId::new();
        let entry = ChangeLogEntry {
            family_id: FamilyId::new("smith"),
            global_seq: GlobalSeq::new(101),
            mutation_id: MutationId::new(),
            entity_type: EntityType::Feeding,
            entity_id: EntityId::new("f1"),
            operation: Operation::Create,
            payload: json!({"side": "left"}),
            version: Version::new(1),
            fields: json!({"side": "left"}),
            deleted: false,
            user_id: UserId::new("alice"),
            origin_device: device,
            client_timestamp: 5,
            committed_at: 10,
        };

        let record = entry.record();
        assert_eq!(record.version, Version::new(1));
        assert_eq!(record.updated_by, device);
        assert_eq!(record.updated_at, 10);
        assert_eq!(record.fields, json!({"side": "left"}));
    }
}
