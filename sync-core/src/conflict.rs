//! Conflict resolution for pending changes.
//!
//! When the server answers a pushed event with a conflict, the device decides
//! whether the local change can be re-derived against the current record
//! (rebase), is already reflected by it (satisfied), or must be discarded and
//! surfaced to the user.
//!
//! ## Field-level check
//!
//! An update remembers the fields the entity had when the change was made
//! (its base). For every field the update touches:
//! - unchanged on the server since the base, or
//! - already equal to the local value
//!
//! means the field does not clash. No clashes → rebase. Otherwise the
//! [`ConflictPolicy`] decides.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sync_types::{Operation, ServerRecord, Version};

use crate::merge::touched_fields;

/// How to settle fields changed on both sides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The committed server value stays; the local change is discarded.
    #[default]
    ServerWins,
    /// The change with the newer client timestamp wins.
    LastWriterWins,
}

/// A pending local change, as seen by the resolver.
#[derive(Debug, Clone, Copy)]
pub struct PendingChange<'a> {
    /// Operation of the pending change.
    pub operation: Operation,
    /// Payload of the pending change.
    pub payload: &'a Value,
    /// Entity fields the change was made against, if the entity existed.
    pub base_fields: Option<&'a Value>,
    /// Device wall clock when the change was made.
    pub client_timestamp: u64,
}

/// Why a pending change could not be rebased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Create targeted an entity that already exists on the server.
    CreateOnExisting,
    /// Update targeted an entity deleted on the server.
    UpdateOnDeleted,
    /// Fields changed on both sides; the server value was kept.
    FieldsChanged {
        /// Clashing fields.
        fields: Vec<String>,
    },
    /// Fields changed on both sides; the server change was newer.
    OlderThanServer {
        /// Clashing fields.
        fields: Vec<String>,
    },
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::CreateOnExisting => write!(f, "entity already exists"),
            ConflictReason::UpdateOnDeleted => write!(f, "entity was deleted"),
            ConflictReason::FieldsChanged { fields } => {
                write!(f, "changed on server: {}", fields.join(", "))
            }
            ConflictReason::OlderThanServer { fields } => {
                write!(f, "newer server change to: {}", fields.join(", "))
            }
        }
    }
}

/// What to do with a conflicted pending change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Resubmit the same change based on the current version.
    Rebase {
        /// New `based_on_version`.
        based_on_version: Version,
    },
    /// The server state already reflects the change; drop it silently.
    Satisfied,
    /// Drop the change and surface a conflict.
    Discard(ConflictReason),
}

/// Decide how a pending change proceeds against the current server record.
pub fn resolve_conflict(
    pending: &PendingChange<'_>,
    current: &ServerRecord,
    policy: ConflictPolicy,
) -> Resolution {
    let rebase = Resolution::Rebase {
        based_on_version: current.version,
    };

    match pending.operation {
        Operation::Create => Resolution::Discard(ConflictReason::CreateOnExisting),
        Operation::Delete if current.deleted => Resolution::Satisfied,
        Operation::Delete => rebase,
        Operation::Update if current.deleted => {
            Resolution::Discard(ConflictReason::UpdateOnDeleted)
        }
        Operation::Update => {
            let clashes = clashing_fields(pending, &current.fields);
            if clashes.is_empty() {
                return rebase;
            }
            match policy {
                ConflictPolicy::ServerWins => {
                    Resolution::Discard(ConflictReason::FieldsChanged { fields: clashes })
                }
                ConflictPolicy::LastWriterWins
                    if pending.client_timestamp > current.client_timestamp =>
                {
                    rebase
                }
                ConflictPolicy::LastWriterWins => {
                    Resolution::Discard(ConflictReason::OlderThanServer { fields: clashes })
                }
            }
        }
    }
}

/// Touched fields whose server value moved away from both base and local.
fn clashing_fields(pending: &PendingChange<'_>, server_fields: &Value) -> Vec<String> {
    let mut clashes: Vec<String> = touched_fields(pending.operation, pending.payload)
        .into_iter()
        .filter(|key| {
            let base = field(pending.base_fields, key);
            let server = field(Some(server_fields), key);
            let local = pending.payload.get(key).filter(|v| !v.is_null());
            server != base && server != local
        })
        .collect();
    clashes.sort();
    clashes
}

fn field<'a>(fields: Option<&'a Value>, key: &str) -> Option<&'a Value> {
    fields.and_then(|f| f.get(key)).filter(|v| !v.is_null())
}
