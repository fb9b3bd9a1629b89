//! Applying mutations to entity state.
//!
//! The same rules run on the device (optimistic apply, replay of pending
//! changes over pulled snapshots) and on the server (commit):
//!
//! - `create` sets the entity's fields to the payload object.
//! - `update` is a shallow merge patch: each top-level key in the payload
//!   replaces the field, a `null` value removes it, absent keys are kept.
//! - `delete` keeps the last fields and sets the tombstone flag.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sync_types::Operation;
use thiserror::Error;

/// Fields and tombstone flag of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    /// Field values (always a JSON object).
    pub fields: Value,
    /// Set by a delete.
    pub deleted: bool,
}

impl EntityState {
    /// A live entity with the given fields.
    pub fn live(fields: Value) -> Self {
        Self {
            fields,
            deleted: false,
        }
    }
}

/// Payload shape errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    /// Create and update payloads must be JSON objects.
    #[error("{0} payload must be a JSON object")]
    NotAnObject(Operation),

    /// Update with nothing to change.
    #[error("update payload is empty")]
    EmptyUpdate,
}

/// Check that a payload has the shape its operation needs.
pub fn check_payload(operation: Operation, payload: &Value) -> Result<(), MergeError> {
    match operation {
        Operation::Create => match payload {
            Value::Object(_) => Ok(()),
            _ => Err(MergeError::NotAnObject(operation)),
        },
        Operation::Update => match payload {
            Value::Object(map) if map.is_empty() => Err(MergeError::EmptyUpdate),
            Value::Object(_) => Ok(()),
            _ => Err(MergeError::NotAnObject(operation)),
        },
        Operation::Delete => Ok(()),
    }
}

/// Shallow merge patch of `patch` into `target`.
///
/// Non-object targets are replaced by an empty object first.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(fields) = target {
        for (key, value) in patch {
            if value.is_null() {
                fields.remove(key);
            } else {
                fields.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Apply one mutation to the current state (`None` = never existed).
pub fn apply_mutation(
    current: Option<&EntityState>,
    operation: Operation,
    payload: &Value,
) -> EntityState {
    match operation {
        Operation::Create => {
            let mut fields = Value::Object(Map::new());
            merge_patch(&mut fields, payload);
            EntityState::live(fields)
        }
        Operation::Update => {
            let mut fields = current
                .map(|s| s.fields.clone())
                .unwrap_or_else(|| Value::Object(Map::new()));
            merge_patch(&mut fields, payload);
            EntityState {
                fields,
                deleted: current.map(|s| s.deleted).unwrap_or(false),
            }
        }
        Operation::Delete => EntityState {
            fields: current
                .map(|s| s.fields.clone())
                .unwrap_or_else(|| Value::Object(Map::new())),
            deleted: true,
        },
    }
}

/// Top-level fields a mutation writes. Empty for delete.
pub fn touched_fields(operation: Operation, payload: &Value) -> Vec<String> {
    match (operation, payload) {
        (Operation::Delete, _) => Vec::new(),
        (_, Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}
