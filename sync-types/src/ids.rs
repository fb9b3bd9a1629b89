//! Identity and ordering types for carelog sync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create a new random identifier (UUID v4).
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID.
            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a string identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

uuid_id!(
    /// A device participating in sync. Generated once per installation.
    DeviceId
);

uuid_id!(
    /// Client-generated idempotency key of a mutation event.
    ///
    /// Globally unique: the server commits a given id at most once.
    MutationId
);

uuid_id!(
    /// One live streaming connection held by the notification hub.
    SessionId
);

uuid_id!(
    /// Unique identifier of a single frame on a streaming connection.
    FrameId
);

string_id!(
    /// A family: the unit of sharing and of sequence numbering.
    ///
    /// Supplied by the authentication layer, never by the client body.
    FamilyId
);

string_id!(
    /// A verified user identity supplied by the authentication layer.
    UserId
);

/// Maximum length of an entity identifier in bytes.
pub const MAX_ENTITY_ID_LEN: usize = 128;

/// Client-generated identifier of a tracked entity (a feeding, a nap, ...).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wrap an entity identifier without validating it.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh random entity identifier.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Non-empty, at most [`MAX_ENTITY_ID_LEN`] bytes, no control characters.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_ENTITY_ID_LEN
            && !self.0.chars().any(char::is_control)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

/// A per-family, server-assigned, monotonically increasing sequence number.
///
/// Assigned by the server at commit time, never by clients. Sequence numbers
/// are more reliable than timestamps because device clocks drift. A device's
/// sync cursor is the last `GlobalSeq` it applied.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct GlobalSeq(u64);

impl GlobalSeq {
    /// Create a new GlobalSeq with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The position before any committed change.
    pub fn zero() -> Self {
        Self(0)
    }

    /// The following sequence number.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for GlobalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for GlobalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalSeq({})", self.0)
    }
}

/// Version of a server record. Incremented on every committed write.
///
/// `Version(0)` means "the entity does not exist yet"; a create is based on it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Create a version with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Version of an entity that has never been committed.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Get the numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The version a successful commit produces.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_id_is_uuid_v4() {
        let id = MutationId::new();
        assert_eq!(id.as_uuid().get_version_num(), 4);
    }

    #[test]
    fn mutation_id_parses_its_display_form() {
        let id = MutationId::new();
        let parsed: MutationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn device_id_rejects_garbage() {
        assert!("not-a-uuid".parse::<DeviceId>().is_err());
    }

    #[test]
    fn family_id_display_is_raw_string() {
        let family = FamilyId::new("smith");
        assert_eq!(family.to_string(), "smith");
        assert_eq!(format!("{:?}", family), "FamilyId(smith)");
    }

    #[test]
    fn entity_id_validation() {
        assert!(EntityId::new("f1").is_valid());
        assert!(EntityId::random().is_valid());
        assert!(!EntityId::new("").is_valid());
        assert!(!EntityId::new("a".repeat(MAX_ENTITY_ID_LEN + 1)).is_valid());
        assert!(!EntityId::new("bad\nid").is_valid());
    }

    #[test]
    fn global_seq_ordering() {
        let s1 = GlobalSeq::new(100);
        let s2 = GlobalSeq::new(101);
        assert!(s1 < s2);
        assert_eq!(s1.next(), s2);
    }

    #[test]
    fn global_seq_saturates() {
        let s = GlobalSeq::new(u64::MAX);
        assert_eq!(s.next().value(), u64::MAX);
    }

    #[test]
    fn version_starts_at_zero() {
        assert_eq!(Version::initial().value(), 0);
        assert_eq!(Version::initial().next(), Version::new(1));
    }

    #[test]
    fn transparent_ids_serialize_as_inner_value() {
        let json = serde_json::to_string(&GlobalSeq::new(7)).unwrap();
        assert_eq!(json, "7");
        let json = serde_json::to_string(&FamilyId::new("smith")).unwrap();
        assert_eq!(json, "\"smith\"");
    }
}
