//! Type-safe ID types.
//!
//! Uses the newtype pattern so session, turn and entity ids can't be mixed up.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to define a newtype ID wrapper around UUID
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random ID
            #[inline]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create an ID from an existing UUID
            #[inline]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the underlying UUID
            #[inline]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Create a nil (all zeros) ID - useful for testing
            #[inline]
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.0.to_string()[..8])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

define_id!(
    /// Unique identifier for a narrative session
    SessionId
);

define_id!(
    /// Unique identifier for a turn
    TurnId
);

define_id!(
    /// Unique identifier for a world-memory entity
    EntityId
);

impl EntityId {
    /// Stable name-based id: the same session, kind and name (ignoring case
    /// and surrounding whitespace) always yield the same id.
    pub fn derive(session: SessionId, kind: impl fmt::Display, name: &str) -> Self {
        let key = format!("{kind}:{}", name.trim().to_lowercase());
        Self(Uuid::new_v5(session.as_uuid(), key.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_creation() {
        let id1 = TurnId::new();
        let id2 = TurnId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_id_from_str() {
        let uuid_str = "550e8400-e29b-41d4-a716-446655440000";
        let id: SessionId = uuid_str.parse().unwrap();
        assert_eq!(id.to_string(), uuid_str);
    }

    #[test]
    fn test_id_debug_format() {
        let debug = format!("{:?}", EntityId::nil());
        assert_eq!(debug, "EntityId(00000000)");
    }

    #[test]
    fn test_derived_entity_id_is_stable() {
        let session = SessionId::new();
        let a = EntityId::derive(session, "character", "Mira");
        let b = EntityId::derive(session, "character", "  mira ");
        assert_eq!(a, b);

        assert_ne!(a, EntityId::derive(session, "location", "Mira"));
        assert_ne!(a, EntityId::derive(SessionId::new(), "character", "Mira"));
    }

    #[test]
    fn test_id_serde() {
        let id = SessionId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}
