//! Strongly-typed identifiers.
//!
//! Every id wraps a ULID. Run and rule ids are generated at runtime; catalog
//! ids are fixed ULIDs embedded in the catalog document so that rules stored
//! elsewhere keep pointing at the same trigger and entity types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Macro to generate a strongly-typed ID wrapper around ULID.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Creates a new ID with a randomly generated ULID.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Creates an ID from a ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the prefix used for display formatting.
            #[must_use]
            pub const fn prefix() -> &'static str {
                $prefix
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                // Try with prefix first
                let prefix_with_underscore = concat!($prefix, "_");
                let ulid_str = if let Some(stripped) = s.strip_prefix(prefix_with_underscore) {
                    stripped
                } else {
                    // Try parsing as raw ULID
                    s
                };

                Ulid::from_str(ulid_str)
                    .map(Self)
                    .map_err(|e| ParseIdError {
                        id_type: stringify!($name),
                        reason: e.to_string(),
                    })
            }
        }

        impl From<Ulid> for $name {
            fn from(ulid: Ulid) -> Self {
                Self(ulid)
            }
        }

        impl From<$name> for Ulid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Unique identifier for an automation rule definition.
    RuleId,
    "rule"
);

define_id!(
    /// Unique identifier for one execution of a rule against one trigger event.
    RunInstanceId,
    "run"
);

define_id!(
    /// Unique identifier for a node within a rule graph.
    NodeId,
    "node"
);

define_id!(
    /// Unique identifier for a trigger type in the reference catalog.
    TriggerTypeId,
    "trt"
);

define_id!(
    /// Unique identifier for an entity type in the reference catalog.
    EntityTypeId,
    "ety"
);

define_id!(
    /// Unique identifier for a monitored entity in the reference catalog.
    EntityId,
    "ent"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_id_display_format() {
        let id = RuleId::new();
        assert!(id.to_string().starts_with("rule_"));
    }

    #[test]
    fn run_instance_ids_are_unique() {
        let first = RunInstanceId::new();
        let second = RunInstanceId::new();
        assert_ne!(first, second);
        assert!(first.to_string().starts_with("run_"));
    }

    #[test]
    fn parse_with_prefix() {
        let id = NodeId::new();
        let parsed: NodeId = id.to_string().parse().expect("should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_without_prefix() {
        let ulid = Ulid::new();
        let id: EntityTypeId = ulid.to_string().parse().expect("should parse");
        assert_eq!(id.as_ulid(), ulid);
    }

    #[test]
    fn parse_invalid_ulid() {
        let err = "not_a_ulid".parse::<RuleId>().unwrap_err();
        assert_eq!(err.id_type, "RuleId");
    }

    #[test]
    fn catalog_ids_deserialize_from_raw_ulid() {
        let id: TriggerTypeId =
            serde_json::from_str("\"01J9Z3T0000000000000000001\"").expect("deserialize");
        assert_eq!(id.to_string(), "trt_01J9Z3T0000000000000000001");
    }

    #[test]
    fn id_serde_roundtrip() {
        let id = RunInstanceId::new();
        let json = serde_json::to_string(&id).expect("serialize");
        let parsed: RunInstanceId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, parsed);
    }
}
