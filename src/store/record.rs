//! Record Types
//!
//! A record is one versioned entry in a node's store. Versions start at 0
//! (absent) and are incremented by the leader on each accepted write, so on
//! the leader a key's version equals the count of accepted writes to it
//! since process start.

use serde::{Deserialize, Serialize};

/// Monotonically non-decreasing per-key version number
pub type Version = u64;

/// A versioned store entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Opaque JSON payload
    pub value: serde_json::Value,

    /// Version assigned by the leader
    pub version: Version,

    /// Tombstone marker; deletes stay in the version chain
    #[serde(default)]
    pub deleted: bool,
}

impl Record {
    /// Create a live record
    pub fn new(value: serde_json::Value, version: Version) -> Self {
        Self {
            value,
            version,
            deleted: false,
        }
    }

    /// Create a tombstone at the given version
    pub fn tombstone(version: Version) -> Self {
        Self {
            value: serde_json::Value::Null,
            version,
            deleted: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone_serializes_with_flag() {
        let record = Record::tombstone(4);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["version"], 4);
        assert_eq!(json["deleted"], true);
    }

    #[test]
    fn test_deleted_defaults_false() {
        let record: Record =
            serde_json::from_str(r#"{"value": "x", "version": 1}"#).unwrap();
        assert!(!record.deleted);
        assert_eq!(record.version, 1);
    }
}
