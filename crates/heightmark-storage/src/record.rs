//! The durable checkpoint record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Height stored for a stream that has not applied anything yet.
pub const UNKNOWN_HEIGHT: i64 = -1;

/// Last committed height for one stream identifier.
///
/// At most one record exists per `identifier`. Once created, `height` only
/// moves forward through a conditional update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Stream (or stream-group) name.
    pub identifier: String,
    /// Last height known to be fully applied.
    pub height: i64,
    /// When the record was first created.
    pub created_at: DateTime<Utc>,
    /// When the record was last modified.
    pub updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(identifier: impl Into<String>, height: i64) -> Self {
        let now = Utc::now();
        Self {
            identifier: identifier.into(),
            height,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` if nothing has been applied for this stream yet.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.height == UNKNOWN_HEIGHT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_timestamps_match() {
        let record = CheckpointRecord::new("chain-a", UNKNOWN_HEIGHT);
        assert_eq!(record.identifier, "chain-a");
        assert_eq!(record.created_at, record.updated_at);
        assert!(record.is_fresh());
    }

    #[test]
    fn test_serde_shape() {
        let record = CheckpointRecord::new("chain-b", 42);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["identifier"], "chain-b");
        assert_eq!(json["height"], 42);
        assert!(json.get("created_at").is_some());
        assert!(!record.is_fresh());
    }
}
