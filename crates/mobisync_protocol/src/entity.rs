//! Versioned entity records.

use crate::types::EntityType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier of an entity, unique within its entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Returns the raw id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// The authoritative, versioned state of one domain record.
///
/// `version` starts at 1 on creation and grows by exactly one on every
/// accepted mutation. Deletes keep the record as a tombstone
/// (`deleted = true`) so devices pulling later still observe the deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id within the type.
    pub entity_id: EntityId,
    /// Current version.
    pub version: u64,
    /// Opaque payload owned by the domain service.
    pub data: Value,
    /// Whether this record is a tombstone.
    #[serde(default)]
    pub deleted: bool,
    /// Time of the last accepted mutation.
    pub updated_at: DateTime<Utc>,
    /// Device that made the last accepted mutation (`None` for server-side changes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

impl EntityRecord {
    /// Returns the `(entity_type, entity_id)` key.
    pub fn key(&self) -> (EntityType, EntityId) {
        (self.entity_type, self.entity_id)
    }

    /// Returns true if the record is live (not tombstoned).
    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_with_flat_id() {
        let record = EntityRecord {
            entity_type: EntityType::Inventory,
            entity_id: EntityId(42),
            version: 3,
            data: serde_json::json!({"sku": "A-1", "qty": 7}),
            deleted: false,
            updated_at: Utc::now(),
            updated_by: None,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["entity_type"], "inventory");
        assert_eq!(json["entity_id"], 42);
        assert!(json.get("updated_by").is_none());
        assert!(record.is_live());
    }
}
