//! Conflict store.
//!
//! Holds every detected version mismatch until a resolution is applied.
//! Conflicts are never removed; once resolved only `status`, `resolution`
//! and `resolved_at` change.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use mobisync_protocol::{
    ConflictStatus, EntityId, EntityType, Resolution, SyncAction, SyncConflict,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// The facts captured when a conflict is detected.
#[derive(Debug, Clone)]
pub struct NewConflict {
    /// Device whose push conflicted.
    pub device_id: String,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: EntityId,
    /// Server version at detection.
    pub server_version: u64,
    /// Version the client submitted against.
    pub client_version: u64,
    /// Server data at detection.
    pub server_data: Value,
    /// Submitted data.
    pub client_data: Value,
    /// Submitted action.
    pub client_action: SyncAction,
    /// Client-side change time, if known.
    pub client_updated_at: Option<DateTime<Utc>>,
}

/// Durable record of conflicts, with first-writer-wins resolution claims.
#[derive(Default)]
pub struct ConflictStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    conflicts: HashMap<Uuid, SyncConflict>,
    order: Vec<Uuid>,
    claimed: HashSet<Uuid>,
}

impl Inner {
    fn insert(&mut self, conflict: SyncConflict) {
        self.order.push(conflict.id);
        self.conflicts.insert(conflict.id, conflict);
    }
}

fn build(new: NewConflict) -> SyncConflict {
    let detected_at = Utc::now();
    let client_updated_at = new
        .client_updated_at
        .or_else(|| timestamp_field(&new.client_data))
        .unwrap_or(detected_at);

    SyncConflict {
        id: Uuid::new_v4(),
        device_id: new.device_id,
        entity_type: new.entity_type,
        entity_id: new.entity_id,
        server_version: new.server_version,
        client_version: new.client_version,
        server_data: new.server_data,
        client_data: new.client_data,
        client_action: new.client_action,
        client_updated_at,
        detected_at,
        status: ConflictStatus::Pending,
        resolution: None,
        resolved_at: None,
    }
}

impl ConflictStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly detected conflict.
    pub fn record(&self, new: NewConflict) -> SyncConflict {
        let conflict = build(new);
        self.inner.write().insert(conflict.clone());
        conflict
    }

    /// Records a conflict unless the same submission already has a pending
    /// one: same device, entity, client version, action and data.
    ///
    /// Returns the conflict and whether it was newly recorded.
    pub fn record_once(&self, new: NewConflict) -> (SyncConflict, bool) {
        let mut inner = self.inner.write();
        let existing = inner
            .order
            .iter()
            .filter_map(|id| inner.conflicts.get(id))
            .find(|c| {
                c.status == ConflictStatus::Pending
                    && c.device_id == new.device_id
                    && c.entity_type == new.entity_type
                    && c.entity_id == new.entity_id
                    && c.client_version == new.client_version
                    && c.client_action == new.client_action
                    && c.client_data == new.client_data
            })
            .cloned();
        if let Some(conflict) = existing {
            return (conflict, false);
        }

        let conflict = build(new);
        inner.insert(conflict.clone());
        (conflict, true)
    }

    /// Gets a conflict by id.
    pub fn get(&self, id: Uuid) -> Option<SyncConflict> {
        self.inner.read().conflicts.get(&id).cloned()
    }

    /// Lists a device's conflicts, oldest first.
    pub fn list(
        &self,
        device_id: &str,
        entity_type: Option<EntityType>,
        status: Option<ConflictStatus>,
    ) -> Vec<SyncConflict> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.conflicts.get(id))
            .filter(|c| c.device_id == device_id)
            .filter(|c| entity_type.map_or(true, |t| c.entity_type == t))
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect()
    }

    /// Counts a device's pending conflicts.
    pub fn pending_count(&self, device_id: &str) -> u64 {
        let inner = self.inner.read();
        inner
            .conflicts
            .values()
            .filter(|c| c.device_id == device_id && c.status == ConflictStatus::Pending)
            .count() as u64
    }

    /// Claims a pending conflict for resolution.
    ///
    /// Only one caller can hold the claim. Everyone else, and everyone after
    /// the conflict is resolved, gets `AlreadyResolved`.
    pub fn claim(&self, id: Uuid) -> SyncResult<SyncConflict> {
        let mut inner = self.inner.write();
        let conflict = inner
            .conflicts
            .get(&id)
            .cloned()
            .ok_or(SyncError::ConflictNotFound(id))?;

        if conflict.is_resolved() || !inner.claimed.insert(id) {
            return Err(SyncError::AlreadyResolved(id));
        }
        Ok(conflict)
    }

    /// Releases a claim without resolving; the conflict stays pending.
    pub fn release(&self, id: Uuid) {
        self.inner.write().claimed.remove(&id);
    }

    /// Marks a claimed conflict resolved and releases the claim.
    pub fn finish(&self, id: Uuid, resolution: Resolution) -> SyncResult<SyncConflict> {
        let mut inner = self.inner.write();
        if !inner.claimed.remove(&id) {
            return Err(SyncError::Internal(format!(
                "conflict {id} finished without a claim"
            )));
        }

        let conflict = inner
            .conflicts
            .get_mut(&id)
            .ok_or(SyncError::ConflictNotFound(id))?;
        conflict.status = ConflictStatus::Resolved;
        conflict.resolution = Some(resolution);
        conflict.resolved_at = Some(Utc::now());
        Ok(conflict.clone())
    }

    /// Returns the number of conflicts recorded.
    pub fn len(&self) -> usize {
        self.inner.read().conflicts.len()
    }

    /// Returns true if no conflict was ever recorded.
    pub fn is_empty(&self) -> bool {
        self.inner.read().conflicts.is_empty()
    }

    /// Returns every conflict in detection order, for snapshots.
    pub fn export(&self) -> Vec<SyncConflict> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.conflicts.get(id).cloned())
            .collect()
    }

    /// Replaces the store's content, for snapshot restore.
    pub fn restore(&self, conflicts: Vec<SyncConflict>) {
        let mut fresh = Inner::default();
        for conflict in conflicts {
            fresh.order.push(conflict.id);
            fresh.conflicts.insert(conflict.id, conflict);
        }
        *self.inner.write() = fresh;
    }
}

/// Reads a client-side change time embedded in a payload.
fn timestamp_field(data: &Value) -> Option<DateTime<Utc>> {
    data.get("updated_at")
        .or_else(|| data.get("updatedAt"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_conflict(device_id: &str, entity_type: EntityType) -> NewConflict {
        NewConflict {
            device_id: device_id.into(),
            entity_type,
            entity_id: EntityId(42),
            server_version: 4,
            client_version: 3,
            server_data: json!({"qty": 4}),
            client_data: json!({"qty": 9}),
            client_action: SyncAction::Update,
            client_updated_at: None,
        }
    }

    #[test]
    fn record_and_list() {
        let store = ConflictStore::new();
        let first = store.record(new_conflict("device-1", EntityType::Inventory));
        store.record(new_conflict("device-1", EntityType::Payment));
        store.record(new_conflict("device-2", EntityType::Inventory));

        let all = store.list("device-1", None, None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, first.id);

        let inventory = store.list("device-1", Some(EntityType::Inventory), None);
        assert_eq!(inventory.len(), 1);
        assert_eq!(store.pending_count("device-1"), 2);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn record_once_reuses_pending_conflict() {
        let store = ConflictStore::new();
        let (first, created) = store.record_once(new_conflict("device-1", EntityType::Inventory));
        assert!(created);
        let (again, created) = store.record_once(new_conflict("device-1", EntityType::Inventory));
        assert!(!created);
        assert_eq!(again.id, first.id);

        let mut other_data = new_conflict("device-1", EntityType::Inventory);
        other_data.client_data = json!({"qty": 10});
        assert!(store.record_once(other_data).1);
        assert!(store.record_once(new_conflict("device-2", EntityType::Inventory)).1);
        assert_eq!(store.len(), 3);

        // Once resolved, the same submission is a new mismatch.
        store.claim(first.id).unwrap();
        store.finish(first.id, Resolution::UseServer).unwrap();
        let (fresh, created) = store.record_once(new_conflict("device-1", EntityType::Inventory));
        assert!(created);
        assert_ne!(fresh.id, first.id);
    }

    #[test]
    fn client_timestamp_falls_back_to_payload() {
        let store = ConflictStore::new();
        let mut new = new_conflict("device-1", EntityType::Bonus);
        new.client_data = json!({"updatedAt": "2024-05-01T10:00:00Z"});
        let conflict = store.record(new);
        assert_eq!(conflict.client_updated_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn claim_is_first_writer_wins() {
        let store = ConflictStore::new();
        let conflict = store.record(new_conflict("device-1", EntityType::Inventory));

        store.claim(conflict.id).unwrap();
        assert!(matches!(
            store.claim(conflict.id),
            Err(SyncError::AlreadyResolved(_))
        ));

        let resolved = store.finish(conflict.id, Resolution::UseServer).unwrap();
        assert!(resolved.is_resolved());
        assert!(resolved.resolved_at.is_some());
        assert!(matches!(
            store.claim(conflict.id),
            Err(SyncError::AlreadyResolved(_))
        ));
        assert_eq!(store.pending_count("device-1"), 0);
    }

    #[test]
    fn release_keeps_conflict_pending() {
        let store = ConflictStore::new();
        let conflict = store.record(new_conflict("device-1", EntityType::Inventory));

        store.claim(conflict.id).unwrap();
        store.release(conflict.id);
        assert!(store.claim(conflict.id).is_ok());
        assert_eq!(
            store.get(conflict.id).unwrap().status,
            ConflictStatus::Pending
        );
    }

    #[test]
    fn unknown_conflict() {
        let store = ConflictStore::new();
        assert!(matches!(
            store.claim(Uuid::new_v4()),
            Err(SyncError::ConflictNotFound(_))
        ));
    }
}
