//! Conflict resolution.
//!
//! Applies one of three strategies to a pending conflict and writes the
//! outcome back through the entity store's compare-and-swap:
//!
//! - `use_server` discards the client's data. Nothing is written.
//! - `use_client` writes the client's submission as a new version.
//! - `merge` writes caller-supplied data, or the default merge below.
//!
//! ## Default merge
//!
//! Field-wise union of the current server object and the client object,
//! preferring client values, except that a field present in both keeps the
//! server's value when the server record's `updated_at` is strictly newer
//! than the client's change time. This is a heuristic with no correctness
//! guarantee. Callers that care about the result should send
//! `resolved_data` explicitly.

use crate::conflicts::ConflictStore;
use crate::error::{SyncError, SyncResult};
use crate::store::{CasOutcome, Change, EntityRegistry, EntityStore};
use chrono::{DateTime, Utc};
use mobisync_protocol::{
    EntityRecord, ResolveConflictResponse, Resolution, SyncAction, SyncConflict,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resolves conflicts held in a [`ConflictStore`].
pub struct ConflictResolver {
    registry: Arc<EntityRegistry>,
    conflicts: Arc<ConflictStore>,
    attempts: u32,
}

impl ConflictResolver {
    /// Creates a resolver that retries contended writes up to `attempts` times.
    pub fn new(registry: Arc<EntityRegistry>, conflicts: Arc<ConflictStore>, attempts: u32) -> Self {
        Self {
            registry,
            conflicts,
            attempts: attempts.max(1),
        }
    }

    /// Resolves `conflict_id` with `resolution`.
    ///
    /// Fails with `AlreadyResolved` if the conflict is resolved or another
    /// resolution of it is in flight, and with `EntityGone` if the entity
    /// was deleted since detection (only `use_server` succeeds then). A
    /// failed resolution leaves the conflict pending.
    pub fn resolve(
        &self,
        conflict_id: Uuid,
        resolution: Resolution,
        resolved_data: Option<Value>,
    ) -> SyncResult<ResolveConflictResponse> {
        let conflict = self.conflicts.claim(conflict_id)?;

        let version = match self.apply(&conflict, resolution, resolved_data) {
            Ok(version) => version,
            Err(err) => {
                self.conflicts.release(conflict_id);
                warn!(%conflict_id, %resolution, error = %err, "conflict resolution failed");
                return Err(err);
            }
        };

        let resolved = self.conflicts.finish(conflict_id, resolution)?;
        info!(
            %conflict_id,
            %resolution,
            entity = %format!("{}#{}", resolved.entity_type, resolved.entity_id),
            ?version,
            "conflict resolved"
        );

        Ok(ResolveConflictResponse {
            conflict_id,
            status: resolved.status,
            resolution,
            version,
        })
    }

    fn apply(
        &self,
        conflict: &SyncConflict,
        resolution: Resolution,
        resolved_data: Option<Value>,
    ) -> SyncResult<Option<u64>> {
        let store = self.registry.store(conflict.entity_type)?;

        match resolution {
            Resolution::UseServer => Ok(None),
            Resolution::UseClient => {
                let change = match conflict.client_action {
                    SyncAction::Delete => Change::Delete,
                    _ => Change::Update(conflict.client_data.clone()),
                };
                self.write(store.as_ref(), conflict, |_| Ok(change.clone()))
                    .map(Some)
            }
            Resolution::Merge => {
                if resolved_data.is_none() && conflict.client_action == SyncAction::Delete {
                    return Err(SyncError::InvalidRequest(
                        "merging a delete requires resolved_data".into(),
                    ));
                }
                self.write(store.as_ref(), conflict, |current| {
                    Ok(Change::Update(match &resolved_data {
                        Some(data) => data.clone(),
                        None => default_merge(
                            current,
                            &conflict.client_data,
                            conflict.client_updated_at,
                        ),
                    }))
                })
                .map(Some)
            }
        }
    }

    /// Writes a change against whatever version is current, retrying when a
    /// concurrent push moves the version between read and write.
    fn write<F>(&self, store: &dyn EntityStore, conflict: &SyncConflict, change_for: F) -> SyncResult<u64>
    where
        F: Fn(&EntityRecord) -> SyncResult<Change>,
    {
        let gone = || SyncError::EntityGone {
            entity_type: conflict.entity_type,
            entity_id: conflict.entity_id,
        };

        for attempt in 1..=self.attempts {
            let current = match store.get(conflict.entity_id)? {
                Some(record) if record.is_live() => record,
                _ => return Err(gone()),
            };

            let change = change_for(&current)?;
            match store.compare_and_swap(
                conflict.entity_id,
                current.version,
                change,
                Some(&conflict.device_id),
            )? {
                CasOutcome::Applied(record) => return Ok(record.version),
                CasOutcome::VersionMismatch(_) => {
                    debug!(conflict_id = %conflict.id, attempt, "resolution raced a push, retrying");
                }
                CasOutcome::Missing | CasOutcome::Deleted(_) => return Err(gone()),
            }
        }

        Err(SyncError::Internal(format!(
            "conflict {} still contended after {} attempts",
            conflict.id, self.attempts
        )))
    }
}

/// Computes the default merge of the current server record and the client's data.
pub fn default_merge(
    server: &EntityRecord,
    client_data: &Value,
    client_updated_at: DateTime<Utc>,
) -> Value {
    let server_newer = server.updated_at > client_updated_at;

    match (&server.data, client_data) {
        (Value::Object(server_map), Value::Object(client_map)) => {
            let mut merged = server_map.clone();
            for (key, value) in client_map {
                if server_newer && server_map.contains_key(key) {
                    continue;
                }
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ if server_newer => server.data.clone(),
        _ => client_data.clone(),
    }
}
