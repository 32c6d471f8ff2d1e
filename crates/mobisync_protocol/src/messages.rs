//! Protocol messages for sync.

use crate::entity::{EntityId, EntityRecord};
use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{ConflictStatus, EntityType, JobScope, Resolution, SyncAction, SyncHealth};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A sync protocol message.
///
/// Every request and response of the protocol, wrapped in one enum so a
/// binary transport can carry any of them as a single CBOR value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Pull request.
    PullRequest(PullRequest),
    /// Pull response.
    PullResponse(PullResponse),
    /// Push request.
    PushRequest(PushRequest),
    /// Push response.
    PushResponse(PushResponse),
    /// List conflicts request.
    ListConflictsRequest(ListConflictsRequest),
    /// List conflicts response.
    ListConflictsResponse(ListConflictsResponse),
    /// Resolve conflict request.
    ResolveConflictRequest(ResolveConflictRequest),
    /// Resolve conflict response.
    ResolveConflictResponse(ResolveConflictResponse),
    /// Sync status request.
    SyncStatusRequest(SyncStatusRequest),
    /// Sync status response.
    SyncStatusResponse(SyncStatusResponse),
    /// Force sync request.
    ForceSyncRequest(ForceSyncRequest),
    /// Force sync response.
    ForceSyncResponse(ForceSyncResponse),
}

impl SyncMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::PullRequest(_) => 1,
            SyncMessage::PullResponse(_) => 2,
            SyncMessage::PushRequest(_) => 3,
            SyncMessage::PushResponse(_) => 4,
            SyncMessage::ListConflictsRequest(_) => 5,
            SyncMessage::ListConflictsResponse(_) => 6,
            SyncMessage::ResolveConflictRequest(_) => 7,
            SyncMessage::ResolveConflictResponse(_) => 8,
            SyncMessage::SyncStatusRequest(_) => 9,
            SyncMessage::SyncStatusResponse(_) => 10,
            SyncMessage::ForceSyncRequest(_) => 11,
            SyncMessage::ForceSyncResponse(_) => 12,
        }
    }

    /// Returns true if this message is sent by a client.
    pub fn is_request(&self) -> bool {
        self.type_code() % 2 == 1
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Pull request from a device.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PullRequest {
    /// Device pulling.
    pub device_id: String,
    /// Last token received, applied to every requested data type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_token: Option<String>,
    /// Per data type tokens for multi-type pulls. Takes precedence over
    /// `last_sync_token`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sync_tokens: BTreeMap<String, String>,
    /// Requested data types. `None`, empty or `["all"]` means every type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_types: Option<Vec<String>>,
}

impl PullRequest {
    /// Creates a pull of every data type from the beginning of time.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Self::default()
        }
    }

    /// Restricts the pull to the given data types.
    pub fn with_data_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.data_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the token to resume from.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.last_sync_token = Some(token.into());
        self
    }

    /// Sets the token for one data type.
    pub fn with_type_token(mut self, data_type: EntityType, token: impl Into<String>) -> Self {
        self.sync_tokens
            .insert(data_type.as_str().to_string(), token.into());
        self
    }
}

/// Changes of one data type returned by a pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTypeDelta {
    /// Changed entities ordered by `(updated_at, entity_id)`, tombstones included.
    pub entities: Vec<EntityRecord>,
    /// Token to echo back on the next pull of this data type.
    pub token: String,
    /// Whether more changes remain beyond this page.
    pub has_more: bool,
}

/// Pull response from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Device that pulled.
    pub device_id: String,
    /// Changes per data type.
    pub data: BTreeMap<EntityType, DataTypeDelta>,
}

impl PullResponse {
    /// Returns true if any data type has more pages.
    pub fn has_more(&self) -> bool {
        self.data.values().any(|delta| delta.has_more)
    }

    /// Returns the total number of entities across data types.
    pub fn entity_count(&self) -> usize {
        self.data.values().map(|delta| delta.entities.len()).sum()
    }
}

/// One client-originated change inside a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
    /// Client-chosen identity of this item, used to detect retransmission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    /// Entity type.
    pub entity_type: EntityType,
    /// Target entity; `None` proposes a create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    /// Requested action.
    pub action: SyncAction,
    /// Submitted payload.
    #[serde(default)]
    pub data: Value,
    /// Version the client believes it is editing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<u64>,
    /// When the client made the change, if it knows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_updated_at: Option<DateTime<Utc>>,
}

impl SyncItem {
    /// Creates a create item.
    pub fn create(entity_type: EntityType, data: Value) -> Self {
        Self {
            item_id: None,
            entity_type,
            entity_id: None,
            action: SyncAction::Create,
            data,
            client_version: None,
            client_updated_at: None,
        }
    }

    /// Creates an update item against `client_version`.
    pub fn update(
        entity_type: EntityType,
        entity_id: EntityId,
        client_version: u64,
        data: Value,
    ) -> Self {
        Self {
            item_id: None,
            entity_type,
            entity_id: Some(entity_id),
            action: SyncAction::Update,
            data,
            client_version: Some(client_version),
            client_updated_at: None,
        }
    }

    /// Creates a delete item against `client_version`.
    pub fn delete(entity_type: EntityType, entity_id: EntityId, client_version: u64) -> Self {
        Self {
            item_id: None,
            entity_type,
            entity_id: Some(entity_id),
            action: SyncAction::Delete,
            data: Value::Null,
            client_version: Some(client_version),
            client_updated_at: None,
        }
    }

    /// Creates a sync acknowledgement item.
    pub fn acknowledge(entity_type: EntityType, entity_id: EntityId, client_version: u64) -> Self {
        Self {
            item_id: None,
            entity_type,
            entity_id: Some(entity_id),
            action: SyncAction::Sync,
            data: Value::Null,
            client_version: Some(client_version),
            client_updated_at: None,
        }
    }

    /// Sets the client item identity.
    pub fn with_item_id(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    /// Sets the client-side change time.
    pub fn with_client_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.client_updated_at = Some(at);
        self
    }
}

/// Push request from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Device pushing.
    pub device_id: String,
    /// Changes to apply, processed independently.
    pub sync_items: Vec<SyncItem>,
}

impl PushRequest {
    /// Creates a new push request.
    pub fn new(device_id: impl Into<String>, sync_items: Vec<SyncItem>) -> Self {
        Self {
            device_id: device_id.into(),
            sync_items,
        }
    }
}

/// Outcome of one pushed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemOutcome {
    /// The change was applied (or acknowledged).
    Applied,
    /// The change was not applied; a conflict was recorded.
    Conflict,
    /// The change was rejected.
    Failed,
}

/// Per-item result of a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    /// The item id, or the item's index in the batch when it had none.
    pub item_ref: String,
    /// Outcome.
    pub outcome: ItemOutcome,
    /// Entity affected, including the id assigned on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    /// Entity version after the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Conflict recorded for this item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<Uuid>,
    /// Machine-readable reason for conflicts and failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// True when the item was a retransmission of an already processed item.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
    /// Sync job recorded for this item.
    pub job_id: Uuid,
}

/// Aggregate counts of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PushSummary {
    /// Items applied.
    pub applied: usize,
    /// Items that produced a conflict.
    pub conflicted: usize,
    /// Items that failed.
    pub failed: usize,
}

impl PushSummary {
    /// Counts one outcome.
    pub fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Applied => self.applied += 1,
            ItemOutcome::Conflict => self.conflicted += 1,
            ItemOutcome::Failed => self.failed += 1,
        }
    }

    /// Returns the number of items counted.
    pub fn total(&self) -> usize {
        self.applied + self.conflicted + self.failed
    }
}

/// Push response from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    /// One result per submitted item, in submission order.
    pub results: Vec<ItemResult>,
    /// Aggregate counts.
    pub summary: PushSummary,
}

impl PushResponse {
    /// Builds a response, computing the summary from the results.
    pub fn from_results(results: Vec<ItemResult>) -> Self {
        let mut summary = PushSummary::default();
        for result in &results {
            summary.record(result.outcome);
        }
        Self { results, summary }
    }
}

/// A recorded divergence between a device's edit and the server's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict id.
    pub id: Uuid,
    /// Device whose push conflicted.
    pub device_id: String,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: EntityId,
    /// Server version at detection time.
    pub server_version: u64,
    /// Version the client submitted against.
    pub client_version: u64,
    /// Server data at detection time.
    pub server_data: Value,
    /// Data the client submitted.
    pub client_data: Value,
    /// Action the client submitted.
    pub client_action: SyncAction,
    /// When the client made its change (best known).
    pub client_updated_at: DateTime<Utc>,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
    /// Status.
    pub status: ConflictStatus,
    /// Strategy applied, once resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    /// When the conflict was resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SyncConflict {
    /// Returns true once a resolution has been applied.
    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }
}

/// List conflicts request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListConflictsRequest {
    /// Device whose conflicts to list.
    pub device_id: String,
    /// Restrict to one entity type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
    /// Restrict to one status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConflictStatus>,
}

impl ListConflictsRequest {
    /// Lists every conflict of a device.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            entity_type: None,
            status: None,
        }
    }

    /// Restricts to one status.
    pub fn with_status(mut self, status: ConflictStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts to one entity type.
    pub fn with_entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }
}

/// List conflicts response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListConflictsResponse {
    /// Matching conflicts, oldest first.
    pub conflicts: Vec<SyncConflict>,
}

/// Resolve conflict request.
///
/// With `Resolution::Merge` and no `resolved_data`, the server applies a
/// default field-wise merge. That merge is a heuristic: production callers
/// should send the merged document explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveConflictRequest {
    /// Conflict to resolve.
    pub conflict_id: Uuid,
    /// Strategy.
    pub resolution: Resolution,
    /// Merged document for `Resolution::Merge`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_data: Option<Value>,
}

impl ResolveConflictRequest {
    /// Creates a resolution request without merged data.
    pub fn new(conflict_id: Uuid, resolution: Resolution) -> Self {
        Self {
            conflict_id,
            resolution,
            resolved_data: None,
        }
    }

    /// Supplies the merged document.
    pub fn with_data(mut self, data: Value) -> Self {
        self.resolved_data = Some(data);
        self
    }
}

/// Resolve conflict response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveConflictResponse {
    /// Resolved conflict.
    pub conflict_id: Uuid,
    /// New status (always resolved on success).
    pub status: ConflictStatus,
    /// Strategy applied.
    pub resolution: Resolution,
    /// Entity version written, if the resolution wrote one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// Sync status request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusRequest {
    /// Device to report on.
    pub device_id: String,
}

/// Sync status of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusResponse {
    /// Device reported on.
    pub device_id: String,
    /// Jobs waiting to be processed.
    pub pending_jobs: u64,
    /// Jobs being processed.
    pub processing_jobs: u64,
    /// Jobs that completed.
    pub completed_jobs: u64,
    /// Jobs that failed.
    pub failed_jobs: u64,
    /// Conflicts awaiting resolution.
    pub pending_conflicts: u64,
    /// Time the last completed job finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Health bucket.
    pub health: SyncHealth,
}

/// Force sync request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceSyncRequest {
    /// Device to resync.
    pub device_id: String,
    /// Data type to resync, or `"all"`.
    pub data_type: String,
}

/// Force sync response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceSyncResponse {
    /// Always true on success.
    pub job_queued: bool,
    /// The pending job.
    pub job_id: Uuid,
    /// Scope of the job.
    pub scope: JobScope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_request_json_shape() {
        let request = PushRequest::new(
            "device-1",
            vec![
                SyncItem::create(EntityType::Payment, serde_json::json!({"amount": 10})),
                SyncItem::update(EntityType::Inventory, EntityId(42), 3, serde_json::json!({"qty": 1}))
                    .with_item_id("op-7"),
            ],
        );

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["sync_items"][0]["action"], "create");
        assert!(json["sync_items"][0].get("entity_id").is_none());
        assert_eq!(json["sync_items"][1]["client_version"], 3);
        assert_eq!(json["sync_items"][1]["item_id"], "op-7");
    }

    #[test]
    fn sync_item_defaults_missing_fields() {
        let item: SyncItem =
            serde_json::from_str(r#"{"entity_type":"bonuses","action":"sync"}"#).unwrap();
        assert_eq!(item.entity_type, EntityType::Bonus);
        assert_eq!(item.data, Value::Null);
        assert!(item.entity_id.is_none());
        assert!(item.client_version.is_none());
    }

    #[test]
    fn summary_from_results() {
        let result = |outcome| ItemResult {
            item_ref: "0".into(),
            outcome,
            entity_id: None,
            version: None,
            conflict_id: None,
            reason: None,
            duplicate: false,
            job_id: Uuid::nil(),
        };
        let response = PushResponse::from_results(vec![
            result(ItemOutcome::Applied),
            result(ItemOutcome::Applied),
            result(ItemOutcome::Conflict),
            result(ItemOutcome::Failed),
        ]);
        assert_eq!(response.summary.applied, 2);
        assert_eq!(response.summary.conflicted, 1);
        assert_eq!(response.summary.failed, 1);
        assert_eq!(response.summary.total(), 4);
    }

    #[test]
    fn cbor_message_roundtrip() {
        let message = SyncMessage::PushRequest(PushRequest::new(
            "device-1",
            vec![SyncItem::update(
                EntityType::Logistics,
                EntityId(9),
                2,
                serde_json::json!({"status": "shipped", "legs": [1, 2]}),
            )],
        ));

        let bytes = message.encode().unwrap();
        let decoded = SyncMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.type_code(), 3);
        assert!(decoded.is_request());
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(matches!(
            SyncMessage::decode(&[0xff, 0x00, 0x13]),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn pull_request_builder() {
        let request = PullRequest::new("device-1")
            .with_data_types(["payments"])
            .with_type_token(EntityType::Bonus, "tok");
        assert_eq!(request.data_types, Some(vec!["payments".to_string()]));
        assert_eq!(request.sync_tokens.get("bonus").map(String::as_str), Some("tok"));
    }
}
