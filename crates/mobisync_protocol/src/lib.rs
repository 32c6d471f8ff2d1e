//! # mobisync protocol
//!
//! Wire types for the mobisync store-and-forward sync protocol.
//!
//! This crate provides:
//! - `EntityType`, `EntityId` and `EntityRecord` for versioned domain records
//! - Sync actions, conflict/job status enums and sync health buckets
//! - Request and response types for pull, push, conflict listing,
//!   conflict resolution, sync status and force sync
//! - `SyncMessage`, a CBOR envelope over every request and response
//!
//! This is a pure protocol crate with no I/O operations. JSON encoding comes
//! from the serde derives; binary encoding goes through [`SyncMessage`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entity;
mod error;
mod messages;
mod types;

pub use entity::{EntityId, EntityRecord};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    DataTypeDelta, ForceSyncRequest, ForceSyncResponse, ItemOutcome, ItemResult,
    ListConflictsRequest, ListConflictsResponse, PullRequest, PullResponse, PushRequest,
    PushResponse, PushSummary, ResolveConflictRequest, ResolveConflictResponse, SyncConflict,
    SyncItem, SyncMessage, SyncStatusRequest, SyncStatusResponse,
};
pub use types::{
    ConflictStatus, EntityType, JobScope, JobStatus, Resolution, SyncAction, SyncHealth,
};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;
