//! Error types for the sync server.

use crate::store::StoreError;
use mobisync_protocol::{EntityId, EntityType, ProtocolError};
use thiserror::Error;
use uuid::Uuid;

/// Result type for server operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync server.
///
/// `InvalidRequest` and `InvalidToken` reject a whole call. The entity-level
/// errors (`EntityNotFound`, `Conflict`) are localized to one push item.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Bad or foreign sync token. The client must restart from an empty token.
    #[error("invalid sync token: {0}")]
    InvalidToken(String),

    /// Update or delete target is absent (or tombstoned).
    #[error("entity not found: {entity_type}#{entity_id}")]
    EntityNotFound {
        /// Entity type.
        entity_type: EntityType,
        /// Entity id.
        entity_id: EntityId,
    },

    /// Version mismatch recorded as a conflict. Raised while writing a push
    /// item and settled into that item's conflict outcome.
    #[error("conflict {conflict_id}: client version {client_version}, server version {server_version}")]
    Conflict {
        /// Recorded conflict.
        conflict_id: Uuid,
        /// Version the client submitted against.
        client_version: u64,
        /// Server version at detection time.
        server_version: u64,
    },

    /// No conflict with this id.
    #[error("conflict not found: {0}")]
    ConflictNotFound(Uuid),

    /// The conflict was already resolved (or is being resolved).
    #[error("conflict already resolved: {0}")]
    AlreadyResolved(Uuid),

    /// The conflicted entity has since been deleted.
    #[error("entity gone: {entity_type}#{entity_id} was deleted")]
    EntityGone {
        /// Entity type.
        entity_type: EntityType,
        /// Entity id.
        entity_id: EntityId,
    },

    /// Invalid server configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Snapshot file is corrupt or unreadable.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// Storage or other internal failure. Safe to retry.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Returns the stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::InvalidRequest(_) => "invalid_request",
            SyncError::InvalidToken(_) => "invalid_token",
            SyncError::EntityNotFound { .. } => "entity_not_found",
            SyncError::Conflict { .. } => "conflict",
            SyncError::ConflictNotFound(_) => "conflict_not_found",
            SyncError::AlreadyResolved(_) => "already_resolved",
            SyncError::EntityGone { .. } => "entity_gone",
            SyncError::Config(_)
            | SyncError::Snapshot(_)
            | SyncError::Internal(_)
            | SyncError::Io(_) => "internal_error",
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidRequest(_)
                | SyncError::InvalidToken(_)
                | SyncError::EntityNotFound { .. }
                | SyncError::Conflict { .. }
                | SyncError::ConflictNotFound(_)
                | SyncError::AlreadyResolved(_)
                | SyncError::EntityGone { .. }
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Returns true if the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Internal(_) | SyncError::Io(_))
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownEntityType(name) => {
                SyncError::InvalidRequest(format!("unsupported data type: {name:?}"))
            }
            ProtocolError::Decode(msg) => SyncError::InvalidRequest(msg),
            ProtocolError::Encode(msg) => SyncError::Internal(msg),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Internal(err.to_string())
    }
}
