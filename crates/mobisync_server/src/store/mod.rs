//! Entity store capability.
//!
//! The sync core never interprets domain payloads. It reads and writes
//! versioned records through [`EntityStore`], one instance per
//! [`EntityType`], looked up through the [`EntityRegistry`].

mod memory;
mod registry;

pub use memory::MemoryEntityStore;
pub use registry::EntityRegistry;

use chrono::{DateTime, Utc};
use mobisync_protocol::{EntityId, EntityRecord, EntityType};
use serde_json::Value;
use thiserror::Error;

/// Result type for entity store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by an entity store implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing storage could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store holds data it cannot interpret.
    #[error("store corrupt: {0}")]
    Corrupt(String),

    /// A timestamp fell outside the representable range.
    #[error("clock out of range")]
    ClockOutOfRange,
}

/// A pull cursor position: everything at or before it has been sent.
///
/// Ordering is `(updated_at, entity_id)`, which stays stable when several
/// entities share a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark {
    /// Update time of the last entity sent.
    pub updated_at: DateTime<Utc>,
    /// Id of the last entity sent.
    pub entity_id: EntityId,
}

impl Watermark {
    /// Creates a watermark.
    pub fn new(updated_at: DateTime<Utc>, entity_id: EntityId) -> Self {
        Self {
            updated_at,
            entity_id,
        }
    }

    /// Returns the watermark positioned at `record`.
    pub fn of(record: &EntityRecord) -> Self {
        Self::new(record.updated_at, record.entity_id)
    }
}

/// A mutation of an existing entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Replace the entity's data.
    Update(Value),
    /// Tombstone the entity.
    Delete,
}

/// Outcome of a compare-and-swap.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The change was written; holds the new record.
    Applied(EntityRecord),
    /// The expected version was stale; holds the current record.
    VersionMismatch(EntityRecord),
    /// No entity with that id.
    Missing,
    /// The entity is a tombstone; holds the tombstone.
    Deleted(EntityRecord),
}

/// One page of changes returned by [`EntityStore::changes_since`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangePage {
    /// Records ordered by `(updated_at, entity_id)`.
    pub records: Vec<EntityRecord>,
    /// Whether more records exist past the last one returned.
    pub has_more: bool,
}

/// Versioned key-value storage for one entity type.
///
/// # Invariants
///
/// - `create` assigns a fresh id and version 1
/// - every applied change increments the version by exactly one
/// - `compare_and_swap` reads, compares and writes as one atomic step
/// - deletes leave a tombstone with a new version; ids are never reused
/// - `updated_at` is strictly increasing across mutations of one store, so a
///   watermark handed out earlier always sorts before a later write
pub trait EntityStore: Send + Sync {
    /// Returns the entity type this store holds.
    fn entity_type(&self) -> EntityType;

    /// Gets the current record, tombstones included.
    fn get(&self, entity_id: EntityId) -> StoreResult<Option<EntityRecord>>;

    /// Creates a new entity at version 1.
    fn create(&self, data: Value, author: Option<&str>) -> StoreResult<EntityRecord>;

    /// Applies `change` only if the stored version equals `expected_version`.
    fn compare_and_swap(
        &self,
        entity_id: EntityId,
        expected_version: u64,
        change: Change,
        author: Option<&str>,
    ) -> StoreResult<CasOutcome>;

    /// Returns up to `limit` records strictly after `after`, in watermark order.
    fn changes_since(&self, after: Option<&Watermark>, limit: usize) -> StoreResult<ChangePage>;

    /// Returns every record, for snapshots.
    fn export(&self) -> StoreResult<Vec<EntityRecord>>;

    /// Replaces the store's content with `records`, for snapshot restore.
    fn restore(&self, records: Vec<EntityRecord>) -> StoreResult<()>;
}
