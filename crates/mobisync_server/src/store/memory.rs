//! In-memory entity store.

use super::{CasOutcome, Change, ChangePage, EntityStore, StoreError, StoreResult, Watermark};
use crate::detector::{check_version, VersionCheck};
use chrono::{DateTime, Utc};
use mobisync_protocol::{EntityId, EntityRecord, EntityType};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;

/// An in-memory entity store for one entity type.
///
/// Records live in a map keyed by id, with a secondary index ordered by
/// watermark for pulls. Both sit behind one lock so compare-and-swap is a
/// single critical section; pulls take the read side only.
///
/// # Example
///
/// ```rust
/// use mobisync_protocol::EntityType;
/// use mobisync_server::{EntityStore, MemoryEntityStore};
///
/// let store = MemoryEntityStore::new(EntityType::Inventory);
/// let record = store.create(serde_json::json!({"sku": "A-1"}), None).unwrap();
/// assert_eq!(record.version, 1);
/// ```
pub struct MemoryEntityStore {
    entity_type: EntityType,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<EntityId, EntityRecord>,
    by_watermark: BTreeMap<Watermark, EntityId>,
    next_id: u64,
    last_micros: i64,
}

impl Inner {
    /// Returns a timestamp strictly after every previous one.
    fn next_stamp(&mut self) -> StoreResult<DateTime<Utc>> {
        let now = Utc::now().timestamp_micros();
        let micros = now.max(self.last_micros.saturating_add(1));
        self.last_micros = micros;
        DateTime::from_timestamp_micros(micros).ok_or(StoreError::ClockOutOfRange)
    }

    fn put(&mut self, record: EntityRecord, previous: Option<Watermark>) {
        if let Some(previous) = previous {
            self.by_watermark.remove(&previous);
        }
        self.by_watermark
            .insert(Watermark::of(&record), record.entity_id);
        self.records.insert(record.entity_id, record);
    }
}

impl MemoryEntityStore {
    /// Creates an empty store.
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            inner: RwLock::new(Inner {
                next_id: 1,
                ..Inner::default()
            }),
        }
    }

    /// Returns the number of records, tombstones included.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Returns true if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }
}

impl EntityStore for MemoryEntityStore {
    fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    fn get(&self, entity_id: EntityId) -> StoreResult<Option<EntityRecord>> {
        Ok(self.inner.read().records.get(&entity_id).cloned())
    }

    fn create(&self, data: Value, author: Option<&str>) -> StoreResult<EntityRecord> {
        let mut inner = self.inner.write();
        let updated_at = inner.next_stamp()?;
        let entity_id = EntityId(inner.next_id);
        inner.next_id += 1;

        let record = EntityRecord {
            entity_type: self.entity_type,
            entity_id,
            version: 1,
            data,
            deleted: false,
            updated_at,
            updated_by: author.map(str::to_string),
        };
        inner.put(record.clone(), None);
        Ok(record)
    }

    fn compare_and_swap(
        &self,
        entity_id: EntityId,
        expected_version: u64,
        change: Change,
        author: Option<&str>,
    ) -> StoreResult<CasOutcome> {
        let mut inner = self.inner.write();

        let current = match inner.records.get(&entity_id) {
            None => return Ok(CasOutcome::Missing),
            Some(record) if record.deleted => return Ok(CasOutcome::Deleted(record.clone())),
            Some(record) => record.clone(),
        };

        if let VersionCheck::Conflict { .. } = check_version(expected_version, current.version) {
            return Ok(CasOutcome::VersionMismatch(current));
        }

        let previous = Watermark::of(&current);
        let mut next = current;
        next.version += 1;
        next.updated_at = inner.next_stamp()?;
        next.updated_by = author.map(str::to_string);
        match change {
            Change::Update(data) => next.data = data,
            Change::Delete => next.deleted = true,
        }

        inner.put(next.clone(), Some(previous));
        Ok(CasOutcome::Applied(next))
    }

    fn changes_since(&self, after: Option<&Watermark>, limit: usize) -> StoreResult<ChangePage> {
        let inner = self.inner.read();
        let lower = match after {
            Some(watermark) => Bound::Excluded(*watermark),
            None => Bound::Unbounded,
        };

        let mut ids = inner
            .by_watermark
            .range((lower, Bound::Unbounded))
            .map(|(_, id)| *id);

        let mut records = Vec::with_capacity(limit.min(inner.records.len()));
        for id in ids.by_ref().take(limit) {
            let record = inner
                .records
                .get(&id)
                .ok_or_else(|| StoreError::Corrupt(format!("index points at missing id {id}")))?;
            records.push(record.clone());
        }
        let has_more = ids.next().is_some();

        Ok(ChangePage { records, has_more })
    }

    fn export(&self) -> StoreResult<Vec<EntityRecord>> {
        Ok(self.inner.read().records.values().cloned().collect())
    }

    fn restore(&self, records: Vec<EntityRecord>) -> StoreResult<()> {
        let mut fresh = Inner {
            next_id: 1,
            ..Inner::default()
        };
        for record in records {
            if record.entity_type != self.entity_type {
                return Err(StoreError::Corrupt(format!(
                    "{} record in {} store",
                    record.entity_type, self.entity_type
                )));
            }
            fresh.next_id = fresh.next_id.max(record.entity_id.as_u64() + 1);
            fresh.last_micros = fresh.last_micros.max(record.updated_at.timestamp_micros());
            fresh.put(record, None);
        }
        *self.inner.write() = fresh;
        Ok(())
    }
}
