//! Idempotency ledger for pushed items.
//!
//! Keyed by `(device_id, item_id)`. Each key stores a SHA-256 fingerprint of
//! the item and, once processed, its terminal outcome. A retry of the same
//! item replays the stored outcome instead of applying the change again.

use mobisync_protocol::{EntityId, ItemOutcome, SyncItem};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

/// SHA-256 of an item's JSON encoding.
pub type Fingerprint = [u8; 32];

/// Computes the fingerprint of a pushed item.
///
/// JSON objects serialize with sorted keys, so two encodings of the same
/// item always hash the same.
pub fn fingerprint(item: &SyncItem) -> Fingerprint {
    let bytes = serde_json::to_vec(item).unwrap_or_default();
    Sha256::digest(&bytes).into()
}

/// The outcome remembered for a processed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOutcome {
    /// Applied or conflict.
    pub outcome: ItemOutcome,
    /// Entity the item touched.
    pub entity_id: Option<EntityId>,
    /// Entity version after the item was applied.
    pub version: Option<u64>,
    /// Conflict recorded for the item.
    pub conflict_id: Option<Uuid>,
}

/// What [`IdempotencyLedger::begin`] decided for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting; process the item and then `complete` or `abandon` it.
    Fresh,
    /// Already processed; replay this outcome.
    Replay(StoredOutcome),
    /// The key was used before for a different item.
    Mismatch,
    /// Another request is processing the same item right now.
    InFlight,
}

#[derive(Debug, Clone)]
enum State {
    InFlight,
    Done(StoredOutcome),
}

#[derive(Debug, Clone)]
struct Entry {
    fingerprint: Fingerprint,
    state: State,
}

/// A persisted ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Device id.
    pub device_id: String,
    /// Client-supplied item id.
    pub item_id: String,
    /// Item fingerprint.
    pub fingerprint: Fingerprint,
    /// Stored outcome.
    pub outcome: StoredOutcome,
}

/// Remembers processed push items per device.
#[derive(Default)]
pub struct IdempotencyLedger {
    entries: RwLock<HashMap<(String, String), Entry>>,
}

impl IdempotencyLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits an item for processing or reports how it was handled before.
    ///
    /// A `Fresh` admission reserves the key until `complete` or `abandon`.
    pub fn begin(&self, device_id: &str, item_id: &str, fingerprint: Fingerprint) -> Admission {
        let key = (device_id.to_string(), item_id.to_string());
        let mut entries = self.entries.write();

        match entries.get(&key) {
            Some(entry) if entry.fingerprint != fingerprint => Admission::Mismatch,
            Some(Entry {
                state: State::Done(outcome),
                ..
            }) => Admission::Replay(*outcome),
            Some(Entry {
                state: State::InFlight,
                ..
            }) => Admission::InFlight,
            None => {
                entries.insert(
                    key,
                    Entry {
                        fingerprint,
                        state: State::InFlight,
                    },
                );
                Admission::Fresh
            }
        }
    }

    /// Stores the outcome of an admitted item.
    pub fn complete(&self, device_id: &str, item_id: &str, outcome: StoredOutcome) {
        let key = (device_id.to_string(), item_id.to_string());
        if let Some(entry) = self.entries.write().get_mut(&key) {
            entry.state = State::Done(outcome);
        }
    }

    /// Forgets an admitted item whose processing failed, so a retry runs again.
    pub fn abandon(&self, device_id: &str, item_id: &str) {
        let key = (device_id.to_string(), item_id.to_string());
        let mut entries = self.entries.write();
        if matches!(entries.get(&key), Some(e) if matches!(e.state, State::InFlight)) {
            entries.remove(&key);
        }
    }

    /// Returns the number of completed entries.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| matches!(e.state, State::Done(_)))
            .count()
    }

    /// Returns true if no item has been completed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns every completed entry, for snapshots.
    pub fn export(&self) -> Vec<LedgerRecord> {
        let mut records: Vec<LedgerRecord> = self
            .entries
            .read()
            .iter()
            .filter_map(|((device_id, item_id), entry)| match entry.state {
                State::Done(outcome) => Some(LedgerRecord {
                    device_id: device_id.clone(),
                    item_id: item_id.clone(),
                    fingerprint: entry.fingerprint,
                    outcome,
                }),
                State::InFlight => None,
            })
            .collect();
        records.sort_by(|a, b| (&a.device_id, &a.item_id).cmp(&(&b.device_id, &b.item_id)));
        records
    }

    /// Replaces the ledger's content, for snapshot restore.
    pub fn restore(&self, records: Vec<LedgerRecord>) {
        let entries = records
            .into_iter()
            .map(|r| {
                (
                    (r.device_id, r.item_id),
                    Entry {
                        fingerprint: r.fingerprint,
                        state: State::Done(r.outcome),
                    },
                )
            })
            .collect();
        *self.entries.write() = entries;
    }
}
