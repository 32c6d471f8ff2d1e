//! Snapshot persistence.
//!
//! The server keeps its state in memory. A snapshot captures every entity
//! store, the conflict store, the job log and the idempotency ledger in one
//! file so a restarted server resumes where it stopped.
//!
//! ## Snapshot Format
//!
//! ```text
//! | magic "MSYN" (4) | version (2, LE) | CBOR body | SHA-256 of body (32) |
//! ```

use crate::error::{SyncError, SyncResult};
use crate::jobs::SyncJob;
use crate::ledger::LedgerRecord;
use chrono::{DateTime, Utc};
use mobisync_protocol::{EntityRecord, SyncConflict};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Magic bytes for snapshot files.
const SNAPSHOT_MAGIC: [u8; 4] = *b"MSYN";
/// Current snapshot format version.
const SNAPSHOT_VERSION: u16 = 1;
/// Header size (magic + version).
const HEADER_SIZE: usize = 4 + 2;
/// Footer size (digest).
const FOOTER_SIZE: usize = 32;

/// Everything the server persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
    /// Entity records of every store, tombstones included.
    pub entities: Vec<EntityRecord>,
    /// Every conflict, resolved or not.
    pub conflicts: Vec<SyncConflict>,
    /// The job log.
    pub jobs: Vec<SyncJob>,
    /// Completed idempotency ledger entries.
    pub ledger: Vec<LedgerRecord>,
}

impl Snapshot {
    /// Encodes the snapshot into the file format.
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        let mut body = Vec::new();
        ciborium::into_writer(self, &mut body)
            .map_err(|e| SyncError::Snapshot(format!("encode failed: {e}")))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + body.len() + FOOTER_SIZE);
        data.extend_from_slice(&SNAPSHOT_MAGIC);
        data.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        data.extend_from_slice(&body);
        data.extend_from_slice(&Sha256::digest(&body));
        Ok(data)
    }

    /// Decodes and verifies a snapshot file's content.
    pub fn decode(data: &[u8]) -> SyncResult<Self> {
        if data.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(SyncError::Snapshot("snapshot too small".into()));
        }
        if data[0..4] != SNAPSHOT_MAGIC {
            return Err(SyncError::Snapshot("invalid snapshot magic".into()));
        }

        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != SNAPSHOT_VERSION {
            return Err(SyncError::Snapshot(format!(
                "unsupported snapshot version: {version}"
            )));
        }

        let digest_offset = data.len() - FOOTER_SIZE;
        let body = &data[HEADER_SIZE..digest_offset];
        if Sha256::digest(body).as_slice() != &data[digest_offset..] {
            return Err(SyncError::Snapshot("snapshot digest mismatch".into()));
        }

        ciborium::from_reader(body).map_err(|e| SyncError::Snapshot(format!("decode failed: {e}")))
    }

    /// Writes the snapshot to `path` atomically.
    ///
    /// The data goes to a temporary sibling first and is renamed into place
    /// once synced, so a crash never leaves a half-written snapshot.
    pub fn write_to(&self, path: &Path) -> SyncResult<()> {
        let data = self.encode()?;
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Reads a snapshot from `path`, or `None` if the file does not exist.
    pub fn read_from(path: &Path) -> SyncResult<Option<Self>> {
        match fs::read(path) {
            Ok(data) => Self::decode(&data).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
