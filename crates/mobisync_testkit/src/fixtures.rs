//! Test fixtures and server helpers.
//!
//! Provides a sync server with a fixed token secret and a private snapshot
//! directory, plus helpers that act as a domain service (seeding and editing
//! entities directly) or as a device (pushing and pulling).

use mobisync_protocol::{
    EntityId, EntityRecord, EntityType, PullRequest, PushRequest, PushResponse, SyncItem,
};
use mobisync_server::{CasOutcome, Change, ServerConfig, SyncServer};
use serde_json::{json, Value};
use std::path::PathBuf;
use tempfile::TempDir;

/// Token secret used by every test server.
pub const TEST_SECRET: &[u8] = b"mobisync-test-secret-0123456789";

/// Returns a configuration with the test secret.
pub fn test_config() -> ServerConfig {
    ServerConfig::default().with_token_secret(TEST_SECRET.to_vec())
}

/// Returns the device id used for device number `n`.
pub fn device(n: usize) -> String {
    format!("device-{n}")
}

/// A test sync server with automatic cleanup.
pub struct TestServer {
    /// The server instance.
    pub server: SyncServer,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: TempDir,
}

impl TestServer {
    /// Creates a server with the test configuration.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a server with a custom configuration.
    pub fn with_config(config: ServerConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        Self {
            server: SyncServer::new(config).expect("Failed to create server"),
            temp_dir,
        }
    }

    /// Returns the path this server snapshots to.
    pub fn snapshot_path(&self) -> PathBuf {
        self.temp_dir.path().join("server.msyn")
    }

    /// Saves a snapshot and starts a fresh server from it.
    pub fn restart(self) -> Self {
        let path = self.snapshot_path();
        self.server.save_snapshot(&path).expect("Failed to save snapshot");
        let config = self.server.config().clone();
        Self {
            server: SyncServer::load_snapshot(config, &path).expect("Failed to load snapshot"),
            temp_dir: self.temp_dir,
        }
    }

    /// Creates one entity as a domain service would.
    pub fn seed_one(&self, entity_type: EntityType, data: Value) -> EntityRecord {
        self.server
            .registry()
            .store(entity_type)
            .expect("Unsupported entity type")
            .create(data, None)
            .expect("Failed to create entity")
    }

    /// Creates `count` entities of one type.
    pub fn seed(&self, entity_type: EntityType, count: usize) -> Vec<EntityRecord> {
        (0..count)
            .map(|n| self.seed_one(entity_type, json!({"n": n})))
            .collect()
    }

    /// Returns the stored record, tombstones included.
    pub fn current(&self, entity_type: EntityType, entity_id: EntityId) -> Option<EntityRecord> {
        self.server
            .registry()
            .store(entity_type)
            .expect("Unsupported entity type")
            .get(entity_id)
            .expect("Failed to read entity")
    }

    /// Changes an entity server-side, at whatever version is current.
    pub fn domain_update(&self, entity_type: EntityType, entity_id: EntityId, data: Value) -> EntityRecord {
        let current = self
            .current(entity_type, entity_id)
            .expect("Entity does not exist");
        let outcome = self
            .server
            .registry()
            .store(entity_type)
            .expect("Unsupported entity type")
            .compare_and_swap(entity_id, current.version, Change::Update(data), None)
            .expect("Failed to update entity");
        match outcome {
            CasOutcome::Applied(record) => record,
            other => panic!("domain update did not apply: {other:?}"),
        }
    }

    /// Pushes items as `device_id`.
    pub fn push(&self, device_id: &str, items: Vec<SyncItem>) -> PushResponse {
        self.server
            .handle_push(PushRequest::new(device_id, items))
            .expect("Push rejected")
    }

    /// Pulls one data type from the beginning of time until no pages remain.
    pub fn pull_all(&self, device_id: &str, entity_type: EntityType) -> Vec<EntityRecord> {
        let (records, _) = self.pull_from(device_id, entity_type, None);
        records
    }

    /// Pulls one data type from `token` until no pages remain.
    ///
    /// Returns every record received and the final token.
    pub fn pull_from(
        &self,
        device_id: &str,
        entity_type: EntityType,
        token: Option<String>,
    ) -> (Vec<EntityRecord>, String) {
        let mut records = Vec::new();
        let mut token = token;
        loop {
            let mut request = PullRequest::new(device_id).with_data_types([entity_type.as_str()]);
            if let Some(token) = &token {
                request = request.with_token(token.clone());
            }
            let mut response = self.server.handle_pull(request).expect("Pull rejected");
            let delta = response
                .data
                .remove(&entity_type)
                .expect("Pull response is missing the requested type");
            records.extend(delta.entities);
            token = Some(delta.token.clone());
            if !delta.has_more {
                return (records, delta.token);
            }
        }
    }
}

impl Default for TestServer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestServer {
    type Target = SyncServer;

    fn deref(&self) -> &Self::Target {
        &self.server
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_and_pull() {
        let server = TestServer::with_config(test_config().with_pull_page_size(2));
        server.seed(EntityType::Payment, 5);
        assert_eq!(server.pull_all(&device(1), EntityType::Payment).len(), 5);
    }

    #[test]
    fn restart_keeps_state() {
        let server = TestServer::new();
        let record = server.seed_one(EntityType::Bonus, json!({"points": 1}));
        let server = server.restart();
        assert_eq!(server.current(EntityType::Bonus, record.entity_id), Some(record));
    }
}
