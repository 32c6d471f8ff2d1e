//! Main sync server.

use crate::config::ServerConfig;
use crate::conflicts::ConflictStore;
use crate::error::{SyncError, SyncResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::jobs::{JobQueue, SyncJob};
use crate::snapshot::Snapshot;
use crate::store::EntityRegistry;
use crate::token::TokenCodec;
use chrono::Utc;
use mobisync_protocol::{
    EntityType, ForceSyncRequest, ForceSyncResponse, ListConflictsRequest, ListConflictsResponse,
    PullRequest, PullResponse, PushRequest, PushResponse, ResolveConflictRequest,
    ResolveConflictResponse, SyncMessage, SyncStatusRequest, SyncStatusResponse,
};
use rand::RngCore;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// The sync server.
///
/// Owns the entity registry, conflict store, job log and idempotency ledger
/// and serves the six sync operations against them. Transports (the HTTP
/// router, a CBOR socket, tests) call the `handle_*` methods.
///
/// # Example
///
/// ```
/// use mobisync_protocol::{EntityType, PushRequest, SyncItem};
/// use mobisync_server::{ServerConfig, SyncServer};
///
/// let config = ServerConfig::default().with_token_secret(b"0123456789abcdef".to_vec());
/// let server = SyncServer::new(config).unwrap();
///
/// let item = SyncItem::create(EntityType::Payment, serde_json::json!({"amount": 5}));
/// let response = server.handle_push(PushRequest::new("device-1", vec![item])).unwrap();
/// assert_eq!(response.summary.applied, 1);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a server backing every entity type with an in-memory store.
    pub fn new(config: ServerConfig) -> SyncResult<Self> {
        Self::with_registry(config, EntityRegistry::in_memory())
    }

    /// Creates a server over caller-supplied entity stores.
    pub fn with_registry(config: ServerConfig, registry: EntityRegistry) -> SyncResult<Self> {
        config.validate()?;

        let secret = match &config.token_secret {
            Some(secret) => secret.clone(),
            None => {
                warn!("no token secret configured; using a random one, issued tokens will not survive a restart");
                let mut secret = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                secret
            }
        };

        let context = Arc::new(HandlerContext::new(
            config,
            Arc::new(registry),
            TokenCodec::new(secret),
        ));
        let handler = RequestHandler::new(Arc::clone(&context));

        Ok(Self { handler, context })
    }

    /// Creates a server and restores the snapshot at `path`, if one exists.
    pub fn load_snapshot(config: ServerConfig, path: &Path) -> SyncResult<Self> {
        let server = Self::new(config)?;
        match Snapshot::read_from(path)? {
            Some(snapshot) => {
                server.restore(snapshot)?;
                info!(path = %path.display(), "restored snapshot");
            }
            None => info!(path = %path.display(), "no snapshot found, starting empty"),
        }
        Ok(server)
    }

    /// Handles a pull request.
    pub fn handle_pull(&self, request: PullRequest) -> SyncResult<PullResponse> {
        self.handler.handle_pull(request)
    }

    /// Handles a push request.
    pub fn handle_push(&self, request: PushRequest) -> SyncResult<PushResponse> {
        self.handler.handle_push(request)
    }

    /// Lists a device's conflicts.
    pub fn handle_list_conflicts(
        &self,
        request: ListConflictsRequest,
    ) -> SyncResult<ListConflictsResponse> {
        self.handler.handle_list_conflicts(request)
    }

    /// Resolves a conflict.
    pub fn handle_resolve(
        &self,
        request: ResolveConflictRequest,
    ) -> SyncResult<ResolveConflictResponse> {
        self.handler.handle_resolve(request)
    }

    /// Reports a device's sync status.
    pub fn handle_status(&self, request: SyncStatusRequest) -> SyncResult<SyncStatusResponse> {
        self.handler.handle_status(request)
    }

    /// Queues a forced full sync.
    pub fn handle_force_sync(&self, request: ForceSyncRequest) -> SyncResult<ForceSyncResponse> {
        self.handler.handle_force_sync(request)
    }

    /// Handles a sync message (dispatches to appropriate handler).
    pub fn handle_message(&self, message: SyncMessage) -> SyncResult<SyncMessage> {
        match message {
            SyncMessage::PullRequest(req) => self.handle_pull(req).map(SyncMessage::PullResponse),
            SyncMessage::PushRequest(req) => self.handle_push(req).map(SyncMessage::PushResponse),
            SyncMessage::ListConflictsRequest(req) => self
                .handle_list_conflicts(req)
                .map(SyncMessage::ListConflictsResponse),
            SyncMessage::ResolveConflictRequest(req) => self
                .handle_resolve(req)
                .map(SyncMessage::ResolveConflictResponse),
            SyncMessage::SyncStatusRequest(req) => {
                self.handle_status(req).map(SyncMessage::SyncStatusResponse)
            }
            SyncMessage::ForceSyncRequest(req) => self
                .handle_force_sync(req)
                .map(SyncMessage::ForceSyncResponse),
            other => Err(SyncError::InvalidRequest(format!(
                "unexpected message type {}",
                other.type_code()
            ))),
        }
    }

    /// Decodes a CBOR message, handles it and encodes the reply.
    pub fn handle_bytes(&self, bytes: &[u8]) -> SyncResult<Vec<u8>> {
        let request = SyncMessage::decode(bytes)?;
        Ok(self.handle_message(request)?.encode()?)
    }

    /// Fails unfinished jobs older than the configured staleness threshold.
    pub fn expire_stale_jobs(&self) -> SyncResult<usize> {
        let max_age = chrono::Duration::from_std(self.context.config.job_stale_after)
            .map_err(|e| SyncError::Config(format!("job_stale_after: {e}")))?;
        let expired = self.context.jobs.expire_stale(Utc::now(), max_age);
        if expired > 0 {
            warn!(expired, "failed stale sync jobs");
        }
        Ok(expired)
    }

    /// Claims up to `limit` pending jobs for an out-of-band worker.
    pub fn claim_pending_jobs(&self, limit: usize) -> Vec<SyncJob> {
        self.context.jobs.claim_pending(limit)
    }

    /// Marks a claimed job completed.
    pub fn complete_job(&self, job_id: Uuid) -> SyncResult<SyncJob> {
        self.context.jobs.complete(job_id)
    }

    /// Marks a claimed job failed.
    pub fn fail_job(&self, job_id: Uuid, reason: &str) -> SyncResult<SyncJob> {
        self.context.jobs.fail(job_id, reason)
    }

    /// Captures the server's state at one consistent point.
    ///
    /// Pushes, resolutions and forced syncs wait until the capture is done,
    /// so a restored ledger never records an outcome the entity stores lack.
    /// Pulls are not held up.
    pub fn snapshot(&self) -> SyncResult<Snapshot> {
        let _quiesced = self.context.quiesce();
        let mut entities = Vec::new();
        for entity_type in self.context.registry.entity_types() {
            entities.extend(self.context.registry.store(entity_type)?.export()?);
        }

        Ok(Snapshot {
            saved_at: Utc::now(),
            entities,
            conflicts: self.context.conflicts.export(),
            jobs: self.context.jobs.export(),
            ledger: self.context.ledger.export(),
        })
    }

    /// Replaces the server's state with `snapshot`.
    pub fn restore(&self, snapshot: Snapshot) -> SyncResult<()> {
        let _quiesced = self.context.quiesce();
        let mut by_type: BTreeMap<EntityType, Vec<_>> = BTreeMap::new();
        for record in snapshot.entities {
            by_type.entry(record.entity_type).or_default().push(record);
        }

        for entity_type in by_type.keys() {
            if !self.context.registry.supports(*entity_type) {
                return Err(SyncError::Snapshot(format!(
                    "snapshot holds {entity_type} records but no store is registered"
                )));
            }
        }
        for entity_type in self.context.registry.entity_types() {
            let records = by_type.remove(&entity_type).unwrap_or_default();
            self.context.registry.store(entity_type)?.restore(records)?;
        }

        self.context.conflicts.restore(snapshot.conflicts);
        self.context.jobs.restore(snapshot.jobs);
        self.context.ledger.restore(snapshot.ledger);
        Ok(())
    }

    /// Writes a snapshot to `path`.
    pub fn save_snapshot(&self, path: &Path) -> SyncResult<()> {
        self.snapshot()?.write_to(path)?;
        info!(path = %path.display(), "saved snapshot");
        Ok(())
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Returns the entity stores.
    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.context.registry
    }

    /// Returns the conflict store.
    pub fn conflicts(&self) -> &Arc<ConflictStore> {
        &self.context.conflicts
    }

    /// Returns the job log.
    pub fn jobs(&self) -> &Arc<JobQueue> {
        &self.context.jobs
    }

    /// Returns the token codec.
    pub fn tokens(&self) -> &TokenCodec {
        &self.context.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobisync_protocol::{EntityId, JobStatus, SyncItem};
    use serde_json::json;

    fn server() -> SyncServer {
        SyncServer::new(ServerConfig::default().with_token_secret(b"server-test-secret".to_vec()))
            .unwrap()
    }

    #[test]
    fn random_secret_when_unconfigured() {
        let server = SyncServer::new(ServerConfig::default()).unwrap();
        let token = server.tokens().issue("device-1", EntityType::Bonus, None).unwrap();
        assert!(server.tokens().inspect(&token).is_ok());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ServerConfig::default().with_pull_page_size(0);
        assert!(matches!(SyncServer::new(config), Err(SyncError::Config(_))));
    }

    #[test]
    fn message_dispatch() {
        let server = server();
        let message = SyncMessage::PullRequest(PullRequest::new("device-1"));
        let response = server.handle_message(message).unwrap();
        assert!(matches!(response, SyncMessage::PullResponse(_)));

        let unexpected = SyncMessage::ListConflictsResponse(ListConflictsResponse {
            conflicts: vec![],
        });
        assert!(matches!(
            server.handle_message(unexpected),
            Err(SyncError::InvalidRequest(_))
        ));
    }

    #[test]
    fn cbor_round_trip_through_server() {
        let server = server();
        let request = SyncMessage::SyncStatusRequest(SyncStatusRequest {
            device_id: "device-1".into(),
        });
        let reply = server.handle_bytes(&request.encode().unwrap()).unwrap();
        assert!(matches!(
            SyncMessage::decode(&reply).unwrap(),
            SyncMessage::SyncStatusResponse(_)
        ));
        assert!(matches!(
            server.handle_bytes(b"not cbor"),
            Err(SyncError::InvalidRequest(_))
        ));
    }

    #[test]
    fn worker_api_drains_force_sync_jobs() {
        let server = server();
        let queued = server
            .handle_force_sync(ForceSyncRequest {
                device_id: "device-1".into(),
                data_type: "inventory".into(),
            })
            .unwrap();

        let claimed = server.claim_pending_jobs(10);
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, queued.job_id);
        let done = server.complete_job(queued.job_id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[test]
    fn worker_api_fails_claimed_job() {
        let server = server();
        let queued = server
            .handle_force_sync(ForceSyncRequest {
                device_id: "device-1".into(),
                data_type: "payments".into(),
            })
            .unwrap();

        let claimed = server.claim_pending_jobs(1);
        assert_eq!(claimed[0].status, JobStatus::Processing);
        let failed = server.fail_job(queued.job_id, "device unreachable").unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.reason.as_deref(), Some("device unreachable"));

        // Terminal jobs cannot be finished again.
        assert!(server.complete_job(queued.job_id).is_err());
        assert!(server.claim_pending_jobs(10).is_empty());

        let status = server
            .handle_status(SyncStatusRequest {
                device_id: "device-1".into(),
            })
            .unwrap();
        assert_eq!(status.failed_jobs, 1);
        assert_eq!(status.pending_jobs, 0);
    }

    #[test]
    fn snapshot_waits_for_in_flight_push() {
        let server = server();
        let guard = server.context.mutation();
        std::thread::scope(|scope| {
            let capture = scope.spawn(|| server.snapshot().unwrap());
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert!(!capture.is_finished());
            drop(guard);
            capture.join().unwrap();
        });
    }

    #[test]
    fn expire_uses_configured_age() {
        let server = SyncServer::new(
            ServerConfig::default()
                .with_token_secret(b"server-test-secret".to_vec())
                .with_job_stale_after(std::time::Duration::ZERO),
        )
        .unwrap();
        server
            .handle_force_sync(ForceSyncRequest {
                device_id: "device-1".into(),
                data_type: "all".into(),
            })
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(server.expire_stale_jobs().unwrap(), 1);
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.msyn");

        let original = server();
        original
            .handle_push(PushRequest::new(
                "device-1",
                vec![
                    SyncItem::create(EntityType::Payment, json!({"amount": 3})).with_item_id("p-1"),
                    SyncItem::create(EntityType::Inventory, json!({"sku": "X"})),
                ],
            ))
            .unwrap();
        original.save_snapshot(&path).unwrap();

        let restored = SyncServer::load_snapshot(
            ServerConfig::default().with_token_secret(b"server-test-secret".to_vec()),
            &path,
        )
        .unwrap();
        assert_eq!(restored.jobs().len(), 2);
        let payment = restored
            .registry()
            .store(EntityType::Payment)
            .unwrap()
            .get(EntityId(1))
            .unwrap()
            .unwrap();
        assert_eq!(payment.data, json!({"amount": 3}));

        // The ledger survives, so a retry after restart is still a no-op.
        let retry = restored
            .handle_push(PushRequest::new(
                "device-1",
                vec![SyncItem::create(EntityType::Payment, json!({"amount": 3})).with_item_id("p-1")],
            ))
            .unwrap();
        assert!(retry.results[0].duplicate);
        assert_eq!(retry.results[0].entity_id, Some(EntityId(1)));
    }
}
