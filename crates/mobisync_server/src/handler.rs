//! Request handlers for sync endpoints.

use crate::config::ServerConfig;
use crate::conflicts::ConflictStore;
use crate::error::{SyncError, SyncResult};
use crate::jobs::JobQueue;
use crate::ledger::IdempotencyLedger;
use crate::resolver::ConflictResolver;
use crate::store::EntityRegistry;
use crate::token::TokenCodec;
use crate::{pull, push};
use mobisync_protocol::{
    ForceSyncRequest, ForceSyncResponse, JobScope, ListConflictsRequest, ListConflictsResponse,
    PullRequest, PullResponse, PushRequest, PushResponse, ResolveConflictRequest,
    ResolveConflictResponse, SyncAction, SyncStatusRequest, SyncStatusResponse,
};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Shared state for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Entity stores by type.
    pub registry: Arc<EntityRegistry>,
    /// Sync token codec.
    pub tokens: TokenCodec,
    /// Detected conflicts.
    pub conflicts: Arc<ConflictStore>,
    /// Job log.
    pub jobs: Arc<JobQueue>,
    /// Processed push items.
    pub ledger: Arc<IdempotencyLedger>,
    /// Mutations hold this for read, snapshots and restores for write.
    barrier: RwLock<()>,
}

impl HandlerContext {
    /// Creates a context with empty conflict, job and ledger state.
    pub fn new(config: ServerConfig, registry: Arc<EntityRegistry>, tokens: TokenCodec) -> Self {
        Self {
            config,
            registry,
            tokens,
            conflicts: Arc::new(ConflictStore::new()),
            jobs: Arc::new(JobQueue::new()),
            ledger: Arc::new(IdempotencyLedger::new()),
            barrier: RwLock::new(()),
        }
    }

    /// Admits a mutating request. Held for the whole request so entity
    /// stores, conflicts, jobs and the ledger move together.
    pub(crate) fn mutation(&self) -> RwLockReadGuard<'_, ()> {
        self.barrier.read()
    }

    /// Waits for in-flight mutations to finish and holds new ones off.
    pub(crate) fn quiesce(&self) -> RwLockWriteGuard<'_, ()> {
        self.barrier.write()
    }

    /// Checks a client-supplied device id.
    ///
    /// Device ids are opaque, but must be non-empty, bounded in length and
    /// limited to `[A-Za-z0-9._:-]`.
    pub fn validate_device_id(&self, device_id: &str) -> SyncResult<()> {
        if device_id.is_empty() {
            return Err(SyncError::InvalidRequest("device_id is required".into()));
        }
        if device_id.len() > self.config.max_device_id_len {
            return Err(SyncError::InvalidRequest(format!(
                "device_id longer than {} bytes",
                self.config.max_device_id_len
            )));
        }
        let valid = device_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'));
        if !valid {
            return Err(SyncError::InvalidRequest(
                "device_id contains unsupported characters".into(),
            ));
        }
        Ok(())
    }

    /// Records the terminal state of a job from the result of its work.
    pub(crate) fn finish_job<T>(&self, job_id: Uuid, result: &SyncResult<T>) {
        let finished = match result {
            Ok(_) => self.jobs.complete(job_id),
            Err(err) => self.jobs.fail(job_id, err.code()),
        };
        if let Err(err) = finished {
            tracing::error!(%job_id, error = %err, "failed to record job outcome");
        }
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
    resolver: ConflictResolver,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        let resolver = ConflictResolver::new(
            Arc::clone(&context.registry),
            Arc::clone(&context.conflicts),
            context.config.resolve_attempts,
        );
        Self { context, resolver }
    }

    /// Returns the shared context.
    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.context
    }

    /// Handles a pull request.
    pub fn handle_pull(&self, request: PullRequest) -> SyncResult<PullResponse> {
        pull::handle(&self.context, request)
    }

    /// Handles a push request.
    pub fn handle_push(&self, request: PushRequest) -> SyncResult<PushResponse> {
        let _mutation = self.context.mutation();
        push::handle(&self.context, request)
    }

    /// Lists a device's conflicts.
    pub fn handle_list_conflicts(
        &self,
        request: ListConflictsRequest,
    ) -> SyncResult<ListConflictsResponse> {
        self.context.validate_device_id(&request.device_id)?;
        let conflicts =
            self.context
                .conflicts
                .list(&request.device_id, request.entity_type, request.status);
        debug!(device_id = %request.device_id, count = conflicts.len(), "listed conflicts");
        Ok(ListConflictsResponse { conflicts })
    }

    /// Resolves a conflict.
    pub fn handle_resolve(
        &self,
        request: ResolveConflictRequest,
    ) -> SyncResult<ResolveConflictResponse> {
        let _mutation = self.context.mutation();
        self.resolver
            .resolve(request.conflict_id, request.resolution, request.resolved_data)
    }

    /// Reports a device's sync status.
    pub fn handle_status(&self, request: SyncStatusRequest) -> SyncResult<SyncStatusResponse> {
        self.context.validate_device_id(&request.device_id)?;
        let counts = self.context.jobs.counts(&request.device_id);

        Ok(SyncStatusResponse {
            pending_jobs: counts.pending,
            processing_jobs: counts.processing,
            completed_jobs: counts.completed,
            failed_jobs: counts.failed,
            pending_conflicts: self.context.conflicts.pending_count(&request.device_id),
            last_sync_at: counts.last_completed_at,
            health: counts.health(),
            device_id: request.device_id,
        })
    }

    /// Queues a full sync of one data type, or of all of them.
    pub fn handle_force_sync(&self, request: ForceSyncRequest) -> SyncResult<ForceSyncResponse> {
        self.context.validate_device_id(&request.device_id)?;
        let scope: JobScope = request.data_type.parse()?;
        if let JobScope::Type(entity_type) = scope {
            self.context.registry.store(entity_type)?;
        }

        let job = {
            let _mutation = self.context.mutation();
            self.context
                .jobs
                .enqueue(&request.device_id, scope, SyncAction::Sync, None)
        };
        info!(device_id = %request.device_id, %scope, job_id = %job.id, "force sync queued");

        Ok(ForceSyncResponse {
            job_queued: true,
            job_id: job.id,
            scope,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobisync_protocol::{EntityType, JobStatus, SyncHealth, SyncItem};
    use serde_json::json;

    fn create_handler() -> RequestHandler {
        let context = HandlerContext::new(
            ServerConfig::default(),
            Arc::new(EntityRegistry::in_memory()),
            TokenCodec::new(b"handler-test-secret".to_vec()),
        );
        RequestHandler::new(Arc::new(context))
    }

    #[test]
    fn device_id_validation() {
        let handler = create_handler();
        let ctx = handler.context();
        assert!(ctx.validate_device_id("tablet-7:ios.17_A").is_ok());
        assert!(ctx.validate_device_id("").is_err());
        assert!(ctx.validate_device_id("has space").is_err());
        assert!(ctx.validate_device_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn status_of_unknown_device() {
        let handler = create_handler();
        let status = handler
            .handle_status(SyncStatusRequest {
                device_id: "device-1".into(),
            })
            .unwrap();
        assert_eq!(status.pending_jobs, 0);
        assert_eq!(status.health, SyncHealth::Unknown);
        assert!(status.last_sync_at.is_none());
    }

    #[test]
    fn force_sync_queues_pending_job() {
        let handler = create_handler();
        let response = handler
            .handle_force_sync(ForceSyncRequest {
                device_id: "device-1".into(),
                data_type: "payments".into(),
            })
            .unwrap();
        assert!(response.job_queued);
        assert_eq!(response.scope, JobScope::Type(EntityType::Payment));

        let job = handler.context().jobs.get(response.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.action, SyncAction::Sync);

        let all = handler
            .handle_force_sync(ForceSyncRequest {
                device_id: "device-1".into(),
                data_type: "all".into(),
            })
            .unwrap();
        assert_eq!(all.scope, JobScope::All);

        let status = handler
            .handle_status(SyncStatusRequest {
                device_id: "device-1".into(),
            })
            .unwrap();
        assert_eq!(status.pending_jobs, 2);
    }

    #[test]
    fn force_sync_rejects_unknown_type() {
        let handler = create_handler();
        let result = handler.handle_force_sync(ForceSyncRequest {
            device_id: "device-1".into(),
            data_type: "invoices".into(),
        });
        assert!(matches!(result, Err(SyncError::InvalidRequest(_))));
    }

    #[test]
    fn status_counts_push_outcomes() {
        let handler = create_handler();
        handler
            .handle_push(PushRequest::new(
                "device-1",
                vec![
                    SyncItem::create(EntityType::Bonus, json!({"points": 10})),
                    SyncItem::update(EntityType::Bonus, 99.into(), 1, json!({})),
                ],
            ))
            .unwrap();

        let status = handler
            .handle_status(SyncStatusRequest {
                device_id: "device-1".into(),
            })
            .unwrap();
        assert_eq!(status.completed_jobs, 1);
        assert_eq!(status.failed_jobs, 1);
        assert_eq!(status.health, SyncHealth::Poor);
        assert!(status.last_sync_at.is_some());
    }
}
