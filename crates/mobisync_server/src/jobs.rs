//! Sync job queue.
//!
//! Every pull, every pushed item and every force-sync request is recorded as
//! a [`SyncJob`]. Jobs move `pending -> processing -> completed | failed` and
//! are never deleted; a device's job history drives its sync health.
//!
//! Force-sync jobs stay pending until a worker drains them with
//! [`JobQueue::claim_pending`]. Jobs that nobody finishes are failed with
//! reason `stale` by [`JobQueue::expire_stale`].

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Duration, Utc};
use mobisync_protocol::{EntityId, JobScope, JobStatus, SyncAction, SyncHealth};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Failure reason recorded by [`JobQueue::expire_stale`].
pub const STALE_REASON: &str = "stale";

/// One unit of sync work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    /// Job id.
    pub id: Uuid,
    /// Device the job belongs to.
    pub device_id: String,
    /// Data types covered.
    pub scope: JobScope,
    /// Entity the job touched, if any.
    #[serde(default)]
    pub entity_id: Option<EntityId>,
    /// Action performed.
    pub action: SyncAction,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Why the job failed.
    #[serde(default)]
    pub reason: Option<String>,
    /// When the job was recorded.
    pub created_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

/// Per-device job counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobCounts {
    /// Pending jobs.
    pub pending: u64,
    /// Processing jobs.
    pub processing: u64,
    /// Completed jobs.
    pub completed: u64,
    /// Failed jobs.
    pub failed: u64,
    /// Most recent completion time.
    pub last_completed_at: Option<DateTime<Utc>>,
}

impl JobCounts {
    /// Returns the health bucket for these counts.
    pub fn health(&self) -> SyncHealth {
        SyncHealth::from_counts(self.completed, self.failed)
    }
}

/// The in-memory job log.
#[derive(Default)]
pub struct JobQueue {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, SyncJob>,
    order: Vec<Uuid>,
}

impl Inner {
    fn transition(&mut self, id: Uuid, to: JobStatus, reason: Option<String>) -> SyncResult<SyncJob> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| SyncError::Internal(format!("unknown job {id}")))?;

        let allowed = match (job.status, to) {
            (JobStatus::Pending, JobStatus::Processing) => true,
            (JobStatus::Pending | JobStatus::Processing, JobStatus::Completed | JobStatus::Failed) => true,
            _ => false,
        };
        if !allowed {
            return Err(SyncError::Internal(format!(
                "job {id} cannot move from {:?} to {:?}",
                job.status, to
            )));
        }

        job.status = to;
        if to.is_terminal() {
            job.reason = reason;
            job.processed_at = Some(Utc::now());
        }
        Ok(job.clone())
    }
}

impl JobQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pending job.
    pub fn enqueue(
        &self,
        device_id: &str,
        scope: JobScope,
        action: SyncAction,
        entity_id: Option<EntityId>,
    ) -> SyncJob {
        let job = SyncJob {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            scope,
            entity_id,
            action,
            status: JobStatus::Pending,
            reason: None,
            created_at: Utc::now(),
            processed_at: None,
        };

        let mut inner = self.inner.write();
        inner.order.push(job.id);
        inner.jobs.insert(job.id, job.clone());
        job
    }

    /// Moves a pending job to processing.
    pub fn start(&self, id: Uuid) -> SyncResult<SyncJob> {
        self.inner.write().transition(id, JobStatus::Processing, None)
    }

    /// Marks a job completed.
    pub fn complete(&self, id: Uuid) -> SyncResult<SyncJob> {
        self.inner.write().transition(id, JobStatus::Completed, None)
    }

    /// Marks a job failed with `reason`.
    pub fn fail(&self, id: Uuid, reason: impl Into<String>) -> SyncResult<SyncJob> {
        self.inner
            .write()
            .transition(id, JobStatus::Failed, Some(reason.into()))
    }

    /// Sets the entity a job touched, once it is known.
    pub fn attach_entity(&self, id: Uuid, entity_id: EntityId) {
        if let Some(job) = self.inner.write().jobs.get_mut(&id) {
            job.entity_id = Some(entity_id);
        }
    }

    /// Claims up to `limit` of the oldest pending jobs, moving them to processing.
    pub fn claim_pending(&self, limit: usize) -> Vec<SyncJob> {
        let mut inner = self.inner.write();
        let pending: Vec<Uuid> = inner
            .order
            .iter()
            .filter(|id| matches!(inner.jobs.get(*id), Some(j) if j.status == JobStatus::Pending))
            .take(limit)
            .copied()
            .collect();

        pending
            .into_iter()
            .filter_map(|id| inner.transition(id, JobStatus::Processing, None).ok())
            .collect()
    }

    /// Fails every pending or processing job created more than `max_age` before `now`.
    ///
    /// Returns the number of jobs expired.
    pub fn expire_stale(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let cutoff = now - max_age;
        let mut inner = self.inner.write();
        let stale: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal() && j.created_at < cutoff)
            .map(|j| j.id)
            .collect();

        stale
            .into_iter()
            .filter(|id| {
                inner
                    .transition(*id, JobStatus::Failed, Some(STALE_REASON.to_string()))
                    .is_ok()
            })
            .count()
    }

    /// Gets a job by id.
    pub fn get(&self, id: Uuid) -> Option<SyncJob> {
        self.inner.read().jobs.get(&id).cloned()
    }

    /// Returns a device's jobs, oldest first.
    pub fn jobs_for(&self, device_id: &str) -> Vec<SyncJob> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|j| j.device_id == device_id)
            .cloned()
            .collect()
    }

    /// Counts a device's jobs by status.
    pub fn counts(&self, device_id: &str) -> JobCounts {
        let inner = self.inner.read();
        inner
            .jobs
            .values()
            .filter(|j| j.device_id == device_id)
            .fold(JobCounts::default(), |mut counts, job| {
                match job.status {
                    JobStatus::Pending => counts.pending += 1,
                    JobStatus::Processing => counts.processing += 1,
                    JobStatus::Completed => {
                        counts.completed += 1;
                        counts.last_completed_at = counts.last_completed_at.max(job.processed_at);
                    }
                    JobStatus::Failed => counts.failed += 1,
                }
                counts
            })
    }

    /// Returns the total number of jobs.
    pub fn len(&self) -> usize {
        self.inner.read().jobs.len()
    }

    /// Returns true if no job was ever recorded.
    pub fn is_empty(&self) -> bool {
        self.inner.read().jobs.is_empty()
    }

    /// Returns every job in creation order, for snapshots.
    pub fn export(&self) -> Vec<SyncJob> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect()
    }

    /// Replaces the queue's content, for snapshot restore.
    pub fn restore(&self, jobs: Vec<SyncJob>) {
        let mut fresh = Inner::default();
        for job in jobs {
            fresh.order.push(job.id);
            fresh.jobs.insert(job.id, job);
        }
        *self.inner.write() = fresh;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobisync_protocol::EntityType;

    fn push_job(queue: &JobQueue, device: &str) -> SyncJob {
        queue.enqueue(
            device,
            JobScope::Type(EntityType::Inventory),
            SyncAction::Update,
            Some(EntityId(1)),
        )
    }

    #[test]
    fn lifecycle() {
        let queue = JobQueue::new();
        let job = push_job(&queue, "device-1");
        assert_eq!(job.status, JobStatus::Pending);

        assert_eq!(queue.start(job.id).unwrap().status, JobStatus::Processing);
        let done = queue.complete(job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.processed_at.is_some());
    }

    #[test]
    fn terminal_states_stick() {
        let queue = JobQueue::new();
        let job = push_job(&queue, "device-1");
        queue.fail(job.id, "conflict").unwrap();

        assert!(queue.complete(job.id).is_err());
        assert!(queue.start(job.id).is_err());
        let stored = queue.get(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.reason.as_deref(), Some("conflict"));
    }

    #[test]
    fn counts_and_health() {
        let queue = JobQueue::new();
        for _ in 0..19 {
            let job = push_job(&queue, "device-1");
            queue.complete(job.id).unwrap();
        }
        let failed = push_job(&queue, "device-1");
        queue.fail(failed.id, "internal_error").unwrap();
        push_job(&queue, "device-1");
        push_job(&queue, "device-2");

        let counts = queue.counts("device-1");
        assert_eq!(counts.completed, 19);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 1);
        assert!(counts.last_completed_at.is_some());
        assert_eq!(counts.health(), SyncHealth::Excellent);

        assert_eq!(queue.counts("device-3").health(), SyncHealth::Unknown);
    }

    #[test]
    fn claim_pending_takes_oldest_first() {
        let queue = JobQueue::new();
        let first = queue.enqueue("device-1", JobScope::All, SyncAction::Sync, None);
        let second = queue.enqueue("device-1", JobScope::All, SyncAction::Sync, None);
        queue.enqueue("device-1", JobScope::All, SyncAction::Sync, None);

        let claimed = queue.claim_pending(2);
        let ids: Vec<_> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(claimed.iter().all(|j| j.status == JobStatus::Processing));
        assert_eq!(queue.claim_pending(10).len(), 1);
        assert!(queue.claim_pending(10).is_empty());
    }

    #[test]
    fn expire_stale_fails_old_unfinished_jobs() {
        let queue = JobQueue::new();
        let pending = queue.enqueue("device-1", JobScope::All, SyncAction::Sync, None);
        let processing = push_job(&queue, "device-1");
        queue.start(processing.id).unwrap();
        let done = push_job(&queue, "device-1");
        queue.complete(done.id).unwrap();

        assert_eq!(queue.expire_stale(Utc::now(), Duration::hours(1)), 0);

        let later = Utc::now() + Duration::hours(2);
        assert_eq!(queue.expire_stale(later, Duration::hours(1)), 2);
        for id in [pending.id, processing.id] {
            let job = queue.get(id).unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.reason.as_deref(), Some(STALE_REASON));
        }
        assert_eq!(queue.get(done.id).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn export_and_restore() {
        let queue = JobQueue::new();
        push_job(&queue, "device-1");
        push_job(&queue, "device-2");

        let restored = JobQueue::new();
        restored.restore(queue.export());
        assert_eq!(restored.export(), queue.export());
        assert_eq!(restored.jobs_for("device-2").len(), 1);
    }
}
