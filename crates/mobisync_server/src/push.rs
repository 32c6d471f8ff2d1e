//! Push handler: delta upload.
//!
//! Items are processed in order, each independently: a failed or conflicted
//! item never aborts the batch. Every item, duplicates included, is recorded
//! as one sync job and resolves to exactly one of applied, conflict or failed.
//!
//! Updates and deletes go through the entity store's compare-and-swap, so a
//! mutation only lands against the version the client saw. A mismatch is
//! recorded as a conflict unless the item is recognizably a retransmission of
//! a change that already landed, or of a submission that already conflicted.

use crate::conflicts::NewConflict;
use crate::error::{SyncError, SyncResult};
use crate::handler::HandlerContext;
use crate::ledger::{fingerprint, Admission, StoredOutcome};
use crate::store::{CasOutcome, Change};
use mobisync_protocol::{
    EntityRecord, ItemOutcome, ItemResult, JobScope, PushRequest, PushResponse, SyncAction,
    SyncItem,
};
use tracing::{debug, info, warn};

/// Reason recorded on jobs and results for conflicted items; the code of
/// [`SyncError::Conflict`].
const CONFLICT_REASON: &str = "conflict";

pub(crate) fn handle(ctx: &HandlerContext, request: PushRequest) -> SyncResult<PushResponse> {
    ctx.validate_device_id(&request.device_id)?;

    if request.sync_items.is_empty() {
        return Err(SyncError::InvalidRequest("push contains no sync_items".into()));
    }
    if request.sync_items.len() > ctx.config.max_push_batch {
        return Err(SyncError::InvalidRequest(format!(
            "too many items: {} > {}",
            request.sync_items.len(),
            ctx.config.max_push_batch
        )));
    }
    for item in &request.sync_items {
        ctx.registry.store(item.entity_type)?;
    }

    let results = request
        .sync_items
        .iter()
        .enumerate()
        .map(|(index, item)| process_item(ctx, &request.device_id, index, item))
        .collect();
    let response = PushResponse::from_results(results);

    info!(
        device_id = %request.device_id,
        applied = response.summary.applied,
        conflicted = response.summary.conflicted,
        failed = response.summary.failed,
        "push processed"
    );
    Ok(response)
}

/// A successfully handled item and whether it was a retransmission.
struct Handled {
    outcome: StoredOutcome,
    duplicate: bool,
}

fn process_item(ctx: &HandlerContext, device_id: &str, index: usize, item: &SyncItem) -> ItemResult {
    let item_ref = item.item_id.clone().unwrap_or_else(|| index.to_string());
    let job = ctx.jobs.enqueue(
        device_id,
        JobScope::Type(item.entity_type),
        item.action,
        item.entity_id,
    );

    let handled = ctx
        .jobs
        .start(job.id)
        .and_then(|_| admit(ctx, device_id, item));

    match handled {
        Ok(Handled { outcome, duplicate }) => {
            let job_result = match outcome.outcome {
                ItemOutcome::Conflict => ctx.jobs.fail(job.id, CONFLICT_REASON),
                _ => ctx.jobs.complete(job.id),
            };
            if let Err(err) = job_result {
                tracing::error!(job_id = %job.id, error = %err, "failed to record job outcome");
            }
            if let Some(entity_id) = outcome.entity_id {
                ctx.jobs.attach_entity(job.id, entity_id);
            }

            ItemResult {
                item_ref,
                outcome: outcome.outcome,
                entity_id: outcome.entity_id,
                version: outcome.version,
                conflict_id: outcome.conflict_id,
                reason: (outcome.outcome == ItemOutcome::Conflict)
                    .then(|| CONFLICT_REASON.to_string()),
                duplicate,
                job_id: job.id,
            }
        }
        Err(err) => {
            if let Err(job_err) = ctx.jobs.fail(job.id, err.code()) {
                tracing::error!(job_id = %job.id, error = %job_err, "failed to record job outcome");
            }
            if err.is_server_error() {
                tracing::error!(%device_id, %item_ref, error = %err, "push item failed");
            } else {
                debug!(%device_id, %item_ref, error = %err, "push item rejected");
            }

            ItemResult {
                item_ref,
                outcome: ItemOutcome::Failed,
                entity_id: item.entity_id,
                version: None,
                conflict_id: None,
                reason: Some(err.code().to_string()),
                duplicate: false,
                job_id: job.id,
            }
        }
    }
}

/// Consults the idempotency ledger before applying an item that carries an item id.
fn admit(ctx: &HandlerContext, device_id: &str, item: &SyncItem) -> SyncResult<Handled> {
    validate_item(item)?;

    let Some(item_id) = item.item_id.as_deref() else {
        return apply(ctx, device_id, item);
    };

    match ctx.ledger.begin(device_id, item_id, fingerprint(item)) {
        Admission::Replay(outcome) => {
            debug!(%device_id, %item_id, "replaying processed item");
            Ok(Handled {
                outcome,
                duplicate: true,
            })
        }
        Admission::Mismatch => Err(SyncError::InvalidRequest(format!(
            "item_id {item_id:?} was already used for a different item"
        ))),
        Admission::InFlight => Err(SyncError::Internal(format!(
            "item {item_id:?} is already being processed"
        ))),
        Admission::Fresh => match apply(ctx, device_id, item) {
            Ok(handled) => {
                ctx.ledger.complete(device_id, item_id, handled.outcome);
                Ok(handled)
            }
            Err(err) => {
                ctx.ledger.abandon(device_id, item_id);
                Err(err)
            }
        },
    }
}

/// Rejects item shapes the action cannot work with.
fn validate_item(item: &SyncItem) -> SyncResult<()> {
    match item.action {
        SyncAction::Create if item.entity_id.is_some() => Err(SyncError::InvalidRequest(
            "create must not carry an entity_id".into(),
        )),
        SyncAction::Create => Ok(()),
        SyncAction::Update | SyncAction::Delete | SyncAction::Sync => {
            if item.entity_id.is_none() {
                return Err(SyncError::InvalidRequest(format!(
                    "{} requires an entity_id",
                    item.action
                )));
            }
            if item.client_version.is_none() {
                return Err(SyncError::InvalidRequest(format!(
                    "{} requires a client_version",
                    item.action
                )));
            }
            Ok(())
        }
    }
}

/// Applies one item. A fresh version mismatch surfaces from [`write`] as
/// [`SyncError::Conflict`] and is settled here into a conflict outcome.
fn apply(ctx: &HandlerContext, device_id: &str, item: &SyncItem) -> SyncResult<Handled> {
    match write(ctx, device_id, item) {
        Err(SyncError::Conflict {
            conflict_id,
            server_version,
            ..
        }) => Ok(Handled {
            outcome: StoredOutcome {
                outcome: ItemOutcome::Conflict,
                entity_id: item.entity_id,
                version: Some(server_version),
                conflict_id: Some(conflict_id),
            },
            duplicate: false,
        }),
        other => other,
    }
}

fn write(ctx: &HandlerContext, device_id: &str, item: &SyncItem) -> SyncResult<Handled> {
    let store = ctx.registry.store(item.entity_type)?;

    let (entity_id, client_version) = match (item.action, item.entity_id, item.client_version) {
        (SyncAction::Create, _, _) => {
            let record = store.create(item.data.clone(), Some(device_id))?;
            debug!(%device_id, entity_type = %record.entity_type, entity_id = %record.entity_id, "created");
            return Ok(applied(&record, false));
        }
        (_, Some(entity_id), Some(client_version)) => (entity_id, client_version),
        _ => return Err(SyncError::InvalidRequest("item is missing entity_id or client_version".into())),
    };

    let change = match item.action {
        SyncAction::Update => Change::Update(item.data.clone()),
        SyncAction::Delete => Change::Delete,
        _ => {
            return Ok(Handled {
                outcome: StoredOutcome {
                    outcome: ItemOutcome::Applied,
                    entity_id: Some(entity_id),
                    version: Some(client_version),
                    conflict_id: None,
                },
                duplicate: false,
            })
        }
    };

    let not_found = || SyncError::EntityNotFound {
        entity_type: item.entity_type,
        entity_id,
    };

    match store.compare_and_swap(entity_id, client_version, change, Some(device_id))? {
        CasOutcome::Applied(record) => {
            debug!(%device_id, entity_type = %record.entity_type, %entity_id, version = record.version, "applied");
            Ok(applied(&record, false))
        }
        CasOutcome::Deleted(tombstone) if is_retransmission(item, client_version, &tombstone, device_id) => {
            Ok(applied(&tombstone, true))
        }
        CasOutcome::Missing | CasOutcome::Deleted(_) => Err(not_found()),
        CasOutcome::VersionMismatch(current) if is_retransmission(item, client_version, &current, device_id) => {
            debug!(%device_id, %entity_id, "retransmitted item already applied");
            Ok(applied(&current, true))
        }
        CasOutcome::VersionMismatch(current) => {
            let server_version = current.version;
            let new = NewConflict {
                device_id: device_id.to_string(),
                entity_type: item.entity_type,
                entity_id,
                server_version,
                client_version,
                server_data: current.data,
                client_data: item.data.clone(),
                client_action: item.action,
                client_updated_at: item.client_updated_at,
            };
            // Without an item id the ledger cannot see a retry, so match
            // the submission against pending conflicts instead.
            let (conflict, created) = match item.item_id {
                Some(_) => (ctx.conflicts.record(new), true),
                None => ctx.conflicts.record_once(new),
            };
            if !created {
                debug!(%device_id, %entity_id, conflict_id = %conflict.id, "retransmitted item already conflicted");
                return Ok(Handled {
                    outcome: StoredOutcome {
                        outcome: ItemOutcome::Conflict,
                        entity_id: Some(entity_id),
                        version: Some(conflict.server_version),
                        conflict_id: Some(conflict.id),
                    },
                    duplicate: true,
                });
            }

            warn!(
                %device_id,
                entity_type = %item.entity_type,
                %entity_id,
                client_version,
                server_version,
                conflict_id = %conflict.id,
                "version conflict"
            );
            Err(SyncError::Conflict {
                conflict_id: conflict.id,
                client_version,
                server_version,
            })
        }
    }
}

/// Recognizes a retry of a change that already landed: the record is exactly
/// one version past the client's, was written by this device, and carries
/// what the item asks for.
fn is_retransmission(item: &SyncItem, client_version: u64, current: &EntityRecord, device_id: &str) -> bool {
    let same_author = current.updated_by.as_deref() == Some(device_id);
    let next_version = client_version.checked_add(1) == Some(current.version);
    let same_effect = match item.action {
        SyncAction::Update => current.is_live() && current.data == item.data,
        SyncAction::Delete => current.deleted,
        _ => false,
    };
    same_author && next_version && same_effect
}

fn applied(record: &EntityRecord, duplicate: bool) -> Handled {
    Handled {
        outcome: StoredOutcome {
            outcome: ItemOutcome::Applied,
            entity_id: Some(record.entity_id),
            version: Some(record.version),
            conflict_id: None,
        },
        duplicate,
    }
}
