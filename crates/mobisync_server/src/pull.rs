//! Pull handler: delta download.
//!
//! For each requested data type the handler resumes from the watermark in
//! the device's token, returns at most one page of records in
//! `(updated_at, entity_id)` order, tombstones included, and issues a token
//! positioned at the last record returned. A short page keeps the cursor
//! where it stopped, so the next pull continues rather than skips.

use crate::error::{SyncError, SyncResult};
use crate::handler::HandlerContext;
use crate::store::Watermark;
use mobisync_protocol::{
    DataTypeDelta, EntityType, JobScope, PullRequest, PullResponse, SyncAction,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

pub(crate) fn handle(ctx: &HandlerContext, request: PullRequest) -> SyncResult<PullResponse> {
    ctx.validate_device_id(&request.device_id)?;
    let types = requested_types(ctx, &request)?;
    let type_tokens = type_tokens(&request)?;

    let job = ctx.jobs.enqueue(
        &request.device_id,
        JobScope::covering(&types),
        SyncAction::Sync,
        None,
    );
    ctx.jobs.start(job.id)?;

    let result = collect(ctx, &request, &types, &type_tokens);
    ctx.finish_job(job.id, &result);

    match &result {
        Ok(response) => info!(
            device_id = %request.device_id,
            types = types.len(),
            entities = response.entity_count(),
            has_more = response.has_more(),
            "pull served"
        ),
        Err(err) if err.is_client_error() => {
            warn!(device_id = %request.device_id, error = %err, "pull rejected")
        }
        Err(err) => tracing::error!(device_id = %request.device_id, error = %err, "pull failed"),
    }
    result
}

/// Resolves the requested data types; none, empty or `all` means every registered type.
fn requested_types(ctx: &HandlerContext, request: &PullRequest) -> SyncResult<Vec<EntityType>> {
    let selectors = match request.data_types.as_deref() {
        None | Some([]) => return Ok(ctx.registry.entity_types()),
        Some(selectors) => selectors,
    };

    let mut types = BTreeSet::new();
    for selector in selectors {
        if selector.trim().eq_ignore_ascii_case("all") {
            types.extend(ctx.registry.entity_types());
            continue;
        }
        let entity_type: EntityType = selector.parse()?;
        ctx.registry.store(entity_type)?;
        types.insert(entity_type);
    }
    Ok(types.into_iter().collect())
}

/// Parses the per-type token map.
fn type_tokens(request: &PullRequest) -> SyncResult<BTreeMap<EntityType, &str>> {
    request
        .sync_tokens
        .iter()
        .map(|(name, token)| {
            let entity_type: EntityType = name.parse().map_err(|_| {
                SyncError::InvalidRequest(format!("sync token for unknown data type {name:?}"))
            })?;
            Ok((entity_type, token.as_str()))
        })
        .collect()
}

fn collect(
    ctx: &HandlerContext,
    request: &PullRequest,
    types: &[EntityType],
    type_tokens: &BTreeMap<EntityType, &str>,
) -> SyncResult<PullResponse> {
    let device_id = request.device_id.as_str();
    let mut data = BTreeMap::new();

    for &entity_type in types {
        let token = type_tokens
            .get(&entity_type)
            .copied()
            .or(request.last_sync_token.as_deref())
            .filter(|t| !t.is_empty());

        let watermark = match token {
            Some(token) => ctx.tokens.decode(token, device_id, entity_type)?,
            None => None,
        };

        let store = ctx.registry.store(entity_type)?;
        let page = store.changes_since(watermark.as_ref(), ctx.config.pull_page_size)?;
        let next = page.records.last().map(Watermark::of).or(watermark);
        let token = ctx.tokens.issue(device_id, entity_type, next.as_ref())?;

        debug!(
            %device_id,
            %entity_type,
            count = page.records.len(),
            has_more = page.has_more,
            "pulled page"
        );
        data.insert(
            entity_type,
            DataTypeDelta {
                entities: page.records,
                token,
                has_more: page.has_more,
            },
        );
    }

    Ok(PullResponse {
        device_id: device_id.to_string(),
        data,
    })
}
