//! HTTP interface.
//!
//! JSON endpoints over [`SyncServer`]:
//!
//! | method | path | operation |
//! |---|---|---|
//! | GET | `/health` | liveness |
//! | POST | `/sync/pull` | pull |
//! | POST | `/sync/push` | push |
//! | GET | `/sync/conflicts?device_id=..&entity_type=..&status=..` | list conflicts |
//! | POST | `/sync/conflicts/:id/resolve` | resolve conflict |
//! | GET | `/sync/status/:device_id` | sync status |
//! | POST | `/sync/force` | force sync |
//! | POST | `/sync/message` | any request as a CBOR [`SyncMessage`](mobisync_protocol::SyncMessage) |
//!
//! Errors are returned as `{"error": code, "message": text}`.

use crate::error::SyncError;
use crate::server::SyncServer;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::body::Bytes;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mobisync_protocol::{
    ForceSyncRequest, ForceSyncResponse, ListConflictsRequest, ListConflictsResponse,
    PullRequest, PullResponse, PushRequest, PushResponse, ResolveConflictRequest,
    ResolveConflictResponse, Resolution, SyncStatusRequest, SyncStatusResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

type ApiResult<T> = Result<Json<T>, SyncError>;

/// Builds the sync router.
pub fn router(server: Arc<SyncServer>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sync/pull", post(pull))
        .route("/sync/push", post(push))
        .route("/sync/conflicts", get(list_conflicts))
        .route("/sync/conflicts/:id/resolve", post(resolve))
        .route("/sync/status/:device_id", get(status))
        .route("/sync/force", post(force_sync))
        .route("/sync/message", post(message))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

/// HTTP status for an error.
pub fn status_code(err: &SyncError) -> StatusCode {
    match err {
        SyncError::InvalidRequest(_) | SyncError::InvalidToken(_) => StatusCode::BAD_REQUEST,
        SyncError::EntityNotFound { .. } | SyncError::ConflictNotFound(_) => StatusCode::NOT_FOUND,
        SyncError::Conflict { .. } | SyncError::AlreadyResolved(_) | SyncError::EntityGone { .. } => {
            StatusCode::CONFLICT
        }
        SyncError::Config(_) | SyncError::Snapshot(_) | SyncError::Internal(_) | SyncError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = status_code(&self);
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = Json(ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

fn bad_json(rejection: JsonRejection) -> SyncError {
    SyncError::InvalidRequest(rejection.body_text())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn pull(
    State(server): State<Arc<SyncServer>>,
    body: Result<Json<PullRequest>, JsonRejection>,
) -> ApiResult<PullResponse> {
    let Json(request) = body.map_err(bad_json)?;
    server.handle_pull(request).map(Json)
}

async fn push(
    State(server): State<Arc<SyncServer>>,
    body: Result<Json<PushRequest>, JsonRejection>,
) -> ApiResult<PushResponse> {
    let Json(request) = body.map_err(bad_json)?;
    server.handle_push(request).map(Json)
}

async fn list_conflicts(
    State(server): State<Arc<SyncServer>>,
    query: Result<Query<ListConflictsRequest>, QueryRejection>,
) -> ApiResult<ListConflictsResponse> {
    let Query(request) = query.map_err(|r| SyncError::InvalidRequest(r.body_text()))?;
    server.handle_list_conflicts(request).map(Json)
}

/// Body of a resolve call; the conflict id comes from the path.
#[derive(Debug, Deserialize)]
struct ResolveBody {
    resolution: Resolution,
    #[serde(default)]
    resolved_data: Option<Value>,
}

async fn resolve(
    State(server): State<Arc<SyncServer>>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<ResolveBody>, JsonRejection>,
) -> ApiResult<ResolveConflictResponse> {
    let Path(conflict_id) = id.map_err(|r| SyncError::InvalidRequest(r.body_text()))?;
    let Json(body) = body.map_err(bad_json)?;
    server
        .handle_resolve(ResolveConflictRequest {
            conflict_id,
            resolution: body.resolution,
            resolved_data: body.resolved_data,
        })
        .map(Json)
}

async fn status(
    State(server): State<Arc<SyncServer>>,
    Path(device_id): Path<String>,
) -> ApiResult<SyncStatusResponse> {
    server
        .handle_status(SyncStatusRequest { device_id })
        .map(Json)
}

async fn force_sync(
    State(server): State<Arc<SyncServer>>,
    body: Result<Json<ForceSyncRequest>, JsonRejection>,
) -> ApiResult<ForceSyncResponse> {
    let Json(request) = body.map_err(bad_json)?;
    server.handle_force_sync(request).map(Json)
}

async fn message(State(server): State<Arc<SyncServer>>, body: Bytes) -> Response {
    match server.handle_bytes(&body) {
        Ok(reply) => ([(header::CONTENT_TYPE, "application/cbor")], reply).into_response(),
        Err(err) => err.into_response(),
    }
}
