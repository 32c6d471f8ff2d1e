//! HTTP router tests.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use mobisync_protocol::{EntityType, SyncItem, SyncMessage, SyncStatusRequest};
use mobisync_server::http::router;
use mobisync_server::Change;
use mobisync_testkit::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

fn app() -> (Router, Arc<SyncServer>) {
    let server = Arc::new(SyncServer::new(test_config()).unwrap());
    (router(Arc::clone(&server)), server)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(&value).unwrap())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_ok() {
    let (app, _) = app();
    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn pull_and_push_over_http() {
    let (app, server) = app();
    let record = server
        .registry()
        .store(EntityType::Payment)
        .unwrap()
        .create(json!({"amount": 10}), None)
        .unwrap();

    let (status, body) = call(
        &app,
        Method::POST,
        "/sync/pull",
        Some(json!({"device_id": "device-1", "data_types": ["payments"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["payment"]["entities"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"]["payment"]["has_more"], false);

    let item = SyncItem::update(EntityType::Payment, record.entity_id, 1, json!({"amount": 11}));
    let (status, body) = call(
        &app,
        Method::POST,
        "/sync/push",
        Some(json!({"device_id": "device-1", "sync_items": [item]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["outcome"], "applied");
    assert_eq!(body["results"][0]["version"], 2);
}

#[tokio::test]
async fn conflict_listing_and_resolution() {
    let (app, server) = app();
    let store = server.registry().store(EntityType::Inventory).unwrap();
    let record = store.create(json!({"qty": 1}), None).unwrap();
    store
        .compare_and_swap(record.entity_id, 1, Change::Update(json!({"qty": 2})), None)
        .unwrap();

    let item = SyncItem::update(EntityType::Inventory, record.entity_id, 1, json!({"qty": 9}));
    let (_, body) = call(
        &app,
        Method::POST,
        "/sync/push",
        Some(json!({"device_id": "device-1", "sync_items": [item]})),
    )
    .await;
    let conflict_id = body["results"][0]["conflict_id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        Method::GET,
        "/sync/conflicts?device_id=device-1&status=pending",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["conflicts"][0]["id"], conflict_id);

    let uri = format!("/sync/conflicts/{conflict_id}/resolve");
    let (status, body) = call(&app, Method::POST, &uri, Some(json!({"resolution": "use_client"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 3);

    let (status, body) = call(&app, Method::POST, &uri, Some(json!({"resolution": "use_client"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already_resolved");
}

#[tokio::test]
async fn unknown_conflict_is_not_found() {
    let (app, _) = app();
    let uri = format!("/sync/conflicts/{}/resolve", Uuid::nil());
    let (status, body) = call(&app, Method::POST, &uri, Some(json!({"resolution": "use_server"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "conflict_not_found");
}

#[tokio::test]
async fn malformed_requests_are_bad_requests() {
    let (app, _) = app();

    let (status, body) = call(&app, Method::POST, "/sync/pull", Some(json!({"nope": true}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");

    let (status, body) = call(
        &app,
        Method::POST,
        "/sync/pull",
        Some(json!({"device_id": "device-1", "last_sync_token": "garbage"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_token");

    let (status, _) = call(
        &app,
        Method::POST,
        "/sync/conflicts/not-a-uuid/resolve",
        Some(json!({"resolution": "merge"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn force_sync_then_status() {
    let (app, _) = app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/sync/force",
        Some(json!({"device_id": "device-7", "data_type": "all"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_queued"], true);

    let (status, body) = call(&app, Method::GET, "/sync/status/device-7", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending_jobs"], 1);
    assert_eq!(body["health"], "unknown");
}

#[tokio::test]
async fn cbor_messages_round_trip() {
    let (app, _) = app();
    let request = SyncMessage::SyncStatusRequest(SyncStatusRequest {
        device_id: "device-1".into(),
    });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/sync/message")
                .header(header::CONTENT_TYPE, "application/cbor")
                .body(Body::from(request.encode().unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    match SyncMessage::decode(&bytes).unwrap() {
        SyncMessage::SyncStatusResponse(status) => assert_eq!(status.device_id, "device-1"),
        other => panic!("unexpected reply: {other:?}"),
    }

    let (status, body) = call(&app, Method::POST, "/sync/message", Some(json!("not cbor"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
}
