#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Control-plane routes driven through the router without a socket.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use mosaic_core::Config;
use mosaic_core::config::{DeviceConfig, ModelConfig};
use mosaic_daemon::backend::BackendRegistry;
use mosaic_daemon::engine::Engine;
use mosaic_daemon::ledger::StaticDiscovery;
use mosaic_daemon::server::{AppState, build_router};

async fn router() -> Router {
    let mut config = Config {
        devices: vec![
            DeviceConfig {
                id: "gpu0".to_string(),
                total_capacity: 24,
                reserved_capacity: 1,
            },
            DeviceConfig {
                id: "gpu1".to_string(),
                total_capacity: 16,
                reserved_capacity: 0,
            },
        ],
        models: vec![
            ModelConfig {
                id: "writer".to_string(),
                capacity: 4,
                pinned_device: None,
                backend: "echo".to_string(),
            },
            ModelConfig {
                id: "critic".to_string(),
                capacity: 4,
                pinned_device: None,
                backend: "echo".to_string(),
            },
        ],
        ..Config::default()
    };
    config.placement.allow_colocation = false;
    let discovery = StaticDiscovery::from_config(&config.devices);
    let engine = Engine::from_config(&config, &discovery, BackendRegistry::with_defaults())
        .await
        .unwrap();
    build_router(AppState::new(Arc::new(engine)))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_ok() {
    let app = router().await;
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn allocate_then_exhaust_without_colocation() {
    let app = router().await;

    let (status, body) = send(
        &app,
        "POST",
        "/allocate",
        Some(json!({ "model_id": "llama", "capacity_requirement": 20 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device_id"], "gpu0");
    assert_eq!(body["ref_count"], 1);

    // gpu1 is free but too small; gpu0 is occupied.
    let (status, body) = send(
        &app,
        "POST",
        "/allocate",
        Some(json!({ "model_id": "mistral", "capacity_requirement": 18 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "capacity_exhausted");

    let (status, body) = send(&app, "GET", "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["strategy"], "auto");
    assert_eq!(body["placements"].as_array().unwrap().len(), 1);
    assert_eq!(body["devices"][0]["current_used"], 20);
}

#[tokio::test]
async fn allocate_on_unknown_device_is_not_found() {
    let app = router().await;
    let (status, body) = send(
        &app,
        "POST",
        "/allocate",
        Some(json!({
            "model_id": "llama",
            "capacity_requirement": 4,
            "preferred_device": "gpu7",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "unknown_device");
}

#[tokio::test]
async fn allocate_rejects_zero_capacity() {
    let app = router().await;
    let (status, body) = send(
        &app,
        "POST",
        "/allocate",
        Some(json!({ "model_id": "llama", "capacity_requirement": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");
}

#[tokio::test]
async fn release_twice_is_a_conflict() {
    let app = router().await;
    send(
        &app,
        "POST",
        "/allocate",
        Some(json!({ "model_id": "llama", "capacity_requirement": 4 })),
    )
    .await;

    let (status, body) = send(&app, "POST", "/release", Some(json!({ "model_id": "llama" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ref_count"], 0);

    let (status, body) = send(&app, "POST", "/release", Some(json!({ "model_id": "llama" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "not_held");
}

#[tokio::test]
async fn recommend_commits_nothing() {
    let app = router().await;
    let (status, body) = send(
        &app,
        "POST",
        "/recommend",
        Some(json!({ "models": [
            { "model_id": "a", "capacity_requirement": 20 },
            { "model_id": "b", "capacity_requirement": 10 },
            { "model_id": "c", "capacity_requirement": 10 },
        ]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let assignments = body["assignments"].as_array().unwrap();
    assert_eq!(assignments[0]["device_id"], "gpu0");
    assert_eq!(assignments[1]["device_id"], "gpu1");
    assert!(assignments[2]["device_id"].is_null());

    let (_, status_body) = send(&app, "GET", "/status", None).await;
    assert!(status_body["placements"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn execute_sequential_with_echo() {
    let app = router().await;
    let (status, body) = send(
        &app,
        "POST",
        "/execute",
        Some(json!({
            "pattern": "sequential",
            "models": ["writer", "critic"],
            "input": "draft",
            "request_id": "req-1",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["request_id"], "req-1");
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["output"], "[echo] [echo] draft");
    assert_eq!(body["branches"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn execute_rejects_bad_topology_and_unknown_models() {
    let app = router().await;

    let (status, body) = send(
        &app,
        "POST",
        "/execute",
        Some(json!({ "pattern": "ensemble", "models": ["writer"], "input": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "invalid_topology");

    let (status, body) = send(
        &app,
        "POST",
        "/execute",
        Some(json!({ "pattern": "voting", "models": ["ghost"], "input": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "unknown_model");
}

#[tokio::test]
async fn abort_of_unknown_request_is_not_found() {
    let app = router().await;
    let (status, body) = send(&app, "POST", "/abort", Some(json!({ "request_id": "nope" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "unknown_request");
}

#[tokio::test]
async fn malformed_json_is_a_validation_error() {
    let app = router().await;
    let request = Request::builder()
        .method("POST")
        .uri("/allocate")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["kind"], "validation");
}
