//! Router tests that need no live socket.

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use codexa_files::storage::NullStore;
use codexa_runner::{AppConfig, AppState, create_router};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

fn test_state(root: &TempDir) -> AppState {
    let mut config = AppConfig::default();
    config.workspace.root = root.path().to_path_buf();
    AppState::new(config, Arc::new(NullStore))
}

#[tokio::test]
async fn test_health_reports_status_and_counts() {
    let root = TempDir::new().unwrap();
    let app = create_router(test_state(&root));

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert!(json["uptime"].as_f64().unwrap() >= 0.0);
    assert!(json["timestamp"].as_str().unwrap().contains('T'));
    assert_eq!(json["sessions"]["active"], 0);
    assert_eq!(json["sessions"]["terminals"], 0);
    assert_eq!(json["sessions"]["idle"], 0);
    assert!(json["memory"].is_object());
}

#[tokio::test]
async fn test_plain_get_on_socket_route_is_refused() {
    let root = TempDir::new().unwrap();
    let app = create_router(test_state(&root));

    let response = app
        .oneshot(
            Request::get("/ws")
                .header("host", "demo.codexa.dev")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let root = TempDir::new().unwrap();
    let app = create_router(test_state(&root));

    let response = app
        .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
