//! Integration tests for the status gateway endpoints.

use axum::body::Body;
use dlchan_core::gateway::{GatewayState, SharedGatewayState, router};
use dlchan_core::{CurvePoint, DlchanConfig, HistoryRecord, ProgressChannel, Stores};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

fn make_state(dir: &TempDir) -> SharedGatewayState {
    let config = DlchanConfig::default();
    let paths = config.paths(dir.path());
    Arc::new(GatewayState::new(
        Stores::open(&paths),
        Arc::new(ProgressChannel::new()),
        config,
        paths.train_dataset,
    ))
}

fn make_request(uri: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn get_body(state: SharedGatewayState, uri: &str) -> (axum::http::StatusCode, Vec<u8>) {
    let app = router(state);
    let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, make_request(uri))
        .await
        .unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 1_000_000)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn get_json(state: SharedGatewayState, uri: &str) -> serde_json::Value {
    let (status, body) = get_body(state, uri).await;
    assert_eq!(status, axum::http::StatusCode::OK);
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health() {
    let dir = TempDir::new().unwrap();
    let json = get_json(make_state(&dir), "/health").await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_waiters_shows_first_three() {
    let dir = TempDir::new().unwrap();
    let state = make_state(&dir);
    for name in ["a", "b", "c", "d"] {
        state.stores.queue.enqueue(&format!("{name}.nn")).unwrap();
    }
    let json = get_json(state, "/api/waiters").await;
    assert_eq!(
        json["waiters"],
        serde_json::json!(["a.nn", "b.nn", "c.nn"])
    );
}

#[tokio::test]
async fn test_ranking_formats_accuracy_and_highlight() {
    let dir = TempDir::new().unwrap();
    let state = make_state(&dir);
    state
        .stores
        .table
        .update("m1", 90.0, 0.1, Some(1000), &[90.0])
        .unwrap();
    state
        .stores
        .table
        .update("m2", 87.5, 0.1, None, &[87.5])
        .unwrap();

    let json = get_json(Arc::clone(&state), "/api/ranking").await;
    assert_eq!(
        json["rank"],
        serde_json::json!([["m1", "90.00000", 1000], ["m2", "87.50000", null]])
    );
    assert_eq!(json["highlight"], -1);

    // Highlight only once the run is latched complete.
    state.progress.reset("m2");
    state.progress.set_rank(Some(2));
    assert_eq!(get_json(Arc::clone(&state), "/api/ranking").await["highlight"], -1);
    state.progress.set_complete(true);
    assert_eq!(get_json(state, "/api/ranking").await["highlight"], 2);
}

#[tokio::test]
async fn test_running_reports_progress_and_leader() {
    let dir = TempDir::new().unwrap();
    let state = make_state(&dir);
    state
        .stores
        .table
        .update("leader", 95.0, 0.1, Some(10), &[90.0, 95.0])
        .unwrap();
    state.progress.reset("candidate");
    state.progress.publish(
        CurvePoint {
            progress: 10.0,
            accuracy: 80.0,
        },
        Some(2),
        (0, 10),
    );

    let json = get_json(state, "/api/running").await;
    assert_eq!(json["tag"], "candidate");
    assert_eq!(json["position"], 2);
    assert_eq!(json["batches"], "01/10");
    assert_eq!(json["series"][0]["accuracy"], 80.0);
    assert_eq!(json["top_tag"], "leader");
    assert_eq!(json["top_curve"][1]["progress"], 100.0);
}

#[tokio::test]
async fn test_running_before_any_evaluation() {
    let dir = TempDir::new().unwrap();
    let json = get_json(make_state(&dir), "/api/running").await;
    assert_eq!(json["tag"], "");
    assert_eq!(json["position"], -1);
    assert_eq!(json["top_tag"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_timeleft_without_deadline() {
    let dir = TempDir::new().unwrap();
    let json = get_json(make_state(&dir), "/api/timeleft").await;
    assert_eq!(json["time"], "-");
    assert_eq!(json["set"], "evaluation");
}

#[tokio::test]
async fn test_history_text() {
    let dir = TempDir::new().unwrap();
    let state = make_state(&dir);

    let (_, body) = get_body(Arc::clone(&state), "/hist.csv").await;
    assert_eq!(String::from_utf8(body).unwrap(), "No model was evaluated yet");

    state
        .stores
        .history
        .append(&HistoryRecord::new(true, "m1", 90.0, 0.1, Some(1000)))
        .unwrap();
    let (status, body) = get_body(state, "/hist.csv").await;
    assert_eq!(status, axum::http::StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().starts_with("1, m1, 90.0, 0.1, 1000, "));
}

#[tokio::test]
async fn test_train_dataset_download() {
    let dir = TempDir::new().unwrap();
    let state = make_state(&dir);

    let (status, _) = get_body(Arc::clone(&state), "/traindataset").await;
    assert_eq!(status, axum::http::StatusCode::NOT_FOUND);

    std::fs::create_dir_all(state.train_dataset.parent().unwrap()).unwrap();
    std::fs::write(&state.train_dataset, b"{\"X\": [], \"Y\": []}").unwrap();
    let (status, body) = get_body(state, "/traindataset").await;
    assert_eq!(status, axum::http::StatusCode::OK);
    assert_eq!(body, b"{\"X\": [], \"Y\": []}".to_vec());
}
