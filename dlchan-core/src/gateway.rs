//! Read-only HTTP status gateway built on axum.
//!
//! Serves the waiting queue, the ranking, the live progress of the running
//! evaluation, the countdown and the raw history file to browser viewers.

use crate::config::DlchanConfig;
use crate::error::StoreError;
use crate::progress::ProgressChannel;
use crate::stores::Stores;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::{Value, json};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Number of waiting submissions shown to viewers.
const WAITERS_SHOWN: usize = 3;

/// Accuracy decimals in the ranking.
const ACCURACY_PRECISION: usize = 5;

/// Everything the handlers read from.
#[derive(Debug)]
pub struct GatewayState {
    pub stores: Stores,
    pub progress: Arc<ProgressChannel>,
    pub config: DlchanConfig,
    pub train_dataset: PathBuf,
    started_at: Instant,
}

pub type SharedGatewayState = Arc<GatewayState>;

impl GatewayState {
    pub fn new(
        stores: Stores,
        progress: Arc<ProgressChannel>,
        config: DlchanConfig,
        train_dataset: PathBuf,
    ) -> Self {
        Self {
            stores,
            progress,
            config,
            train_dataset,
            started_at: Instant::now(),
        }
    }
}

struct ApiError(String);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.0, "Status request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0 })),
        )
            .into_response()
    }
}

/// Run a blocking store read off the async runtime.
async fn read_stores<T, F>(state: &SharedGatewayState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Stores) -> Result<T, StoreError> + Send + 'static,
{
    let stores = state.stores.clone();
    Ok(tokio::task::spawn_blocking(move || f(&stores)).await??)
}

/// `cur+1/total` with the current batch zero-padded to the width of `total`.
pub fn format_batch_counter(current: usize, total: usize) -> String {
    let width = total.to_string().len();
    format!("{:0width$}/{}", current + 1, total, width = width)
}

/// Build the gateway router.
pub fn router(state: SharedGatewayState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/waiters", get(waiters_handler))
        .route("/api/ranking", get(ranking_handler))
        .route("/api/running", get(running_handler))
        .route("/api/timeleft", get(timeleft_handler))
        .route("/hist.csv", get(history_handler))
        .route("/traindataset", get(train_dataset_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<SharedGatewayState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "evaluating": state.progress.tag(),
    }))
}

async fn waiters_handler(State(state): State<SharedGatewayState>) -> Result<Json<Value>, ApiError> {
    let mut waiters = read_stores(&state, |s| s.queue.waiting()).await?;
    waiters.truncate(WAITERS_SHOWN);
    Ok(Json(json!({ "waiters": waiters })))
}

async fn ranking_handler(State(state): State<SharedGatewayState>) -> Result<Json<Value>, ApiError> {
    let entries = read_stores(&state, |s| s.table.get()).await?;
    let progress = state.progress.snapshot();
    let highlight = match (progress.complete, progress.rank) {
        (true, Some(rank)) if rank > 0 => rank as i64,
        _ => -1,
    };
    let rank: Vec<Value> = entries
        .iter()
        .map(|e| {
            json!([
                e.tag,
                format!("{:.*}", ACCURACY_PRECISION, e.accuracy),
                e.param_count
            ])
        })
        .collect();
    Ok(Json(json!({ "rank": rank, "highlight": highlight })))
}

async fn running_handler(State(state): State<SharedGatewayState>) -> Result<Json<Value>, ApiError> {
    let top = read_stores(&state, |s| s.table.top_summary()).await?;
    let progress = state.progress.snapshot();
    let (current, total) = progress.batch;
    Ok(Json(json!({
        "tag": progress.tag,
        "series": progress.series,
        "position": progress.rank.map_or(-1, |r| r as i64),
        "batches": format_batch_counter(current, total),
        "top_curve": top.curve,
        "top_tag": top.tag,
    })))
}

async fn timeleft_handler(State(state): State<SharedGatewayState>) -> impl IntoResponse {
    let now = chrono::Local::now().naive_local();
    let time = state
        .config
        .challenge
        .time_left(now)
        .unwrap_or_else(|| "-".to_string());
    Json(json!({ "time": time, "set": state.config.dataset.name }))
}

async fn history_handler(State(state): State<SharedGatewayState>) -> Result<Response, ApiError> {
    let text = read_stores(&state, |s| s.history.read_raw())
        .await?
        .unwrap_or_else(|| "No model was evaluated yet".to_string());
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response())
}

async fn train_dataset_handler(State(state): State<SharedGatewayState>) -> Response {
    match tokio::fs::read(&state.train_dataset).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(path = %state.train_dataset.display(), error = %e, "Training set unavailable");
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "training dataset not available" })),
            )
                .into_response()
        }
    }
}

/// Serve the gateway on the configured address until `shutdown` resolves.
pub async fn run<F>(state: SharedGatewayState, shutdown: F) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", state.config.gateway.host, state.config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Status gateway listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_batch_counter() {
        assert_eq!(format_batch_counter(0, 4), "1/4");
        assert_eq!(format_batch_counter(2, 12), "03/12");
        assert_eq!(format_batch_counter(99, 100), "100/100");
        assert_eq!(format_batch_counter(0, 0), "1/0");
    }
}
