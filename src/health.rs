// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP health surface.
//!
//! | Route | Body |
//! |-------|------|
//! | `GET /ping` | `OK` |
//! | `GET /isinitialized` | `true` / `false` |
//! | `GET /snapshotlastreceived` | `true` / `false` |
//! | `GET /isretrying` | `true` / `false` |
//! | `GET /health` | runner state plus all flags; 503 unless `Running` |

use crate::error::{Result, SyncError};
use crate::metrics;
use crate::runner::RunnerState;
use crate::state::{self, StateSnapshot, SyncState};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Shared state of the health handlers.
#[derive(Clone)]
pub struct HealthState {
    sync_state: Arc<SyncState>,
    runner_state: watch::Receiver<RunnerState>,
}

impl HealthState {
    pub fn new(sync_state: Arc<SyncState>, runner_state: watch::Receiver<RunnerState>) -> Self {
        Self {
            sync_state,
            runner_state,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: RunnerState,
    #[serde(flatten)]
    pub flags: StateSnapshot,
}

pub fn build_router(state: HealthState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/isinitialized", get(is_initialized))
        .route("/snapshotlastreceived", get(snapshot_last_received))
        .route("/isretrying", get(is_retrying))
        .route("/health", get(health))
        .with_state(state)
}

async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn is_initialized(State(state): State<HealthState>) -> Json<bool> {
    Json(state.sync_state.is_initialized())
}

async fn snapshot_last_received(State(state): State<HealthState>) -> Json<bool> {
    Json(state.sync_state.snapshot_last_received())
}

async fn is_retrying(State(state): State<HealthState>) -> Json<bool> {
    Json(state.sync_state.is_retrying())
}

async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    let report = HealthReport {
        state: *state.runner_state.borrow(),
        flags: state.sync_state.snapshot(),
    };
    metrics::set_flags(
        report.flags.is_initialized,
        report.flags.snapshot_last_received,
        report.flags.is_retrying,
    );
    let status = if report.state == RunnerState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// Serve `router` on `bind_addr` until `shutdown` turns true.
pub async fn serve(bind_addr: &str, router: Router, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| SyncError::Config(format!("cannot bind health endpoint {}: {}", bind_addr, e)))?;
    info!(addr = %bind_addr, "Health endpoint listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { state::cancelled(&mut shutdown).await })
        .await
        .map_err(|e| SyncError::Internal(format!("health endpoint failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn router(runner: RunnerState) -> (Router, Arc<SyncState>, watch::Sender<RunnerState>) {
        let sync_state = Arc::new(SyncState::new());
        let (tx, rx) = watch::channel(runner);
        (build_router(HealthState::new(sync_state.clone(), rx)), sync_state, tx)
    }

    async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_ping() {
        let (router, _, _) = router(RunnerState::Created);
        let (status, body) = get_body(router, "/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn test_flag_routes_follow_state() {
        let (router, sync_state, _tx) = router(RunnerState::Running);

        let (_, body) = get_body(router.clone(), "/isinitialized").await;
        assert_eq!(body, "false");

        sync_state.set_initialized(true);
        sync_state.set_snapshot_last_received(true);
        let (_, body) = get_body(router.clone(), "/isinitialized").await;
        assert_eq!(body, "true");
        let (_, body) = get_body(router.clone(), "/snapshotlastreceived").await;
        assert_eq!(body, "true");

        let (_, body) = get_body(router.clone(), "/isretrying").await;
        assert_eq!(body, "false");
        let _guard = sync_state.begin_retry();
        let (_, body) = get_body(router, "/isretrying").await;
        assert_eq!(body, "true");
    }

    #[tokio::test]
    async fn test_health_report() {
        let (router, sync_state, tx) = router(RunnerState::Starting);
        let (status, body) = get_body(router.clone(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let report: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["state"], "Starting");
        assert_eq!(report["is_initialized"], false);

        sync_state.set_initialized(true);
        tx.send(RunnerState::Running).unwrap();
        let (status, body) = get_body(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let report: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["state"], "Running");
        assert_eq!(report["is_initialized"], true);
        assert_eq!(report["is_retrying"], false);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (router, _, _) = router(RunnerState::Running);
        let (status, _) = get_body(router, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
