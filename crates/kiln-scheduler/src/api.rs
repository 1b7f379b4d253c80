//! HTTP API: WebSocket upgrade routes plus operator endpoints.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use kiln_proto::QuitRequest;

use crate::auth::UserStore;
use crate::connection;
use crate::registry::WorkerView;
use crate::scheduler::{ClusterInfo, EnvironmentInventory, SchedulerHandle};

/// Shared state for API handlers.
pub struct AppState {
    pub scheduler: SchedulerHandle,
    pub users: Arc<UserStore>,
    /// Outbound queue depth per connection.
    pub channel_capacity: usize,
    /// Cancelled by `POST /quit`.
    pub shutdown: CancellationToken,
}

/// Creates the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/worker", get(connection::worker_upgrade))
        .route("/compile", get(connection::compile_upgrade))
        .route("/monitor", get(connection::monitor_upgrade))
        .route("/health", get(health))
        .route("/workers", get(list_workers))
        .route("/environments", get(list_environments))
        .route("/info", get(cluster_info))
        .route("/quit-workers", post(quit_workers))
        .route("/quit", post(quit))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

async fn list_workers(State(state): State<Arc<AppState>>) -> Result<Json<Vec<WorkerView>>, StatusCode> {
    state
        .scheduler
        .list_workers()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn list_environments(State(state): State<Arc<AppState>>) -> Result<Json<EnvironmentInventory>, StatusCode> {
    state
        .scheduler
        .cluster_info()
        .await
        .map(|info| Json(info.environments))
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn cluster_info(State(state): State<Arc<AppState>>) -> Result<Json<ClusterInfo>, StatusCode> {
    state
        .scheduler
        .cluster_info()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

/// Query flags. A flag counts as set when present, with or without a value.
#[derive(Debug, Default, Deserialize)]
struct QuitParams {
    code: Option<i32>,
    purge_environments: Option<String>,
}

impl QuitParams {
    fn purge(&self) -> bool {
        self.purge_environments.is_some()
    }
}

async fn quit_workers(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QuitParams>,
) -> Result<Json<QuitResponse>, StatusCode> {
    let request = QuitRequest {
        code: params.code.unwrap_or(0),
        purge_environments: params.purge(),
    };
    let workers = state
        .scheduler
        .quit_workers(request)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    tracing::info!(workers, code = request.code, purge = request.purge_environments, "Asked workers to quit");
    Ok(Json(QuitResponse {
        workers: Some(workers),
        purged: None,
    }))
}

async fn quit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QuitParams>,
) -> Result<Json<QuitResponse>, StatusCode> {
    let purged = if params.purge() {
        let count = state.scheduler.purge_environments().await.map_err(|e| {
            tracing::error!(error = %e, "Purge before shutdown failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        Some(count)
    } else {
        None
    };
    tracing::info!(?purged, "Shutdown requested");
    state.shutdown.cancel();
    Ok(Json(QuitResponse { workers: None, purged }))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct QuitResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    purged: Option<usize>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::Scheduler;
    use axum::body::Body;
    use axum::http::Request;
    use kiln_state::{KvBackend, MemoryKv};
    use tower::ServiceExt;

    async fn make_app_state() -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SchedulerConfig::default();
        config.storage.environments_dir = dir.path().join("environments");
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());

        let (scheduler, handle) = Scheduler::bootstrap(&config, kv.clone()).await.unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(scheduler.run(shutdown.clone()));

        let state = Arc::new(AppState {
            scheduler: handle,
            users: Arc::new(UserStore::new(kv)),
            channel_capacity: config.connection.channel_capacity,
            shutdown,
        });
        (state, dir)
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (state, _dir) = make_app_state().await;
        let (status, body) = call(router(state), "GET", "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn workers_list_empty() {
        let (state, _dir) = make_app_state().await;
        let (status, body) = call(router(state), "GET", "/workers").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn quit_workers_with_none_connected() {
        let (state, _dir) = make_app_state().await;
        let (status, body) = call(router(state), "POST", "/quit-workers?code=3&purge_environments").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["workers"], 0);
    }

    #[tokio::test]
    async fn quit_cancels_shutdown_token() {
        let (state, _dir) = make_app_state().await;
        let token = state.shutdown.clone();
        let (status, body) = call(router(state), "POST", "/quit?purge_environments").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["purged"], 0);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn stopped_scheduler_is_unavailable() {
        let (state, _dir) = make_app_state().await;
        state.shutdown.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let (status, _) = call(router(state), "GET", "/info").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn quit_flag_is_presence_based() {
        let params: QuitParams = quit_params("purge_environments&code=2");
        assert!(params.purge());
        assert_eq!(params.code, Some(2));

        let params: QuitParams = quit_params("code=1");
        assert!(!params.purge());
    }

    fn quit_params(query: &str) -> QuitParams {
        let uri: axum::http::Uri = format!("/quit?{query}").parse().unwrap();
        Query::<QuitParams>::try_from_uri(&uri).unwrap().0
    }
}
