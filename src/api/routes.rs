//! REST endpoints for download jobs.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::error::error_response;
use crate::error::DownloadError;
use crate::jobs::{DownloadRequest, JobManager, JobRecord};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
}

/// Build the Axum router for the download API.
pub fn download_routes(manager: Arc<JobManager>) -> Router {
    let state = AppState { manager };

    Router::new()
        .route("/health", get(health))
        .route("/api", get(api_info))
        .route("/download", post(start_download))
        .route("/download/{id}", get(download_file))
        .route("/status/{id}", get(get_status))
        .route("/stop/{id}", post(stop_download))
        .route("/active", get(list_active))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ── Service ─────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn api_info() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "Chat Downloader API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /download": "Start chat download",
            "GET /status/{id}": "Check download status",
            "POST /stop/{id}": "Stop a running download",
            "GET /download/{id}": "Download file",
            "GET /health": "Health check",
            "GET /active": "List downloads",
        }
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

async fn start_download(
    State(state): State<AppState>,
    body: Result<Json<DownloadRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return DownloadError::Validation(format!(
                "Invalid request body: {}",
                rejection.body_text()
            ))
            .into_response();
        }
    };

    match state.manager.submit(request).await {
        Ok(submission) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "download_id": submission.download_id,
                "status": "started",
                "message": "Download started successfully",
                "config": submission.config,
            })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Status snapshot with the derived `cancellable` flag.
#[derive(Serialize)]
struct StatusView {
    #[serde(flatten)]
    record: JobRecord,
    cancellable: bool,
}

/// Unknown ids answer 404 and keep the legacy `"status": "not_found"` sentinel.
async fn get_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.status(&id).await {
        Ok(record) => {
            let cancellable = record.cancellable();
            Json(StatusView {
                record,
                cancellable,
            })
            .into_response()
        }
        Err(e) => (
            e.status_code(),
            Json(serde_json::json!({
                "status": "not_found",
                "error": e.public_message(),
                "kind": e.kind(),
            })),
        )
            .into_response(),
    }
}

async fn stop_download(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.request_stop(&id).await {
        Ok(()) => Json(serde_json::json!({
            "message": "Download stopped successfully",
            "download_id": id,
            "status": "stopping",
        }))
        .into_response(),
        // Unknown and no-longer-stoppable jobs both answer 404.
        Err(e) => error_response(StatusCode::NOT_FOUND, &e),
    }
}

async fn download_file(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let artifact = match state.manager.fetch_artifact(&id).await {
        Ok(artifact) => artifact,
        Err(e) => return e.into_response(),
    };

    match tokio::fs::read(&artifact.path).await {
        Ok(bytes) => {
            info!(
                download_id = %id,
                bytes = bytes.len(),
                partial = artifact.partial,
                "Serving artifact"
            );
            let disposition = format!("attachment; filename=\"{}\"", artifact.filename);
            (
                [
                    (header::CONTENT_TYPE, artifact.format.content_type().to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                bytes,
            )
                .into_response()
        }
        Err(e) => {
            warn!(download_id = %id, error = %e, "Artifact vanished before it could be served");
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": "File not found", "kind": "not_found"})),
            )
                .into_response()
        }
    }
}

async fn list_active(State(state): State<AppState>) -> impl IntoResponse {
    let jobs = state.manager.list_all().await;
    let running = jobs.iter().filter(|j| j.status.is_active()).count();

    let mut downloads = serde_json::Map::new();
    for job in &jobs {
        downloads.insert(
            job.id.clone(),
            serde_json::json!({
                "status": job.status,
                "message_count": job.message_count,
                "created_at": job.created_at,
            }),
        );
    }

    Json(serde_json::json!({
        "active_downloads": jobs.len(),
        "running": running,
        "downloads": downloads,
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::ServiceConfig;
    use crate::source::MemorySource;

    fn router(dir: &std::path::Path) -> Router {
        let config = ServiceConfig {
            download_dir: dir.to_path_buf(),
            ..ServiceConfig::default()
        };
        let manager = Arc::new(JobManager::new(config, Arc::new(MemorySource::numbered(5))));
        download_routes(manager)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_ok() {
        let dir = tempfile::tempdir().unwrap();
        let resp = router(dir.path())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "healthy");
    }

    #[tokio::test]
    async fn malformed_body_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let resp = router(dir.path())
            .oneshot(
                Request::post("/download")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["kind"], "validation_error");
    }

    #[tokio::test]
    async fn unknown_status_keeps_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let resp = router(dir.path())
            .oneshot(Request::get("/status/download_0_0").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["status"], "not_found");
    }

    #[tokio::test]
    async fn submit_then_status() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(dir.path());
        let resp = app
            .clone()
            .oneshot(
                Request::post("/download")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"url":"https://twitch.tv/example","format":"txt"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "started");
        assert_eq!(json["config"]["format"], "txt");
        let id = json["download_id"].as_str().unwrap().to_string();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let resp = app
            .oneshot(Request::get(format!("/status/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["id"], id);
        assert!(json.get("cancellable").is_some());
    }
}
