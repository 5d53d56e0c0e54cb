//! HTTP API.
//!
//! Serves symbolication and cache inspection over JSON. The watcher and the
//! reclaimer run as background tasks of the same process.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/v1/stats` | Cache statistics |
//! | `GET`  | `/v1/disk-usage` | Firmware, scratch, and database bytes |
//! | `GET`  | `/v1/watcher` | Ingestion watcher status |
//! | `GET`  | `/v1/firmware` | Object store listing with parsed names |
//! | `GET`  | `/v1/scans` | All scan records |
//! | `GET`  | `/v1/scans/{device}/{os}/{build}` | One scan record |
//! | `POST` | `/v1/scans` | Request a scan |
//! | `POST` | `/v1/symbolicate` | Symbolicate a raw crash report |
//! | `POST` | `/v1/reclaim` | Run one reclaimer sweep now |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "no symbols for ...; upload ... to symbolicate" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request` | 400 |
//! | `not_found` | 404 |
//! | `in_progress` | 202 |
//! | `extraction_failed` | 422 |
//! | `object_store` | 502 |
//! | `store_unavailable` | 503 |
//!
//! `in_progress` is not a failure: the scan is running and the same request
//! will succeed once it completes.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};

use crate::crash::CrashHints;
use crate::engine::{Engine, FirmwareEntry, ScanSubmission};
use crate::error::SymcacheError;
use crate::models::{CacheKey, ScanRecord, SourceRef};
use crate::orchestrator::ScanHandle;
use crate::reclaimer::SweepReport;
use crate::router::SymbolicatedOutput;
use crate::stats::{collect_stats, CacheStats, DiskUsage};
use crate::watcher::WatcherStatus;

/// Shared state passed to every handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub watcher: Arc<RwLock<WatcherStatus>>,
}

/// Build the API router. Split from [`run_server`] so tests can serve it on
/// an ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/stats", get(handle_stats))
        .route("/v1/disk-usage", get(handle_disk_usage))
        .route("/v1/watcher", get(handle_watcher))
        .route("/v1/firmware", get(handle_firmware))
        .route("/v1/scans", get(handle_list_scans).post(handle_request_scan))
        .route("/v1/scans/{device}/{os}/{build}", get(handle_get_scan))
        .route("/v1/symbolicate", post(handle_symbolicate))
        .route("/v1/reclaim", post(handle_reclaim))
        .layer(cors)
        .with_state(state)
}

/// Start the background loops and serve the API on `[server].bind` until
/// the process is terminated.
pub async fn run_server(engine: Engine) -> anyhow::Result<()> {
    let bind_addr = engine.config.server.bind.clone();
    let watcher = engine.spawn_background();
    let app = router(AppState { engine, watcher });

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "symcache listening");
    println!("symcache listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"in_progress"`).
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SymcacheError> for AppError {
    fn from(err: SymcacheError) -> Self {
        let status = match &err {
            SymcacheError::BadRequest(_) => StatusCode::BAD_REQUEST,
            SymcacheError::NotFound { .. } => StatusCode::NOT_FOUND,
            SymcacheError::InProgress { .. } => StatusCode::ACCEPTED,
            SymcacheError::ExtractionFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SymcacheError::ObjectStore(_) => StatusCode::BAD_GATEWAY,
            SymcacheError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            tracing::warn!(code = err.code(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /v1/stats, /v1/disk-usage, /v1/watcher ============

async fn handle_stats(State(state): State<AppState>) -> Result<Json<CacheStats>, AppError> {
    let stats = collect_stats(&state.engine.store, &state.engine.config.db.path)
        .await
        .map_err(SymcacheError::from)?;
    Ok(Json(stats))
}

async fn handle_disk_usage(State(state): State<AppState>) -> Result<Json<DiskUsage>, AppError> {
    Ok(Json(state.engine.disk_usage().await?))
}

async fn handle_watcher(State(state): State<AppState>) -> Json<WatcherStatus> {
    Json(state.watcher.read().await.clone())
}

// ============ GET /v1/firmware ============

#[derive(Serialize)]
struct FirmwareResponse {
    store: String,
    firmware: Vec<FirmwareEntry>,
}

async fn handle_firmware(
    State(state): State<AppState>,
) -> Result<Json<FirmwareResponse>, AppError> {
    let firmware = state.engine.firmware_listing().await?;
    Ok(Json(FirmwareResponse {
        store: state.engine.objects.describe(),
        firmware,
    }))
}

// ============ /v1/scans ============

#[derive(Serialize)]
struct ScanListResponse {
    scans: Vec<ScanRecord>,
}

async fn handle_list_scans(
    State(state): State<AppState>,
) -> Result<Json<ScanListResponse>, AppError> {
    let scans = state
        .engine
        .store
        .list()
        .await
        .map_err(SymcacheError::from)?;
    Ok(Json(ScanListResponse { scans }))
}

async fn handle_get_scan(
    State(state): State<AppState>,
    Path((device, os, build)): Path<(String, String, String)>,
) -> Result<Json<ScanRecord>, AppError> {
    let device = state
        .engine
        .resolver
        .resolve(&device)
        .map_err(|e| bad_request(e.to_string()))?;
    let key = CacheKey::new(&device, &os, &build);
    let record = state
        .engine
        .store
        .get(&key)
        .await
        .map_err(SymcacheError::from)?
        .ok_or_else(|| not_found(format!("no scan record for {}", key)))?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct ScanBody {
    /// `"object"` (default) or `"file"`.
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    object: Option<String>,
    device: String,
    os_version: String,
    #[serde(default)]
    build_id: Option<String>,
    #[serde(default)]
    force: bool,
    /// Block until the scan finishes (bounded by the router wait timeout).
    #[serde(default)]
    wait: bool,
}

#[derive(Serialize)]
struct ScanResponse {
    #[serde(flatten)]
    handle: ScanHandle,
    /// The finished record, when `wait` was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    finished: Option<ScanRecord>,
}

async fn handle_request_scan(
    State(state): State<AppState>,
    Json(body): Json<ScanBody>,
) -> Result<(StatusCode, Json<ScanResponse>), AppError> {
    let kind = body.source.as_deref().unwrap_or("object");
    let source = match body.object.as_deref() {
        Some(location) => Some(SourceRef::from_parts(kind, location).ok_or_else(|| {
            bad_request(format!("source must be \"object\" or \"file\", got {:?}", kind))
        })?),
        None if kind == "file" => return Err(bad_request("a file source needs `object`")),
        None => None,
    };

    let handle = state
        .engine
        .submit(ScanSubmission {
            source,
            device: body.device,
            os_version: body.os_version,
            build_id: body.build_id,
            force: body.force,
        })
        .await?;

    let finished = if body.wait {
        let router = &state.engine.config.router;
        Some(
            state
                .engine
                .orchestrator
                .wait_for(
                    &handle.record.key(),
                    std::time::Duration::from_secs(router.wait_timeout_secs),
                    std::time::Duration::from_millis(router.poll_interval_ms),
                )
                .await?,
        )
    } else {
        None
    };

    let status = if finished.is_some() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(ScanResponse { handle, finished })))
}

// ============ POST /v1/symbolicate ============

#[derive(Debug, Default, Deserialize)]
struct SymbolicateQuery {
    device: Option<String>,
    os_version: Option<String>,
    build_id: Option<String>,
}

async fn handle_symbolicate(
    State(state): State<AppState>,
    Query(query): Query<SymbolicateQuery>,
    body: Bytes,
) -> Result<Json<SymbolicatedOutput>, AppError> {
    if body.is_empty() {
        return Err(bad_request("request body must contain a crash report"));
    }
    let hints = CrashHints {
        device: query.device,
        os_version: query.os_version,
        build_id: query.build_id,
    };
    let output = state.engine.router.symbolicate(&body, &hints).await?;
    Ok(Json(output))
}

// ============ POST /v1/reclaim ============

async fn handle_reclaim(State(state): State<AppState>) -> Result<Json<SweepReport>, AppError> {
    let report = state
        .engine
        .reclaimer()
        .sweep()
        .await
        .map_err(SymcacheError::from)?;
    tracing::info!(deleted = report.deleted, failed = report.failed, "manual reclaim");
    Ok(Json(report))
}
