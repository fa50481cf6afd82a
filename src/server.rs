//! HTTP configuration and search API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/pipelines/` | Register a pipeline configuration (400 on duplicate id) |
//! | `GET`  | `/pipelines/{id}` | Fetch a configuration (404 when unknown) |
//! | `POST` | `/pipelines/{id}/run?extract_type=full\|delta` | Enqueue a `data_extraction` job, returns `{task_id}` |
//! | `POST` | `/pipelines/{id}/search` | Embed a query and return ranked results |
//! | `GET`  | `/pipelines/{id}/documents?size=N` | Match-all scan of the pipeline's index |
//! | `GET`  | `/health` | Health check |
//!
//! Error responses follow `{ "error": { "code": ..., "message": ... } }`.
//!
//! The in-memory configuration map is per-process convenience, not a store
//! of record: the job payloads carry the full configuration, so a worker
//! never reads this map.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Settings;
use crate::factory::{create_sink, PipelineConfig};
use crate::models::RagSearchResult;
use crate::pipeline::ExtractType;
use crate::queue::{Job, JobQueue};
use crate::search::run_search;

/// Shared state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    settings: Arc<Settings>,
    configs: Arc<RwLock<HashMap<String, PipelineConfig>>>,
    queue: Arc<dyn JobQueue>,
}

impl AppState {
    pub fn new(settings: Arc<Settings>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            settings,
            configs: Arc::new(RwLock::new(HashMap::new())),
            queue,
        }
    }
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/pipelines/", post(handle_create_pipeline))
        .route("/pipelines/{id}", get(handle_get_pipeline))
        .route("/pipelines/{id}/run", post(handle_run_pipeline))
        .route("/pipelines/{id}/search", post(handle_search))
        .route("/pipelines/{id}/documents", get(handle_documents))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until the process terminates.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let bind = state.settings.bind.clone();
    let app = router(state);

    info!(%bind, "API server listening");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
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

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ POST /pipelines/ ============

async fn handle_create_pipeline(
    State(state): State<AppState>,
    Json(config): Json<PipelineConfig>,
) -> Result<(StatusCode, Json<PipelineConfig>), AppError> {
    let mut configs = state.configs.write().await;
    if configs.contains_key(&config.id) {
        return Err(bad_request(format!(
            "pipeline id '{}' already exists",
            config.id
        )));
    }
    configs.insert(config.id.clone(), config.clone());
    info!(pipeline = %config.id, "pipeline registered");
    Ok((StatusCode::CREATED, Json(config)))
}

// ============ GET /pipelines/{id} ============

async fn handle_get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PipelineConfig>, AppError> {
    let configs = state.configs.read().await;
    configs
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| not_found(format!("pipeline '{}' not found", id)))
}

// ============ POST /pipelines/{id}/run ============

#[derive(Deserialize)]
struct RunParams {
    #[serde(default = "default_extract_type")]
    extract_type: String,
}

fn default_extract_type() -> String {
    "full".to_string()
}

#[derive(Serialize)]
struct RunResponse {
    task_id: String,
}

async fn handle_run_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<RunParams>,
) -> Result<Json<RunResponse>, AppError> {
    let extract_type: ExtractType = params
        .extract_type
        .parse()
        .map_err(|_| {
            bad_request(format!(
                "invalid extract_type '{}'; must be full or delta",
                params.extract_type
            ))
        })?;

    let config = {
        let configs = state.configs.read().await;
        configs
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(format!("pipeline '{}' not found", id)))?
    };

    let task_id = state
        .queue
        .enqueue(Job::DataExtraction {
            pipeline_config: config,
            extract_type,
            last_extraction: None,
        })
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(RunResponse { task_id }))
}

// ============ POST /pipelines/{id}/search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    3
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<RagSearchResult>,
}

async fn handle_search(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let config = {
        let configs = state.configs.read().await;
        configs
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(format!("pipeline '{}' not found", id)))?
    };

    let results = run_search(&config, &state.settings, &request.query, request.top_k)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(SearchResponse { results }))
}

// ============ GET /pipelines/{id}/documents ============

#[derive(Deserialize)]
struct DocumentsParams {
    #[serde(default = "default_scan_size")]
    size: usize,
}

fn default_scan_size() -> usize {
    10
}

#[derive(Serialize)]
struct DocumentsResponse {
    documents: Vec<RagSearchResult>,
}

async fn handle_documents(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<DocumentsParams>,
) -> Result<Json<DocumentsResponse>, AppError> {
    let config = {
        let configs = state.configs.read().await;
        configs
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(format!("pipeline '{}' not found", id)))?
    };

    let sink =
        create_sink(&config.sink, &state.settings).map_err(|e| internal_error(e.to_string()))?;
    let documents = sink
        .get_documents(params.size)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(DocumentsResponse { documents }))
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
