//! HTTP API over the query-serving pipeline.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Ingest `{id, text}` |
//! | `GET` | `/documents` | List ingested documents |
//! | `DELETE` | `/documents/{id}` | Delete a document |
//! | `POST` | `/query` | Answer `{query, top_k?}` |
//! | `POST` | `/query/batch` | Answer `{queries, top_k?}` concurrently |
//! | `GET` | `/metrics` | Prometheus text exposition |
//! | `GET` | `/stats` | Pipeline, cache and metric statistics as JSON |
//! | `GET` | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "empty_index", "message": "...", "retryable": false } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `invalid_input` | 400 |
//! | `not_found` | 404 |
//! | `request_timeout` | 408 |
//! | `empty_index` | 409 |
//! | `internal` | 500 |
//! | `generation_unavailable` | 502 |
//! | `embedding_unavailable` | 503 |
//! | `generation_timeout` | 504 |

use anyhow::{bail, Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use lightning_serve_core::cache::{CacheStore, InMemoryCacheStore};
use lightning_serve_core::error::PipelineError;
use lightning_serve_core::models::DocumentRecord;
use lightning_serve_core::pipeline::{
    DeleteReport, IngestReport, Pipeline, PipelineStats, QueryRequest, QueryResponse,
};

use crate::config::{CacheConfig, Config};
use crate::exposition;
use crate::providers::{create_embedding_provider, create_generation_provider};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

/// Construct the pipeline and its providers from configuration.
pub async fn build_pipeline(config: &Config) -> Result<Arc<Pipeline>> {
    let embedding = create_embedding_provider(&config.embedding)?;
    let generation = create_generation_provider(&config.generation)?;
    let store = create_cache_store(&config.cache).await?;

    info!(
        embedding = embedding.model_name(),
        dims = embedding.dims(),
        generation = generation.model_name(),
        cache = store.name(),
        "pipeline configured"
    );
    Ok(Arc::new(Pipeline::new(
        embedding,
        generation,
        store,
        config.pipeline_params(),
    )))
}

async fn create_cache_store(config: &CacheConfig) -> Result<Arc<dyn CacheStore>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryCacheStore::new(config.capacity))),
        #[cfg(feature = "redis-cache")]
        "redis" => {
            let url = config
                .resolved_redis_url()
                .context("cache.redis_url (or REDIS_URL) is required for the redis backend")?;
            let store =
                crate::cache_redis::RedisCacheStore::connect(&url, &config.redis_prefix).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-cache"))]
        "redis" => bail!("The redis cache backend requires --features redis-cache"),
        other => bail!("Unknown cache backend: {}", other),
    }
}

/// Build the router. Split from [`run_server`] so tests can serve it on an
/// ephemeral port.
pub fn router(pipeline: Arc<Pipeline>, allowed_origins: &[String]) -> Router {
    let state = AppState { pipeline };

    Router::new()
        .route("/documents", post(handle_ingest).get(handle_list_documents))
        .route("/documents/{id}", delete(handle_delete_document))
        .route("/query", post(handle_query))
        .route("/query/batch", post(handle_query_batch))
        .route("/metrics", get(handle_metrics))
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// Starts the HTTP server on `[server].bind` and runs until Ctrl-C.
pub async fn run_server(config: &Config) -> Result<()> {
    let pipeline = build_pipeline(config).await?;
    let app = router(pipeline, &config.server.allowed_origins);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!(addr = %config.server.bind, "Lightning Serve listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Inner error detail with a machine-readable code and human-readable message.
#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    retryable: bool,
}

impl From<&PipelineError> for ErrorDetail {
    fn from(e: &PipelineError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    detail: ErrorDetail,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.detail })).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        Self {
            status: status_for(&e),
            detail: ErrorDetail::from(&e),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: ErrorDetail {
                code: "invalid_input".to_string(),
                message: rejection.body_text(),
                retryable: false,
            },
        }
    }
}

fn status_for(e: &PipelineError) -> StatusCode {
    match e {
        PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::RequestTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
        PipelineError::EmptyIndex => StatusCode::CONFLICT,
        PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        PipelineError::GenerationService { .. } => StatusCode::BAD_GATEWAY,
        PipelineError::EmbeddingService { .. } => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::GenerationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
    }
}

// ============ Documents ============

#[derive(Deserialize)]
struct IngestBody {
    id: String,
    text: String,
}

async fn handle_ingest(
    State(state): State<AppState>,
    body: Result<Json<IngestBody>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestReport>), AppError> {
    let Json(body) = body?;
    let report = state.pipeline.ingest(&body.id, &body.text).await?;
    let status = if report.unchanged {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(report)))
}

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentRecord>,
}

async fn handle_list_documents(State(state): State<AppState>) -> Json<DocumentListResponse> {
    Json(DocumentListResponse {
        documents: state.pipeline.list_documents(),
    })
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteReport>, AppError> {
    Ok(Json(state.pipeline.delete_document(&id).await?))
}

// ============ Queries ============

async fn handle_query(
    State(state): State<AppState>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, AppError> {
    let Json(request) = body?;
    Ok(Json(state.pipeline.query(request).await?))
}

#[derive(Deserialize)]
struct BatchBody {
    queries: Vec<String>,
    #[serde(default)]
    top_k: Option<usize>,
}

/// One entry of a batch response: an answer or that query's error.
#[derive(Serialize)]
#[serde(untagged)]
enum BatchItem {
    Answer(QueryResponse),
    Failed { error: ErrorDetail },
}

#[derive(Serialize)]
struct BatchResponse {
    results: Vec<BatchItem>,
    succeeded: usize,
    failed: usize,
}

async fn handle_query_batch(
    State(state): State<AppState>,
    body: Result<Json<BatchBody>, JsonRejection>,
) -> Result<Json<BatchResponse>, AppError> {
    let Json(body) = body?;
    let outcomes = state.pipeline.query_batch(body.queries, body.top_k).await?;

    let succeeded = outcomes.iter().filter(|r| r.is_ok()).count();
    let failed = outcomes.len() - succeeded;
    let results = outcomes
        .into_iter()
        .map(|r| match r {
            Ok(answer) => BatchItem::Answer(answer),
            Err(e) => BatchItem::Failed {
                error: ErrorDetail::from(&e),
            },
        })
        .collect();

    Ok(Json(BatchResponse {
        results,
        succeeded,
        failed,
    }))
}

// ============ Telemetry ============

async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.pipeline.stats().await;
    (
        [(header::CONTENT_TYPE, exposition::CONTENT_TYPE)],
        exposition::render(&stats),
    )
}

async fn handle_stats(State(state): State<AppState>) -> Json<PipelineStats> {
    Json(state.pipeline.stats().await)
}

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
