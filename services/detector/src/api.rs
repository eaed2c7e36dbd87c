use crate::analysis::AnalysisRecord;
use crate::config::ApiConfig;
use crate::event::RawEnvelope;
use crate::pipeline::Pipeline;
use crate::result_store::ResultStore;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sqlx::postgres::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<dyn ResultStore>,
    pub pool: PgPool,
}

/// Host-style invocation response
#[derive(Debug, Serialize)]
pub struct InvocationResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/v1/events", post(invoke))
        // Object keys may contain '/'
        .route("/v1/analyses/*image_id", get(get_analysis))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "checkpoint-detector"
    }))
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").fetch_one(&state.pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Run one host invocation envelope through the pipeline
#[instrument(skip(state, body), fields(size_bytes = body.len()))]
async fn invoke(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let outcome = state
        .pipeline
        .handle(RawEnvelope::HostBatch(body.to_vec()))
        .await;

    let status_code = outcome.status_code();
    let status = StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    (
        status,
        Json(InvocationResponse {
            status_code,
            body: outcome.body().to_string(),
        }),
    )
}

#[instrument(skip(state))]
async fn get_analysis(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
) -> Result<Json<AnalysisRecord>, (StatusCode, Json<ErrorResponse>)> {
    let record = state.store.get(&image_id).await.map_err(|e| {
        error!(error = %e, "Failed to read analysis record");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Failed to read analysis record".to_string(),
                code: "QUERY_ERROR".to_string(),
            }),
        )
    })?;

    record.map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Analysis record not found".to_string(),
                code: "NOT_FOUND".to_string(),
            }),
        )
    })
}

/// Serve the API until `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting detector API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
