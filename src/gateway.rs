//! HTTP surface over the registry and the threshold computer.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::baseline::{RunSummary, ThresholdComputer};
use crate::error::AnomalyError;
use crate::registry::AlgorithmRegistry;
use crate::storage::Store;
use crate::types::{CheckOutput, Threshold};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AlgorithmRegistry>,
    pub store: Arc<dyn Store>,
    pub computer: ThresholdComputer,
    /// Serialises recomputations so two runs never interleave their writes
    recompute: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(
        registry: Arc<AlgorithmRegistry>,
        store: Arc<dyn Store>,
        computer: ThresholdComputer,
    ) -> Self {
        Self {
            registry,
            store,
            computer,
            recompute: Arc::new(Mutex::new(())),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AnomalyRequest {
    pub registration_dt: String,
}

/// Handler error, rendered as `{"detail": "..."}`
#[derive(Debug)]
pub enum ApiError {
    Anomaly(AnomalyError),
    UnknownCountry(String),
    /// Request body missing, malformed or not JSON
    Body(JsonRejection),
}

impl From<AnomalyError> for ApiError {
    fn from(e: AnomalyError) -> Self {
        ApiError::Anomaly(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::Body(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            ApiError::Anomaly(e) => {
                let status = match e {
                    AnomalyError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    AnomalyError::UnknownAlgorithm(_) | AnomalyError::NoData(_) => {
                        StatusCode::NOT_FOUND
                    }
                    AnomalyError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, e.to_string())
            }
            ApiError::UnknownCountry(country) => (
                StatusCode::NOT_FOUND,
                format!("No thresholds for country {}", country),
            ),
            ApiError::Body(rejection) => (rejection.status(), rejection.body_text()),
        };

        if status.is_server_error() {
            tracing::error!(%status, error = %detail, "Request failed");
        } else {
            tracing::debug!(%status, error = %detail, "Request rejected");
        }

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/check_anomaly", post(check_default))
        .route("/check_anomaly/{algorithm}", post(check_named))
        .route("/thresholds/recompute", post(recompute))
        .route("/thresholds/{country}", get(country_thresholds))
        .route("/algorithms", get(list_algorithms))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until Ctrl-C
pub async fn serve(bind: &str, state: AppState) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!(address = %bind, "HTTP gateway listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal, exiting");
            }
        })
        .await?;
    Ok(())
}

async fn check_default(
    State(state): State<AppState>,
    body: Result<Json<AnomalyRequest>, JsonRejection>,
) -> Result<Json<CheckOutput>, ApiError> {
    let Json(req) = body?;
    run_check(&state, "", &req).await
}

async fn check_named(
    State(state): State<AppState>,
    Path(algorithm): Path<String>,
    body: Result<Json<AnomalyRequest>, JsonRejection>,
) -> Result<Json<CheckOutput>, ApiError> {
    let Json(req) = body?;
    run_check(&state, &algorithm, &req).await
}

async fn run_check(
    state: &AppState,
    algorithm: &str,
    req: &AnomalyRequest,
) -> Result<Json<CheckOutput>, ApiError> {
    let output = state.registry.check(algorithm, &req.registration_dt).await?;
    Ok(Json((*output).clone()))
}

async fn country_thresholds(
    State(state): State<AppState>,
    Path(country): Path<String>,
) -> Result<Json<Vec<Threshold>>, ApiError> {
    let rows = state.store.thresholds_for_country(&country).await?;
    if rows.is_empty() {
        return Err(ApiError::UnknownCountry(country));
    }
    Ok(Json(rows))
}

async fn recompute(State(state): State<AppState>) -> Result<Json<RunSummary>, ApiError> {
    let _guard = state.recompute.lock().await;
    let summary = state.computer.run(state.store.as_ref()).await?;
    state.registry.cache().clear();
    Ok(Json(summary))
}

async fn list_algorithms(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "algorithms": state.registry.algorithms() }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
