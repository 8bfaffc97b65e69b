use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;
use crate::state::AppState;

// ============================================================================
// Health & model lifecycle
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub build_date: &'static str,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        build_date: env!("BUILD_DATE"),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Model status response
#[derive(Serialize)]
pub struct ModelStatusResponse {
    #[serde(rename = "modelLoaded")]
    pub model_loaded: bool,
    #[serde(rename = "modelPath")]
    pub model_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

pub async fn model_status(State(state): State<Arc<AppState>>) -> Json<ModelStatusResponse> {
    let status = state.engine.status().await;

    Json(ModelStatusResponse {
        model_loaded: status.loaded,
        model_path: status.model_path,
        error: status.last_error,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Model initialization response
#[derive(Serialize)]
pub struct InitializeModelResponse {
    pub success: bool,
    pub message: String,
    #[serde(rename = "loadTime", skip_serializing_if = "Option::is_none")]
    pub load_time_ms: Option<u64>,
}

/// Idempotent detector load
///
/// A second request returns the cached handle; a failed load is surfaced
/// as an error response and may be retried.
pub async fn initialize_model(
    State(state): State<Arc<AppState>>,
) -> Result<Json<InitializeModelResponse>> {
    let outcome = state.engine.initialize().await?;

    Ok(Json(InitializeModelResponse {
        success: true,
        message: if outcome.already_loaded {
            "Model already loaded".to_string()
        } else {
            "Model loaded".to_string()
        },
        load_time_ms: Some(outcome.load_time_ms),
    }))
}
