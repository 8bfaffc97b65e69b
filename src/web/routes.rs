use axum::{
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use crate::signaling::ws_handler;
use crate::state::AppState;

/// Create the main application router
///
/// CORS allows all origins: the capture peer reaches the broker through
/// local addresses and tunneled URLs, and preflight requests must be
/// answered for both.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/model-status", get(handlers::model_status))
        .route("/initialize-model", post(handlers::initialize_model))
        // Signaling endpoint
        .route("/ws", any(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
