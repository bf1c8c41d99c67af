//! Local RPC surface
//!
//! JSON over HTTP on the loopback interface, plus a server-sent event feed
//! for progress.

pub mod events;
pub mod manifests;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::broadcast::Broadcaster;
use crate::db::LedgerStore;
use crate::upload::UploadOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub ledger: LedgerStore,
    pub orchestrator: UploadOrchestrator,
    pub broadcaster: Broadcaster,
}

pub fn router(state: AppState) -> Router {
    let api_v1 = Router::new()
        .route("/manifests/:id/upload", post(manifests::upload))
        .route("/manifests/:id/cancel", post(manifests::cancel))
        .route("/manifests/:id/reset", post(manifests::reset))
        .route("/manifests/:id/remove", post(manifests::remove))
        .route("/subscribe/:subscriber_id", get(events::subscribe));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_v1)
        .layer(tracing_layer())
        .with_state(state)
}

/// Request logging with latency in microseconds
pub fn tracing_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(
            DefaultOnResponse::new()
                .level(Level::INFO)
                .latency_unit(tower_http::LatencyUnit::Micros),
        )
}

async fn health(State(state): State<AppState>) -> Response {
    match state.ledger.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "connected",
                "active_uploads": state.orchestrator.registry().active_count(),
                "subscribers": state.broadcaster.subscriber_count(),
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Ledger health check failed: {:?}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "database": "disconnected",
                })),
            )
                .into_response()
        }
    }
}
