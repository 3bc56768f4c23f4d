use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::api::handlers::{generate, healthz};
use crate::app_state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/generate", post(generate))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("  GET  /healthz - Liveness and readiness");
    tracing::info!("  POST /v1/generate - Text generation (bearer auth)");

    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
