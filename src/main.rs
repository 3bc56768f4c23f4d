use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_generate_api::api::server;
use llm_generate_api::config::{Settings, LISTEN_ADDR};
use llm_generate_api::llm::loader;
use llm_generate_api::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_generate_api=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    if settings.api_key.is_none() {
        tracing::warn!("API_KEY is not set; every /v1/generate request will be rejected");
    }

    let state = Arc::new(AppState::new(settings.clone()));

    // Load before binding: a failed load means the server never starts.
    tracing::info!("Loading model {}", settings.model_id);
    let context = tokio::task::spawn_blocking(move || loader::load_context(&settings))
        .await
        .context("model loading task panicked")??;
    state.publish(context)?;
    tracing::info!("Model ready");

    server::serve(state, LISTEN_ADDR).await
}
