use axum::{extract::State, Json};
use std::sync::Arc;

use crate::api::auth::BearerAuth;
use crate::api::models::{GenerateRequest, GenerateResponse, HealthResponse};
use crate::app_state::AppState;
use crate::error::ApiError;

pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        ready: state.is_ready(),
    })
}

pub async fn generate(
    State(state): State<Arc<AppState>>,
    _auth: BearerAuth,
    Json(payload): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let options = payload.validate(state.settings.max_new_tokens_limit)?;
    let context = state.inference().ok_or(ApiError::NotReady)?;

    tracing::info!(
        "Generate request for {}: {} prompt chars, max_new_tokens={}, temperature={}, top_p={}",
        context.model_id,
        payload.prompt.len(),
        options.max_new_tokens,
        options.temperature,
        options.top_p
    );

    // Inference blocks for the whole generation; keep it off the async workers.
    let completion = tokio::task::spawn_blocking(move || context.complete(&payload.prompt, &options))
        .await
        .map_err(|e| ApiError::Inference(e.into()))??;

    tracing::debug!(
        "Generated {} tokens from a {} token {} prompt",
        completion.generated_tokens,
        completion.prompt_tokens,
        if completion.chat_formatted { "chat" } else { "plain" }
    );

    Ok(Json(GenerateResponse {
        output: completion.text,
    }))
}
