//! Bearer-protected HTTP text generation over a locally stored
//! Llama, Mistral or Gemma 3 causal language model.
//!
//! - `llm`: model runtime, tokenizer, chat template, sampling and the
//!   startup loader
//! - `api`: axum router, handlers and the bearer-token extractor
//! - `app_state`: the write-once inference context shared by handlers

pub mod api;
pub mod app_state;
pub mod config;
pub mod error;
pub mod llm;

pub use app_state::{AppState, InferenceContext};
pub use config::Settings;
pub use error::ApiError;
