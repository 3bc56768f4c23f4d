use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};
use candle_core::Device;

use crate::config::Settings;
use crate::llm::inference::{self, Completion, SamplingOptions};
use crate::llm::models::CausalLM;
use crate::llm::tokenizer::TextTokenizer;

/// The loaded tokenizer and model. Both are published together, so readers
/// see either nothing or a complete context.
pub struct InferenceContext {
    pub model: Box<dyn CausalLM + Send + Sync>,
    pub tokenizer: TextTokenizer,
    pub device: Device,
    pub model_id: String,
}

impl InferenceContext {
    pub fn complete(&self, prompt: &str, options: &SamplingOptions) -> Result<Completion> {
        inference::complete(&*self.model, &self.tokenizer, &self.device, prompt, options)
    }
}

/// Shared state handed to every request handler.
pub struct AppState {
    pub settings: Settings,
    inference: OnceLock<Arc<InferenceContext>>,
}

impl AppState {
    /// State with no model loaded yet.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            inference: OnceLock::new(),
        }
    }

    pub fn with_context(settings: Settings, context: InferenceContext) -> Self {
        let state = Self::new(settings);
        let _ = state.inference.set(Arc::new(context));
        state
    }

    /// Publishes the loaded context. Only the first call succeeds.
    pub fn publish(&self, context: InferenceContext) -> Result<()> {
        self.inference
            .set(Arc::new(context))
            .map_err(|_| anyhow!("inference context already published"))
    }

    pub fn inference(&self) -> Option<Arc<InferenceContext>> {
        self.inference.get().cloned()
    }

    pub fn is_ready(&self) -> bool {
        self.inference.get().is_some()
    }
}
