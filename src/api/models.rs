use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::llm::inference::SamplingOptions;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    /// Fixes the sampling RNG; random when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_max_new_tokens() -> usize {
    128
}

fn default_temperature() -> f64 {
    0.7
}

fn default_top_p() -> f64 {
    0.9
}

impl GenerateRequest {
    pub fn validate(&self, max_new_tokens_limit: usize) -> Result<SamplingOptions, ApiError> {
        if self.max_new_tokens == 0 || self.max_new_tokens > max_new_tokens_limit {
            return Err(ApiError::InvalidRequest(format!(
                "max_new_tokens must be between 1 and {}",
                max_new_tokens_limit
            )));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ApiError::InvalidRequest(
                "temperature must be a finite number >= 0".to_string(),
            ));
        }
        if !self.top_p.is_finite() || self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(ApiError::InvalidRequest(
                "top_p must be in (0, 1]".to_string(),
            ));
        }
        Ok(SamplingOptions {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            seed: self.seed,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub output: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub ready: bool,
}
