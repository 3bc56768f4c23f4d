use candle_core::{Device, Result as CandleResult, Tensor};

use crate::llm::layer::Layer;
use crate::llm::weights::Weights;

pub struct EmbeddingLayer {
    weights: Tensor,
    /// Gemma multiplies looked-up rows by `sqrt(hidden_size)`.
    scale: Option<f64>,
    device: Device,
}

impl EmbeddingLayer {
    pub fn new(weights: &Weights, prefix: &str) -> CandleResult<Self> {
        Ok(Self {
            weights: weights.get(&format!("{}.weight", prefix))?,
            scale: None,
            device: weights.device().clone(),
        })
    }

    pub fn scaled(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    /// The `(vocab_size, hidden_size)` table, shared with a tied LM head.
    pub fn table(&self) -> &Tensor {
        &self.weights
    }
}

impl Layer for EmbeddingLayer {
    fn forward(&self, input_ids: &Tensor) -> CandleResult<Tensor> {
        let input_ids = input_ids.to_device(&self.device)?;

        let (batch_size, seq_length) = input_ids.dims2()?;

        let flat_input = input_ids.reshape(batch_size * seq_length)?;

        let flat_embeddings = self.weights.index_select(&flat_input, 0)?;

        let embeddings = flat_embeddings.reshape((batch_size, seq_length, self.weights.dim(1)?))?;
        match self.scale {
            Some(scale) => embeddings.affine(scale, 0.0),
            None => Ok(embeddings),
        }
    }
}
