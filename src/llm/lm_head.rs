use candle_core::{Device, Result as CandleResult, Tensor};

use crate::llm::layer::Layer;
use crate::llm::weights::Weights;

pub struct LMHeadLayer {
    weights: Tensor,
    device: Device,
}

impl LMHeadLayer {
    pub fn new(weights: &Weights, prefix: &str) -> CandleResult<Self> {
        Ok(Self {
            weights: weights.get(&format!("{}.weight", prefix))?,
            device: weights.device().clone(),
        })
    }

    /// Head that projects through the input embedding table.
    pub fn tied(embedding_table: &Tensor) -> Self {
        Self {
            weights: embedding_table.clone(),
            device: embedding_table.device().clone(),
        }
    }
}

impl Layer for LMHeadLayer {
    fn forward(&self, input: &Tensor) -> CandleResult<Tensor> {
        let input = input.to_device(&self.device)?;
        input.broadcast_matmul(&self.weights.t()?)
    }
}
