use candle_core::{Device, Result as CandleResult, Tensor};

use crate::llm::layer::Layer;
use crate::llm::weights::Weights;

pub struct LinearLayer {
    weights: Tensor,
    bias: Option<Tensor>,
    device: Device,
}

impl LinearLayer {
    pub fn new(weights: &Weights, prefix: &str) -> CandleResult<Self> {
        let weight = weights.get(&format!("{}.weight", prefix))?;

        let bias_name = format!("{}.bias", prefix);
        let bias = if weights.contains(&bias_name) {
            Some(weights.get(&bias_name)?)
        } else {
            None
        };

        Ok(Self {
            weights: weight,
            bias,
            device: weights.device().clone(),
        })
    }
}

impl Layer for LinearLayer {
    fn forward(&self, input: &Tensor) -> CandleResult<Tensor> {
        let input = input.to_device(&self.device)?;
        let mut output = input.broadcast_matmul(&self.weights.t()?)?;
        if let Some(bias) = &self.bias {
            output = output.broadcast_add(bias)?
        }
        Ok(output)
    }
}
