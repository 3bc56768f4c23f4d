use candle_core::{Device, Result as CandleResult, Tensor};

use crate::llm::activation::Activation;
use crate::llm::layer::Layer;
use crate::llm::linear::LinearLayer;
use crate::llm::weights::Weights;

/// Gated feed-forward block: `down(act(gate(x)) * up(x))`.
pub struct MlpLayer {
    gate_proj: LinearLayer,
    up_proj: LinearLayer,
    down_proj: LinearLayer,
    activation: Activation,
    device: Device,
}

impl MlpLayer {
    pub fn new(weights: &Weights, prefix: &str, activation: Activation) -> CandleResult<Self> {
        Ok(Self {
            gate_proj: LinearLayer::new(weights, &format!("{}.gate_proj", prefix))?,
            up_proj: LinearLayer::new(weights, &format!("{}.up_proj", prefix))?,
            down_proj: LinearLayer::new(weights, &format!("{}.down_proj", prefix))?,
            activation,
            device: weights.device().clone(),
        })
    }
}

impl Layer for MlpLayer {
    fn forward(&self, input: &Tensor) -> CandleResult<Tensor> {
        let input = input.to_device(&self.device)?;
        let gated = self.activation.apply(&self.gate_proj.forward(&input)?)?;
        let up = self.up_proj.forward(&input)?;
        self.down_proj.forward(&gated.mul(&up)?)
    }
}
