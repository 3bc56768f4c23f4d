use candle_core::{DType, Device, Result as CandleResult, Tensor};

use crate::llm::layer::Layer;
use crate::llm::weights::Weights;

pub struct RMSNormLayer {
    weights: Tensor,
    eps: f64,
    /// Gemma scales by `1 + w` and does the whole computation in f32.
    unit_offset: bool,
    device: Device,
}

impl RMSNormLayer {
    pub fn new(weights: &Weights, prefix: &str, eps: f64) -> CandleResult<Self> {
        Ok(Self {
            weights: weights.get(&format!("{}.weight", prefix))?,
            eps,
            unit_offset: false,
            device: weights.device().clone(),
        })
    }

    /// Norm whose checkpoint stores `w` for an effective scale of `1 + w`.
    pub fn with_unit_offset(weights: &Weights, prefix: &str, eps: f64) -> CandleResult<Self> {
        let scale = weights
            .get_as(&format!("{}.weight", prefix), DType::F32)?
            .affine(1.0, 1.0)?;
        Ok(Self {
            weights: scale,
            eps,
            unit_offset: true,
            device: weights.device().clone(),
        })
    }
}

impl Layer for RMSNormLayer {
    fn forward(&self, input: &Tensor) -> CandleResult<Tensor> {
        let input = input.to_device(&self.device)?;
        let orig_dtype = input.dtype();

        // Reduce in f32 so half-precision checkpoints do not overflow.
        let input = input.to_dtype(DType::F32)?;
        let variance = input.sqr()?.mean_keepdim(candle_core::D::Minus1)?;
        let inv_rms = variance.affine(1.0, self.eps)?.sqrt()?.recip()?;
        let normed = input.broadcast_mul(&inv_rms)?;

        if self.unit_offset {
            normed.broadcast_mul(&self.weights)?.to_dtype(orig_dtype)
        } else {
            normed.to_dtype(orig_dtype)?.broadcast_mul(&self.weights)
        }
    }
}
