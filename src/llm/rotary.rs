use std::f64::consts::PI;

use candle_core::{DType, Device, Result as CandleResult, Tensor, D};

use crate::config::RopeScalingConfig;

/// Rotary position embedding with precomputed inverse frequencies.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    inv_freq: Vec<f32>,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, theta: f32, scaling: Option<&RopeScalingConfig>) -> Self {
        let base: Vec<f64> = (0..head_dim / 2)
            .map(|i| 1.0 / (theta as f64).powf(2.0 * i as f64 / head_dim as f64))
            .collect();

        let inv_freq = match scaling {
            Some(cfg) if cfg.kind() == "linear" => {
                base.iter().map(|f| f / cfg.factor as f64).collect()
            }
            Some(cfg) if cfg.kind() == "llama3" => llama3_frequencies(&base, cfg),
            _ => base,
        };

        Self {
            inv_freq: inv_freq.into_iter().map(|f| f as f32).collect(),
        }
    }

    pub fn inv_freq(&self) -> &[f32] {
        &self.inv_freq
    }

    /// `(cos, sin)` tables of shape `(seq_len, head_dim)` for the absolute
    /// positions `offset..offset + seq_len`.
    pub fn tables(
        &self,
        offset: usize,
        seq_len: usize,
        dtype: DType,
        device: &Device,
    ) -> CandleResult<(Tensor, Tensor)> {
        let inv_freq = Tensor::new(self.inv_freq.as_slice(), device)?;
        let positions = Tensor::arange(offset as u32, (offset + seq_len) as u32, device)?
            .to_dtype(DType::F32)?;

        // (seq_len, head_dim / 2)
        let freqs = positions
            .unsqueeze(1)?
            .broadcast_mul(&inv_freq.unsqueeze(0)?)?;
        let emb = Tensor::cat(&[&freqs, &freqs], 1)?;

        Ok((emb.cos()?.to_dtype(dtype)?, emb.sin()?.to_dtype(dtype)?))
    }

    pub fn rotate_half(x: &Tensor) -> CandleResult<Tensor> {
        let last_dim = x.dim(D::Minus1)?;
        let xs1 = x.narrow(D::Minus1, 0, last_dim / 2)?;
        let xs2 = x.narrow(D::Minus1, last_dim / 2, last_dim - last_dim / 2)?;
        Tensor::cat(&[&xs2.neg()?, &xs1], D::Minus1)
    }

    pub fn apply(x: &Tensor, cos: &Tensor, sin: &Tensor) -> CandleResult<Tensor> {
        x.broadcast_mul(cos)? + Self::rotate_half(x)?.broadcast_mul(sin)?
    }
}

/// Llama 3.1 frequency remapping: long wavelengths are divided by the
/// factor, short ones kept, and the band in between interpolated.
fn llama3_frequencies(base: &[f64], cfg: &RopeScalingConfig) -> Vec<f64> {
    let factor = cfg.factor as f64;
    let low = cfg.low_freq_factor as f64;
    let high = cfg.high_freq_factor as f64;
    let old_context = cfg.original_max_position_embeddings as f64;
    let low_freq_wavelen = old_context / low;
    let high_freq_wavelen = old_context / high;

    base.iter()
        .map(|&freq| {
            let wavelen = 2.0 * PI / freq;
            if wavelen < high_freq_wavelen {
                freq
            } else if wavelen > low_freq_wavelen {
                freq / factor
            } else {
                let smooth = (old_context / wavelen - low) / (high - low);
                (1.0 - smooth) * freq / factor + smooth * freq
            }
        })
        .collect()
}
