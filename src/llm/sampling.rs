use candle_core::{DType, Result as CandleResult, Tensor};
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Temperatures below this collapse the softmax onto the argmax anyway, and
/// dividing f32 logits by them can overflow to infinity.
pub const MIN_SAMPLING_TEMPERATURE: f64 = 1e-5;

/// Picks the next token from a logits vector.
///
/// Temperature 0 (or anything below `MIN_SAMPLING_TEMPERATURE`) is greedy
/// argmax. Otherwise the logits are scaled by the
/// temperature, turned into probabilities and truncated to the smallest set
/// of most likely tokens whose mass reaches `top_p` before drawing.
pub struct LogitsSampler {
    rng: StdRng,
    temperature: f64,
    top_p: f64,
}

impl LogitsSampler {
    pub fn new(temperature: f64, top_p: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            rng,
            temperature,
            top_p,
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < MIN_SAMPLING_TEMPERATURE
    }

    /// `logits` must be one-dimensional over the vocabulary.
    pub fn sample(&mut self, logits: &Tensor) -> CandleResult<u32> {
        let logits = logits.to_dtype(DType::F32)?;

        if self.is_greedy() {
            return logits.argmax(0)?.to_scalar::<u32>();
        }

        let scaled = (logits / self.temperature)?;
        let probs = candle_nn::ops::softmax_last_dim(&scaled)?.to_vec1::<f32>()?;
        self.sample_top_p(&probs)
    }

    fn sample_top_p(&mut self, probs: &[f32]) -> CandleResult<u32> {
        let mut order: Vec<usize> = (0..probs.len()).collect();
        order.sort_unstable_by(|&a, &b| probs[b].total_cmp(&probs[a]));

        let mut kept = Vec::new();
        let mut cumulative = 0.0f64;
        for &idx in &order {
            kept.push(idx);
            cumulative += probs[idx] as f64;
            if cumulative >= self.top_p {
                break;
            }
        }

        let weights: Vec<f32> = kept.iter().map(|&idx| probs[idx]).collect();
        let dist = WeightedIndex::new(&weights).map_err(|e| candle_core::Error::msg(e.to_string()))?;
        Ok(kept[dist.sample(&mut self.rng)] as u32)
    }
}
