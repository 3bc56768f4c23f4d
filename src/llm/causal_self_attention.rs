use candle_core::{DType, Device, Result as CandleResult, Tensor};

use crate::llm::layer::Layer;
use crate::llm::linear::LinearLayer;
use crate::llm::rms_norm::RMSNormLayer;
use crate::llm::rotary::RotaryEmbedding;
use crate::llm::weights::Weights;

/// KV cache for storing key and value tensors across generation steps
#[derive(Clone, Default)]
pub struct KVCache {
    pub k_cache: Option<Tensor>,
    pub v_cache: Option<Tensor>,
}

impl KVCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of positions already stored.
    pub fn len(&self) -> usize {
        self.k_cache
            .as_ref()
            .and_then(|k| k.dim(2).ok())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shape and position handling of one attention layer.
#[derive(Debug, Clone)]
pub struct AttentionConfig {
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub rotary: RotaryEmbedding,
    /// Keys further back than this many positions are masked out.
    pub sliding_window: Option<usize>,
    /// Multiplier on `q . k`.
    pub scale: f64,
    pub softcap: Option<f64>,
    /// Epsilon of the per-head query/key norms, when the layer has them.
    pub qk_norm_eps: Option<f64>,
}

pub struct CausalSelfAttentionLayer {
    q_proj: LinearLayer,
    k_proj: LinearLayer,
    v_proj: LinearLayer,
    o_proj: LinearLayer,
    qk_norm: Option<(RMSNormLayer, RMSNormLayer)>,
    cfg: AttentionConfig,
    device: Device,
}

impl CausalSelfAttentionLayer {
    pub fn new(weights: &Weights, prefix: &str, cfg: AttentionConfig) -> CandleResult<Self> {
        let qk_norm = match cfg.qk_norm_eps {
            Some(eps) => Some((
                RMSNormLayer::with_unit_offset(weights, &format!("{}.q_norm", prefix), eps)?,
                RMSNormLayer::with_unit_offset(weights, &format!("{}.k_norm", prefix), eps)?,
            )),
            None => None,
        };

        Ok(Self {
            q_proj: LinearLayer::new(weights, &format!("{}.q_proj", prefix))?,
            k_proj: LinearLayer::new(weights, &format!("{}.k_proj", prefix))?,
            v_proj: LinearLayer::new(weights, &format!("{}.v_proj", prefix))?,
            o_proj: LinearLayer::new(weights, &format!("{}.o_proj", prefix))?,
            qk_norm,
            cfg,
            device: weights.device().clone(),
        })
    }

    fn repeat_kv(x: Tensor, n_rep: usize) -> CandleResult<Tensor> {
        if n_rep == 1 {
            return Ok(x);
        }

        let (b_sz, n_kv_heads, seq_len, head_dim) = x.dims4()?;
        x.unsqueeze(2)?
            .expand((b_sz, n_kv_heads, n_rep, seq_len, head_dim))?
            .reshape((b_sz, n_kv_heads * n_rep, seq_len, head_dim))
    }

    /// Additive mask of shape `(1, 1, seq_len, total_len)` where query `i`
    /// sits at absolute position `total_len - seq_len + i`. With a window,
    /// a query also ignores keys `window` or more positions behind it.
    fn causal_mask(
        seq_len: usize,
        total_len: usize,
        window: Option<usize>,
        dtype: DType,
        device: &Device,
    ) -> CandleResult<Tensor> {
        let offset = total_len - seq_len;
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| {
                let pos = i + offset;
                (0..total_len).map(move |j| {
                    let future = j > pos;
                    let expired = window.is_some_and(|w| pos - j.min(pos) >= w);
                    if future || expired {
                        f32::NEG_INFINITY
                    } else {
                        0.0
                    }
                })
            })
            .collect();

        Tensor::from_vec(mask, (seq_len, total_len), device)?
            .to_dtype(dtype)?
            .unsqueeze(0)?
            .unsqueeze(0)
    }

    fn project(&self, proj: &LinearLayer, input: &Tensor, n_heads: usize) -> CandleResult<Tensor> {
        let (b_sz, seq_len, _) = input.dims3()?;
        proj.forward(input)?
            .reshape((b_sz, seq_len, n_heads, self.cfg.head_dim))
    }

    /// Forward pass with KV cache support. `position` is the absolute
    /// position of the first token in `input`.
    pub fn forward_with_cache(
        &self,
        input: &Tensor,
        kv_cache: &mut KVCache,
        position: usize,
    ) -> CandleResult<Tensor> {
        let input = input.to_device(&self.device)?;
        let (b_sz, seq_len, _) = input.dims3()?;
        let cfg = &self.cfg;
        let n_rep = cfg.n_heads / cfg.n_kv_heads;

        let mut q = self.project(&self.q_proj, &input, cfg.n_heads)?;
        let mut k = self.project(&self.k_proj, &input, cfg.n_kv_heads)?;
        let v = self.project(&self.v_proj, &input, cfg.n_kv_heads)?;

        if let Some((q_norm, k_norm)) = &self.qk_norm {
            q = q_norm.forward(&q)?;
            k = k_norm.forward(&k)?;
        }

        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        let (cos, sin) = cfg.rotary.tables(position, seq_len, q.dtype(), &self.device)?;
        let q = RotaryEmbedding::apply(&q, &cos, &sin)?;
        let k = RotaryEmbedding::apply(&k, &cos, &sin)?;

        let k = match &kv_cache.k_cache {
            Some(cached) => Tensor::cat(&[cached, &k], 2)?,
            None => k,
        };
        let v = match &kv_cache.v_cache {
            Some(cached) => Tensor::cat(&[cached, &v], 2)?,
            None => v,
        };
        kv_cache.k_cache = Some(k.clone());
        kv_cache.v_cache = Some(v.clone());

        let total_len = k.dim(2)?;

        let k = Self::repeat_kv(k, n_rep)?.contiguous()?;
        let v = Self::repeat_kv(v, n_rep)?.contiguous()?;

        let mut attn_scores = q.matmul(&k.t()?)?.affine(cfg.scale, 0.0)?;

        if let Some(cap) = cfg.softcap {
            attn_scores = ((attn_scores / cap)?.tanh()? * cap)?;
        }

        // A single new token may attend to every cached position unless a
        // window has pushed some of them out.
        let windowed = cfg.sliding_window.is_some_and(|w| total_len > w);
        if seq_len > 1 || windowed {
            let mask = Self::causal_mask(
                seq_len,
                total_len,
                cfg.sliding_window,
                attn_scores.dtype(),
                &self.device,
            )?;
            attn_scores = attn_scores.broadcast_add(&mask)?;
        }

        let attn_probs = candle_nn::ops::softmax_last_dim(&attn_scores)?;

        let context = attn_probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, cfg.n_heads * cfg.head_dim))?;

        self.o_proj.forward(&context)
    }
}
