use candle_core::{Device, Result as CandleResult, Tensor};

use crate::config::{Architecture, ModelConfig};
use crate::llm::activation::Activation;
use crate::llm::causal_self_attention::{AttentionConfig, CausalSelfAttentionLayer, KVCache};
use crate::llm::layer::Layer;
use crate::llm::mlp::MlpLayer;
use crate::llm::rms_norm::RMSNormLayer;
use crate::llm::rotary::RotaryEmbedding;
use crate::llm::weights::Weights;

/// Pre-norm residual block. Gemma 3 also normalizes each sub-block's
/// output before the residual add ("sandwich" norms).
pub struct DecoderLayer {
    pub self_attn: CausalSelfAttentionLayer,
    pub mlp: MlpLayer,
    pub input_norm: RMSNormLayer,
    pub post_attention_norm: Option<RMSNormLayer>,
    pub pre_mlp_norm: RMSNormLayer,
    pub post_mlp_norm: Option<RMSNormLayer>,
    pub device: Device,
}

impl DecoderLayer {
    pub fn new(
        weights: &Weights,
        layer_idx: usize,
        config: &ModelConfig,
        architecture: Architecture,
        activation: Activation,
    ) -> CandleResult<Self> {
        let prefix = format!("model.layers.{}", layer_idx);
        let eps = config.rms_norm_eps;
        let (theta, scaling) = config.layer_rope(layer_idx);

        let attn_cfg = AttentionConfig {
            n_heads: config.num_attention_heads,
            n_kv_heads: config.num_kv_heads(),
            head_dim: config.head_dim(),
            rotary: RotaryEmbedding::new(config.head_dim(), theta, scaling),
            sliding_window: config.layer_sliding_window(layer_idx),
            scale: config.attention_scale(),
            softcap: config.attn_logit_softcapping,
            qk_norm_eps: (architecture == Architecture::Gemma3).then_some(eps),
        };
        let self_attn =
            CausalSelfAttentionLayer::new(weights, &format!("{}.self_attn", prefix), attn_cfg)?;

        let mlp = MlpLayer::new(weights, &format!("{}.mlp", prefix), activation)?;

        let norm = |name: &str| match architecture {
            Architecture::Llama => RMSNormLayer::new(weights, &format!("{}.{}", prefix, name), eps),
            Architecture::Gemma3 => {
                RMSNormLayer::with_unit_offset(weights, &format!("{}.{}", prefix, name), eps)
            }
        };

        let layer = match architecture {
            // Llama names its pre-MLP norm `post_attention_layernorm`.
            Architecture::Llama => Self {
                self_attn,
                mlp,
                input_norm: norm("input_layernorm")?,
                post_attention_norm: None,
                pre_mlp_norm: norm("post_attention_layernorm")?,
                post_mlp_norm: None,
                device: weights.device().clone(),
            },
            Architecture::Gemma3 => Self {
                self_attn,
                mlp,
                input_norm: norm("input_layernorm")?,
                post_attention_norm: Some(norm("post_attention_layernorm")?),
                pre_mlp_norm: norm("pre_feedforward_layernorm")?,
                post_mlp_norm: Some(norm("post_feedforward_layernorm")?),
                device: weights.device().clone(),
            },
        };
        Ok(layer)
    }

    pub fn forward_with_cache(
        &self,
        input: &Tensor,
        kv_cache: &mut KVCache,
        position: usize,
    ) -> CandleResult<Tensor> {
        let input = input.to_device(&self.device)?;
        let normed_input = self.input_norm.forward(&input)?;
        let mut attn_output = self
            .self_attn
            .forward_with_cache(&normed_input, kv_cache, position)?;
        if let Some(norm) = &self.post_attention_norm {
            attn_output = norm.forward(&attn_output)?;
        }
        let attn_residual = input.add(&attn_output)?;

        let normed_attn = self.pre_mlp_norm.forward(&attn_residual)?;
        let mut mlp_output = self.mlp.forward(&normed_attn)?;
        if let Some(norm) = &self.post_mlp_norm {
            mlp_output = norm.forward(&mlp_output)?;
        }
        attn_residual.add(&mlp_output)
    }
}
