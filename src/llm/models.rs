use anyhow::Result;
use candle_core::{Device, Result as CandleResult, Tensor};

use crate::config::{Architecture, ModelConfig};
use crate::llm::activation::Activation;
use crate::llm::causal_self_attention::KVCache;
use crate::llm::decoder::DecoderLayer;
use crate::llm::embedding::EmbeddingLayer;
use crate::llm::layer::Layer;
use crate::llm::lm_head::LMHeadLayer;
use crate::llm::rms_norm::RMSNormLayer;
use crate::llm::weights::Weights;

/// A decoder-only language model producing next-token logits.
///
/// `forward_with_cache` takes `(batch, seq_len)` token ids whose first token
/// sits at absolute `position`, extends `kv_caches` (one per layer) and
/// returns `(batch, seq_len, vocab_size)` logits.
pub trait CausalLM: Send + Sync {
    fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        kv_caches: &mut [KVCache],
        position: usize,
    ) -> CandleResult<Tensor>;

    fn num_layers(&self) -> usize;

    fn forward(&self, input_ids: &Tensor) -> CandleResult<Tensor> {
        let mut kv_caches = self.new_cache();
        self.forward_with_cache(input_ids, &mut kv_caches, 0)
    }

    fn new_cache(&self) -> Vec<KVCache> {
        vec![KVCache::new(); self.num_layers()]
    }
}

/// Llama-family or Gemma 3 decoder-only transformer.
pub struct DecoderModel {
    pub device: Device,
    pub architecture: Architecture,
    pub embed_layer: EmbeddingLayer,
    pub decoder_layers: Vec<DecoderLayer>,
    pub norm_layer: RMSNormLayer,
    pub lm_head: LMHeadLayer,
    pub final_logit_softcapping: Option<f64>,
}

impl DecoderModel {
    pub fn new(weights: &Weights, config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        let architecture = config.architecture()?;
        let activation = Activation::try_from(config.activation_name())?;

        let embed_layer = EmbeddingLayer::new(weights, "model.embed_tokens")?;
        let embed_layer = match architecture {
            Architecture::Llama => embed_layer,
            Architecture::Gemma3 => embed_layer.scaled((config.hidden_size as f64).sqrt()),
        };

        let decoder_layers = (0..config.num_hidden_layers)
            .map(|layer_idx| DecoderLayer::new(weights, layer_idx, config, architecture, activation))
            .collect::<CandleResult<Vec<_>>>()?;

        let norm_layer = match architecture {
            Architecture::Llama => RMSNormLayer::new(weights, "model.norm", config.rms_norm_eps)?,
            Architecture::Gemma3 => {
                RMSNormLayer::with_unit_offset(weights, "model.norm", config.rms_norm_eps)?
            }
        };

        // Some checkpoints omit the head tensor even without the tie flag.
        let lm_head = if config.tie_word_embeddings || !weights.contains("lm_head.weight") {
            LMHeadLayer::tied(embed_layer.table())
        } else {
            LMHeadLayer::new(weights, "lm_head")?
        };

        Ok(Self {
            device: weights.device().clone(),
            architecture,
            embed_layer,
            decoder_layers,
            norm_layer,
            lm_head,
            final_logit_softcapping: config.final_logit_softcapping,
        })
    }
}

impl CausalLM for DecoderModel {
    fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        kv_caches: &mut [KVCache],
        position: usize,
    ) -> CandleResult<Tensor> {
        if kv_caches.len() != self.decoder_layers.len() {
            candle_core::bail!(
                "expected {} kv caches, got {}",
                self.decoder_layers.len(),
                kv_caches.len()
            );
        }

        let input_ids = input_ids.to_device(&self.device)?;
        let mut hidden_states = self.embed_layer.forward(&input_ids)?;

        for (layer, cache) in self.decoder_layers.iter().zip(kv_caches.iter_mut()) {
            hidden_states = layer.forward_with_cache(&hidden_states, cache, position)?;
        }

        let normed_output = self.norm_layer.forward(&hidden_states)?;
        let logits = self.lm_head.forward(&normed_output)?;
        match self.final_logit_softcapping {
            Some(cap) => (logits / cap)?.tanh()? * cap,
            None => Ok(logits),
        }
    }

    fn num_layers(&self) -> usize {
        self.decoder_layers.len()
    }
}
