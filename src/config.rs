use anyhow::{anyhow, Result};
use candle_core::DType;
use serde::Deserialize;

pub const DEFAULT_MODEL_ID: &str = "google/gemma-3-270m-it";
pub const DEFAULT_MAX_NEW_TOKENS_LIMIT: usize = 4096;
pub const LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Process settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bearer secret. `None` when `API_KEY` is unset or empty, which locks
    /// the generation endpoint for everyone.
    pub api_key: Option<String>,
    pub model_id: String,
    pub dtype: DType,
    pub max_new_tokens_limit: usize,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("API_KEY").filter(|key| !key.is_empty());

        let model_id = lookup("MODEL_ID")
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string());

        let dtype = match lookup("MODEL_DTYPE") {
            Some(raw) => parse_dtype(raw.trim())?,
            None => DType::F32,
        };

        let max_new_tokens_limit = match lookup("MAX_NEW_TOKENS_LIMIT") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|limit| *limit > 0)
                .ok_or_else(|| anyhow!("MAX_NEW_TOKENS_LIMIT must be a positive integer, got '{}'", raw))?,
            None => DEFAULT_MAX_NEW_TOKENS_LIMIT,
        };

        Ok(Self {
            api_key,
            model_id,
            dtype,
            max_new_tokens_limit,
        })
    }
}

/// Parse a dtype name. `f32` is the CPU-safe default.
pub fn parse_dtype(s: &str) -> Result<DType> {
    match s {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => Err(anyhow!("unknown dtype: '{}'", other)),
    }
}

/// `eos_token_id` is either a single id or a list of ids in HF configs.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum TokenIds {
    Single(u32),
    Multiple(Vec<u32>),
}

impl TokenIds {
    pub fn first(&self) -> Option<u32> {
        match self {
            TokenIds::Single(id) => Some(*id),
            TokenIds::Multiple(ids) => ids.first().copied(),
        }
    }

    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            TokenIds::Single(id) => vec![*id],
            TokenIds::Multiple(ids) => ids.clone(),
        }
    }
}

/// Decoder families `llm::models::DecoderModel` can rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// Llama and Mistral checkpoints.
    Llama,
    /// Gemma 3 text models: QK-norm, sandwich norms, scaled embeddings and
    /// interleaved sliding/global attention.
    Gemma3,
}

/// `rope_scaling` entry of `config.json`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RopeScalingConfig {
    #[serde(default)]
    pub rope_type: Option<String>,
    /// Older configs spell the key `type`.
    #[serde(default, rename = "type")]
    pub legacy_type: Option<String>,
    #[serde(default = "default_rope_factor")]
    pub factor: f32,
    #[serde(default = "default_low_freq_factor")]
    pub low_freq_factor: f32,
    #[serde(default = "default_high_freq_factor")]
    pub high_freq_factor: f32,
    #[serde(default = "default_original_max_pos")]
    pub original_max_position_embeddings: usize,
}

impl RopeScalingConfig {
    pub fn kind(&self) -> &str {
        self.rope_type
            .as_deref()
            .or(self.legacy_type.as_deref())
            .unwrap_or("default")
    }
}

fn default_rope_factor() -> f32 {
    1.0
}

fn default_low_freq_factor() -> f32 {
    1.0
}

fn default_high_freq_factor() -> f32 {
    4.0
}

fn default_original_max_pos() -> usize {
    8192
}

/// The subset of a Hugging Face `config.json` needed to rebuild a
/// Llama-family or Gemma 3 decoder.
#[derive(Deserialize, Debug, Clone)]
pub struct ModelConfig {
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub bos_token_id: Option<TokenIds>,
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    /// Llama spelling of the MLP activation.
    #[serde(default)]
    pub hidden_act: Option<String>,
    /// Gemma spelling of the MLP activation.
    #[serde(default)]
    pub hidden_activation: Option<String>,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default)]
    pub rope_scaling: Option<RopeScalingConfig>,
    /// RoPE base of Gemma 3 sliding-window layers.
    #[serde(default)]
    pub rope_local_base_freq: Option<f32>,
    #[serde(default)]
    pub sliding_window: Option<usize>,
    #[serde(default)]
    pub layer_types: Option<Vec<String>>,
    #[serde(default, alias = "_sliding_window_pattern")]
    pub sliding_window_pattern: Option<usize>,
    #[serde(default)]
    pub query_pre_attn_scalar: Option<f64>,
    #[serde(default)]
    pub attn_logit_softcapping: Option<f64>,
    #[serde(default)]
    pub final_logit_softcapping: Option<f64>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub torch_dtype: Option<String>,
    pub vocab_size: usize,
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f32 {
    10_000.0
}

const LLAMA_ARCHITECTURES: &[&str] = &["LlamaForCausalLM", "MistralForCausalLM"];
const GEMMA3_ARCHITECTURES: &[&str] = &["Gemma3ForCausalLM"];
const SUPPORTED_ROPE_SCALING: &[&str] = &["default", "linear", "llama3"];
const DEFAULT_GEMMA3_SLIDING_PATTERN: usize = 6;

impl ModelConfig {
    /// The decoder family, from `architectures` or, when that is empty,
    /// from `model_type`.
    pub fn architecture(&self) -> Result<Architecture> {
        if self.architectures.is_empty() {
            return Ok(match self.model_type.as_deref() {
                Some("gemma3_text") => Architecture::Gemma3,
                _ => Architecture::Llama,
            });
        }
        for arch in &self.architectures {
            if LLAMA_ARCHITECTURES.contains(&arch.as_str()) {
                return Ok(Architecture::Llama);
            }
            if GEMMA3_ARCHITECTURES.contains(&arch.as_str()) {
                return Ok(Architecture::Gemma3);
            }
        }
        Err(anyhow!(
            "unsupported architecture {:?}; supported: {}, {}",
            self.architectures,
            LLAMA_ARCHITECTURES.join(", "),
            GEMMA3_ARCHITECTURES.join(", ")
        ))
    }

    pub fn activation_name(&self) -> &str {
        self.hidden_activation
            .as_deref()
            .or(self.hidden_act.as_deref())
            .unwrap_or(match self.model_type.as_deref() {
                Some("gemma3_text") => "gelu_pytorch_tanh",
                _ => "silu",
            })
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    /// Multiplier applied to `q . k` before the softmax.
    pub fn attention_scale(&self) -> f64 {
        let scalar = self
            .query_pre_attn_scalar
            .unwrap_or(self.head_dim() as f64);
        1.0 / scalar.sqrt()
    }

    /// Attention window of layer `layer_idx`, `None` for full attention.
    pub fn layer_sliding_window(&self, layer_idx: usize) -> Option<usize> {
        let window = self.sliding_window?;
        let sliding = match &self.layer_types {
            Some(types) => types
                .get(layer_idx)
                .is_some_and(|kind| kind == "sliding_attention"),
            None => match self.architecture().ok()? {
                Architecture::Gemma3 => {
                    let pattern = self
                        .sliding_window_pattern
                        .unwrap_or(DEFAULT_GEMMA3_SLIDING_PATTERN);
                    pattern == 0 || (layer_idx + 1) % pattern != 0
                }
                // Mistral applies its window in every layer.
                Architecture::Llama => true,
            },
        };
        sliding.then_some(window)
    }

    /// RoPE base and scaling of layer `layer_idx`. Gemma 3 sliding layers
    /// use their own unscaled base.
    pub fn layer_rope(&self, layer_idx: usize) -> (f32, Option<&RopeScalingConfig>) {
        let local = self.layer_sliding_window(layer_idx).is_some()
            && matches!(self.architecture(), Ok(Architecture::Gemma3));
        if local {
            (self.rope_local_base_freq.unwrap_or(default_rope_theta()), None)
        } else {
            (self.rope_theta, self.rope_scaling.as_ref())
        }
    }

    /// Rejects configurations `llm::models::DecoderModel` cannot rebuild.
    pub fn validate(&self) -> Result<()> {
        self.architecture()?;
        if self.num_attention_heads == 0 {
            return Err(anyhow!("num_attention_heads must be positive"));
        }
        if self.head_dim.is_none() && self.hidden_size % self.num_attention_heads != 0 {
            return Err(anyhow!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size,
                self.num_attention_heads
            ));
        }
        let kv_heads = self.num_kv_heads();
        if kv_heads == 0 || self.num_attention_heads % kv_heads != 0 {
            return Err(anyhow!(
                "num_attention_heads {} is not a multiple of num_key_value_heads {}",
                self.num_attention_heads,
                kv_heads
            ));
        }
        if self.head_dim() == 0 || self.head_dim() % 2 != 0 {
            return Err(anyhow!("head dimension {} must be even for rotary embeddings", self.head_dim()));
        }
        if let Some(scaling) = &self.rope_scaling {
            if !SUPPORTED_ROPE_SCALING.contains(&scaling.kind()) {
                return Err(anyhow!(
                    "unsupported rope_scaling type '{}'; supported: {}",
                    scaling.kind(),
                    SUPPORTED_ROPE_SCALING.join(", ")
                ));
            }
            if !(scaling.factor.is_finite() && scaling.factor > 0.0) {
                return Err(anyhow!("rope_scaling factor must be positive, got {}", scaling.factor));
            }
            if scaling.kind() == "llama3" && scaling.high_freq_factor <= scaling.low_freq_factor {
                return Err(anyhow!("llama3 rope_scaling needs high_freq_factor > low_freq_factor"));
            }
        }
        if self.sliding_window == Some(0) {
            return Err(anyhow!("sliding_window must be positive"));
        }
        Ok(())
    }
}

/// Optional `generation_config.json`; only special ids are used.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct GenerationDefaults {
    #[serde(default)]
    pub bos_token_id: Option<TokenIds>,
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
}
