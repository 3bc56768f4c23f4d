use anyhow::Result;
use candle_core::{Device, IndexOp, Tensor};

use crate::llm::models::CausalLM;
use crate::llm::sampling::LogitsSampler;
use crate::llm::tokenizer::TextTokenizer;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    /// 0 selects greedy decoding.
    pub temperature: f64,
    pub top_p: f64,
    pub seed: Option<u64>,
    /// Generation ends after any of these ids is produced.
    pub stop_token_ids: Vec<u32>,
}

/// Runs autoregressive generation and returns the prompt followed by at most
/// `max_new_tokens` generated ids. A produced stop token is kept and ends
/// generation.
pub fn generate(
    model: &dyn CausalLM,
    device: &Device,
    input_ids: &[u32],
    params: &GenerationParams,
) -> Result<Vec<u32>> {
    let mut output_ids = input_ids.to_vec();
    if params.max_new_tokens == 0 {
        return Ok(output_ids);
    }
    anyhow::ensure!(!input_ids.is_empty(), "cannot generate from an empty prompt");

    let mut sampler = LogitsSampler::new(params.temperature, params.top_p, params.seed);
    let mut kv_caches = model.new_cache();

    // First forward pass with all prompt tokens, then one token at a time.
    let mut pending: Vec<u32> = input_ids.to_vec();
    let mut position = 0;

    for _ in 0..params.max_new_tokens {
        let input_tensor = Tensor::new(pending.as_slice(), device)?.unsqueeze(0)?;
        let logits = model.forward_with_cache(&input_tensor, &mut kv_caches, position)?;

        let next_token_logits = logits.i((0, logits.dim(1)? - 1))?;
        let next_token = sampler.sample(&next_token_logits)?;

        position += pending.len();
        output_ids.push(next_token);

        if params.stop_token_ids.contains(&next_token) {
            break;
        }
        pending = vec![next_token];
    }

    Ok(output_ids)
}

/// Per-request sampling knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingOptions {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: Option<u64>,
}

/// Decoded result of one generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub chat_formatted: bool,
}

/// Tokenizes `prompt`, generates, strips the echoed prompt and decodes the
/// continuation without special tokens.
pub fn complete(
    model: &dyn CausalLM,
    tokenizer: &TextTokenizer,
    device: &Device,
    prompt: &str,
    options: &SamplingOptions,
) -> Result<Completion> {
    let prompt_tokens = tokenizer.prompt_tokens(prompt)?;
    let input_ids = prompt_tokens.ids();

    let params = GenerationParams {
        max_new_tokens: options.max_new_tokens,
        temperature: options.temperature,
        top_p: options.top_p,
        seed: options.seed,
        stop_token_ids: tokenizer.stop_token_ids().to_vec(),
    };

    let output_ids = generate(model, device, input_ids, &params)?;
    let new_tokens = &output_ids[input_ids.len()..];
    let text = tokenizer.decode(new_tokens, true)?.trim().to_string();

    Ok(Completion {
        text,
        prompt_tokens: input_ids.len(),
        generated_tokens: new_tokens.len(),
        chat_formatted: prompt_tokens.is_chat(),
    })
}
