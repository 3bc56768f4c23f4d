use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use candle_core::{Device, Result as CandleResult, Tensor};
use http_body_util::BodyExt;
use tokenizers::Tokenizer;

use llm_generate_api::config::Settings;
use llm_generate_api::llm::causal_self_attention::KVCache;
use llm_generate_api::llm::models::CausalLM;
use llm_generate_api::llm::tokenizer::{
    ChatTemplateSource, SpecialIds, SpecialToken, TextTokenizer, TokenizerConfig,
};
use llm_generate_api::{AppState, InferenceContext};

pub const API_KEY: &str = "test-key";

const TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [
        {"id": 0, "content": "<unk>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
        {"id": 1, "content": "<bos>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
        {"id": 2, "content": "<eos>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
        {"id": 3, "content": "<|user|>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
        {"id": 4, "content": "<|assistant|>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
    ],
    "normalizer": null,
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {
            "<unk>": 0, "<bos>": 1, "<eos>": 2, "<|user|>": 3, "<|assistant|>": 4,
            "hello": 5, "world": 6, "what": 7, "is": 8, "the": 9,
            "capital": 10, "of": 11, "Finland": 12, "?": 13, "helsinki": 14
        },
        "unk_token": "<unk>"
    }
}"#;

pub const CHAT_TEMPLATE: &str = "{{ bos_token }}{% for m in messages %}<|user|> {{ m['content'] }}{{ eos_token }}{% endfor %}{% if add_generation_prompt %}<|assistant|>{% endif %}";

const VOCAB_SIZE: usize = 15;

/// Deterministic stand-in for a language model: always predicts the id
/// after the last input token, and `<eos>` past the end of the vocabulary.
pub struct CountingModel;

impl CausalLM for CountingModel {
    fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        _kv_caches: &mut [KVCache],
        _position: usize,
    ) -> CandleResult<Tensor> {
        let ids = input_ids.squeeze(0)?.to_vec1::<u32>()?;
        let mut logits = vec![0f32; ids.len() * VOCAB_SIZE];
        for (row, id) in ids.iter().enumerate() {
            let next = match (*id as usize + 1) % VOCAB_SIZE {
                0 => 2,
                next => next,
            };
            logits[row * VOCAB_SIZE + next] = 10.0;
        }
        Tensor::from_vec(logits, (1, ids.len(), VOCAB_SIZE), input_ids.device())
    }

    fn num_layers(&self) -> usize {
        1
    }
}

/// Always fails, standing in for a broken inference backend.
pub struct FailingModel;

impl CausalLM for FailingModel {
    fn forward_with_cache(
        &self,
        _input_ids: &Tensor,
        _kv_caches: &mut [KVCache],
        _position: usize,
    ) -> CandleResult<Tensor> {
        candle_core::bail!("backend exploded")
    }

    fn num_layers(&self) -> usize {
        1
    }
}

pub fn settings(api_key: Option<&str>) -> Settings {
    Settings {
        api_key: api_key.map(str::to_string),
        model_id: "test/counting".to_string(),
        dtype: candle_core::DType::F32,
        max_new_tokens_limit: 64,
    }
}

pub fn tokenizer(chat_template: Option<&str>) -> TextTokenizer {
    let inner = Tokenizer::from_bytes(TOKENIZER_JSON.as_bytes()).unwrap();
    let config = TokenizerConfig {
        bos_token: Some(SpecialToken::Text("<bos>".into())),
        eos_token: Some(SpecialToken::Text("<eos>".into())),
        pad_token: None,
        chat_template: chat_template.map(|t| ChatTemplateSource::Single(t.into())),
    };
    TextTokenizer::new(inner, config, SpecialIds::default())
}

pub fn context(
    model: Box<dyn CausalLM + Send + Sync>,
    chat_template: Option<&str>,
) -> InferenceContext {
    InferenceContext {
        model,
        tokenizer: tokenizer(chat_template),
        device: Device::Cpu,
        model_id: "test/counting".to_string(),
    }
}

pub fn ready_state(api_key: Option<&str>, chat_template: Option<&str>) -> Arc<AppState> {
    Arc::new(AppState::with_context(
        settings(api_key),
        context(Box::new(CountingModel), chat_template),
    ))
}

pub fn generate_request(auth: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/generate")
        .header("content-type", "application/json");
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
