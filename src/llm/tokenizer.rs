use anyhow::{anyhow, Result};
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::llm::chat_template::{ChatMessage, ChatTemplate};

/// A special token in `tokenizer_config.json`: either the bare string or an
/// `AddedToken` object.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum SpecialToken {
    Text(String),
    Added { content: String },
}

impl SpecialToken {
    pub fn content(&self) -> &str {
        match self {
            SpecialToken::Text(text) => text,
            SpecialToken::Added { content } => content,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum ChatTemplateSource {
    Single(String),
    Named(Vec<NamedTemplate>),
}

#[derive(Deserialize, Debug, Clone)]
pub struct NamedTemplate {
    pub name: String,
    pub template: String,
}

impl ChatTemplateSource {
    /// The `default` entry of a named list, or its first entry.
    pub fn default_template(&self) -> Option<&str> {
        match self {
            ChatTemplateSource::Single(source) => Some(source),
            ChatTemplateSource::Named(list) => list
                .iter()
                .find(|entry| entry.name == "default")
                .or_else(|| list.first())
                .map(|entry| entry.template.as_str()),
        }
    }
}

/// The parts of `tokenizer_config.json` used at inference time.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct TokenizerConfig {
    #[serde(default)]
    pub bos_token: Option<SpecialToken>,
    #[serde(default)]
    pub eos_token: Option<SpecialToken>,
    #[serde(default)]
    pub pad_token: Option<SpecialToken>,
    #[serde(default)]
    pub chat_template: Option<ChatTemplateSource>,
}

/// Fallback special ids from `config.json` / `generation_config.json`.
#[derive(Debug, Clone, Default)]
pub struct SpecialIds {
    pub bos: Option<u32>,
    pub eos: Option<u32>,
    pub pad: Option<u32>,
    /// Every id that ends generation, e.g. an `eos_token_id` list such as
    /// `[1, 106]` for `<eos>` and `<end_of_turn>`.
    pub stop: Vec<u32>,
}

/// Prompt token ids, tagged with how they were produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptTokens {
    /// Rendered through the chat template.
    Chat(Vec<u32>),
    /// Plain tokenization of the raw prompt.
    Raw(Vec<u32>),
}

impl PromptTokens {
    pub fn ids(&self) -> &[u32] {
        match self {
            PromptTokens::Chat(ids) | PromptTokens::Raw(ids) => ids,
        }
    }

    pub fn is_chat(&self) -> bool {
        matches!(self, PromptTokens::Chat(_))
    }
}

/// `tokenizers::Tokenizer` plus the special tokens and optional chat
/// template the model was trained with.
pub struct TextTokenizer {
    inner: Tokenizer,
    chat_template: Option<ChatTemplate>,
    bos_token: Option<String>,
    eos_token: Option<String>,
    eos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
    stop_token_ids: Vec<u32>,
}

impl TextTokenizer {
    /// Resolves special tokens (config strings first, then fallback ids) and
    /// aliases a missing pad token to the end-of-sequence token. Stop ids are
    /// the fallback list plus the resolved eos and pad ids.
    ///
    /// A chat template that does not compile is dropped with a warning; the
    /// tokenizer then behaves as if it had none.
    pub fn new(inner: Tokenizer, config: TokenizerConfig, fallback: SpecialIds) -> Self {
        let resolve = |token: &Option<SpecialToken>, fallback_id: Option<u32>| {
            let from_config = token.as_ref().and_then(|token| {
                inner
                    .token_to_id(token.content())
                    .map(|id| (token.content().to_string(), id))
            });
            from_config.or_else(|| {
                fallback_id.and_then(|id| inner.id_to_token(id).map(|text| (text, id)))
            })
        };

        let bos = resolve(&config.bos_token, fallback.bos);
        let eos = resolve(&config.eos_token, fallback.eos);
        let mut pad = resolve(&config.pad_token, fallback.pad);

        if pad.is_none() {
            if let Some(eos) = &eos {
                tracing::debug!("tokenizer has no pad token; using eos token '{}'", eos.0);
                pad = Some(eos.clone());
            }
        }

        let mut stop_token_ids = fallback.stop;
        for (_, id) in eos.iter().chain(pad.iter()) {
            if !stop_token_ids.contains(id) {
                stop_token_ids.push(*id);
            }
        }

        let chat_template = config
            .chat_template
            .as_ref()
            .and_then(|source| source.default_template())
            .and_then(|source| match ChatTemplate::parse(source) {
                Ok(template) => Some(template),
                Err(e) => {
                    tracing::warn!("ignoring chat template that failed to compile: {}", e);
                    None
                }
            });

        Self {
            inner,
            chat_template,
            bos_token: bos.map(|(text, _)| text),
            eos_token_id: eos.as_ref().map(|(_, id)| *id),
            eos_token: eos.map(|(text, _)| text),
            pad_token_id: pad.map(|(_, id)| id),
            stop_token_ids,
        }
    }

    /// Replaces the chat template, e.g. with one from `chat_template.jinja`.
    pub fn with_chat_template(mut self, template: Option<ChatTemplate>) -> Self {
        self.chat_template = template;
        self
    }

    pub fn has_chat_template(&self) -> bool {
        self.chat_template.is_some()
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    /// Ids that end generation.
    pub fn stop_token_ids(&self) -> &[u32] {
        &self.stop_token_ids
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| anyhow!(e))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow!(e))
    }

    /// Renders the chat template when the tokenizer has one.
    ///
    /// `None` means the capability is absent. `Some(Err(_))` means the
    /// template itself rejected the conversation.
    pub fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Option<Result<String, minijinja::Error>> {
        self.chat_template.as_ref().map(|template| {
            template.render(
                messages,
                self.bos_token.as_deref(),
                self.eos_token.as_deref(),
                add_generation_prompt,
            )
        })
    }

    /// Tokenizes a single-turn user prompt, preferring the chat format.
    ///
    /// Template failures fall back to plain tokenization. Tokenizer failures
    /// are returned as errors on either path.
    pub fn prompt_tokens(&self, prompt: &str) -> Result<PromptTokens> {
        match self.apply_chat_template(&[ChatMessage::user(prompt)], true) {
            Some(Ok(text)) => {
                // The template already carries BOS and turn markers.
                return Ok(PromptTokens::Chat(self.encode(&text, false)?));
            }
            Some(Err(e)) => {
                tracing::warn!("chat template failed, using plain tokenization: {}", e);
            }
            None => {
                tracing::debug!("tokenizer has no chat template, using plain tokenization");
            }
        }
        Ok(PromptTokens::Raw(self.encode(prompt, true)?))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Word-level tokenizer whose specials are matched as added tokens.
    pub(crate) const TOKENIZER_JSON: &str = r#"{
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

    pub(crate) const CHAT_TEMPLATE: &str =
        "{{ bos_token }}{% for m in messages %}<|user|> {{ m['content'] }}{{ eos_token }}{% endfor %}{% if add_generation_prompt %}<|assistant|>{% endif %}";

    pub(crate) fn raw_tokenizer() -> Tokenizer {
        Tokenizer::from_bytes(TOKENIZER_JSON.as_bytes()).unwrap()
    }

    pub(crate) fn config(chat_template: Option<&str>) -> TokenizerConfig {
        TokenizerConfig {
            bos_token: Some(SpecialToken::Text("<bos>".into())),
            eos_token: Some(SpecialToken::Added {
                content: "<eos>".into(),
            }),
            pad_token: None,
            chat_template: chat_template.map(|t| ChatTemplateSource::Single(t.into())),
        }
    }

    #[test]
    fn test_pad_token_aliases_eos() {
        let tok = TextTokenizer::new(raw_tokenizer(), config(None), SpecialIds::default());
        assert_eq!(tok.eos_token_id(), Some(2));
        assert_eq!(tok.pad_token_id(), Some(2));
        assert_eq!(tok.stop_token_ids(), &[2]);
    }

    #[test]
    fn test_explicit_pad_token_is_kept() {
        let mut cfg = config(None);
        cfg.pad_token = Some(SpecialToken::Text("<unk>".into()));
        let tok = TextTokenizer::new(raw_tokenizer(), cfg, SpecialIds::default());
        assert_eq!(tok.pad_token_id(), Some(0));
        assert_eq!(tok.stop_token_ids(), &[2, 0]);
    }

    #[test]
    fn test_stop_ids_merge_generation_list_with_eos() {
        let fallback = SpecialIds {
            stop: vec![13, 2],
            ..SpecialIds::default()
        };
        let tok = TextTokenizer::new(raw_tokenizer(), config(None), fallback);
        assert_eq!(tok.eos_token_id(), Some(2));
        assert_eq!(tok.stop_token_ids(), &[13, 2]);
    }

    #[test]
    fn test_special_ids_fall_back_to_model_config() {
        let fallback = SpecialIds {
            bos: Some(1),
            eos: Some(2),
            pad: None,
            stop: Vec::new(),
        };
        let tok = TextTokenizer::new(raw_tokenizer(), TokenizerConfig::default(), fallback);
        assert_eq!(tok.eos_token_id(), Some(2));
        assert_eq!(tok.pad_token_id(), Some(2));
    }

    #[test]
    fn test_no_eos_leaves_pad_unset() {
        let tok = TextTokenizer::new(raw_tokenizer(), TokenizerConfig::default(), SpecialIds::default());
        assert_eq!(tok.eos_token_id(), None);
        assert_eq!(tok.pad_token_id(), None);
    }

    #[test]
    fn test_chat_prompt_tokens() {
        let tok = TextTokenizer::new(raw_tokenizer(), config(Some(CHAT_TEMPLATE)), SpecialIds::default());
        assert!(tok.has_chat_template());
        let tokens = tok.prompt_tokens("hello world").unwrap();
        assert_eq!(tokens, PromptTokens::Chat(vec![1, 3, 5, 6, 2, 4]));
    }

    #[test]
    fn test_raw_prompt_tokens_without_template() {
        let tok = TextTokenizer::new(raw_tokenizer(), config(None), SpecialIds::default());
        let tokens = tok.prompt_tokens("what is the capital of Finland?").unwrap();
        assert!(!tokens.is_chat());
        assert_eq!(tokens.ids(), &[7, 8, 9, 10, 11, 12, 13]);
    }

    #[test]
    fn test_failing_template_falls_back_to_raw() {
        let tok = TextTokenizer::new(
            raw_tokenizer(),
            config(Some("{{ raise_exception('no chat here') }}")),
            SpecialIds::default(),
        );
        let tokens = tok.prompt_tokens("hello").unwrap();
        assert_eq!(tokens, PromptTokens::Raw(vec![5]));
    }

    #[test]
    fn test_uncompilable_template_is_dropped() {
        let tok = TextTokenizer::new(raw_tokenizer(), config(Some("{% if %}")), SpecialIds::default());
        assert!(!tok.has_chat_template());
    }

    #[test]
    fn test_named_template_list_prefers_default() {
        let json = r#"{"chat_template": [
            {"name": "tool_use", "template": "tools"},
            {"name": "default", "template": "plain"}
        ]}"#;
        let cfg: TokenizerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.chat_template.unwrap().default_template(), Some("plain"));
    }

    #[test]
    fn test_decode_skips_special_tokens_and_is_idempotent() {
        let tok = TextTokenizer::new(raw_tokenizer(), config(None), SpecialIds::default());
        let ids = [5, 6, 2];
        let first = tok.decode(&ids, true).unwrap();
        assert_eq!(first, "hello world");
        assert_eq!(tok.decode(&ids, true).unwrap(), first);
    }
}
