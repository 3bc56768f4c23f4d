use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::app_state::InferenceContext;
use crate::config::{GenerationDefaults, ModelConfig, Settings, TokenIds};
use crate::llm::chat_template::ChatTemplate;
use crate::llm::models::DecoderModel;
use crate::llm::tokenizer::{SpecialIds, TextTokenizer, TokenizerConfig};
use crate::llm::weights::Weights;

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
const CHAT_TEMPLATE_FILE: &str = "chat_template.jinja";
const GENERATION_CONFIG_FILE: &str = "generation_config.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Paths of every file needed to rebuild a model, all on local disk.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub chat_template: Option<PathBuf>,
    pub generation_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct WeightsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Resolves `model_id` without touching the network: an existing directory
/// is used as is, anything else is looked up in the local hub cache.
pub fn resolve_model_files(model_id: &str) -> Result<ModelFiles> {
    let dir = Path::new(model_id);
    if dir.is_dir() {
        tracing::info!("Resolving model files from directory {}", dir.display());
        return resolve_with(model_id, |name| {
            let path = dir.join(name);
            path.is_file().then_some(path)
        });
    }

    let cache = hf_hub::Cache::from_env();
    tracing::info!(
        "Resolving {} from the local hub cache at {}",
        model_id,
        cache.path().display()
    );
    let repo = cache.model(model_id.to_string());
    resolve_with(model_id, |name| repo.get(name))
}

fn resolve_with<F>(model_id: &str, get: F) -> Result<ModelFiles>
where
    F: Fn(&str) -> Option<PathBuf>,
{
    let require = |name: &str| {
        get(name).ok_or_else(|| {
            anyhow!(
                "{} not found for model '{}' (only local files are used)",
                name,
                model_id
            )
        })
    };

    let weights = if let Some(single) = get(WEIGHTS_FILE) {
        vec![single]
    } else if let Some(index_path) = get(WEIGHTS_INDEX_FILE) {
        let index: WeightsIndex = read_json(&index_path)?;
        let shards: BTreeSet<&String> = index.weight_map.values().collect();
        if shards.is_empty() {
            bail!("{} lists no weight shards", index_path.display());
        }
        shards
            .into_iter()
            .map(|shard| require(shard.as_str()))
            .collect::<Result<Vec<_>>>()?
    } else {
        bail!(
            "neither {} nor {} found for model '{}' (only local files are used)",
            WEIGHTS_FILE,
            WEIGHTS_INDEX_FILE,
            model_id
        );
    };

    Ok(ModelFiles {
        config: require(CONFIG_FILE)?,
        tokenizer: require(TOKENIZER_FILE)?,
        tokenizer_config: get(TOKENIZER_CONFIG_FILE),
        chat_template: get(CHAT_TEMPLATE_FILE),
        generation_config: get(GENERATION_CONFIG_FILE),
        weights,
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    serde_json::from_reader(file).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn load_tokenizer(
    files: &ModelFiles,
    config: &ModelConfig,
    generation: &GenerationDefaults,
) -> Result<TextTokenizer> {
    let inner = Tokenizer::from_file(&files.tokenizer).map_err(|e| {
        anyhow!("failed to load tokenizer {}: {}", files.tokenizer.display(), e)
    })?;

    let tokenizer_config: TokenizerConfig = match &files.tokenizer_config {
        Some(path) => read_json(path)?,
        None => TokenizerConfig::default(),
    };

    let fallback = SpecialIds {
        bos: generation
            .bos_token_id
            .as_ref()
            .or(config.bos_token_id.as_ref())
            .and_then(|ids| ids.first()),
        eos: generation
            .eos_token_id
            .as_ref()
            .or(config.eos_token_id.as_ref())
            .and_then(|ids| ids.first()),
        pad: generation.pad_token_id.or(config.pad_token_id),
        // generation_config first: it carries chat end-of-turn ids
        stop: generation
            .eos_token_id
            .iter()
            .chain(config.eos_token_id.iter())
            .flat_map(TokenIds::to_vec)
            .fold(Vec::new(), |mut ids, id| {
                if !ids.contains(&id) {
                    ids.push(id);
                }
                ids
            }),
    };

    let mut tokenizer = TextTokenizer::new(inner, tokenizer_config, fallback);

    // A standalone template file takes precedence over the config entry.
    if let Some(path) = &files.chat_template {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        match ChatTemplate::parse(source) {
            Ok(template) => tokenizer = tokenizer.with_chat_template(Some(template)),
            Err(e) => tracing::warn!("ignoring {}: {}", path.display(), e),
        }
    }

    Ok(tokenizer)
}

pub fn load_weights(paths: &[PathBuf], device: &Device, dtype: DType) -> Result<Weights> {
    let tensors = unsafe {
        if paths.len() == 1 {
            MmapedSafetensors::new(&paths[0])
        } else {
            MmapedSafetensors::multi(paths)
        }
    }
    .context("failed to memory-map safetensors weights")?;
    Ok(Weights::new(tensors, device.clone(), dtype))
}

/// Loads tokenizer and model for `settings.model_id` on the CPU.
pub fn load_context(settings: &Settings) -> Result<InferenceContext> {
    let files = resolve_model_files(&settings.model_id)?;

    let config: ModelConfig = read_json(&files.config)?;
    config.validate()?;
    let generation: GenerationDefaults = match &files.generation_config {
        Some(path) => read_json(path)?,
        None => GenerationDefaults::default(),
    };

    let tokenizer = load_tokenizer(&files, &config, &generation)?;
    tracing::info!(
        "Tokenizer loaded (chat template: {}, eos: {:?}, pad: {:?}, stop ids: {:?})",
        tokenizer.has_chat_template(),
        tokenizer.eos_token_id(),
        tokenizer.pad_token_id(),
        tokenizer.stop_token_ids()
    );

    let device = Device::Cpu;
    let weights = load_weights(&files.weights, &device, settings.dtype)?;
    let model = DecoderModel::new(&weights, &config)
        .with_context(|| format!("failed to build model '{}'", settings.model_id))?;
    tracing::info!(
        "Model loaded: {:?}, {} layers, hidden size {}, dtype {:?}",
        model.architecture,
        config.num_hidden_layers,
        config.hidden_size,
        settings.dtype
    );

    Ok(InferenceContext {
        model: Box::new(model),
        tokenizer,
        device,
        model_id: settings.model_id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MAX_NEW_TOKENS_LIMIT;
    use crate::llm::models::tests::{
        tiny_config_json, tiny_gemma3_config_json, write_checkpoint, write_gemma3_checkpoint,
    };
    use crate::llm::tokenizer::tests::TOKENIZER_JSON;
    use std::fs;

    fn write_model_dir(dir: &Path) {
        fs::write(dir.join(CONFIG_FILE), tiny_config_json(false).to_string()).unwrap();
        fs::write(dir.join(TOKENIZER_FILE), TOKENIZER_JSON).unwrap();
        fs::write(
            dir.join(TOKENIZER_CONFIG_FILE),
            r#"{"bos_token": "<bos>", "eos_token": "<eos>", "pad_token": null}"#,
        )
        .unwrap();
    }

    fn settings(model_id: &Path) -> Settings {
        Settings {
            api_key: None,
            model_id: model_id.display().to_string(),
            dtype: DType::F32,
            max_new_tokens_limit: DEFAULT_MAX_NEW_TOKENS_LIMIT,
        }
    }

    #[test]
    fn test_missing_weights_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_model_dir(dir.path());
        let err = resolve_model_files(dir.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains(WEIGHTS_FILE));
    }

    #[test]
    fn test_missing_tokenizer_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_model_dir(dir.path());
        fs::remove_file(dir.path().join(TOKENIZER_FILE)).unwrap();
        fs::write(dir.path().join(WEIGHTS_FILE), b"").unwrap();
        let err = resolve_model_files(dir.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains(TOKENIZER_FILE));
    }

    #[test]
    fn test_sharded_weights_are_resolved_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_model_dir(dir.path());
        fs::write(
            dir.path().join(WEIGHTS_INDEX_FILE),
            r#"{"metadata": {}, "weight_map": {
                "lm_head.weight": "model-00002-of-00002.safetensors",
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors",
                "model.norm.weight": "model-00002-of-00002.safetensors"
            }}"#,
        )
        .unwrap();
        fs::write(dir.path().join("model-00001-of-00002.safetensors"), b"").unwrap();

        let err = resolve_model_files(dir.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("model-00002-of-00002.safetensors"));

        fs::write(dir.path().join("model-00002-of-00002.safetensors"), b"").unwrap();
        let files = resolve_model_files(dir.path().to_str().unwrap()).unwrap();
        let names: Vec<_> = files
            .weights
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["model-00001-of-00002.safetensors", "model-00002-of-00002.safetensors"]
        );
    }

    #[test]
    fn test_unknown_repo_is_not_downloaded() {
        let cache = tempfile::tempdir().unwrap();
        let repo = hf_hub::Cache::new(cache.path().to_path_buf()).model("nobody/nothing".to_string());
        let err = resolve_with("nobody/nothing", |name| repo.get(name)).unwrap_err();
        assert!(err.to_string().contains("only local files"));
    }

    #[test]
    fn test_chat_template_file_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        write_model_dir(dir.path());
        fs::write(dir.path().join(WEIGHTS_FILE), b"").unwrap();
        fs::write(dir.path().join(CHAT_TEMPLATE_FILE), "{{ messages[0]['content'] }}").unwrap();

        let files = resolve_model_files(dir.path().to_str().unwrap()).unwrap();
        let config: ModelConfig = read_json(&files.config).unwrap();
        let tokenizer = load_tokenizer(&files, &config, &GenerationDefaults::default()).unwrap();
        assert!(tokenizer.has_chat_template());
        assert!(tokenizer.prompt_tokens("hello").unwrap().is_chat());
    }

    #[test]
    fn test_load_context_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_model_dir(dir.path());
        write_checkpoint(&dir.path().join(WEIGHTS_FILE), true);

        let context = load_context(&settings(dir.path())).unwrap();
        assert_eq!(context.model.num_layers(), 2);
        assert!(!context.tokenizer.has_chat_template());
        assert_eq!(context.tokenizer.eos_token_id(), Some(2));
        assert_eq!(context.tokenizer.pad_token_id(), Some(2));
    }

    #[test]
    fn test_generation_config_stop_ids_end_generation() {
        let dir = tempfile::tempdir().unwrap();
        write_model_dir(dir.path());
        write_checkpoint(&dir.path().join(WEIGHTS_FILE), true);
        fs::write(dir.path().join(GENERATION_CONFIG_FILE), r#"{"eos_token_id": [2, 13]}"#).unwrap();

        let context = load_context(&settings(dir.path())).unwrap();
        assert_eq!(context.tokenizer.eos_token_id(), Some(2));
        assert_eq!(context.tokenizer.stop_token_ids(), &[2, 13]);
    }

    #[test]
    fn test_load_gemma3_context() {
        let dir = tempfile::tempdir().unwrap();
        write_model_dir(dir.path());
        fs::write(dir.path().join(CONFIG_FILE), tiny_gemma3_config_json().to_string()).unwrap();
        write_gemma3_checkpoint(&dir.path().join(WEIGHTS_FILE));

        let context = load_context(&settings(dir.path())).unwrap();
        assert_eq!(context.model.num_layers(), 2);
        let completion = context
            .complete(
                "hello",
                &crate::llm::inference::SamplingOptions {
                    max_new_tokens: 3,
                    temperature: 0.0,
                    top_p: 1.0,
                    seed: None,
                },
            )
            .unwrap();
        assert!(completion.generated_tokens <= 3);
    }

    #[test]
    fn test_load_context_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent-model");
        assert!(load_context(&settings(&missing)).is_err());
    }
}
