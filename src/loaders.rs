//! Downloading model components from the Hugging Face Hub.
//!
//! - [`HfLoader`] - resolves a single file of a Hub repository to a local path
//! - [`TokenizerLoader`] - `tokenizer.json`
//! - [`GenerationConfigLoader`] - `generation_config.json` (end-of-sequence ids)
//! - [`TokenizerConfigLoader`] - `tokenizer_config.json` (chat template)
//! - [`GgufModelLoader`] - quantized GGUF weights
//!
//! Files are cached by `hf-hub`, so only the first load touches the network.
//! Concurrent loads of the same repository can race on the Hub cache lock;
//! those attempts are retried with exponential backoff.

use crate::core::{ChatTemplate, GenerationConfig};
use candle_core::quantized::gguf_file;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokenizers::Tokenizer;

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct HfLoader {
    pub repo: String,
    pub filename: String,
}

impl HfLoader {
    pub fn new(repo: &str, filename: &str) -> Self {
        Self {
            repo: repo.into(),
            filename: filename.into(),
        }
    }

    pub async fn load(&self) -> anyhow::Result<PathBuf> {
        let api = hf_hub::api::tokio::ApiBuilder::new()
            .with_chunk_size(None)
            .build()?
            .model(self.repo.clone());

        let mut attempt = 1;
        loop {
            match api.get(&self.filename).await {
                Ok(path) => return Ok(path),
                Err(e) if attempt < MAX_ATTEMPTS && e.to_string().contains("Lock acquisition failed") => {
                    let wait = Duration::from_millis(100 * (1 << attempt));
                    tracing::warn!(
                        repo = %self.repo,
                        file = %self.filename,
                        attempt,
                        "hub cache is locked, retrying in {wait:?}"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("failed to fetch {}/{}", self.repo, self.filename)))
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenizerLoader {
    pub tokenizer_file_loader: HfLoader,
}

impl TokenizerLoader {
    pub fn new(repo: &str, filename: &str) -> Self {
        Self {
            tokenizer_file_loader: HfLoader::new(repo, filename),
        }
    }

    pub async fn load(&self) -> anyhow::Result<Tokenizer> {
        let path = self.tokenizer_file_loader.load().await?;
        Tokenizer::from_file(path).map_err(anyhow::Error::msg)
    }
}

#[derive(Debug, Clone)]
pub struct GenerationConfigLoader {
    pub generation_config_file_loader: HfLoader,
}

#[derive(Deserialize)]
struct RawGenerationConfig {
    #[serde(alias = "eos_token_ids")]
    eos_token_id: Option<serde_json::Value>,
    bos_token_id: Option<u64>,
}

impl GenerationConfigLoader {
    pub fn new(repo: &str, filename: &str) -> Self {
        Self {
            generation_config_file_loader: HfLoader::new(repo, filename),
        }
    }

    pub async fn load(&self) -> anyhow::Result<GenerationConfig> {
        let path = self.generation_config_file_loader.load().await?;
        parse_generation_config(&std::fs::read_to_string(path)?)
    }
}

pub(crate) fn parse_generation_config(json: &str) -> anyhow::Result<GenerationConfig> {
    let raw: RawGenerationConfig = serde_json::from_str(json)?;

    let eos_token_ids = match raw.eos_token_id {
        Some(serde_json::Value::Number(n)) => vec![n
            .as_u64()
            .ok_or_else(|| anyhow::anyhow!("invalid EOS token id {n}"))?],
        Some(serde_json::Value::Array(ids)) => ids
            .into_iter()
            .map(|v| {
                v.as_u64()
                    .ok_or_else(|| anyhow::anyhow!("invalid EOS token id {v}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?,
        _ => Vec::new(),
    };

    Ok(GenerationConfig {
        eos_token_ids,
        bos_token_id: raw.bos_token_id,
    })
}

#[derive(Debug, Clone)]
pub struct TokenizerConfigLoader {
    pub tokenizer_config_file_loader: HfLoader,
}

impl TokenizerConfigLoader {
    pub fn new(repo: &str, filename: &str) -> Self {
        Self {
            tokenizer_config_file_loader: HfLoader::new(repo, filename),
        }
    }

    /// Load and compile the `chat_template` field.
    pub async fn load_chat_template(&self) -> anyhow::Result<ChatTemplate> {
        let path = self.tokenizer_config_file_loader.load().await?;
        let config: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        let source = config["chat_template"].as_str().ok_or_else(|| {
            anyhow::anyhow!(
                "missing 'chat_template' in {}",
                self.tokenizer_config_file_loader.repo
            )
        })?;
        ChatTemplate::new(source)
    }
}

#[derive(Debug, Clone)]
pub struct GgufModelLoader {
    pub model_file_loader: HfLoader,
}

impl GgufModelLoader {
    pub fn new(model_repo: &str, model_filename: &str) -> Self {
        Self {
            model_file_loader: HfLoader::new(model_repo, model_filename),
        }
    }

    pub async fn load(&self) -> anyhow::Result<(std::fs::File, gguf_file::Content)> {
        let path = self.model_file_loader.load().await?;

        let mut file = std::fs::File::open(&path)?;
        let content = gguf_file::Content::read(&mut file).map_err(|e| e.with_path(path))?;

        Ok((file, content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eos_as_array() {
        let config = parse_generation_config(
            r#"{"bos_token_id": 151643, "eos_token_id": [151645, 151643], "do_sample": true}"#,
        )
        .unwrap();
        assert_eq!(config.eos_token_ids, vec![151645, 151643]);
        assert_eq!(config.bos_token_id, Some(151643));
    }

    #[test]
    fn test_eos_as_number() {
        let config = parse_generation_config(r#"{"eos_token_id": 2}"#).unwrap();
        assert_eq!(config.eos_token_ids, vec![2]);
    }

    #[test]
    fn test_missing_eos() {
        let config = parse_generation_config("{}").unwrap();
        assert!(config.eos_token_ids.is_empty());
    }

    #[test]
    fn test_invalid_eos() {
        assert!(parse_generation_config(r#"{"eos_token_id": [-1]}"#).is_err());
    }
}
