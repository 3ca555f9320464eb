//! TOML configuration.
//!
//! Every section has defaults, so a deployment can run with no config file
//! at all. Credentials are never read from the file: `[generation]` names
//! the environment variable that holds the API key.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub generation: GenerationConfig,
    pub server: ServerConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `local`, `openai`, or `ollama`.
    pub provider: String,
    pub model: String,
    pub dims: Option<usize>,
    pub batch_size: usize,
    /// Ollama base URL.
    pub url: Option<String>,
    pub timeout_secs: u64,
    /// Where local model weights are persisted between runs.
    pub cache_dir: PathBuf,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: "all-minilm-l6-v2".to_string(),
            dims: None,
            batch_size: 64,
            url: None,
            timeout_secs: 30,
            cache_dir: PathBuf::from("./models_cache"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    /// Persisted-index directory.
    pub dir: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./faiss_index"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum chunk length in characters.
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks of one document.
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub k: usize,
    /// Candidates scanned when looking for the target page's raw markup.
    pub script_markup_k: usize,
    pub script_context_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: 4,
            script_markup_k: 10,
            script_context_k: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    /// `openai` (any OpenAI-compatible endpoint) or `ollama`.
    pub provider: String,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub test_case_temperature: f32,
    pub script_temperature: f32,
    /// Single-entry `Grounded_In` values replaced with the retrieved sources.
    pub placeholder_sources: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "openai/gpt-4o".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            timeout_secs: 120,
            test_case_temperature: 0.1,
            script_temperature: 0.0,
            placeholder_sources: vec!["context".to_string()],
        }
    }
}

impl GenerationConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            max_upload_mb: 25,
        }
    }
}

/// Extension allow-lists applied before uploads reach the core.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct UploadConfig {
    pub document_extensions: Vec<String>,
    pub html_extensions: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            document_extensions: vec!["md".into(), "txt".into(), "json".into(), "pdf".into()],
            html_extensions: vec!["html".into(), "htm".into()],
        }
    }
}

impl UploadConfig {
    pub fn is_document_allowed(&self, filename: &str) -> bool {
        has_extension(filename, &self.document_extensions)
    }

    pub fn is_html_allowed(&self, filename: &str) -> bool {
        has_extension(filename, &self.html_extensions)
    }
}

fn has_extension(filename: &str, allowed: &[String]) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| allowed.iter().any(|a| a.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        let config = Config::default();
        validate(&config)?;
        Ok(config)
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }

    if config.retrieval.k == 0 || config.retrieval.script_markup_k == 0 {
        anyhow::bail!("retrieval.k and retrieval.script_markup_k must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "local" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be local, openai, or ollama.",
            other
        ),
    }
    if config.embedding.provider != "local" && config.embedding.dims.is_none() {
        anyhow::bail!(
            "embedding.dims must be set when provider is '{}'",
            config.embedding.provider
        );
    }

    match config.generation.provider.as_str() {
        "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be openai or ollama.",
            other
        ),
    }

    Ok(())
}
