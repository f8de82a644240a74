
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::embeddings::ollama::DEFAULT_EMBEDDING_DIMENSION;
use crate::ingest::chunking::ChunkingConfig;

const CONFIG_FILE_NAME: &str = "config.toml";
const APP_DIR_NAME: &str = "ragkit";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub embedding: OllamaConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OllamaConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub model: String,
    pub batch_size: u32,
    pub embedding_dimension: u32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            model: "all-minilm:latest".to_string(),
            batch_size: 32,
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndexConfig {
    /// Search breadth per index: queries explore `top_k * n_trees` graph candidates
    pub n_trees: usize,
    /// Number of local chunks retrieved per query
    pub top_k: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            n_trees: 10,
            top_k: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebConfig {
    pub num_results: usize,
    /// Only the first `crawl_top` search results are crawled
    pub crawl_top: usize,
    /// Characters of crawled body carried into the prompt per result
    pub preview_chars: usize,
    pub max_content_length: usize,
    pub timeout_seconds: u64,
    pub concurrency: usize,
    pub cache_ttl_hours: u64,
    pub request_deadline_seconds: u64,
    pub user_agent: String,
    pub serpapi_url: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            num_results: 5,
            crawl_top: 3,
            preview_chars: 1000,
            max_content_length: 5000,
            timeout_seconds: 10,
            concurrency: 5,
            cache_ttl_hours: 24,
            request_deadline_seconds: 30,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
            serpapi_url: "https://serpapi.com/search".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    /// Pause between consecutive page summaries of one paged document
    pub page_delay_ms: u64,
    /// Pause after a paged document has been fully summarized
    pub document_cooldown_ms: u64,
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            model: "gemini-2.0-flash".to_string(),
            page_delay_ms: 1000,
            document_cooldown_ms: 10_000,
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_turns: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_turns: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Prior queries strictly above this cosine similarity are evaluated against
    pub similarity_threshold: f32,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid embedding dimension: {0} (must be between 8 and 4096)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid chunk size: {0} (must be between 50 and 100000)")]
    InvalidChunkSize(usize),
    #[error("Chunk overlap ({0}) must be smaller than chunk size ({1})")]
    OverlapTooLarge(usize, usize),
    #[error("Invalid separator: must not be empty")]
    EmptySeparator,
    #[error("Invalid tree count: {0} (must be between 1 and 1000)")]
    InvalidTreeCount(usize),
    #[error("Invalid top-k: {0} (must be between 1 and 100)")]
    InvalidTopK(usize),
    #[error("Invalid web concurrency: {0} (must be between 1 and 64)")]
    InvalidConcurrency(usize),
    #[error("Invalid timeout: {0} seconds (must be between 1 and 600)")]
    InvalidTimeout(u64),
    #[error("Invalid history size: {0} (must be between 1 and 100)")]
    InvalidHistorySize(usize),
    #[error("Invalid similarity threshold: {0} (must be between 0 and 1)")]
    InvalidSimilarityThreshold(f32),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding: OllamaConfig::default(),
            chunking: ChunkingConfig::default(),
            index: IndexConfig::default(),
            web: WebConfig::default(),
            llm: LlmConfig::default(),
            history: HistoryConfig::default(),
            feedback: FeedbackConfig::default(),
            base_dir: PathBuf::new(),
        }
    }
}

impl Config {
    /// Default base directory, e.g. `~/.config/ragkit` on Linux
    #[inline]
    pub fn default_base_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR_NAME))
            .ok_or(ConfigError::DirectoryError)
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let config_path = base_dir.as_ref().join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            return Ok(Self {
                base_dir: base_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = base_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let base_dir = self.get_base_dir();

        fs::create_dir_all(base_dir)
            .with_context(|| format!("Failed to create config directory: {}", base_dir.display()))?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Get the base directory for the application
    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.embedding.validate()?;
        self.validate_chunking_config()?;
        self.validate_retrieval_config()?;
        Ok(())
    }

    fn validate_chunking_config(&self) -> Result<(), ConfigError> {
        let config = &self.chunking;

        if !(50..=100_000).contains(&config.chunk_size) {
            return Err(ConfigError::InvalidChunkSize(config.chunk_size));
        }

        if config.chunk_overlap >= config.chunk_size {
            return Err(ConfigError::OverlapTooLarge(
                config.chunk_overlap,
                config.chunk_size,
            ));
        }

        if config.separator.is_empty() {
            return Err(ConfigError::EmptySeparator);
        }

        Ok(())
    }

    fn validate_retrieval_config(&self) -> Result<(), ConfigError> {
        if !(1..=1000).contains(&self.index.n_trees) {
            return Err(ConfigError::InvalidTreeCount(self.index.n_trees));
        }

        if !(1..=100).contains(&self.index.top_k) {
            return Err(ConfigError::InvalidTopK(self.index.top_k));
        }

        if !(1..=64).contains(&self.web.concurrency) {
            return Err(ConfigError::InvalidConcurrency(self.web.concurrency));
        }

        for timeout in [self.web.timeout_seconds, self.llm.timeout_seconds] {
            if !(1..=600).contains(&timeout) {
                return Err(ConfigError::InvalidTimeout(timeout));
            }
        }

        Url::parse(&self.web.serpapi_url)
            .map_err(|_| ConfigError::InvalidUrl(self.web.serpapi_url.clone()))?;
        Url::parse(&self.llm.base_url).map_err(|_| ConfigError::InvalidUrl(self.llm.base_url.clone()))?;

        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.llm.model.clone()));
        }

        if !(1..=100).contains(&self.history.max_turns) {
            return Err(ConfigError::InvalidHistorySize(self.history.max_turns));
        }

        if !(0.0..=1.0).contains(&self.feedback.similarity_threshold) {
            return Err(ConfigError::InvalidSimilarityThreshold(
                self.feedback.similarity_threshold,
            ));
        }

        Ok(())
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        self.embedding.ollama_url()
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join(CONFIG_FILE_NAME)
    }

    /// Canonical location of ingested source files
    #[inline]
    pub fn knowledge_dir(&self) -> PathBuf {
        self.get_base_dir().join("knowledge_source")
    }

    /// Per-file chunk artifacts that feed every rebuild
    #[inline]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.get_base_dir().join("artifacts")
    }

    /// Root of the index generations and the `CURRENT` pointer
    #[inline]
    pub fn index_dir(&self) -> PathBuf {
        self.get_base_dir().join("index")
    }

    #[inline]
    pub fn feedback_log_path(&self) -> PathBuf {
        self.get_base_dir().join("feedback").join("feedback_log.jsonl")
    }

    #[inline]
    pub fn evaluation_log_path(&self) -> PathBuf {
        self.get_base_dir().join("feedback").join("evaluations.jsonl")
    }

    #[inline]
    pub fn web_cache_path(&self) -> PathBuf {
        self.get_base_dir().join("cache").join("web_search_cache.json")
    }

    #[inline]
    pub fn crawled_data_dir(&self) -> PathBuf {
        self.get_base_dir().join("crawled_data")
    }
}

impl OllamaConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if !(8..=4096).contains(&self.embedding_dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(
                self.embedding_dimension,
            ));
        }

        Ok(())
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }
}
