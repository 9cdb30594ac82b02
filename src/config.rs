//! Configuration parsing and validation.
//!
//! notectx is configured via a TOML file (default `config/notectx.toml`).
//! Sections:
//!
//! - `[db]`: SQLite database path
//! - `[provider]`: embedding backend, model, and rate limits
//! - `[chunking]`: chunk size and overlap, in chars
//! - `[retrieval]`: result count, candidate depth, context budget
//! - `[index]`: write-lock lease
//! - `[server]`: HTTP bind address
//! - `[[collections]]`: one entry per indexable notes file
//!
//! See `config/notectx.example.toml` for a complete example.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use notectx_core::chunk::ChunkParams;
use notectx_core::retrieval::RetrievalParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub collections: Vec<CollectionConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Which embedding API family to talk to.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    Disabled,
    Ollama,
    Openai,
    Lmstudio,
    GenericHttp,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Disabled => "disabled",
            ProviderType::Ollama => "ollama",
            ProviderType::Openai => "openai",
            ProviderType::Lmstudio => "lmstudio",
            ProviderType::GenericHttp => "generic-http",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            ProviderType::Ollama => "http://localhost:11434",
            ProviderType::Openai => "https://api.openai.com",
            ProviderType::Lmstudio => "http://localhost:1234",
            ProviderType::Disabled | ProviderType::GenericHttp => "",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(rename = "type", default = "default_provider_type")]
    pub kind: ProviderType,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    /// Passed through to the external AI validation stage; never called here.
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderType::Disabled,
            base_url: None,
            api_key: None,
            embedding_model: None,
            llm_model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl ProviderConfig {
    pub fn is_enabled(&self) -> bool {
        self.kind != ProviderType::Disabled
    }

    /// Configured base URL, or the provider family's usual local address.
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| self.kind.default_base_url().to_string())
    }

    /// API key from the config file, falling back to `NOTECTX_API_KEY` and
    /// then `OPENAI_API_KEY`.
    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("NOTECTX_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.is_empty())
    }
}

fn default_provider_type() -> ProviderType {
    ProviderType::Disabled
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_requests_per_minute() -> u32 {
    600
}
fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    notectx_core::chunk::DEFAULT_CHUNK_SIZE
}
fn default_overlap() -> usize {
    notectx_core::chunk::DEFAULT_OVERLAP
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            candidate_k: default_candidate_k(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self) -> RetrievalParams {
        RetrievalParams {
            candidate_k: self.candidate_k,
            max_context_chars: self.max_context_chars,
        }
    }
}

fn default_max_results() -> usize {
    notectx_core::retrieval::DEFAULT_MAX_RESULTS
}
fn default_candidate_k() -> usize {
    notectx_core::retrieval::DEFAULT_CANDIDATE_K
}
fn default_max_context_chars() -> usize {
    notectx_core::retrieval::DEFAULT_MAX_CONTEXT_CHARS
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Age after which a write lock left by a crashed run may be taken over.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

fn default_lock_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

/// One indexable notes file.
#[derive(Debug, Deserialize, Clone)]
pub struct CollectionConfig {
    pub collection_name: String,
    #[serde(default)]
    pub description: String,
    pub json_file: PathBuf,
    /// Overrides `[chunking] chunk_size` for this collection.
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub force_recreate: bool,
    #[serde(default)]
    pub skip_ai_validation: bool,
}

impl Config {
    /// Chunking parameters for one collection.
    pub fn chunk_params(&self, collection: &CollectionConfig) -> ChunkParams {
        ChunkParams {
            chunk_size: collection.chunk_size.unwrap_or(self.chunking.chunk_size),
            overlap: self.chunking.overlap,
        }
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionConfig> {
        self.collections.iter().find(|c| c.collection_name == name)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    let chunking = ChunkParams {
        chunk_size: config.chunking.chunk_size,
        overlap: config.chunking.overlap,
    };
    if let Err(msg) = chunking.validate() {
        bail!("chunking: {}", msg);
    }

    // Validate retrieval
    if config.retrieval.max_results < 1 {
        bail!("retrieval.max_results must be >= 1");
    }
    if config.retrieval.max_context_chars == 0 {
        bail!("retrieval.max_context_chars must be > 0");
    }

    // Validate provider
    let provider = &config.provider;
    if provider.is_enabled() {
        if provider.dims.unwrap_or(0) == 0 {
            bail!(
                "provider.dims must be > 0 when provider is '{}'",
                provider.kind.as_str()
            );
        }
        if provider
            .embedding_model
            .as_deref()
            .map_or(true, |m| m.trim().is_empty())
        {
            bail!(
                "provider.embedding_model must be specified when provider is '{}'",
                provider.kind.as_str()
            );
        }
        if provider.base_url().is_empty() {
            bail!(
                "provider.base_url must be specified when provider is '{}'",
                provider.kind.as_str()
            );
        }
    }
    if provider.batch_size == 0 {
        bail!("provider.batch_size must be >= 1");
    }
    if provider.rate_limit.requests_per_minute == 0 {
        bail!("provider.rate_limit.requests_per_minute must be >= 1");
    }
    if provider.rate_limit.concurrency == 0 {
        bail!("provider.rate_limit.concurrency must be >= 1");
    }

    // Validate collections
    let mut seen = HashSet::new();
    for c in &config.collections {
        if c.collection_name.trim().is_empty() {
            bail!("collections: collection_name must not be empty");
        }
        if c.collection_name == "all" {
            bail!("collections: 'all' is reserved and cannot be a collection name");
        }
        if !seen.insert(c.collection_name.as_str()) {
            bail!(
                "collections: duplicate collection_name '{}'",
                c.collection_name
            );
        }
        if let Err(msg) = config.chunk_params(c).validate() {
            bail!("collections.{}: {}", c.collection_name, msg);
        }
    }

    Ok(())
}
