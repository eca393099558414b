//! TOML configuration, read once at startup.
//!
//! Every section is optional; an empty file runs the offline demo setup
//! (hashing embedder, extractive generator, in-memory cache) on
//! `127.0.0.1:8000`.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8000"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [generation]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [cache]
//! backend = "redis"
//! redis_url = "redis://127.0.0.1:6379"
//! ```
//!
//! API keys are never stored in the file: `api_key_env` names the
//! environment variable to read them from.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use lightning_serve_core::cache::{CacheParams, KeyRules};
use lightning_serve_core::chunk::ChunkParams;
use lightning_serve_core::embedding::RetryPolicy;
use lightning_serve_core::pipeline::PipelineParams;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// CORS origins; `["*"]` allows any.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    256
}
fn default_overlap() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"hashing"` (offline) or `"openai"` (any OpenAI-compatible API).
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Per-request HTTP timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            base_url: default_openai_base_url(),
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    /// Vector dimension; the hashing embedder defaults to 384.
    pub fn resolved_dims(&self) -> usize {
        self.dims.unwrap_or(DEFAULT_HASHING_DIMS)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
        }
    }
}

const DEFAULT_HASHING_DIMS: usize = 384;

fn default_embedding_provider() -> String {
    "hashing".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    200
}
fn default_retry_max_ms() -> u64 {
    5_000
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `"extractive"` (offline) or `"openai"` (chat completions).
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Bounds the whole generation call, retries included.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: None,
            base_url: default_openai_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_generation_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl GenerationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
        }
    }
}

fn default_generation_provider() -> String {
    "extractive".to_string()
}
fn default_generation_retries() -> u32 {
    2
}
fn default_max_output_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    #[serde(default = "default_max_batch_queries")]
    pub max_batch_queries: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            max_batch_queries: default_max_batch_queries(),
        }
    }
}

fn default_top_k() -> usize {
    3
}
fn default_max_top_k() -> usize {
    20
}
fn default_max_batch_queries() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// `"memory"` or `"redis"` (requires the `redis-cache` feature).
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    /// Falls back to the `REDIS_URL` environment variable.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default = "default_true")]
    pub collapse_whitespace: bool,
    #[serde(default = "default_true")]
    pub include_top_k: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl(),
            redis_url: None,
            redis_prefix: default_redis_prefix(),
            case_sensitive: false,
            collapse_whitespace: true,
            include_top_k: true,
        }
    }
}

impl CacheConfig {
    pub fn resolved_redis_url(&self) -> Option<String> {
        self.redis_url
            .clone()
            .or_else(|| std::env::var("REDIS_URL").ok())
    }
}

fn default_cache_backend() -> String {
    "memory".to_string()
}
fn default_cache_capacity() -> usize {
    10_000
}
fn default_cache_ttl() -> u64 {
    600
}
fn default_redis_prefix() -> String {
    "lightning:answer:".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Concurrent computations allowed to reach the model services.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// How long one request waits for its answer.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            request_timeout_secs: default_request_timeout(),
            max_document_bytes: default_max_document_bytes(),
        }
    }
}

fn default_max_concurrency() -> usize {
    16
}
fn default_request_timeout() -> u64 {
    60
}
fn default_max_document_bytes() -> usize {
    5 * 1024 * 1024
}

impl Config {
    /// Translate into the core's parameter struct.
    pub fn pipeline_params(&self) -> PipelineParams {
        PipelineParams {
            chunking: ChunkParams {
                max_tokens: self.chunking.max_tokens,
                overlap_tokens: self.chunking.overlap_tokens,
            },
            embed_batch_size: self.embedding.batch_size,
            embed_retry: self.embedding.retry_policy(),
            generation_timeout: Duration::from_secs(self.generation.timeout_secs),
            generation_retry: self.generation.retry_policy(),
            cache: CacheParams {
                ttl: Duration::from_secs(self.cache.ttl_secs),
                key_rules: KeyRules {
                    case_sensitive: self.cache.case_sensitive,
                    collapse_whitespace: self.cache.collapse_whitespace,
                    include_top_k: self.cache.include_top_k,
                },
            },
            default_top_k: self.retrieval.default_top_k,
            max_top_k: self.retrieval.max_top_k,
            max_concurrency: self.pipeline.max_concurrency,
            request_timeout: Duration::from_secs(self.pipeline.request_timeout_secs),
            max_batch_queries: self.retrieval.max_batch_queries,
            max_document_bytes: self.pipeline.max_document_bytes,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check cross-field constraints that serde cannot express.
pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "hashing" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be specified when provider is 'openai'");
            }
            if config.embedding.dims.is_none() {
                anyhow::bail!("embedding.dims must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hashing or openai.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    // Validate generation
    match config.generation.provider.as_str() {
        "extractive" => {}
        "openai" => {
            if config.generation.model.is_none() {
                anyhow::bail!("generation.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be extractive or openai.",
            other
        ),
    }
    if config.generation.timeout_secs == 0 {
        anyhow::bail!("generation.timeout_secs must be > 0");
    }

    // Validate retrieval
    if config.retrieval.default_top_k == 0 {
        anyhow::bail!("retrieval.default_top_k must be >= 1");
    }
    if config.retrieval.default_top_k > config.retrieval.max_top_k {
        anyhow::bail!("retrieval.default_top_k must be <= retrieval.max_top_k");
    }
    if config.retrieval.max_batch_queries == 0 {
        anyhow::bail!("retrieval.max_batch_queries must be >= 1");
    }

    // Validate cache
    if config.cache.capacity == 0 {
        anyhow::bail!("cache.capacity must be > 0");
    }
    if config.cache.ttl_secs == 0 {
        anyhow::bail!("cache.ttl_secs must be > 0");
    }
    match config.cache.backend.as_str() {
        "memory" => {}
        "redis" => {
            if config.cache.resolved_redis_url().is_none() {
                anyhow::bail!("cache.redis_url (or REDIS_URL) is required when backend is 'redis'");
            }
        }
        other => anyhow::bail!("Unknown cache backend: '{}'. Must be memory or redis.", other),
    }

    // Validate pipeline
    if config.pipeline.max_concurrency == 0 {
        anyhow::bail!("pipeline.max_concurrency must be > 0");
    }
    if config.pipeline.request_timeout_secs == 0 {
        anyhow::bail!("pipeline.request_timeout_secs must be > 0");
    }

    Ok(())
}
