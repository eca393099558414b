//! Concrete embedding and generation providers.
//!
//! - **`hashing`** / **`extractive`**: offline providers from the core
//!   crate; no network calls, no API key.
//! - **`openai`**: any OpenAI-compatible HTTP API. Embeddings use
//!   `POST {base_url}/embeddings`, generation uses
//!   `POST {base_url}/chat/completions`.
//!
//! Each provider call is exactly one HTTP request. Retry and backoff belong
//! to the core's client wrappers, so providers only classify failures:
//! network errors, HTTP 429 and 5xx are transient; other statuses and
//! malformed bodies are permanent.
//!
//! # Provider Selection
//!
//! ```rust
//! # use lightning_serve::config::EmbeddingConfig;
//! # use lightning_serve::providers::create_embedding_provider;
//! let config = EmbeddingConfig::default(); // provider = "hashing"
//! let provider = create_embedding_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "hashing");
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use lightning_serve_core::embedding::{EmbeddingProvider, HashingEmbeddingProvider};
use lightning_serve_core::error::ProviderError;
use lightning_serve_core::generator::{
    ExtractiveGenerationProvider, GenerationProvider, GenerationRequest,
};

use crate::config::{EmbeddingConfig, GenerationConfig};

const SYSTEM_PROMPT: &str = "You answer questions using only the numbered context passages provided. \
If the passages do not contain the answer, say so. Be concise.";

/// Build the embedding provider named in config.
pub fn create_embedding_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbeddingProvider::new(config.resolved_dims()))),
        "openai" => Ok(Arc::new(HttpEmbeddingProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Build the generation provider named in config.
pub fn create_generation_provider(config: &GenerationConfig) -> Result<Arc<dyn GenerationProvider>> {
    match config.provider.as_str() {
        "extractive" => Ok(Arc::new(ExtractiveGenerationProvider)),
        "openai" => Ok(Arc::new(HttpGenerationProvider::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

fn read_api_key(env_name: &str) -> Result<String> {
    std::env::var(env_name)
        .with_context(|| format!("{} environment variable not set", env_name))
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("Failed to build HTTP client")
}

/// Turn a reqwest response into its JSON body, classifying failures.
async fn read_json(
    sent: Result<reqwest::Response, reqwest::Error>,
    service: &str,
) -> Result<serde_json::Value, ProviderError> {
    let response =
        sent.map_err(|e| ProviderError::transient(format!("{} request failed: {}", service, e)))?;
    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(ProviderError::from_status(status.as_u16(), &body_text));
    }
    response
        .json()
        .await
        .map_err(|e| ProviderError::permanent(format!("{} returned invalid JSON: {}", service, e)))
}

// ============ OpenAI-compatible embeddings ============

pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            api_key: read_api_key(&config.api_key_env)?,
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let sent = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await;
        let json = read_json(sent, "embedding service").await?;
        parse_embeddings_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::permanent("Invalid embeddings response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ProviderError::permanent("Invalid embeddings response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);

        let vector = embedding
            .iter()
            .map(|v| {
                v.as_f64().map(|f| f as f32).ok_or_else(|| {
                    ProviderError::permanent("Invalid embeddings response: non-numeric value")
                })
            })
            .collect::<Result<Vec<f32>, ProviderError>>()?;
        indexed.push((index, vector));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ OpenAI-compatible chat completions ============

pub struct HttpGenerationProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_output_tokens: u32,
    temperature: f32,
}

impl HttpGenerationProvider {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: read_api_key(&config.api_key_env)?,
            model,
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let sent = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&chat_body(
                &self.model,
                request,
                self.max_output_tokens,
                self.temperature,
            ))
            .send()
            .await;
        let json = read_json(sent, "generation service").await?;
        parse_chat_response(&json)
    }
}

fn chat_body(
    model: &str,
    request: &GenerationRequest,
    max_tokens: u32,
    temperature: f32,
) -> serde_json::Value {
    let user = format!(
        "Context:\n{}\n\nQuestion: {}",
        request.numbered_context(),
        request.query
    );
    serde_json::json!({
        "model": model,
        "messages": [
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": user },
        ],
        "max_tokens": max_tokens,
        "temperature": temperature,
    })
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String, ProviderError> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| ProviderError::permanent("Invalid chat response: missing choices[0].message.content"))
}
