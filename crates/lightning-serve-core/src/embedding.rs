//! Embedding provider trait, the batching/retrying embedder client, and
//! vector utilities.
//!
//! An [`EmbeddingProvider`] performs exactly one external call per
//! [`embed_batch`](EmbeddingProvider::embed_batch). The [`EmbedderClient`]
//! wrapped around it owns everything policy-related: splitting input into
//! batches, retrying transient failures with jittered exponential backoff,
//! and checking that the service returned what was asked for.
//!
//! # Retry Strategy
//!
//! - [`ProviderErrorKind::Transient`] (network, HTTP 429, HTTP 5xx) → retry
//! - [`ProviderErrorKind::Permanent`] → fail immediately
//! - Backoff: `base`, `2×base`, `4×base`, … capped at `max_delay`, each
//!   multiplied by a random jitter factor in `[0, 1)`
//! - At most `max_retries` retries after the first attempt
//!
//! Concrete HTTP providers live in the `lightning-serve` app crate.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::error::{PipelineError, ProviderError};

/// Backend that turns texts into vectors with one external call.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed one batch. Must return one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Bounded, jittered exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry (before jitter).
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delays between attempts. Yields at most `max_retries` items.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        // ExponentialBackoff::from_millis(2) yields 2, 4, 8, ... which
        // `factor` scales; halving the base makes the first delay `base`.
        let factor = (self.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_retries as usize)
    }
}

/// Client used by ingestion and retrieval to embed text.
///
/// Holds no mutable state of its own; concurrent calls share only the
/// provider (and whatever connection pool it keeps).
pub struct EmbedderClient {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    retry: RetryPolicy,
}

impl EmbedderClient {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
            retry,
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Embed `texts`, returning `vectors[i]` for `texts[i]`.
    ///
    /// Texts are sent in batches of at most `batch_size`. An empty input
    /// returns an empty output without calling the provider.
    ///
    /// # Errors
    ///
    /// [`PipelineError::EmbeddingService`] with the last underlying cause
    /// when a batch fails permanently or exhausts its retries.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let embedded = self.embed_with_retry(batch).await?;
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    /// Embed a single text (e.g. a search query).
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        let mut out = self.embed(&[text.to_string()]).await?;
        out.pop().ok_or_else(|| PipelineError::EmbeddingService {
            attempts: 1,
            cause: "empty embedding response".to_string(),
        })
    }

    async fn embed_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let provider = self.provider.as_ref();
        let dims = provider.dims();

        let result = RetryIf::spawn(
            self.retry.delays(),
            || async move {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                if attempt > 1 {
                    debug!(attempt, batch = batch.len(), "retrying embedding batch");
                }
                let vectors = provider.embed_batch(batch).await?;
                validate_batch(&vectors, batch.len(), dims)?;
                Ok::<_, ProviderError>(vectors)
            },
            |e: &ProviderError| {
                if e.is_transient() {
                    warn!(error = %e, "transient embedding failure");
                }
                e.is_transient()
            },
        )
        .await;

        result.map_err(|e| PipelineError::EmbeddingService {
            attempts: counter.load(Ordering::Relaxed),
            cause: e.message,
        })
    }
}

fn validate_batch(vectors: &[Vec<f32>], expected: usize, dims: usize) -> Result<(), ProviderError> {
    if vectors.len() != expected {
        return Err(ProviderError::permanent(format!(
            "embedding service returned {} vectors for {} inputs",
            vectors.len(),
            expected
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(ProviderError::permanent(format!(
            "embedding dimension mismatch: expected {}, got {}",
            dims,
            bad.len()
        )));
    }
    Ok(())
}

// ============ Hashing Provider ============

/// Offline, deterministic feature-hashing embedder.
///
/// Each lower-cased alphanumeric token is hashed (SHA-256) into one of
/// `dims` buckets with a ±1 sign, and the result is L2-normalised. Texts
/// sharing words get positive cosine similarity. No network calls; used for
/// demo mode and as the basis of test doubles.
pub struct HashingEmbeddingProvider {
    dims: usize,
}

impl HashingEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    /// Embed a single text synchronously.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&digest[..8]);
            let h = u64::from_le_bytes(bytes);
            let bucket = (h % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddingProvider {
    fn model_name(&self) -> &str {
        "hashing"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, or zero-magnitude vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Records batch sizes and fails according to a script.
    struct ScriptedProvider {
        inner: HashingEmbeddingProvider,
        failures: Mutex<VecDeque<ProviderError>>,
        batches: Mutex<Vec<usize>>,
    }

    impl ScriptedProvider {
        fn new(failures: Vec<ProviderError>) -> Self {
            Self {
                inner: HashingEmbeddingProvider::new(16),
                failures: Mutex::new(failures.into()),
                batches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn dims(&self) -> usize {
            16
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            self.batches.lock().push(texts.len());
            if let Some(err) = self.failures.lock().pop_front() {
                return Err(err);
            }
            self.inner.embed_batch(texts).await
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("text number {}", i)).collect()
    }

    #[tokio::test]
    async fn test_batches_preserve_order() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let client = EmbedderClient::new(provider.clone(), 4, fast_retry(0));
        let input = texts(10);

        let vectors = client.embed(&input).await.unwrap();

        assert_eq!(*provider.batches.lock(), vec![4, 4, 2]);
        let hashing = HashingEmbeddingProvider::new(16);
        for (text, vector) in input.iter().zip(vectors.iter()) {
            assert_eq!(&hashing.embed_text(text), vector);
        }
    }

    #[tokio::test]
    async fn test_empty_input_skips_provider() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let client = EmbedderClient::new(provider.clone(), 4, fast_retry(0));
        assert!(client.embed(&[]).await.unwrap().is_empty());
        assert!(provider.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ProviderError::transient("HTTP 429: slow down"),
            ProviderError::transient("connection reset"),
        ]));
        let client = EmbedderClient::new(provider.clone(), 8, fast_retry(3));

        let vectors = client.embed(&texts(2)).await.unwrap();

        assert_eq!(vectors.len(), 2);
        assert_eq!(provider.batches.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_carries_last_cause() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ProviderError::transient("first"),
            ProviderError::transient("second"),
            ProviderError::transient("third"),
        ]));
        let client = EmbedderClient::new(provider.clone(), 8, fast_retry(2));

        let err = client.embed(&texts(1)).await.unwrap_err();

        match err {
            PipelineError::EmbeddingService { attempts, cause } => {
                assert_eq!(attempts, 3);
                assert_eq!(cause, "third");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![ProviderError::permanent(
            "HTTP 401: bad key",
        )]));
        let client = EmbedderClient::new(provider.clone(), 8, fast_retry(5));

        let err = client.embed(&texts(1)).await.unwrap_err();

        assert!(matches!(err, PipelineError::EmbeddingService { attempts: 1, .. }));
        assert_eq!(provider.batches.lock().len(), 1);
    }

    #[test]
    fn test_retry_delays_bounded() {
        let policy = RetryPolicy {
            max_retries: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let delays: Vec<Duration> = policy.delays().collect();
        assert_eq!(delays.len(), 6);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(300)));
    }

    #[test]
    fn test_hashing_is_deterministic_and_normalized() {
        let p = HashingEmbeddingProvider::new(64);
        let a = p.embed_text("Lightning is a fast weather phenomenon.");
        let b = p.embed_text("Lightning is a fast weather phenomenon.");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_shared_words_are_similar() {
        let p = HashingEmbeddingProvider::new(256);
        let doc = p.embed_text("Lightning is a fast weather phenomenon.");
        let query = p.embed_text("What is lightning?");
        let other = p.embed_text("Bread recipes with sourdough starter");
        assert!(cosine_similarity(&doc, &query) > cosine_similarity(&other, &query));
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
