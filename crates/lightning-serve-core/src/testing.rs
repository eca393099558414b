//! Deterministic provider doubles for tests.
//!
//! Available to this crate's unit tests and, through the `test-utils`
//! feature, to downstream integration tests.
//!
//! ```toml
//! [dev-dependencies]
//! lightning-serve-core = { path = "crates/lightning-serve-core", features = ["test-utils"] }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::embedding::{EmbeddingProvider, HashingEmbeddingProvider};
use crate::error::ProviderError;
use crate::generator::{GenerationProvider, GenerationRequest};

/// Hashing embedder that counts calls and can be told to fail or stall.
pub struct CountingEmbedder {
    inner: HashingEmbeddingProvider,
    dims: usize,
    calls: AtomicUsize,
    texts: AtomicUsize,
    failures: Mutex<VecDeque<ProviderError>>,
    delay: Mutex<Duration>,
}

impl CountingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            inner: HashingEmbeddingProvider::new(dims),
            dims,
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Number of `embed_batch` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of texts embedded so far.
    pub fn texts(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    /// The next call fails with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, error: ProviderError) {
        self.failures.lock().push_back(error);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    fn model_name(&self) -> &str {
        "counting"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed_batch(texts).await
    }
}

/// Generator that answers from the top passage, counting calls.
pub struct ScriptedGenerator {
    calls: AtomicUsize,
    failures: Mutex<VecDeque<ProviderError>>,
    delay: Mutex<Duration>,
    fixed_answer: Mutex<Option<String>>,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            delay: Mutex::new(Duration::ZERO),
            fixed_answer: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, error: ProviderError) {
        self.failures.lock().push_back(error);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Always answer with `answer` instead of the top passage.
    pub fn set_answer(&self, answer: impl Into<String>) {
        *self.fixed_answer.lock() = Some(answer.into());
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        if let Some(answer) = self.fixed_answer.lock().clone() {
            return Ok(answer);
        }
        Ok(request
            .context
            .first()
            .cloned()
            .unwrap_or_else(|| format!("No context for: {}", request.query)))
    }
}
