//! Generation provider trait and the timeout/retry generator client.
//!
//! A [`GenerationProvider`] makes one call to a language model. The
//! [`GeneratorClient`] applies policy around it:
//!
//! - the configured timeout bounds the *whole* call, retries included; on
//!   expiry the in-flight attempt is dropped and
//!   [`PipelineError::GenerationTimeout`] is returned;
//! - transient failures are retried with the same jittered backoff as the
//!   embedder ([`RetryPolicy`]);
//! - an empty answer counts as a permanent failure.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::embedding::RetryPolicy;
use crate::error::{PipelineError, ProviderError};

/// A question plus the passages retrieved for it, best first.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub query: String,
    pub context: Vec<String>,
}

impl GenerationRequest {
    pub fn new(query: impl Into<String>, context: Vec<String>) -> Self {
        Self {
            query: query.into(),
            context,
        }
    }

    /// Render the context as numbered passages for a chat prompt.
    pub fn numbered_context(&self) -> String {
        self.context
            .iter()
            .enumerate()
            .map(|(i, text)| format!("[{}] {}", i + 1, text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Backend that answers a [`GenerationRequest`] with one external call.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, request: &GenerationRequest) -> Result<String, ProviderError>;
}

pub struct GeneratorClient {
    provider: Arc<dyn GenerationProvider>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl GeneratorClient {
    pub fn new(provider: Arc<dyn GenerationProvider>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            provider,
            timeout,
            retry,
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Produce an answer for `query` from `context`.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::GenerationTimeout`] when the deadline passes.
    /// - [`PipelineError::GenerationService`] on a permanent failure or once
    ///   retries are exhausted.
    pub async fn generate(&self, query: &str, context: Vec<String>) -> Result<String, PipelineError> {
        let request = GenerationRequest::new(query, context);
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, self.generate_with_retry(&request)).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                warn!(elapsed_ms, model = self.model_name(), "generation timed out");
                Err(PipelineError::GenerationTimeout { elapsed_ms })
            }
        }
    }

    async fn generate_with_retry(&self, request: &GenerationRequest) -> Result<String, PipelineError> {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let provider = self.provider.as_ref();

        let result = RetryIf::spawn(
            self.retry.delays(),
            || async move {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                if attempt > 1 {
                    debug!(attempt, "retrying generation");
                }
                let answer = provider.complete(request).await?;
                if answer.trim().is_empty() {
                    return Err(ProviderError::permanent("model returned an empty answer"));
                }
                Ok::<_, ProviderError>(answer)
            },
            |e: &ProviderError| {
                if e.is_transient() {
                    warn!(error = %e, "transient generation failure");
                }
                e.is_transient()
            },
        )
        .await;

        result.map_err(|e| PipelineError::GenerationService {
            attempts: counter.load(Ordering::Relaxed),
            cause: e.message,
        })
    }
}

/// Offline provider that answers with the best-matching passage.
///
/// Used for demo mode when no model endpoint is configured.
pub struct ExtractiveGenerationProvider;

/// Longest answer the extractive provider returns, in characters.
const EXTRACT_MAX_CHARS: usize = 600;

#[async_trait]
impl GenerationProvider for ExtractiveGenerationProvider {
    fn model_name(&self) -> &str {
        "extractive"
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let Some(top) = request.context.first() else {
            return Ok("No relevant passages were found for this question.".to_string());
        };
        let mut answer: String = top.chars().take(EXTRACT_MAX_CHARS).collect();
        if top.chars().count() > EXTRACT_MAX_CHARS {
            answer.push_str("...");
        }
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct ScriptedModel {
        script: Mutex<VecDeque<Result<String, ProviderError>>>,
        delay: Duration,
        calls: AtomicU32,
    }

    impl ScriptedModel {
        fn new(script: Vec<Result<String, ProviderError>>, delay: Duration) -> Self {
            Self {
                script: Mutex::new(script.into()),
                delay,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl GenerationProvider for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _request: &GenerationRequest) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok("default".to_string()))
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn client(model: Arc<ScriptedModel>, timeout: Duration) -> GeneratorClient {
        GeneratorClient::new(model, timeout, fast_retry())
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let model = Arc::new(ScriptedModel::new(
            vec![Err(ProviderError::transient("HTTP 503")), Ok("answer".into())],
            Duration::ZERO,
        ));
        let answer = client(model.clone(), Duration::from_secs(5))
            .generate("q", vec![])
            .await
            .unwrap();
        assert_eq!(answer, "answer");
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let model = Arc::new(ScriptedModel::new(
            vec![Err(ProviderError::permanent("HTTP 401"))],
            Duration::ZERO,
        ));
        let err = client(model.clone(), Duration::from_secs(5))
            .generate("q", vec![])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::GenerationService {
                attempts: 1,
                cause: "HTTP 401".into()
            }
        );
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let model = Arc::new(ScriptedModel::new(
            vec![
                Err(ProviderError::transient("a")),
                Err(ProviderError::transient("b")),
                Err(ProviderError::transient("c")),
            ],
            Duration::ZERO,
        ));
        let err = client(model.clone(), Duration::from_secs(5))
            .generate("q", vec![])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::GenerationService {
                attempts: 3,
                cause: "c".into()
            }
        );
    }

    #[tokio::test]
    async fn test_empty_answer_is_error() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("  ".into())], Duration::ZERO));
        let err = client(model.clone(), Duration::from_secs(5))
            .generate("q", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::GenerationService { .. }));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_covers_whole_call() {
        let model = Arc::new(ScriptedModel::new(vec![], Duration::from_secs(10)));
        let err = client(model, Duration::from_millis(100))
            .generate("q", vec![])
            .await
            .unwrap_err();
        match err {
            PipelineError::GenerationTimeout { elapsed_ms } => assert!(elapsed_ms >= 100),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_extractive_uses_top_passage() {
        let provider = ExtractiveGenerationProvider;
        let request = GenerationRequest::new(
            "What is lightning?",
            vec!["Lightning is a fast weather phenomenon.".into(), "other".into()],
        );
        let answer = provider.complete(&request).await.unwrap();
        assert_eq!(answer, "Lightning is a fast weather phenomenon.");
    }

    #[test]
    fn test_numbered_context() {
        let request = GenerationRequest::new("q", vec!["alpha".into(), "beta".into()]);
        assert_eq!(request.numbered_context(), "[1] alpha\n\n[2] beta");
    }
}
