//! Error taxonomy for the query-serving pipeline.
//!
//! [`PipelineError`] is what callers of the core see. It is `Clone` because a
//! single failed computation in the cache layer is handed to every request
//! waiting on the same key.
//!
//! [`ProviderError`] is what an embedding or generation backend returns for a
//! single external call. The clients in [`crate::embedding`] and
//! [`crate::generator`] use its [`ProviderErrorKind`] to decide whether to
//! retry, and fold the last failure into a [`PipelineError`] once retries run
//! out.

use thiserror::Error;

/// Errors surfaced by the ingestion and query paths.
///
/// | Variant | Retried locally | HTTP code |
/// |---------|-----------------|-----------|
/// | `InvalidInput` | no | `invalid_input` (400) |
/// | `EmbeddingService` | yes, then surfaced | `embedding_unavailable` (503) |
/// | `GenerationService` | yes, then surfaced | `generation_unavailable` (502) |
/// | `GenerationTimeout` | no | `generation_timeout` (504) |
/// | `EmptyIndex` | no | `empty_index` (409) |
/// | `NotFound` | no | `not_found` (404) |
/// | `RequestTimeout` | no | `request_timeout` (408) |
/// | `Internal` | no | `internal` (500) |
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("embedding service failed after {attempts} attempt(s): {cause}")]
    EmbeddingService { attempts: u32, cause: String },

    #[error("generation service failed after {attempts} attempt(s): {cause}")]
    GenerationService { attempts: u32, cause: String },

    #[error("generation timed out after {elapsed_ms} ms")]
    GenerationTimeout { elapsed_ms: u64 },

    #[error("the index holds no chunks; ingest a document first")]
    EmptyIndex,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request timed out after {elapsed_ms} ms")]
    RequestTimeout { elapsed_ms: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Machine-readable error code used in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::InvalidInput(_) => "invalid_input",
            PipelineError::EmbeddingService { .. } => "embedding_unavailable",
            PipelineError::GenerationService { .. } => "generation_unavailable",
            PipelineError::GenerationTimeout { .. } => "generation_timeout",
            PipelineError::EmptyIndex => "empty_index",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::RequestTimeout { .. } => "request_timeout",
            PipelineError::Internal(_) => "internal",
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::EmbeddingService { .. }
                | PipelineError::GenerationService { .. }
                | PipelineError::GenerationTimeout { .. }
                | PipelineError::RequestTimeout { .. }
        )
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        PipelineError::InvalidInput(message.into())
    }
}

/// Whether a provider failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Network errors, HTTP 429, HTTP 5xx.
    Transient,
    /// Client errors, malformed responses, misconfiguration.
    Permanent,
}

/// Failure of one call to an external embedding or generation service.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }

    /// Classify an HTTP status: 429 and 5xx are transient, everything else
    /// permanent.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body);
        if status == 429 || (500..600).contains(&status) {
            Self::transient(message)
        } else {
            Self::permanent(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ProviderError::from_status(429, "slow down").is_transient());
        assert!(ProviderError::from_status(503, "").is_transient());
        assert!(!ProviderError::from_status(400, "bad").is_transient());
        assert!(!ProviderError::from_status(401, "").is_transient());
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(!PipelineError::invalid_input("x").is_retryable());
        assert!(!PipelineError::EmptyIndex.is_retryable());
        assert!(PipelineError::GenerationTimeout { elapsed_ms: 5 }.is_retryable());
        assert!(PipelineError::EmbeddingService {
            attempts: 3,
            cause: "boom".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_display_carries_cause() {
        let err = PipelineError::EmbeddingService {
            attempts: 4,
            cause: "HTTP 503: overloaded".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("4 attempt"));
        assert!(msg.contains("overloaded"));
        assert_eq!(err.code(), "embedding_unavailable");
    }
}
