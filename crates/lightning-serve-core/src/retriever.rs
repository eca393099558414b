//! Query-time retrieval: embed the query, search the index, assemble context.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::embedding::EmbedderClient;
use crate::error::PipelineError;
use crate::index::VectorIndex;
use crate::metrics::{MetricsCollector, Outcome, Stage};
use crate::models::ScoredChunk;

/// Passages retrieved for one query, best first.
#[derive(Debug, Clone)]
pub struct RetrievedContext {
    pub passages: Vec<ScoredChunk>,
}

impl RetrievedContext {
    pub fn chunk_ids(&self) -> Vec<String> {
        self.passages.iter().map(|p| p.chunk.id.clone()).collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.passages.iter().map(|p| p.chunk.text.clone()).collect()
    }

    pub fn best_score(&self) -> Option<f32> {
        self.passages.first().map(|p| p.score)
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

pub struct Retriever {
    embedder: Arc<EmbedderClient>,
    index: Arc<VectorIndex>,
    metrics: Arc<MetricsCollector>,
}

impl Retriever {
    pub fn new(
        embedder: Arc<EmbedderClient>,
        index: Arc<VectorIndex>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            embedder,
            index,
            metrics,
        }
    }

    /// Retrieve the `top_k` passages most similar to `query`.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::InvalidInput`] for a blank query.
    /// - [`PipelineError::EmptyIndex`] when nothing has been ingested.
    /// - [`PipelineError::EmbeddingService`] when the query cannot be embedded.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<RetrievedContext, PipelineError> {
        if query.trim().is_empty() {
            return Err(PipelineError::invalid_input("query must not be empty"));
        }
        if self.index.is_empty() {
            return Err(PipelineError::EmptyIndex);
        }

        let started = Instant::now();
        let vector = match self.embedder.embed_one(query).await {
            Ok(v) => {
                self.metrics
                    .record(Stage::Embed, started.elapsed(), Outcome::Success);
                v
            }
            Err(e) => {
                self.metrics
                    .record(Stage::Embed, started.elapsed(), Outcome::Error);
                return Err(e);
            }
        };

        if vector.len() != self.index.dims() {
            self.metrics
                .record(Stage::Retrieve, started.elapsed(), Outcome::Error);
            return Err(PipelineError::EmbeddingService {
                attempts: 1,
                cause: format!(
                    "query vector has dimension {}, index expects {}",
                    vector.len(),
                    self.index.dims()
                ),
            });
        }

        let search_started = Instant::now();
        let passages = self.index.search(&vector, top_k);
        self.metrics
            .record(Stage::Retrieve, search_started.elapsed(), Outcome::Success);

        let context = RetrievedContext { passages };
        if let Some(score) = context.best_score() {
            self.metrics.record_similarity(score);
        }
        debug!(
            top_k,
            hits = context.passages.len(),
            best_score = context.best_score().unwrap_or(0.0),
            "retrieved context"
        );
        Ok(context)
    }
}
