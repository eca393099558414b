//! Query-serving pipeline orchestration.
//!
//! [`Pipeline`] owns one instance of every component and is the only entry
//! point the HTTP layer talks to:
//!
//! ```text
//! ingest:  Chunker → EmbedderClient → VectorIndex (corpus version bump)
//! query:   QueryCache lookup ─hit──────────────────────────────→ answer
//!                            └miss→ Retriever → GeneratorClient → store
//! ```
//!
//! # Concurrency
//!
//! - A semaphore of `max_concurrency` permits bounds how many computations
//!   reach the embedding and generation services at once. Ingestion takes
//!   one permit per document while embedding its chunks.
//! - Ingestion and deletion of the same document are serialized by a
//!   per-document async mutex; different documents proceed in parallel.
//! - `request_timeout` bounds each caller's wait. A caller that gives up
//!   does not cancel the shared computation other callers are waiting on.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::cache::{CacheOutcome, CacheParams, CacheStats, CacheStore, Computed, QueryCache};
use crate::chunk::{chunk_document, ChunkParams};
use crate::embedding::{EmbedderClient, EmbeddingProvider, RetryPolicy};
use crate::error::PipelineError;
use crate::generator::{GenerationProvider, GeneratorClient};
use crate::index::VectorIndex;
use crate::metrics::{MetricsCollector, MetricsSnapshot, Outcome, Stage};
use crate::models::{ContextPassage, CorpusVersion, Document, DocumentRecord, EmbeddedChunk};
use crate::retriever::Retriever;

/// Longest accepted document id.
const MAX_DOCUMENT_ID_LEN: usize = 256;

/// Everything [`Pipeline::new`] needs besides the providers and store.
#[derive(Debug, Clone)]
pub struct PipelineParams {
    pub chunking: ChunkParams,
    pub embed_batch_size: usize,
    pub embed_retry: RetryPolicy,
    pub generation_timeout: Duration,
    pub generation_retry: RetryPolicy,
    pub cache: CacheParams,
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub max_concurrency: usize,
    pub request_timeout: Duration,
    pub max_batch_queries: usize,
    pub max_document_bytes: usize,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            chunking: ChunkParams::default(),
            embed_batch_size: 64,
            embed_retry: RetryPolicy::default(),
            generation_timeout: Duration::from_secs(30),
            generation_retry: RetryPolicy::default(),
            cache: CacheParams::default(),
            default_top_k: 3,
            max_top_k: 20,
            max_concurrency: 16,
            request_timeout: Duration::from_secs(60),
            max_batch_queries: 20,
            max_document_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Where a query is in its lifecycle. Emitted as the `phase` field of
/// tracing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Received,
    CacheLookup,
    CacheHit,
    CacheMiss,
    Embedding,
    Retrieving,
    Generating,
    CacheStore,
    Done,
    Failed,
}

impl QueryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryPhase::Received => "received",
            QueryPhase::CacheLookup => "cache_lookup",
            QueryPhase::CacheHit => "cache_hit",
            QueryPhase::CacheMiss => "cache_miss",
            QueryPhase::Embedding => "embedding",
            QueryPhase::Retrieving => "retrieving",
            QueryPhase::Generating => "generating",
            QueryPhase::CacheStore => "cache_store",
            QueryPhase::Done => "done",
            QueryPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryPhase::Done | QueryPhase::Failed)
    }
}

impl fmt::Display for QueryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Return the retrieved passages with the answer. Default: `true`.
    #[serde(default = "default_include_context")]
    pub include_context: bool,
}

fn default_include_context() -> bool {
    true
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: None,
            include_context: true,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_context(mut self, include_context: bool) -> Self {
        self.include_context = include_context;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub chunk_ids: Vec<String>,
    /// Similarity of the best retrieved passage.
    pub similarity_score: Option<f32>,
    /// Retrieved passages, best first; omitted unless requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<ContextPassage>>,
    pub from_cache: bool,
    pub cache: CacheOutcome,
    pub corpus_version: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub version: u64,
    pub chunks: usize,
    pub corpus_version: u64,
    /// The upload matched the stored content; nothing was re-embedded.
    pub unchanged: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub document_id: String,
    pub chunks_removed: usize,
    pub corpus_version: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub documents: usize,
    pub chunks: usize,
    pub corpus_version: u64,
    pub embedding_model: String,
    pub generation_model: String,
    pub max_concurrency: usize,
    pub available_permits: usize,
    pub cache: CacheStats,
    pub metrics: MetricsSnapshot,
}

pub struct Pipeline {
    embedder: Arc<EmbedderClient>,
    generator: Arc<GeneratorClient>,
    index: Arc<VectorIndex>,
    cache: Arc<QueryCache>,
    retriever: Arc<Retriever>,
    metrics: Arc<MetricsCollector>,
    corpus: Arc<CorpusVersion>,
    limiter: Arc<Semaphore>,
    ingest_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    documents: DashMap<String, DocumentRecord>,
    model_id: String,
    params: PipelineParams,
}

impl Pipeline {
    /// Construct every component once; they are shared by reference from
    /// here on.
    pub fn new(
        embedding: Arc<dyn EmbeddingProvider>,
        generation: Arc<dyn GenerationProvider>,
        store: Arc<dyn CacheStore>,
        params: PipelineParams,
    ) -> Self {
        let corpus = Arc::new(CorpusVersion::new());
        let metrics = Arc::new(MetricsCollector::new());
        let embedder = Arc::new(EmbedderClient::new(
            embedding,
            params.embed_batch_size,
            params.embed_retry.clone(),
        ));
        let generator = Arc::new(GeneratorClient::new(
            generation,
            params.generation_timeout,
            params.generation_retry.clone(),
        ));
        let index = Arc::new(VectorIndex::new(embedder.dims(), Arc::clone(&corpus)));
        let cache = Arc::new(QueryCache::new(
            store,
            Arc::clone(&corpus),
            Arc::clone(&metrics),
            params.cache.clone(),
        ));
        let retriever = Arc::new(Retriever::new(
            Arc::clone(&embedder),
            Arc::clone(&index),
            Arc::clone(&metrics),
        ));
        let model_id = format!("{}+{}", embedder.model_name(), generator.model_name());

        Self {
            embedder,
            generator,
            index,
            cache,
            retriever,
            metrics,
            corpus,
            limiter: Arc::new(Semaphore::new(params.max_concurrency.max(1))),
            ingest_locks: DashMap::new(),
            documents: DashMap::new(),
            model_id,
            params,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn corpus_version(&self) -> u64 {
        self.corpus.current()
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    // ============ Ingestion ============

    /// Chunk, embed and index a document, replacing any previous version.
    ///
    /// An upload whose content hash matches the stored version is reported
    /// as `unchanged` without re-embedding or bumping any version.
    pub async fn ingest(&self, document_id: &str, text: &str) -> Result<IngestReport, PipelineError> {
        let started = Instant::now();
        let result = self.ingest_inner(document_id, text, started).await;
        let outcome = if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Error
        };
        self.metrics.record(Stage::Ingest, started.elapsed(), outcome);
        if let Err(e) = &result {
            warn!(document_id, error = %e, "ingestion failed");
        }
        result
    }

    async fn ingest_inner(
        &self,
        document_id: &str,
        text: &str,
        started: Instant,
    ) -> Result<IngestReport, PipelineError> {
        validate_document_id(document_id)?;
        if text.trim().is_empty() {
            return Err(PipelineError::invalid_input("document text must not be empty"));
        }
        if text.len() > self.params.max_document_bytes {
            return Err(PipelineError::invalid_input(format!(
                "document is {} bytes; the limit is {}",
                text.len(),
                self.params.max_document_bytes
            )));
        }

        let lock = self.document_lock(document_id);
        let _guard = lock.lock().await;

        let content_hash = format!("{:x}", Sha256::digest(text.as_bytes()));
        let previous = self.documents.get(document_id).map(|r| r.value().clone());
        if let Some(record) = &previous {
            if record.content_hash == content_hash {
                debug!(document_id, version = record.version, "content unchanged; skipping");
                return Ok(IngestReport {
                    document_id: document_id.to_string(),
                    version: record.version,
                    chunks: record.chunk_count,
                    corpus_version: self.corpus.current(),
                    unchanged: true,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
        }

        let version = previous.map(|r| r.version + 1).unwrap_or(1);
        let document = Document::new(document_id, text, version);
        let chunks = chunk_document(&document, &self.params.chunking)?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();

        let vectors = {
            let _permit = acquire(&self.limiter).await?;
            let embed_started = Instant::now();
            match self.embedder.embed(&texts).await {
                Ok(v) => {
                    self.metrics
                        .record(Stage::Embed, embed_started.elapsed(), Outcome::Success);
                    v
                }
                Err(e) => {
                    self.metrics
                        .record(Stage::Embed, embed_started.elapsed(), Outcome::Error);
                    return Err(e);
                }
            }
        };

        let embedded: Vec<EmbeddedChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| EmbeddedChunk { chunk, vector })
            .collect();
        let count = self.index.replace_document(document_id, embedded)?;
        let corpus_version = self.corpus.current();

        self.documents.insert(
            document_id.to_string(),
            DocumentRecord {
                id: document_id.to_string(),
                version,
                chunk_count: count,
                content_hash,
                ingested_at: Utc::now(),
            },
        );

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(document_id, version, chunks = count, corpus_version, elapsed_ms, "document ingested");
        Ok(IngestReport {
            document_id: document_id.to_string(),
            version,
            chunks: count,
            corpus_version,
            unchanged: false,
            elapsed_ms,
        })
    }

    /// Remove a document and all of its chunks.
    pub async fn delete_document(&self, document_id: &str) -> Result<DeleteReport, PipelineError> {
        let lock = self.document_lock(document_id);
        let report = {
            let _guard = lock.lock().await;
            if self.documents.remove(document_id).is_none() {
                return Err(PipelineError::NotFound(format!("document '{}'", document_id)));
            }
            let chunks_removed = self.index.invalidate(document_id);
            DeleteReport {
                document_id: document_id.to_string(),
                chunks_removed,
                corpus_version: self.corpus.current(),
            }
        };
        drop(lock);
        self.ingest_locks
            .remove_if(document_id, |_, l| Arc::strong_count(l) == 1);

        info!(document_id, chunks_removed = report.chunks_removed, "document deleted");
        Ok(report)
    }

    /// All ingested documents, ordered by id.
    pub fn list_documents(&self) -> Vec<DocumentRecord> {
        let mut records: Vec<DocumentRecord> =
            self.documents.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    fn document_lock(&self, document_id: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.ingest_locks
                .entry(document_id.to_string())
                .or_default()
                .value(),
        )
    }

    // ============ Queries ============

    /// Answer a query, from cache when possible.
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse, PipelineError> {
        let started = Instant::now();
        let span = info_span!("query", top_k = tracing::field::Empty, corpus_version = tracing::field::Empty);
        let result = self.query_inner(request, started).instrument(span).await;

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(PipelineError::GenerationTimeout { .. } | PipelineError::RequestTimeout { .. }) => {
                Outcome::Timeout
            }
            Err(_) => Outcome::Error,
        };
        self.metrics.record(Stage::Query, started.elapsed(), outcome);
        result
    }

    async fn query_inner(&self, request: QueryRequest, started: Instant) -> Result<QueryResponse, PipelineError> {
        let span = tracing::Span::current();
        debug!(phase = %QueryPhase::Received);

        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Err(PipelineError::invalid_input("query must not be empty"));
        }
        let top_k = request.top_k.unwrap_or(self.params.default_top_k);
        let include_context = request.include_context;
        if top_k == 0 || top_k > self.params.max_top_k {
            return Err(PipelineError::invalid_input(format!(
                "top_k must be between 1 and {}",
                self.params.max_top_k
            )));
        }
        if self.index.is_empty() {
            return Err(PipelineError::EmptyIndex);
        }

        let key = self.cache.key_for(&query, top_k, &self.model_id);
        let corpus_version = key.corpus_version;
        span.record("top_k", top_k);
        span.record("corpus_version", corpus_version);
        debug!(phase = %QueryPhase::CacheLookup);

        let compute = self.computation(query, top_k, span.clone());
        let waited = tokio::time::timeout(
            self.params.request_timeout,
            self.cache.get_or_compute(key, compute),
        )
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match waited {
            Ok(Ok(cached)) => {
                let phase = if cached.outcome == CacheOutcome::Hit {
                    QueryPhase::CacheHit
                } else {
                    QueryPhase::CacheMiss
                };
                debug!(phase = %phase, outcome = ?cached.outcome);
                debug!(phase = %QueryPhase::Done, elapsed_ms);
                Ok(QueryResponse {
                    answer: cached.answer,
                    chunk_ids: cached.retrieved_chunk_ids,
                    similarity_score: cached.passages.first().map(|p| p.score),
                    context: include_context.then_some(cached.passages),
                    from_cache: cached.outcome == CacheOutcome::Hit,
                    cache: cached.outcome,
                    corpus_version,
                    elapsed_ms,
                })
            }
            Ok(Err(e)) => {
                debug!(phase = %QueryPhase::Failed, error = %e);
                Err(e)
            }
            Err(_) => {
                warn!(elapsed_ms, "request deadline passed while waiting for an answer");
                debug!(phase = %QueryPhase::Failed, elapsed_ms);
                Err(PipelineError::RequestTimeout { elapsed_ms })
            }
        }
    }

    /// The miss path: retrieve then generate, under a concurrency permit.
    fn computation(
        &self,
        query: String,
        top_k: usize,
        span: tracing::Span,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<Computed, PipelineError>> + Send + 'static {
        let retriever = Arc::clone(&self.retriever);
        let generator = Arc::clone(&self.generator);
        let metrics = Arc::clone(&self.metrics);
        let limiter = Arc::clone(&self.limiter);

        move || -> BoxFuture<'static, Result<Computed, PipelineError>> {
            let work = async move {
                let _permit = acquire(&limiter).await?;

                debug!(phase = %QueryPhase::Embedding);
                let context = retriever.retrieve(&query, top_k).await?;
                debug!(phase = %QueryPhase::Retrieving, passages = context.passages.len());

                debug!(phase = %QueryPhase::Generating);
                let generate_started = Instant::now();
                let answer = match generator.generate(&query, context.texts()).await {
                    Ok(answer) => {
                        metrics.record(Stage::Generate, generate_started.elapsed(), Outcome::Success);
                        answer
                    }
                    Err(e) => {
                        let outcome = match e {
                            PipelineError::GenerationTimeout { .. } => Outcome::Timeout,
                            _ => Outcome::Error,
                        };
                        metrics.record(Stage::Generate, generate_started.elapsed(), outcome);
                        return Err(e);
                    }
                };

                debug!(phase = %QueryPhase::CacheStore);
                Ok(Computed {
                    answer,
                    retrieved_chunk_ids: context.chunk_ids(),
                    passages: context.passages.iter().map(ContextPassage::from).collect(),
                })
            };
            work.instrument(span).boxed()
        }
    }

    /// Answer several queries concurrently. Each query succeeds or fails on
    /// its own; only an invalid batch fails as a whole. Batch answers omit
    /// the context passages.
    pub async fn query_batch(
        &self,
        queries: Vec<String>,
        top_k: Option<usize>,
    ) -> Result<Vec<Result<QueryResponse, PipelineError>>, PipelineError> {
        if queries.is_empty() || queries.len() > self.params.max_batch_queries {
            return Err(PipelineError::invalid_input(format!(
                "a batch holds between 1 and {} queries",
                self.params.max_batch_queries
            )));
        }

        let requests = queries.into_iter().map(|query| self.query(QueryRequest {
            query,
            top_k,
            include_context: false,
        }));
        Ok(futures::future::join_all(requests).await)
    }

    pub async fn stats(&self) -> PipelineStats {
        PipelineStats {
            documents: self.documents.len(),
            chunks: self.index.len(),
            corpus_version: self.corpus.current(),
            embedding_model: self.embedder.model_name().to_string(),
            generation_model: self.generator.model_name().to_string(),
            max_concurrency: self.params.max_concurrency.max(1),
            available_permits: self.limiter.available_permits(),
            cache: self.cache.stats().await,
            metrics: self.metrics.snapshot(),
        }
    }
}

async fn acquire(limiter: &Arc<Semaphore>) -> Result<OwnedSemaphorePermit, PipelineError> {
    Arc::clone(limiter)
        .acquire_owned()
        .await
        .map_err(|_| PipelineError::Internal("concurrency limiter closed".to_string()))
}

fn validate_document_id(id: &str) -> Result<(), PipelineError> {
    if id.trim().is_empty() {
        return Err(PipelineError::invalid_input("document id must not be empty"));
    }
    if id.len() > MAX_DOCUMENT_ID_LEN {
        return Err(PipelineError::invalid_input(format!(
            "document id exceeds {} bytes",
            MAX_DOCUMENT_ID_LEN
        )));
    }
    if id.contains('/') || id.chars().any(char::is_control) {
        return Err(PipelineError::invalid_input(
            "document id must not contain '/' or control characters",
        ));
    }
    Ok(())
}
