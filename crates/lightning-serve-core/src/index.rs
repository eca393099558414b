//! In-memory vector index.
//!
//! Chunks are stored per document: a [`DashMap`] from document id to an
//! `Arc<Vec<IndexedChunk>>`. Writers build or copy-on-write a document's
//! list and swap the `Arc` while holding only that document's shard lock;
//! searches clone the `Arc`s (a brief shard read lock each) and score
//! without holding any lock. Ingesting one document therefore never stalls
//! queries for longer than the pointer swap.
//!
//! Search is brute-force cosine similarity. Results are ordered by score
//! descending, then by insertion order, so equal scores are stable.
//!
//! Every visible mutation bumps the shared [`CorpusVersion`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::embedding::cosine_similarity;
use crate::error::PipelineError;
use crate::models::{Chunk, CorpusVersion, EmbeddedChunk, ScoredChunk};

#[derive(Debug, Clone)]
struct IndexedChunk {
    chunk: Chunk,
    vector: Vec<f32>,
    /// Global insertion sequence, used to break score ties.
    seq: u64,
}

pub struct VectorIndex {
    dims: usize,
    documents: DashMap<String, Arc<Vec<IndexedChunk>>>,
    chunk_count: AtomicUsize,
    next_seq: AtomicU64,
    corpus: Arc<CorpusVersion>,
}

impl VectorIndex {
    /// Create an empty index for vectors of dimension `dims`.
    pub fn new(dims: usize, corpus: Arc<CorpusVersion>) -> Self {
        Self {
            dims,
            documents: DashMap::new(),
            chunk_count: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            corpus,
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Total number of indexed chunks.
    pub fn len(&self) -> usize {
        self.chunk_count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn corpus_version(&self) -> u64 {
        self.corpus.current()
    }

    /// Insert one chunk with its vector.
    ///
    /// # Errors
    ///
    /// [`PipelineError::InvalidInput`] on a dimension mismatch or when a
    /// chunk with the same id is already indexed for that document.
    pub fn insert(&self, chunk: Chunk, vector: Vec<f32>) -> Result<(), PipelineError> {
        self.check_dims(&vector)?;
        {
            let mut entry = self.documents.entry(chunk.document_id.clone()).or_default();
            if entry.iter().any(|c| c.chunk.id == chunk.id) {
                return Err(PipelineError::invalid_input(format!(
                    "chunk '{}' is already indexed",
                    chunk.id
                )));
            }
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            Arc::make_mut(&mut *entry).push(IndexedChunk { chunk, vector, seq });
            self.chunk_count.fetch_add(1, Ordering::AcqRel);
        }
        self.corpus.bump();
        Ok(())
    }

    /// Atomically replace every chunk of `document_id` with `chunks`.
    ///
    /// Readers see either the old set or the new set, never a mix. An empty
    /// `chunks` removes the document. Returns the number of chunks indexed.
    pub fn replace_document(
        &self,
        document_id: &str,
        chunks: Vec<EmbeddedChunk>,
    ) -> Result<usize, PipelineError> {
        let mut seen = HashSet::with_capacity(chunks.len());
        for c in &chunks {
            self.check_dims(&c.vector)?;
            if c.chunk.document_id != document_id {
                return Err(PipelineError::invalid_input(format!(
                    "chunk '{}' belongs to '{}', not '{}'",
                    c.chunk.id, c.chunk.document_id, document_id
                )));
            }
            if !seen.insert(c.chunk.id.as_str()) {
                return Err(PipelineError::invalid_input(format!(
                    "duplicate chunk id '{}'",
                    c.chunk.id
                )));
            }
        }

        if chunks.is_empty() {
            self.invalidate(document_id);
            return Ok(0);
        }

        let indexed: Vec<IndexedChunk> = chunks
            .into_iter()
            .map(|c| IndexedChunk {
                chunk: c.chunk,
                vector: c.vector,
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            })
            .collect();
        let added = indexed.len();

        let previous = self
            .documents
            .insert(document_id.to_string(), Arc::new(indexed));
        let removed = previous.map(|p| p.len()).unwrap_or(0);
        self.chunk_count.fetch_add(added, Ordering::AcqRel);
        self.chunk_count.fetch_sub(removed, Ordering::AcqRel);

        let version = self.corpus.bump();
        debug!(document_id, added, removed, version, "replaced document chunks");
        Ok(added)
    }

    /// Remove all chunks of a document. Returns how many were removed.
    pub fn invalidate(&self, document_id: &str) -> usize {
        match self.documents.remove(document_id) {
            Some((_, chunks)) => {
                self.chunk_count.fetch_sub(chunks.len(), Ordering::AcqRel);
                let version = self.corpus.bump();
                debug!(document_id, removed = chunks.len(), version, "invalidated document");
                chunks.len()
            }
            None => 0,
        }
    }

    /// Chunk ids currently indexed for a document, in chunk order.
    pub fn chunk_ids(&self, document_id: &str) -> Vec<String> {
        self.documents
            .get(document_id)
            .map(|chunks| chunks.iter().map(|c| c.chunk.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Return the `top_k` chunks most similar to `query`.
    ///
    /// `top_k` is clamped to the number of chunks. A query vector of the
    /// wrong dimension scores `0.0` against everything.
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<ScoredChunk> {
        if top_k == 0 || self.is_empty() {
            return Vec::new();
        }

        let snapshot: Vec<Arc<Vec<IndexedChunk>>> =
            self.documents.iter().map(|e| Arc::clone(e.value())).collect();

        let mut scored: Vec<(f32, &IndexedChunk)> = snapshot
            .iter()
            .flat_map(|chunks| chunks.iter())
            .map(|c| (cosine_similarity(query, &c.vector), c))
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.seq.cmp(&b.1.seq)));

        let mut seen = HashSet::new();
        scored
            .into_iter()
            .filter(|(_, c)| seen.insert(c.chunk.id.as_str()))
            .take(top_k)
            .map(|(score, c)| ScoredChunk {
                chunk: c.chunk.clone(),
                score,
            })
            .collect()
    }

    fn check_dims(&self, vector: &[f32]) -> Result<(), PipelineError> {
        if vector.len() != self.dims {
            return Err(PipelineError::invalid_input(format!(
                "vector has dimension {}, index expects {}",
                vector.len(),
                self.dims
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc: &str, idx: usize) -> Chunk {
        Chunk {
            id: format!("{}:v1:{}", doc, idx),
            document_id: doc.to_string(),
            chunk_index: idx,
            text: format!("{} chunk {}", doc, idx),
            offsets: 0..1,
        }
    }

    fn embedded(doc: &str, idx: usize, vector: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: chunk(doc, idx),
            vector,
        }
    }

    fn index() -> VectorIndex {
        VectorIndex::new(2, Arc::new(CorpusVersion::new()))
    }

    #[test]
    fn test_search_sorted_descending() {
        let idx = index();
        idx.insert(chunk("a", 0), vec![0.0, 1.0]).unwrap();
        idx.insert(chunk("a", 1), vec![1.0, 0.0]).unwrap();
        idx.insert(chunk("b", 0), vec![1.0, 1.0]).unwrap();

        let hits = idx.search(&[1.0, 0.1], 3);
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a:v1:1", "b:v1:0", "a:v1:0"]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_ties_follow_insertion_order() {
        let idx = index();
        idx.insert(chunk("z", 0), vec![1.0, 0.0]).unwrap();
        idx.insert(chunk("a", 0), vec![2.0, 0.0]).unwrap();
        idx.insert(chunk("m", 0), vec![3.0, 0.0]).unwrap();

        let hits = idx.search(&[1.0, 0.0], 3);
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["z:v1:0", "a:v1:0", "m:v1:0"]);
    }

    #[test]
    fn test_top_k_clamped_and_zero() {
        let idx = index();
        idx.insert(chunk("a", 0), vec![1.0, 0.0]).unwrap();
        idx.insert(chunk("a", 1), vec![0.0, 1.0]).unwrap();

        assert_eq!(idx.search(&[1.0, 0.0], 50).len(), 2);
        assert!(idx.search(&[1.0, 0.0], 0).is_empty());
    }

    #[test]
    fn test_empty_index_search() {
        assert!(index().search(&[1.0, 0.0], 5).is_empty());
    }

    #[test]
    fn test_no_duplicate_ids() {
        let idx = index();
        idx.insert(chunk("a", 0), vec![1.0, 0.0]).unwrap();
        let err = idx.insert(chunk("a", 0), vec![1.0, 0.0]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));

        let hits = idx.search(&[1.0, 0.0], 10);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let idx = index();
        assert!(idx.insert(chunk("a", 0), vec![1.0, 0.0, 0.0]).is_err());
        assert!(idx.is_empty());
    }

    #[test]
    fn test_invalidate_removes_document_and_bumps_version() {
        let idx = index();
        idx.insert(chunk("a", 0), vec![1.0, 0.0]).unwrap();
        idx.insert(chunk("b", 0), vec![0.0, 1.0]).unwrap();
        let before = idx.corpus_version();

        assert_eq!(idx.invalidate("a"), 1);
        assert_eq!(idx.len(), 1);
        assert!(idx.corpus_version() > before);
        assert!(idx
            .search(&[1.0, 0.0], 10)
            .iter()
            .all(|h| h.chunk.document_id == "b"));

        let unchanged = idx.corpus_version();
        assert_eq!(idx.invalidate("missing"), 0);
        assert_eq!(idx.corpus_version(), unchanged);
    }

    #[test]
    fn test_replace_document_swaps_chunks() {
        let idx = index();
        idx.replace_document(
            "a",
            vec![embedded("a", 0, vec![1.0, 0.0]), embedded("a", 1, vec![0.0, 1.0])],
        )
        .unwrap();
        assert_eq!(idx.len(), 2);

        let v = idx.corpus_version();
        let mut replacement = embedded("a", 0, vec![1.0, 1.0]);
        replacement.chunk.id = "a:v2:0".to_string();
        assert_eq!(idx.replace_document("a", vec![replacement]).unwrap(), 1);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.chunk_ids("a"), vec!["a:v2:0".to_string()]);
        assert_eq!(idx.corpus_version(), v + 1);

        assert_eq!(idx.replace_document("a", Vec::new()).unwrap(), 0);
        assert!(idx.is_empty());
        assert_eq!(idx.document_count(), 0);
    }

    #[test]
    fn test_replace_rejects_foreign_chunk() {
        let idx = index();
        let err = idx
            .replace_document("a", vec![embedded("b", 0, vec![1.0, 0.0])])
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        assert!(idx.is_empty());
    }

    #[test]
    fn test_reproducible_nearest_neighbour() {
        let idx = index();
        for i in 0..10 {
            let angle = i as f32 * 0.3;
            idx.insert(chunk("d", i), vec![angle.cos(), angle.sin()]).unwrap();
        }
        let q = [0.9f32.cos(), 0.9f32.sin()];
        let first = idx.search(&q, 3);
        let second = idx.search(&q, 3);
        let ids = |hits: &[ScoredChunk]| hits.iter().map(|h| h.chunk.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(first[0].chunk.id, "d:v1:3");
    }

    #[test]
    fn test_reads_concurrent_with_writes() {
        let idx = Arc::new(index());
        idx.insert(chunk("stable", 0), vec![1.0, 0.0]).unwrap();

        let writer = {
            let idx = Arc::clone(&idx);
            std::thread::spawn(move || {
                for round in 0..200 {
                    let mut c = embedded("churn", 0, vec![0.0, 1.0]);
                    c.chunk.id = format!("churn:v{}:0", round);
                    idx.replace_document("churn", vec![c]).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let idx = Arc::clone(&idx);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let hits = idx.search(&[1.0, 0.0], 5);
                        assert_eq!(hits[0].chunk.id, "stable:v1:0");
                        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(idx.len(), 2);
    }
}
