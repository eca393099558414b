//! Core data models shared by the ingestion and query paths.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A document as uploaded, pinned to the version it was ingested under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub raw_text: String,
    pub version: u64,
}

impl Document {
    pub fn new(id: impl Into<String>, raw_text: impl Into<String>, version: u64) -> Self {
        Self {
            id: id.into(),
            raw_text: raw_text.into(),
            version,
        }
    }
}

/// A retrieval unit cut from a document's raw text.
///
/// `offsets` is a byte range into [`Document::raw_text`]; the chunk text is
/// that slice with surrounding whitespace trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub offsets: Range<usize>,
}

/// A chunk paired with its embedding, as stored in the vector index.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// A search hit: the chunk and its cosine similarity to the query vector.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Registry entry for an ingested document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub id: String,
    pub version: u64,
    pub chunk_count: usize,
    /// SHA-256 of the raw text; identical re-uploads are skipped.
    pub content_hash: String,
    pub ingested_at: DateTime<Utc>,
}

/// A retrieved passage as returned to clients alongside an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPassage {
    pub chunk_id: String,
    pub text: String,
    pub score: f32,
}

impl From<&ScoredChunk> for ContextPassage {
    fn from(scored: &ScoredChunk) -> Self {
        Self {
            chunk_id: scored.chunk.id.clone(),
            text: scored.chunk.text.clone(),
            score: scored.score,
        }
    }
}

/// Global corpus version counter.
///
/// Bumped after every visible document mutation. Cached answers remember the
/// version they were computed against and are discarded on read once it
/// moves on.
///
/// The counter restarts at zero in every process, so it only orders states
/// of *this* in-memory corpus. The random `epoch` names which corpus the
/// counter belongs to; a store shared between processes holds entries from
/// several epochs and only the local one is ever served.
#[derive(Debug)]
pub struct CorpusVersion {
    epoch: String,
    version: AtomicU64,
}

impl CorpusVersion {
    pub fn new() -> Self {
        Self::with_epoch(Uuid::new_v4().to_string())
    }

    pub fn with_epoch(epoch: impl Into<String>) -> Self {
        Self {
            epoch: epoch.into(),
            version: AtomicU64::new(0),
        }
    }

    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    pub fn current(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Increment the counter, returning the new version.
    pub fn bump(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Default for CorpusVersion {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corpus_version_is_monotonic() {
        let v = CorpusVersion::new();
        assert_eq!(v.current(), 0);
        assert_eq!(v.bump(), 1);
        assert_eq!(v.bump(), 2);
        assert_eq!(v.current(), 2);
    }

    #[test]
    fn test_corpus_epoch_differs_per_instance() {
        let a = CorpusVersion::new();
        let b = CorpusVersion::new();
        assert_ne!(a.epoch(), b.epoch());
        assert_eq!(CorpusVersion::with_epoch("fixed").epoch(), "fixed");
    }
}
