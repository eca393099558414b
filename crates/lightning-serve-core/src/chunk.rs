//! Boundary-aware text chunker.
//!
//! Splits a [`Document`]'s raw text into [`Chunk`]s of at most `max_tokens`
//! (converted to characters at 4 chars/token), with an optional overlap
//! between consecutive chunks. Every chunk records the byte range it was cut
//! from, so `&raw_text[chunk.offsets]` trimmed is exactly `chunk.text`.
//!
//! # Algorithm
//!
//! 1. Skip leading whitespace.
//! 2. If the rest fits in `max_chars`, it is the last chunk.
//! 3. Otherwise look for a break inside the window, preferring a paragraph
//!    break (`\n\n`), then a newline, then any whitespace. Breaks in the
//!    first half of the window are ignored to avoid slivers. With no break,
//!    hard-split at the nearest char boundary.
//! 4. Trim the piece and emit it unless empty.
//! 5. Step back by up to `overlap_chars` (snapped forward to a word start)
//!    and repeat.
//!
//! Chunk ids are derived from the document id, version and index, so
//! chunking is fully deterministic.
//!
//! # Example
//!
//! ```rust
//! use lightning_serve_core::chunk::{chunk_document, ChunkParams};
//! use lightning_serve_core::models::Document;
//!
//! let doc = Document::new("doc1", "Hello world.\n\nSecond paragraph.", 1);
//! let chunks = chunk_document(&doc, &ChunkParams::default()).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].id, "doc1:v1:0");
//! ```

use crate::error::PipelineError;
use crate::models::{Chunk, Document};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Chunking parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct ChunkParams {
    /// Maximum tokens per chunk.
    pub max_tokens: usize,
    /// Tokens shared between consecutive chunks. Capped at a quarter of
    /// `max_tokens` so every step makes progress.
    pub overlap_tokens: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            overlap_tokens: 32,
        }
    }
}

/// Split a document into chunks.
///
/// # Errors
///
/// [`PipelineError::InvalidInput`] when the text is empty or whitespace only.
///
/// # Guarantees
///
/// - No chunk is empty.
/// - Indices are contiguous from 0.
/// - Identical text and parameters produce identical chunks.
pub fn chunk_document(doc: &Document, params: &ChunkParams) -> Result<Vec<Chunk>, PipelineError> {
    let text = doc.raw_text.as_str();
    if text.trim().is_empty() {
        return Err(PipelineError::invalid_input(format!(
            "document '{}' has no text",
            doc.id
        )));
    }

    let max_chars = (params.max_tokens * CHARS_PER_TOKEN).max(1);
    let overlap_chars = (params.overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 4);

    let mut chunks = Vec::new();
    let mut start = skip_whitespace(text, 0);

    while start < text.len() {
        let end = if text.len() - start <= max_chars {
            text.len()
        } else {
            find_break(text, start, max_chars)
        };

        let (s, e) = trim_range(text, start, end);
        if s < e {
            chunks.push(make_chunk(doc, chunks.len(), text, s, e));
        }

        if end >= text.len() {
            break;
        }
        start = skip_whitespace(text, next_start(text, start, end, overlap_chars));
    }

    Ok(chunks)
}

/// Pick the end of a chunk starting at `start` when the remainder is longer
/// than `max_chars`. Always returns a position greater than `start`.
fn find_break(text: &str, start: usize, max_chars: usize) -> usize {
    let limit = snap_to_char_boundary(text, start + max_chars);
    let limit = if limit <= start {
        next_char_boundary(text, start)
    } else {
        limit
    };
    let window = &text[start..limit];
    let min_break = window.len() / 2;

    if let Some(pos) = window.rfind("\n\n").filter(|&p| p >= min_break) {
        return start + pos + 2;
    }
    if let Some(pos) = window.rfind('\n').filter(|&p| p >= min_break) {
        return start + pos + 1;
    }
    if let Some((pos, c)) = window
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .filter(|(p, _)| *p >= min_break)
    {
        return start + pos + c.len_utf8();
    }
    limit
}

/// Where the next chunk starts, stepping back into the previous one by up to
/// `overlap_chars`. Falls back to `end` when overlap would stall progress.
fn next_start(text: &str, start: usize, end: usize, overlap_chars: usize) -> usize {
    if overlap_chars == 0 {
        return end;
    }
    let candidate = snap_to_char_boundary(text, end.saturating_sub(overlap_chars));
    if candidate <= start {
        return end;
    }

    let mid_word = text[..candidate]
        .chars()
        .next_back()
        .is_some_and(|c| !c.is_whitespace());
    if !mid_word {
        return candidate;
    }
    text[candidate..end]
        .char_indices()
        .find(|(_, c)| c.is_whitespace())
        .map(|(pos, c)| candidate + pos + c.len_utf8())
        .unwrap_or(end)
}

fn skip_whitespace(text: &str, from: usize) -> usize {
    let rest = &text[from..];
    from + (rest.len() - rest.trim_start().len())
}

fn trim_range(text: &str, start: usize, end: usize) -> (usize, usize) {
    let slice = &text[start..end];
    let lead = slice.len() - slice.trim_start().len();
    let trimmed = slice.trim();
    (start + lead, start + lead + trimmed.len())
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .chars()
        .next()
        .map(|c| index + c.len_utf8())
        .unwrap_or(s.len())
}

fn make_chunk(doc: &Document, index: usize, text: &str, start: usize, end: usize) -> Chunk {
    Chunk {
        id: format!("{}:v{}:{}", doc.id, doc.version, index),
        document_id: doc.id.clone(),
        chunk_index: index,
        text: text[start..end].to_string(),
        offsets: start..end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(max_tokens: usize, overlap_tokens: usize) -> ChunkParams {
        ChunkParams {
            max_tokens,
            overlap_tokens,
        }
    }

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_small_text_single_chunk() {
        let doc = Document::new("doc1", "Lightning is a fast weather phenomenon.", 1);
        let chunks = chunk_document(&doc, &params(700, 0)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Lightning is a fast weather phenomenon.");
        assert_eq!(chunks[0].document_id, "doc1");
        assert_eq!(chunks[0].id, "doc1:v1:0");
    }

    #[test]
    fn test_empty_text_rejected() {
        let doc = Document::new("doc1", "", 1);
        let err = chunk_document(&doc, &params(700, 0)).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));

        let blank = Document::new("doc1", "  \n\n\t ", 1);
        assert!(chunk_document(&blank, &params(700, 0)).is_err());
    }

    #[test]
    fn test_offsets_point_into_raw_text() {
        let text = "  First paragraph here.\n\nSecond paragraph is a little longer.\n\nThird.  ";
        let doc = Document::new("d", text, 3);
        let chunks = chunk_document(&doc, &params(5, 0)).unwrap();
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert_eq!(&text[c.offsets.clone()], c.text);
            assert_eq!(c.text, c.text.trim());
        }
    }

    #[test]
    fn test_never_empty_and_contiguous_indices() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n\n");
        let doc = Document::new("doc1", text, 1);
        let chunks = chunk_document(&doc, &params(10, 2)).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
            assert!(!c.text.trim().is_empty());
            assert!(c.text.chars().count() <= 40);
        }
    }

    #[test]
    fn test_prefers_paragraph_boundaries() {
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let doc = Document::new("doc1", text, 1);
        let chunks = chunk_document(&doc, &params(12, 0)).unwrap();
        assert_eq!(chunks[0].text, "This is paragraph one.\n\nThis is paragraph two.");
        assert_eq!(chunks[1].text, "This is paragraph three.");
    }

    #[test]
    fn test_overlap_shares_text() {
        let doc = Document::new("doc1", words(200), 1);
        let chunks = chunk_document(&doc, &params(10, 2)).unwrap();
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            assert!(pair[1].offsets.start < pair[0].offsets.end);
            assert!(pair[1].offsets.start > pair[0].offsets.start);
        }
        let last = chunks.last().unwrap();
        assert!(last.text.ends_with("w199"));
    }

    #[test]
    fn test_no_overlap_is_disjoint() {
        let doc = Document::new("doc1", words(200), 1);
        let chunks = chunk_document(&doc, &params(10, 0)).unwrap();
        for pair in chunks.windows(2) {
            assert!(pair[1].offsets.start >= pair[0].offsets.end);
        }
    }

    #[test]
    fn test_hard_split_without_whitespace() {
        let doc = Document::new("doc1", "x".repeat(100), 1);
        let chunks = chunk_document(&doc, &params(5, 0)).unwrap();
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.text.len() == 20));
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let doc = Document::new("doc1", text, 1);
        let chunks = chunk_document(&doc, &params(3, 1)).unwrap();
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(!c.text.is_empty());
            assert_eq!(&text[c.offsets.clone()], c.text);
        }
    }

    #[test]
    fn test_deterministic() {
        let doc = Document::new("doc1", "Alpha\n\nBeta\n\nGamma\n\nDelta", 2);
        let c1 = chunk_document(&doc, &params(2, 1)).unwrap();
        let c2 = chunk_document(&doc, &params(2, 1)).unwrap();
        assert_eq!(c1, c2);
    }
}
