//! Document chunking strategies.
//!
//! This module provides the [`Chunker`] trait and two implementations:
//!
//! - [`FixedSizeChunker`] — splits by character count with configurable overlap
//! - [`RecursiveChunker`] — splits hierarchically by paragraphs, lines, sentences, then words
//!
//! Both produce chunks that are exact substrings of the document, addressed by
//! their byte `start_offset`. Consecutive chunks may overlap but never leave a
//! gap, so the chunks always cover the whole document.

use std::iter;

use serde::{Deserialize, Serialize};

use crate::document::{Chunk, Document};
use crate::error::{RagError, Result};

/// A strategy for splitting documents into chunks.
///
/// Implementations produce [`Chunk`]s with text and offsets but no embeddings.
/// Embeddings are attached later by the index.
pub trait Chunker: Send + Sync {
    /// Split a document into chunks.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::EmptyDocument`] if the document has no
    /// non-whitespace text.
    fn chunk(&self, document: &Document) -> Result<Vec<Chunk>>;
}

/// Selects a [`Chunker`] implementation from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    /// Fixed character windows, see [`FixedSizeChunker`].
    FixedSize,
    /// Separator-aware windows, see [`RecursiveChunker`].
    #[default]
    Recursive,
}

impl ChunkingStrategy {
    /// Build the chunker for this strategy.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidConfiguration`] if `chunk_size == 0` or
    /// `chunk_overlap >= chunk_size`.
    pub fn chunker(self, chunk_size: usize, chunk_overlap: usize) -> Result<Box<dyn Chunker>> {
        Ok(match self {
            ChunkingStrategy::FixedSize => {
                Box::new(FixedSizeChunker::new(chunk_size, chunk_overlap)?)
            }
            ChunkingStrategy::Recursive => {
                Box::new(RecursiveChunker::new(chunk_size, chunk_overlap)?)
            }
        })
    }
}

/// Split a document into fixed-size overlapping chunks.
///
/// Shorthand for `FixedSizeChunker::new(chunk_size, overlap)?.chunk(document)`.
pub fn chunk_document(document: &Document, chunk_size: usize, overlap: usize) -> Result<Vec<Chunk>> {
    FixedSizeChunker::new(chunk_size, overlap)?.chunk(document)
}

fn validate_window(chunk_size: usize, chunk_overlap: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(RagError::InvalidConfiguration(
            "chunk_size must be greater than zero".to_string(),
        ));
    }
    if chunk_overlap >= chunk_size {
        return Err(RagError::InvalidConfiguration(format!(
            "chunk_overlap ({chunk_overlap}) must be less than chunk_size ({chunk_size})"
        )));
    }
    Ok(())
}

fn ensure_not_empty(document: &Document) -> Result<()> {
    if document.text.trim().is_empty() {
        return Err(RagError::EmptyDocument { document_id: document.id.clone() });
    }
    Ok(())
}

/// Turn byte spans of `document.text` into chunks, numbered in order.
fn spans_to_chunks(document: &Document, spans: Vec<(usize, usize)>) -> Vec<Chunk> {
    spans
        .into_iter()
        .enumerate()
        .map(|(i, (start, end))| Chunk {
            id: format!("{}_{i}", document.id),
            text: document.text[start..end].to_string(),
            document_id: document.id.clone(),
            start_offset: start,
            sequence_index: i,
            metadata: document.metadata.clone(),
            embedding: Vec::new(),
        })
        .collect()
}

/// Splits text into fixed-size chunks by character count with configurable overlap.
///
/// Consecutive chunks share exactly `chunk_overlap` characters, and
/// splitting stops as soon as a chunk reaches the end of the text, so the
/// chunks reconstruct the document with no gaps. Chunk IDs are generated as
/// `{document_id}_{sequence_index}`.
///
/// # Example
///
/// ```rust,ignore
/// use docchat_rag::FixedSizeChunker;
///
/// let chunker = FixedSizeChunker::new(500, 50)?;
/// let chunks = chunker.chunk(&document)?;
/// ```
#[derive(Debug, Clone)]
pub struct FixedSizeChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl FixedSizeChunker {
    /// Create a new `FixedSizeChunker`.
    ///
    /// # Arguments
    ///
    /// * `chunk_size` — maximum number of characters per chunk
    /// * `chunk_overlap` — number of overlapping characters between consecutive chunks
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidConfiguration`] if `chunk_size == 0` or
    /// `chunk_overlap >= chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        validate_window(chunk_size, chunk_overlap)?;
        Ok(Self { chunk_size, chunk_overlap })
    }
}

impl Chunker for FixedSizeChunker {
    fn chunk(&self, document: &Document) -> Result<Vec<Chunk>> {
        ensure_not_empty(document)?;

        let text = &document.text;
        // Byte offset of every char start, plus the end of the text.
        let boundaries: Vec<usize> =
            text.char_indices().map(|(i, _)| i).chain(iter::once(text.len())).collect();
        let char_count = boundaries.len() - 1;
        let step = self.chunk_size - self.chunk_overlap;

        let mut spans = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + self.chunk_size).min(char_count);
            spans.push((boundaries[start], boundaries[end]));
            if end == char_count {
                break;
            }
            start += step;
        }

        Ok(spans_to_chunks(document, spans))
    }
}

/// Separator levels tried in order; a span that is still too long after
/// splitting at one level is split again at the next.
const SEPARATOR_LEVELS: &[&[&str]] = &[&["\n\n"], &["\n"], &[". ", "! ", "? "], &[" "]];

/// Splits text hierarchically: paragraphs → lines → sentences → words → characters.
///
/// Separator whitespace stays at the end of the piece it follows, so pieces
/// tile the text. Pieces are merged greedily while the chunk, ignoring edge
/// whitespace, holds at most `chunk_size` characters. Trailing pieces
/// totalling at most `chunk_overlap` such characters are repeated at the start
/// of the next chunk; otherwise the next chunk starts where this one ends.
///
/// # Example
///
/// ```rust,ignore
/// use docchat_rag::RecursiveChunker;
///
/// let chunker = RecursiveChunker::new(500, 100)?;
/// let chunks = chunker.chunk(&document)?;
/// ```
#[derive(Debug, Clone)]
pub struct RecursiveChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl RecursiveChunker {
    /// Create a new `RecursiveChunker`.
    ///
    /// # Arguments
    ///
    /// * `chunk_size` — maximum number of characters per chunk
    /// * `chunk_overlap` — maximum number of characters carried into the next chunk
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidConfiguration`] if `chunk_size == 0` or
    /// `chunk_overlap >= chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        validate_window(chunk_size, chunk_overlap)?;
        Ok(Self { chunk_size, chunk_overlap })
    }

    /// Split `span` into pieces whose trimmed length fits in `chunk_size`.
    /// The returned pieces tile `span` exactly.
    fn split_span(&self, text: &str, span: (usize, usize), level: usize) -> Vec<(usize, usize)> {
        if trimmed_len(text, span) <= self.chunk_size {
            return vec![span];
        }
        let Some(separators) = SEPARATOR_LEVELS.get(level) else {
            return split_chars(text, span);
        };

        let pieces = split_at_separators(text, span, separators);
        if pieces.len() == 1 {
            return self.split_span(text, span, level + 1);
        }
        pieces.into_iter().flat_map(|piece| self.split_span(text, piece, level + 1)).collect()
    }

    /// Greedily merge contiguous pieces into chunk spans.
    fn merge_pieces(&self, text: &str, pieces: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut window: Vec<(usize, usize)> = Vec::new();

        for piece in pieces {
            if let Some(&first) = window.first() {
                if trimmed_len(text, (first.0, piece.1)) > self.chunk_size {
                    let last = window[window.len() - 1];
                    spans.push((first.0, last.1));

                    // Keep a tail no longer than the overlap that still leaves
                    // room for the incoming piece.
                    while let Some(&head) = window.first() {
                        let tail_len = trimmed_len(text, (head.0, last.1));
                        let with_piece = trimmed_len(text, (head.0, piece.1));
                        if tail_len > self.chunk_overlap || with_piece > self.chunk_size {
                            window.remove(0);
                        } else {
                            break;
                        }
                    }
                }
            }
            window.push(piece);
        }

        if let (Some(first), Some(last)) = (window.first(), window.last()) {
            spans.push((first.0, last.1));
        }
        spans
    }
}

impl Chunker for RecursiveChunker {
    fn chunk(&self, document: &Document) -> Result<Vec<Chunk>> {
        ensure_not_empty(document)?;

        let text = &document.text;
        let pieces = self.split_span(text, (0, text.len()), 0);
        let spans = self.merge_pieces(text, pieces);

        Ok(spans_to_chunks(document, spans))
    }
}

/// Characters in `span`, not counting leading and trailing whitespace.
fn trimmed_len(text: &str, (start, end): (usize, usize)) -> usize {
    text[start..end].trim().chars().count()
}

/// Cut a span after each separator occurrence, so sentence punctuation and
/// the whitespace after it stay with the preceding piece.
fn split_at_separators(text: &str, (start, end): (usize, usize), separators: &[&str]) -> Vec<(usize, usize)> {
    let slice = &text[start..end];
    let mut cuts: Vec<usize> = separators
        .iter()
        .flat_map(|sep| slice.match_indices(sep).map(move |(pos, _)| start + pos + sep.len()))
        .filter(|cut| *cut > start && *cut < end)
        .collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut pieces = Vec::with_capacity(cuts.len() + 1);
    let mut from = start;
    for cut in cuts {
        pieces.push((from, cut));
        from = cut;
    }
    pieces.push((from, end));
    pieces
}

fn split_chars(text: &str, (start, end): (usize, usize)) -> Vec<(usize, usize)> {
    text[start..end].char_indices().map(|(i, c)| (start + i, start + i + c.len_utf8())).collect()
}
