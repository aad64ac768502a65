//! Splits raw text into bounded-size chunks suitable for embedding.
//!
//! Chunks are fixed character windows with a configurable overlap between
//! consecutive windows. The stride is `max_chunk_size - overlap`, so
//! concatenating chunk texts minus the overlaps reconstructs the original
//! input losslessly. Windows are computed over `char` boundaries, never raw
//! bytes, so multi-byte input cannot split a code point.

use crate::types::LoreError;

/// One chunk of a document's text, pre-embedding.
///
/// Ordinals are zero-based and contiguous in original text order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub ordinal: usize,
}

/// Splits `text` into overlapping character windows.
///
/// Empty or whitespace-only input yields an empty sequence, not an error.
/// Pure function with no side effects.
///
/// # Errors
///
/// Returns [`LoreError::Validation`] unless `max_chunk_size > overlap`.
pub fn chunk(text: &str, max_chunk_size: usize, overlap: usize) -> Result<Vec<TextChunk>, LoreError> {
    if max_chunk_size == 0 {
        return Err(LoreError::Validation(
            "max_chunk_size must be greater than zero".into(),
        ));
    }
    if overlap >= max_chunk_size {
        return Err(LoreError::Validation(format!(
            "overlap ({overlap}) must be smaller than max_chunk_size ({max_chunk_size})"
        )));
    }
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let chars: Vec<char> = text.chars().collect();
    let stride = max_chunk_size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut ordinal = 0usize;

    while start < chars.len() {
        let end = (start + max_chunk_size).min(chars.len());
        chunks.push(TextChunk {
            text: chars[start..end].iter().collect(),
            ordinal,
        });
        if end == chars.len() {
            break;
        }
        start += stride;
        ordinal += 1;
    }

    Ok(chunks)
}
