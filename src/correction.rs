//! Human-in-the-loop answer correction.
//!
//! A correction does not append new knowledge; it rewrites the indexed
//! chunk the flawed answer came from. The chunk keeps its id, ordinal, and
//! document linkage, so every later retrieval that would have surfaced the
//! old text surfaces the corrected text instead.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embeddings::EmbeddingProvider;
use crate::index::VectorIndex;
use crate::types::{LoreError, Provenance};

/// A caller-submitted correction for one retrieved chunk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Correction {
    /// Provenance of the answer being corrected, as handed out by the ask
    /// path. The first entry names the chunk that is rewritten.
    pub provenance: Provenance,
    /// Replacement text for the chunk.
    pub corrected_text: String,
}

/// Result of a successfully applied correction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorrectionOutcome {
    pub chunk_id: String,
    pub document_id: String,
    pub message: String,
}

/// Applies corrections: re-embed the replacement text, then overwrite the
/// target chunk in place.
pub struct CorrectionService {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
}

impl CorrectionService {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, index: Arc<dyn VectorIndex>) -> Self {
        Self { embedder, index }
    }

    /// Rewrites the chunk named by the correction's provenance.
    ///
    /// The index is only touched after the replacement embedding exists, so
    /// a failed embedding leaves the chunk untouched. The total chunk count
    /// never changes.
    ///
    /// # Errors
    ///
    /// [`LoreError::Validation`] for empty replacement text,
    /// [`LoreError::ChunkNotFound`] when the chunk id is absent, and any
    /// upstream error from re-embedding.
    pub async fn apply(&self, correction: &Correction) -> Result<CorrectionOutcome, LoreError> {
        if correction.corrected_text.trim().is_empty() {
            return Err(LoreError::Validation(
                "corrected text must not be empty".into(),
            ));
        }

        let chunk_id = &correction.provenance.chunk_id;
        // Resolve before embedding so an unknown id fails fast and cheap.
        let existing = self
            .index
            .get_chunk(chunk_id)
            .await?
            .ok_or_else(|| LoreError::ChunkNotFound {
                chunk_id: chunk_id.clone(),
            })?;

        let embedding = self.embedder.embed(&correction.corrected_text).await?;
        self.index
            .update_chunk(chunk_id, &correction.corrected_text, embedding)
            .await?;

        tracing::info!(
            chunk_id = %chunk_id,
            document_id = %existing.document_id,
            ordinal = existing.ordinal,
            "chunk rewritten by correction"
        );
        Ok(CorrectionOutcome {
            chunk_id: chunk_id.clone(),
            document_id: existing.document_id,
            message: "knowledge base updated".to_string(),
        })
    }
}
