//! Retrieval planning: question in, grounding context out.
//!
//! The planner embeds the question, asks the index for the nearest chunks,
//! and assembles them into one context block ordered by descending
//! similarity. When nothing is indexed (or nothing comes back) the context
//! is an explicit marker string, so the generation layer can tell "no
//! knowledge" apart from "empty string bug".

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::RetrievalConfig;
use crate::embeddings::EmbeddingProvider;
use crate::index::VectorIndex;
use crate::types::{LoreError, Provenance};

/// Sentinel context used when retrieval finds nothing relevant. The prompt
/// instructs the model to answer from general knowledge when it sees this.
pub const NO_CONTEXT: &str = "NO_RELEVANT_CONTEXT";

/// Assembled grounding material for one question.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrievedContext {
    /// Concatenated chunk texts, or [`NO_CONTEXT`].
    pub context_text: String,
    /// One entry per included chunk, in context order (most similar first).
    pub provenance: Vec<Provenance>,
}

impl RetrievedContext {
    /// The empty-retrieval case.
    #[must_use]
    pub fn no_context() -> Self {
        Self {
            context_text: NO_CONTEXT.to_string(),
            provenance: Vec::new(),
        }
    }

    /// Whether any indexed chunk backs this context.
    #[must_use]
    pub fn has_sources(&self) -> bool {
        !self.provenance.is_empty()
    }
}

/// Embeds questions and assembles retrieval context from the index.
pub struct RetrievalPlanner {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    config: RetrievalConfig,
}

impl RetrievalPlanner {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            config,
        }
    }

    /// Retrieves grounding context for `question`.
    ///
    /// Failing to embed the question is fatal for the request; there is no
    /// degraded "search anyway" mode. An empty index is not an error and
    /// yields [`RetrievedContext::no_context`].
    pub async fn retrieve(&self, question: &str) -> Result<RetrievedContext, LoreError> {
        if question.trim().is_empty() {
            return Err(LoreError::Validation("question must not be empty".into()));
        }

        let query = self.embedder.embed(question).await?;
        let hits = self.index.search(&query, self.config.top_k).await?;
        if hits.is_empty() {
            tracing::debug!("retrieval found no candidate chunks");
            return Ok(RetrievedContext::no_context());
        }

        // Hits arrive most similar first; keep that order in the context.
        // The budget never splits a chunk, and the best hit is always
        // included even when it alone exceeds the budget.
        let mut context_text = String::new();
        let mut provenance = Vec::new();
        for hit in hits {
            let chunk = hit.chunk;
            let chunk_len = chunk.content.chars().count();
            if !provenance.is_empty()
                && context_text.chars().count() + chunk_len + 2 > self.config.context_budget
            {
                break;
            }
            if !context_text.is_empty() {
                context_text.push_str("\n\n");
            }
            context_text.push_str(&chunk.content);
            provenance.push(Provenance {
                chunk_id: chunk.id,
                document_id: chunk.document_id,
                source_url: chunk.source_url,
                ordinal: chunk.ordinal,
            });
        }

        tracing::debug!(
            chunks = provenance.len(),
            context_chars = context_text.chars().count(),
            "retrieval context assembled"
        );
        Ok(RetrievedContext {
            context_text,
            provenance,
        })
    }
}
