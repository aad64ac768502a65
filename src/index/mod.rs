//! Vector index abstraction.
//!
//! The index stores `(vector, text, metadata)` tuples and supports upsert,
//! similarity search, and point update by id. It is consumed as an external,
//! concurrent-safe capability: reads never block on unrelated writes, and a
//! correction write interleaving with a retrieval is acceptable (eventual
//! consistency only).
//!
//! ```text
//!                  ┌───────────────────┐
//!                  │ VectorIndex trait │
//!                  │   (async CRUD)    │
//!                  └─────────┬─────────┘
//!                            │
//!                 ┌──────────┴──────────┐
//!                 ▼                     ▼
//!          ┌────────────┐       ┌─────────────┐
//!          │ MemoryIndex│       │ SqliteIndex │
//!          │  (cosine)  │       │ sqlite-vec  │
//!          └────────────┘       └─────────────┘
//! ```

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::LoreError;

pub use memory::MemoryIndex;
pub use sqlite::SqliteIndex;

/// Deterministic chunk identity: `sha256(document_id, ordinal)`.
///
/// Re-running ingestion for the same document produces the same ids, so
/// at-least-once job delivery overwrites rather than duplicates.
#[must_use]
pub fn chunk_identity(document_id: &str, ordinal: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(ordinal.to_le_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// A chunk with its embedding, as stored in (or destined for) the index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Deterministic id, see [`chunk_identity`].
    pub id: String,
    /// Owning document.
    pub document_id: String,
    /// Where the document came from.
    pub source_url: String,
    /// Zero-based position of this chunk within the document.
    pub ordinal: usize,
    /// The chunk text.
    pub content: String,
    /// Additional metadata as JSON.
    pub metadata: serde_json::Value,
    /// The embedding vector, if computed.
    pub embedding: Option<Vec<f32>>,
}

impl ChunkRecord {
    pub fn new(
        document_id: impl Into<String>,
        source_url: impl Into<String>,
        ordinal: usize,
        content: impl Into<String>,
    ) -> Self {
        let document_id = document_id.into();
        Self {
            id: chunk_identity(&document_id, ordinal),
            document_id,
            source_url: source_url.into(),
            ordinal,
            content: content.into(),
            metadata: serde_json::Value::Object(Default::default()),
            embedding: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// A search hit: the chunk plus its similarity to the query (higher is
/// closer).
#[derive(Clone, Debug)]
pub struct ScoredChunk {
    pub chunk: ChunkRecord,
    pub similarity: f32,
}

/// Unified interface over vector storage backends.
///
/// All write operations are keyed by chunk id, so repeated upserts of the
/// same record replace rather than duplicate.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace chunk records. Records without an embedding are
    /// skipped (they cannot be searched).
    async fn upsert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), LoreError>;

    /// Fetch a chunk by id.
    async fn get_chunk(&self, id: &str) -> Result<Option<ChunkRecord>, LoreError>;

    /// Replace a chunk's text and embedding in place. Id, ordinal, and
    /// document metadata are preserved.
    ///
    /// # Errors
    ///
    /// Returns [`LoreError::ChunkNotFound`] when `id` is absent.
    async fn update_chunk(
        &self,
        id: &str,
        content: &str,
        embedding: Vec<f32>,
    ) -> Result<(), LoreError>;

    /// Delete every chunk belonging to a document. Returns the number of
    /// chunks removed.
    async fn delete_document(&self, document_id: &str) -> Result<usize, LoreError>;

    /// Nearest-neighbour search, most similar first.
    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<ScoredChunk>, LoreError>;

    /// Total number of chunks stored.
    async fn count(&self) -> Result<usize, LoreError>;
}
