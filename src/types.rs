//! Shared types and the crate-wide error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the ingestion pipeline, the query path, and the
/// correction service.
///
/// Propagation policy: the ingestion worker absorbs per-chunk failures
/// locally (logged and counted) and only escalates whole-document failure;
/// the query path propagates errors to the caller verbatim, except that the
/// answer generator converts a mid-stream failure into a user-safe fallback
/// segment instead of an aborted stream.
#[derive(Debug, Error)]
pub enum LoreError {
    /// Input rejected before any work happened. Not retryable.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The embedding or generation upstream was unreachable or returned a
    /// malformed response.
    #[error("upstream provider error: {0}")]
    Upstream(String),

    /// An embedding came back with the wrong dimensionality. This is fatal
    /// and never silently coerced.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A correction referenced a chunk id that is not present in the index.
    #[error("chunk '{chunk_id}' not found in the vector index")]
    ChunkNotFound { chunk_id: String },

    /// Some chunks of a document failed to embed after exhausting retries.
    /// The document is still indexed when at least one chunk succeeded.
    #[error("document '{document_id}' indexed with failed ordinals {failed_ordinals:?}")]
    PartialIngestion {
        document_id: String,
        failed_ordinals: Vec<usize>,
    },

    #[error("vector index error: {0}")]
    Storage(String),

    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoreError {
    /// Returns `true` when retrying the same call may succeed.
    ///
    /// Validation failures and dimension mismatches are permanent; upstream,
    /// timeout, and transport errors are transient by assumption.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoreError::Upstream(_) | LoreError::Timeout { .. } | LoreError::Http(_)
        )
    }
}

/// Identifying trail linking a generated answer back to its source chunk.
///
/// Produced by retrieval, handed back by the caller when correcting an
/// answer. `ordinal` is the chunk's zero-based position within its document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub chunk_id: String,
    pub document_id: String,
    pub source_url: String,
    pub ordinal: usize,
}

/// Role of a turn in a conversation session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of a conversation.
///
/// The sequence of turns is append-only and owned by the session
/// collaborator; the core only produces assistant content and never mutates
/// history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Phase of a synchronous ad-hoc text ingestion, as exposed to callers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextIngestPhase {
    #[default]
    Idle,
    Embedding,
}

/// Phase of an in-flight answer correction, as exposed to callers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionPhase {
    #[default]
    Idle,
    Updating,
}

impl std::fmt::Display for TextIngestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TextIngestPhase::Idle => write!(f, "idle"),
            TextIngestPhase::Embedding => write!(f, "embedding"),
        }
    }
}

impl std::fmt::Display for CorrectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorrectionPhase::Idle => write!(f, "idle"),
            CorrectionPhase::Updating => write!(f, "updating"),
        }
    }
}
