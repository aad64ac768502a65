//! Ingestion jobs and their phase state machine.

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::types::LoreError;

/// A document accepted for indexing. Immutable once queued; a changed
/// source is submitted again under a new version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub source_url: Url,
    pub version: String,
    pub content: String,
}

impl Document {
    /// Creates a document with a fresh id.
    pub fn new(source_url: Url, version: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            document_id: Uuid::new_v4().to_string(),
            source_url,
            version: version.into(),
            content: content.into(),
        }
    }

    /// Creates a document with a caller-chosen id, for re-submissions that
    /// must overwrite a previous run's chunks.
    pub fn with_id(
        document_id: impl Into<String>,
        source_url: Url,
        version: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            source_url,
            version: version.into(),
            content: content.into(),
        }
    }
}

/// Unique handle for an ingestion job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Phase of an ingestion job.
///
/// Transitions are monotonically forward (`queued → chunking → embedding →
/// indexed`), with two exceptions: any non-terminal phase may fail, and a
/// failed job may be retried back to `queued`. Everything else is illegal
/// and rejected by [`IngestionJob::advance`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Queued,
    Chunking,
    Embedding,
    Indexed,
    Failed,
}

impl JobPhase {
    /// Returns `true` once the job can make no further progress.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Indexed | JobPhase::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    #[must_use]
    pub fn can_advance_to(&self, next: JobPhase) -> bool {
        use JobPhase::*;
        matches!(
            (self, next),
            (Queued, Chunking)
                | (Chunking, Embedding)
                | (Chunking, Indexed)
                | (Embedding, Indexed)
                | (Queued, Failed)
                | (Chunking, Failed)
                | (Embedding, Failed)
                | (Failed, Queued)
        )
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Queued => write!(f, "queued"),
            JobPhase::Chunking => write!(f, "chunking"),
            JobPhase::Embedding => write!(f, "embedding"),
            JobPhase::Indexed => write!(f, "indexed"),
            JobPhase::Failed => write!(f, "failed"),
        }
    }
}

/// One indexing job, owned exclusively by the worker that dequeued it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: JobId,
    pub document: Document,
    pub phase: JobPhase,
    /// Delivery attempts so far, incremented on redelivery and retry.
    pub attempts: u32,
}

impl IngestionJob {
    pub fn new(document: Document) -> Self {
        Self {
            job_id: JobId::new(),
            document,
            phase: JobPhase::Queued,
            attempts: 1,
        }
    }

    /// Moves the job to `next`, rejecting any transition the state machine
    /// does not permit.
    pub fn advance(&mut self, next: JobPhase) -> Result<(), LoreError> {
        if !self.phase.can_advance_to(next) {
            return Err(LoreError::Validation(format!(
                "illegal job transition {} -> {} (job {})",
                self.phase, next, self.job_id
            )));
        }
        self.phase = next;
        Ok(())
    }
}
