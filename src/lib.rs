//! Loresmith: a retrieval-augmented knowledge base with streaming answers
//! and human-in-the-loop correction.
//!
//! Three flows share one embedding provider and one vector index:
//!
//! ```text
//!   ingest                         ask                       correct
//!     │                             │                           │
//!     ▼                             ▼                           ▼
//!  JobQueue ─► workers        RetrievalPlanner            CorrectionService
//!     │      chunk/embed        embed question              re-embed text
//!     ▼           │                 │                           │
//!     └──────────►▼                 ▼                           ▼
//!            VectorIndex ◄──── search top-k ◄──── update chunk in place
//!                                   │
//!                                   ▼
//!                            AnswerGenerator ─► AnswerStream (segments)
//! ```
//!
//! Start from [`service::KnowledgeService`]; everything else is a
//! collaborator it wires together.
//!
//! ```rust
//! use std::sync::Arc;
//! use loresmith::config::ServiceConfig;
//! use loresmith::embeddings::MockEmbeddingProvider;
//! use loresmith::generation::MockGenerationProvider;
//! use loresmith::index::MemoryIndex;
//! use loresmith::service::KnowledgeService;
//! use loresmith::types::ConversationTurn;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), loresmith::types::LoreError> {
//! let service = KnowledgeService::builder(ServiceConfig::default())
//!     .embedder(Arc::new(MockEmbeddingProvider::new()))
//!     .generator(Arc::new(MockGenerationProvider::new(vec!["Five days."])))
//!     .index(Arc::new(MemoryIndex::new()))
//!     .build()?;
//!
//! service
//!     .ingest_text("Refunds take five days.", "https://example.com/policy")
//!     .await?;
//! let (answer, provenance) = service
//!     .ask_collect(&[ConversationTurn::user("How long do refunds take?")])
//!     .await?;
//! assert!(!provenance.is_empty());
//! # service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod chunking;
pub mod config;
pub mod correction;
pub mod embeddings;
pub mod generation;
pub mod index;
pub mod ingestion;
pub mod retrieval;
pub mod service;
pub mod types;

pub use config::ServiceConfig;
pub use correction::{Correction, CorrectionOutcome};
pub use generation::AnswerStream;
pub use index::{ChunkRecord, ScoredChunk, VectorIndex};
pub use ingestion::{Document, JobId, JobPhase};
pub use retrieval::RetrievedContext;
pub use service::{AskResponse, KnowledgeService};
pub use types::{ConversationTurn, LoreError, Provenance};
