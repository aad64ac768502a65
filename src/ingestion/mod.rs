//! Asynchronous ingestion pipeline.
//!
//! ```text
//! Document ──► JobQueue::enqueue ──► queued
//!                                      │  IngestionWorker::run
//!                                      ▼
//!                chunking ──► embedding ──► indexed
//!                    │             │
//!                    └──── failed ◄┘   (retry: failed ──► queued)
//! ```
//!
//! Document acceptance is a fast, non-blocking enqueue; indexing runs on one
//! or more worker tasks that may process different documents fully in
//! parallel. Delivery is at-least-once: a job not acknowledged within the
//! visibility timeout is redelivered, and workers rely on deterministic
//! chunk identity to make re-processing a safe overwrite.

pub mod job;
pub mod queue;
pub mod worker;

pub use job::{Document, IngestionJob, JobId, JobPhase};
pub use queue::{JobDelivery, JobQueue};
pub use worker::{IngestionReport, IngestionWorker, redelivery_loop};
