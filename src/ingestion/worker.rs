//! Worker loop that turns queued documents into indexed chunks.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::queue::{JobDelivery, JobQueue};
use crate::chunking;
use crate::config::IngestionConfig;
use crate::embeddings::EmbeddingProvider;
use crate::index::{ChunkRecord, VectorIndex};
use crate::ingestion::job::JobPhase;
use crate::types::LoreError;

/// Outcome summary for one processed document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestionReport {
    pub document_id: String,
    /// Chunks successfully embedded and upserted.
    pub chunk_count: usize,
    /// Ordinals that exhausted their embedding attempts. Empty on full
    /// success.
    pub failed_ordinals: Vec<usize>,
}

/// Pulls jobs from the queue and drives them through
/// `chunking -> embedding -> indexed`.
///
/// Several workers may run against the same queue; each document is
/// processed end to end by whichever worker dequeued it, so distinct
/// documents index fully in parallel.
pub struct IngestionWorker {
    queue: Arc<JobQueue>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    config: IngestionConfig,
}

impl IngestionWorker {
    pub fn new(
        queue: Arc<JobQueue>,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            queue,
            embedder,
            index,
            config,
        }
    }

    /// Runs until `shutdown` flips to `true`. Each iteration waits for the
    /// next job, processes it, and acknowledges it regardless of outcome
    /// (failure is a recorded terminal phase, not a reason to redeliver
    /// immediately).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                delivery = self.queue.next_job() => {
                    let Some(delivery) = delivery else { break };
                    let job_id = delivery.job.job_id;
                    if let Err(err) = self.process(&delivery).await {
                        tracing::error!(job_id = %job_id, error = %err, "ingestion job failed");
                        if self.queue.set_phase(job_id, JobPhase::Failed).is_err() {
                            tracing::debug!(job_id = %job_id, "job already terminal");
                        }
                    }
                    self.queue.ack(job_id);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Processes a single delivery to completion.
    ///
    /// Redeliveries of an already indexed job are a no-op. A document whose
    /// content chunks to nothing is indexed immediately with zero chunks.
    pub async fn process(&self, delivery: &JobDelivery) -> Result<IngestionReport, LoreError> {
        let job = &delivery.job;
        let document = &job.document;

        if job.phase == JobPhase::Indexed {
            return Ok(IngestionReport {
                document_id: document.document_id.clone(),
                chunk_count: 0,
                failed_ordinals: Vec::new(),
            });
        }
        if job.phase == JobPhase::Failed {
            return Err(LoreError::Validation(format!(
                "job {} delivered in failed phase; retry it first",
                job.job_id
            )));
        }

        self.queue.set_phase(job.job_id, JobPhase::Chunking)?;
        let chunks = chunking::chunk(
            &document.content,
            self.config.max_chunk_size,
            self.config.chunk_overlap,
        )?;

        if chunks.is_empty() {
            tracing::info!(
                document_id = %document.document_id,
                "document has no embeddable content"
            );
            self.queue.set_phase(job.job_id, JobPhase::Indexed)?;
            return Ok(IngestionReport {
                document_id: document.document_id.clone(),
                chunk_count: 0,
                failed_ordinals: Vec::new(),
            });
        }

        self.queue.set_phase(job.job_id, JobPhase::Embedding)?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let mut vectors = self.embedder.embed_batch(&texts).await?;

        // Bounded per-chunk retries with exponential backoff for the
        // positions the batch could not embed.
        for attempt in 2..=self.config.max_embed_attempts {
            let missing: Vec<usize> = vectors
                .iter()
                .enumerate()
                .filter_map(|(i, v)| v.is_none().then_some(i))
                .collect();
            if missing.is_empty() {
                break;
            }
            let backoff = self.config.retry_backoff * 2u32.pow(attempt - 2);
            tokio::time::sleep(backoff).await;
            for i in missing {
                match self.embedder.embed(&texts[i]).await {
                    Ok(vector) => vectors[i] = Some(vector),
                    Err(err @ LoreError::DimensionMismatch { .. }) => return Err(err),
                    Err(err) => {
                        tracing::warn!(
                            document_id = %document.document_id,
                            ordinal = i,
                            attempt,
                            error = %err,
                            "embedding retry failed"
                        );
                    }
                }
            }
        }

        let mut records = Vec::new();
        let mut failed_ordinals = Vec::new();
        for (chunk, vector) in chunks.iter().zip(vectors) {
            match vector {
                Some(vector) => {
                    let metadata = serde_json::json!({
                        "docId": document.document_id,
                        "sourceUrl": document.source_url.as_str(),
                        "chunkIndex": chunk.ordinal,
                        "version": document.version,
                    });
                    records.push(
                        ChunkRecord::new(
                            &document.document_id,
                            document.source_url.as_str(),
                            chunk.ordinal,
                            &chunk.text,
                        )
                        .with_metadata(metadata)
                        .with_embedding(vector),
                    );
                }
                None => failed_ordinals.push(chunk.ordinal),
            }
        }

        if records.is_empty() {
            self.queue
                .record_failed_ordinals(job.job_id, failed_ordinals.clone());
            return Err(LoreError::Upstream(format!(
                "no chunk of document {} could be embedded",
                document.document_id
            )));
        }

        let chunk_count = records.len();
        self.index.upsert_chunks(records).await?;
        self.queue
            .record_failed_ordinals(job.job_id, failed_ordinals.clone());
        self.queue.set_phase(job.job_id, JobPhase::Indexed)?;

        if failed_ordinals.is_empty() {
            tracing::info!(
                document_id = %document.document_id,
                chunk_count,
                "document indexed"
            );
        } else {
            tracing::warn!(
                document_id = %document.document_id,
                chunk_count,
                failed = failed_ordinals.len(),
                "document indexed with missing chunks"
            );
        }

        Ok(IngestionReport {
            document_id: document.document_id.clone(),
            chunk_count,
            failed_ordinals,
        })
    }
}

/// Periodically requeues deliveries that were never acknowledged. Runs
/// until `shutdown` flips to `true`.
pub async fn redelivery_loop(
    queue: Arc<JobQueue>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let redelivered = queue.redeliver_stale();
                if redelivered > 0 {
                    tracing::warn!(redelivered, "requeued stale deliveries");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::MockEmbeddingProvider;
    use crate::index::MemoryIndex;
    use crate::ingestion::job::Document;
    use url::Url;

    fn worker_with(
        embedder: Arc<MockEmbeddingProvider>,
    ) -> (IngestionWorker, Arc<JobQueue>, Arc<MemoryIndex>) {
        let queue = Arc::new(JobQueue::new(Duration::from_secs(60)));
        let index = Arc::new(MemoryIndex::new());
        let config = IngestionConfig {
            max_chunk_size: 10,
            chunk_overlap: 2,
            max_embed_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            visibility_timeout: Duration::from_secs(60),
        };
        let worker = IngestionWorker::new(
            queue.clone(),
            embedder.clone(),
            index.clone(),
            config,
        );
        (worker, queue, index)
    }

    fn doc(content: &str) -> Document {
        Document::new(
            Url::parse("https://example.com/handbook.pdf").unwrap(),
            "v1",
            content,
        )
    }

    #[tokio::test]
    async fn document_flows_to_indexed() {
        let embedder = Arc::new(MockEmbeddingProvider::new());
        let (worker, queue, index) = worker_with(embedder);

        let job_id = queue.enqueue(doc("a document long enough for several chunks"));
        let delivery = queue.next_job().await.unwrap();
        let report = worker.process(&delivery).await.unwrap();

        assert!(report.chunk_count > 1);
        assert!(report.failed_ordinals.is_empty());
        assert_eq!(queue.phase(job_id), Some(JobPhase::Indexed));
        assert_eq!(index.count().await.unwrap(), report.chunk_count);
    }

    #[tokio::test]
    async fn empty_document_is_indexed_with_zero_chunks() {
        let embedder = Arc::new(MockEmbeddingProvider::new());
        let (worker, queue, index) = worker_with(embedder.clone());

        let job_id = queue.enqueue(doc("   \n  "));
        let delivery = queue.next_job().await.unwrap();
        let report = worker.process(&delivery).await.unwrap();

        assert_eq!(report.chunk_count, 0);
        assert_eq!(queue.phase(job_id), Some(JobPhase::Indexed));
        assert_eq!(index.count().await.unwrap(), 0);
        assert_eq!(embedder.call_count(), 0);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_within_attempt_budget() {
        let embedder = Arc::new(MockEmbeddingProvider::new());
        let (worker, queue, index) = worker_with(embedder.clone());

        let document = doc("abcdefghij".repeat(3).as_str());
        let chunks =
            chunking::chunk(&document.content, 10, 2).unwrap();
        assert!(chunks.len() >= 3);
        embedder.fail_times(chunks[1].text.clone(), 1);

        let job_id = queue.enqueue(document);
        let delivery = queue.next_job().await.unwrap();
        let report = worker.process(&delivery).await.unwrap();

        assert!(report.failed_ordinals.is_empty());
        assert_eq!(queue.phase(job_id), Some(JobPhase::Indexed));
        assert_eq!(index.count().await.unwrap(), report.chunk_count);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_ordinal_failed_but_index_the_rest() {
        let embedder = Arc::new(MockEmbeddingProvider::new());
        let (worker, queue, index) = worker_with(embedder.clone());

        let document = doc("abcdefghij".repeat(3).as_str());
        let chunks =
            chunking::chunk(&document.content, 10, 2).unwrap();
        embedder.fail_times(chunks[1].text.clone(), 10);

        let job_id = queue.enqueue(document);
        let delivery = queue.next_job().await.unwrap();
        let report = worker.process(&delivery).await.unwrap();

        assert_eq!(report.failed_ordinals, vec![1]);
        assert_eq!(queue.phase(job_id), Some(JobPhase::Indexed));
        assert_eq!(index.count().await.unwrap(), chunks.len() - 1);
        assert_eq!(queue.failed_ordinals(job_id), Some(vec![1]));
    }

    #[tokio::test]
    async fn total_embedding_failure_fails_the_job() {
        let embedder = Arc::new(MockEmbeddingProvider::new());
        let (worker, queue, index) = worker_with(embedder.clone());

        let document = doc("tiny");
        embedder.fail_times("tiny", 10);

        let job_id = queue.enqueue(document);
        let delivery = queue.next_job().await.unwrap();
        let err = worker.process(&delivery).await.unwrap_err();

        assert!(matches!(err, LoreError::Upstream(_)));
        queue.set_phase(job_id, JobPhase::Failed).unwrap();
        assert_eq!(queue.phase(job_id), Some(JobPhase::Failed));
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reprocessing_does_not_duplicate_chunks() {
        let embedder = Arc::new(MockEmbeddingProvider::new());
        let (worker, queue, index) = worker_with(embedder);

        let document = doc("a document long enough for several chunks");
        let document_id = document.document_id.clone();

        queue.enqueue(document.clone());
        let delivery = queue.next_job().await.unwrap();
        let first = worker.process(&delivery).await.unwrap();

        // Same document id again, as a redelivery would present it.
        queue.enqueue(Document::with_id(
            document_id,
            document.source_url.clone(),
            "v1",
            document.content.clone(),
        ));
        let delivery = queue.next_job().await.unwrap();
        let second = worker.process(&delivery).await.unwrap();

        assert_eq!(first.chunk_count, second.chunk_count);
        assert_eq!(index.count().await.unwrap(), first.chunk_count);
    }

    #[tokio::test]
    async fn run_loop_processes_and_stops_on_shutdown() {
        let embedder = Arc::new(MockEmbeddingProvider::new());
        let (worker, queue, index) = worker_with(embedder);
        let worker = Arc::new(worker);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let job_id = queue.enqueue(doc("content to index"));

        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run(shutdown_rx).await })
        };

        let mut phases = queue.watch_phase(job_id).unwrap();
        while *phases.borrow() != JobPhase::Indexed {
            phases.changed().await.unwrap();
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(index.count().await.unwrap() > 0);
    }
}
