//! The `KnowledgeService` facade.
//!
//! One object wires the whole system together: the ingestion queue and its
//! workers, the retrieval planner, the answer generator, and the correction
//! service, all sharing a single embedding provider and vector index.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::chunking;
use crate::config::ServiceConfig;
use crate::correction::{Correction, CorrectionOutcome, CorrectionService};
use crate::embeddings::EmbeddingProvider;
use crate::generation::{AnswerGenerator, AnswerStream, GenerationProvider};
use crate::index::{ChunkRecord, VectorIndex};
use crate::ingestion::{Document, JobId, JobPhase, JobQueue, IngestionWorker, redelivery_loop};
use crate::retrieval::{RetrievalPlanner, RetrievedContext};
use crate::types::{
    ConversationTurn, CorrectionPhase, LoreError, Provenance, TextIngestPhase,
};

/// An in-flight answer: the segment stream plus where the grounding
/// material came from. Provenance is available immediately, before the
/// first segment.
pub struct AskResponse {
    pub stream: AnswerStream,
    pub provenance: Vec<Provenance>,
}

/// Builder for [`KnowledgeService`].
pub struct KnowledgeServiceBuilder {
    config: ServiceConfig,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    generator: Option<Arc<dyn GenerationProvider>>,
    index: Option<Arc<dyn VectorIndex>>,
    worker_count: usize,
}

impl KnowledgeServiceBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            embedder: None,
            generator: None,
            index: None,
            worker_count: 2,
        }
    }

    #[must_use]
    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn generator(mut self, generator: Arc<dyn GenerationProvider>) -> Self {
        self.generator = Some(generator);
        self
    }

    #[must_use]
    pub fn index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Number of ingestion worker tasks to spawn.
    #[must_use]
    pub fn workers(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Builds the service and spawns its background tasks.
    pub fn build(self) -> Result<KnowledgeService, LoreError> {
        self.config.validate()?;
        let embedder = self
            .embedder
            .ok_or_else(|| LoreError::Validation("an embedding provider is required".into()))?;
        let generator = self
            .generator
            .ok_or_else(|| LoreError::Validation("a generation provider is required".into()))?;
        let index = self
            .index
            .ok_or_else(|| LoreError::Validation("a vector index is required".into()))?;

        let queue = Arc::new(JobQueue::new(self.config.ingestion.visibility_timeout));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        for _ in 0..self.worker_count {
            let worker = IngestionWorker::new(
                queue.clone(),
                embedder.clone(),
                index.clone(),
                self.config.ingestion.clone(),
            );
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { worker.run(rx).await }));
        }
        tasks.push(tokio::spawn(redelivery_loop(
            queue.clone(),
            self.config.ingestion.visibility_timeout,
            shutdown_rx,
        )));

        let planner = RetrievalPlanner::new(
            embedder.clone(),
            index.clone(),
            self.config.retrieval.clone(),
        );
        let answerer = AnswerGenerator::new(generator, self.config.persona.clone());
        let corrector = CorrectionService::new(embedder.clone(), index.clone());

        let (ingest_phase_tx, _) = watch::channel(TextIngestPhase::Idle);
        let (correction_phase_tx, _) = watch::channel(CorrectionPhase::Idle);

        Ok(KnowledgeService {
            config: self.config,
            embedder,
            index,
            queue,
            planner,
            answerer,
            corrector,
            ingest_phase_tx,
            correction_phase_tx,
            shutdown_tx,
            tasks,
        })
    }
}

/// Facade over ingestion, retrieval, generation, and correction.
pub struct KnowledgeService {
    config: ServiceConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    queue: Arc<JobQueue>,
    planner: RetrievalPlanner,
    answerer: AnswerGenerator,
    corrector: CorrectionService,
    ingest_phase_tx: watch::Sender<TextIngestPhase>,
    correction_phase_tx: watch::Sender<CorrectionPhase>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl KnowledgeService {
    pub fn builder(config: ServiceConfig) -> KnowledgeServiceBuilder {
        KnowledgeServiceBuilder::new(config)
    }

    /// Ingests a snippet of text synchronously: chunk, embed, upsert, done
    /// when it returns. The caller-visible phase moves `idle -> embedding
    /// -> idle` around the provider call.
    ///
    /// Every chunk must embed; a partial result is reported as
    /// [`LoreError::PartialIngestion`] and nothing is indexed in that case.
    pub async fn ingest_text(
        &self,
        text: &str,
        source_url: &str,
    ) -> Result<usize, LoreError> {
        if text.trim().is_empty() {
            return Err(LoreError::Validation("text must not be empty".into()));
        }

        let chunks = chunking::chunk(
            text,
            self.config.ingestion.max_chunk_size,
            self.config.ingestion.chunk_overlap,
        )?;
        if chunks.is_empty() {
            return Ok(0);
        }

        self.ingest_phase_tx.send_replace(TextIngestPhase::Embedding);
        let result = self.embed_and_upsert(&chunks, source_url).await;
        self.ingest_phase_tx.send_replace(TextIngestPhase::Idle);
        result
    }

    async fn embed_and_upsert(
        &self,
        chunks: &[chunking::TextChunk],
        source_url: &str,
    ) -> Result<usize, LoreError> {
        let document_id = uuid::Uuid::new_v4().to_string();
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        let failed_ordinals: Vec<usize> = vectors
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.is_none().then_some(chunks[i].ordinal))
            .collect();
        if !failed_ordinals.is_empty() {
            return Err(LoreError::PartialIngestion {
                document_id,
                failed_ordinals,
            });
        }

        let records: Vec<ChunkRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| {
                let metadata = serde_json::json!({
                    "docId": document_id,
                    "sourceUrl": source_url,
                    "chunkIndex": chunk.ordinal,
                });
                ChunkRecord::new(&document_id, source_url, chunk.ordinal, &chunk.text)
                    .with_metadata(metadata)
                    .with_embedding(vector.unwrap_or_default())
            })
            .collect();

        let count = records.len();
        self.index.upsert_chunks(records).await?;
        tracing::info!(document_id = %document_id, chunks = count, "text ingested");
        Ok(count)
    }

    /// Phase of the synchronous text-ingest path.
    pub fn ingest_phase(&self) -> watch::Receiver<TextIngestPhase> {
        self.ingest_phase_tx.subscribe()
    }

    /// Queues a document for asynchronous indexing and returns immediately.
    pub fn ingest_document(&self, document: Document) -> JobId {
        self.queue.enqueue(document)
    }

    /// Current phase of a queued job, or `None` for an unknown id.
    pub fn job_phase(&self, job_id: JobId) -> Option<JobPhase> {
        self.queue.phase(job_id)
    }

    /// Push-style observation of a queued job's phase.
    pub fn watch_job(&self, job_id: JobId) -> Option<watch::Receiver<JobPhase>> {
        self.queue.watch_phase(job_id)
    }

    /// Requeues a failed job for another attempt.
    pub fn retry_job(&self, job_id: JobId) -> Result<(), LoreError> {
        self.queue.retry(job_id)
    }

    /// Answers the last user turn of `history`, grounded in retrieved
    /// chunks. Provenance in the response names the chunks the context was
    /// built from; it is empty when retrieval found nothing or the question
    /// short-circuited.
    pub async fn ask(&self, history: &[ConversationTurn]) -> Result<AskResponse, LoreError> {
        let question = history
            .iter()
            .rev()
            .find(|turn| turn.role == crate::types::Role::User)
            .map(|turn| turn.content.as_str())
            .ok_or_else(|| {
                LoreError::Validation("conversation has no user turn to answer".into())
            })?;

        // Identity questions are answered directly; retrieval is skipped.
        let context = if AnswerGenerator::is_identity_question(question) {
            RetrievedContext::no_context()
        } else {
            self.planner.retrieve(question).await?
        };
        let provenance = context.provenance.clone();
        let stream = self.answerer.answer(history, &context).await?;
        Ok(AskResponse { stream, provenance })
    }

    /// Like [`ask`](Self::ask) but drains the stream into one string.
    pub async fn ask_collect(
        &self,
        history: &[ConversationTurn],
    ) -> Result<(String, Vec<Provenance>), LoreError> {
        let response = self.ask(history).await?;
        let text = response.stream.collect_text().await;
        Ok((text, response.provenance))
    }

    /// Applies a human correction to the chunk named by its provenance.
    /// The caller-visible phase moves `idle -> updating -> idle`.
    pub async fn correct_answer(
        &self,
        correction: &Correction,
    ) -> Result<CorrectionOutcome, LoreError> {
        self.correction_phase_tx
            .send_replace(CorrectionPhase::Updating);
        let result = self.corrector.apply(correction).await;
        self.correction_phase_tx.send_replace(CorrectionPhase::Idle);
        result
    }

    /// Phase of the correction path.
    pub fn correction_phase(&self) -> watch::Receiver<CorrectionPhase> {
        self.correction_phase_tx.subscribe()
    }

    /// Rewrites rough user text into a clear, self-contained question.
    pub async fn enhance_text(&self, text: &str) -> Result<String, LoreError> {
        self.answerer.enhance(text).await
    }

    /// Total chunks in the index.
    pub async fn chunk_count(&self) -> Result<usize, LoreError> {
        self.index.count().await
    }

    /// Stops the background workers and waits for them to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "background task did not shut down cleanly");
            }
        }
    }
}
