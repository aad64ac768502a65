//! End-to-end ingestion pipeline behavior through the public API.

use std::sync::Arc;
use std::time::Duration;

use loresmith::config::ServiceConfig;
use loresmith::embeddings::MockEmbeddingProvider;
use loresmith::generation::MockGenerationProvider;
use loresmith::index::{MemoryIndex, VectorIndex};
use loresmith::ingestion::{Document, JobPhase};
use loresmith::service::KnowledgeService;
use url::Url;

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .init();
    });
}

fn config() -> ServiceConfig {
    init_tracing();
    ServiceConfig::builder()
        .chunking(40, 8)
        .retry_backoff(Duration::from_millis(1))
        .build()
        .unwrap()
}

fn build_service(
    embedder: Arc<MockEmbeddingProvider>,
    index: Arc<MemoryIndex>,
    workers: usize,
) -> KnowledgeService {
    KnowledgeService::builder(config())
        .embedder(embedder)
        .generator(Arc::new(MockGenerationProvider::new(vec!["ok"])))
        .index(index)
        .workers(workers)
        .build()
        .unwrap()
}

fn doc(id: &str, content: &str) -> Document {
    Document::with_id(
        id,
        Url::parse("https://example.com/handbook.pdf").unwrap(),
        "v1",
        content,
    )
}

async fn wait_for_phase(service: &KnowledgeService, job_id: loresmith::JobId, target: JobPhase) {
    let mut phases = service.watch_job(job_id).unwrap();
    tokio::time::timeout(Duration::from_secs(3), async {
        while *phases.borrow() != target {
            phases.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job never reached {target}"));
}

#[tokio::test]
async fn document_moves_through_every_phase_to_indexed() {
    let embedder = Arc::new(MockEmbeddingProvider::new());
    let index = Arc::new(MemoryIndex::new());
    let service = build_service(embedder, index.clone(), 1);

    let content = "Employees accrue vacation monthly. Unused days roll over \
                   once per calendar year, capped at ten carried days.";
    let job_id = service.ingest_document(doc("doc-hr", content));

    wait_for_phase(&service, job_id, JobPhase::Indexed).await;
    assert!(index.count().await.unwrap() > 1);
    service.shutdown().await;
}

#[tokio::test]
async fn reingesting_the_same_document_does_not_duplicate() {
    let embedder = Arc::new(MockEmbeddingProvider::new());
    let index = Arc::new(MemoryIndex::new());
    let service = build_service(embedder, index.clone(), 1);

    let content = "The same handbook content submitted twice under one id.";
    let first = service.ingest_document(doc("doc-dup", content));
    wait_for_phase(&service, first, JobPhase::Indexed).await;
    let count_after_first = index.count().await.unwrap();

    let second = service.ingest_document(doc("doc-dup", content));
    wait_for_phase(&service, second, JobPhase::Indexed).await;

    assert_eq!(index.count().await.unwrap(), count_after_first);
    service.shutdown().await;
}

#[tokio::test]
async fn transient_embedding_failures_recover_within_the_job() {
    let embedder = Arc::new(MockEmbeddingProvider::new());
    let index = Arc::new(MemoryIndex::new());

    // Whole content fits one chunk; fail its first two embed calls.
    let content = "Printers live on floor three.";
    embedder.fail_times(content, 2);

    let service = build_service(embedder, index.clone(), 1);
    let job_id = service.ingest_document(doc("doc-printers", content));

    wait_for_phase(&service, job_id, JobPhase::Indexed).await;
    assert_eq!(index.count().await.unwrap(), 1);
    service.shutdown().await;
}

#[tokio::test]
async fn total_embedding_failure_marks_the_job_failed() {
    let embedder = Arc::new(MockEmbeddingProvider::new());
    let index = Arc::new(MemoryIndex::new());

    // Three attempts per job run; exhaust exactly the first run's budget.
    let content = "Unembeddable content.";
    embedder.fail_times(content, 3);

    let service = build_service(embedder.clone(), index.clone(), 1);
    let job_id = service.ingest_document(doc("doc-bad", content));

    wait_for_phase(&service, job_id, JobPhase::Failed).await;
    assert_eq!(index.count().await.unwrap(), 0);

    // A failed job is retryable; once the provider recovers it indexes.
    service.retry_job(job_id).unwrap();
    wait_for_phase(&service, job_id, JobPhase::Indexed).await;
    assert_eq!(index.count().await.unwrap(), 1);
    service.shutdown().await;
}

#[tokio::test]
async fn empty_document_indexes_with_zero_chunks() {
    let embedder = Arc::new(MockEmbeddingProvider::new());
    let index = Arc::new(MemoryIndex::new());
    let service = build_service(embedder.clone(), index.clone(), 1);

    let job_id = service.ingest_document(doc("doc-empty", "   \n\t "));
    wait_for_phase(&service, job_id, JobPhase::Indexed).await;

    assert_eq!(index.count().await.unwrap(), 0);
    assert_eq!(embedder.call_count(), 0);
    service.shutdown().await;
}

#[tokio::test]
async fn distinct_documents_index_in_parallel_without_interference() {
    let embedder = Arc::new(MockEmbeddingProvider::new());
    let index = Arc::new(MemoryIndex::new());
    let service = build_service(embedder, index.clone(), 4);

    let mut job_ids = Vec::new();
    for i in 0..6 {
        let content = format!("Document number {i} with its own distinct body of text.");
        job_ids.push(service.ingest_document(doc(&format!("doc-{i}"), &content)));
    }
    for job_id in job_ids {
        wait_for_phase(&service, job_id, JobPhase::Indexed).await;
    }

    assert!(index.count().await.unwrap() >= 6);
    service.shutdown().await;
}

#[tokio::test]
async fn unknown_job_id_has_no_phase() {
    let embedder = Arc::new(MockEmbeddingProvider::new());
    let index = Arc::new(MemoryIndex::new());
    let service = build_service(embedder, index, 1);

    assert_eq!(service.job_phase(loresmith::JobId::new()), None);
    service.shutdown().await;
}
