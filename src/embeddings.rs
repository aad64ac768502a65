//! Embedding providers: text in, fixed-dimension vector out.
//!
//! The batch contract has partial-failure semantics: one bad chunk must not
//! block the rest, so `embed_batch` returns `None` at the failing position
//! instead of aborting. A dimensionality mismatch is the exception: a hard
//! failure for the whole batch, never silently accepted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::timeout;

use crate::config::ProviderConfig;
use crate::types::LoreError;

/// Converts text into fixed-dimension vectors.
///
/// Implementations must be idempotent: embedding the same input twice is
/// always safe and yields an equivalent result, so callers may retry freely.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text. Any failure is a typed error, never a silently
    /// empty vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LoreError>;

    /// Embed a batch of texts concurrently.
    ///
    /// A `None` at position `i` means embedding `i` failed without aborting
    /// the batch. Only batch-fatal conditions (dimension mismatch) surface
    /// as `Err`.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>, LoreError> {
        let calls = texts.iter().map(|text| self.embed(text));
        let results = futures_util::future::join_all(calls).await;
        let mut out = Vec::with_capacity(results.len());
        for (position, result) in results.into_iter().enumerate() {
            match result {
                Ok(vector) => out.push(Some(vector)),
                Err(err @ LoreError::DimensionMismatch { .. }) => return Err(err),
                Err(err) => {
                    tracing::warn!(position, error = %err, "embedding failed within batch");
                    out.push(None);
                }
            }
        }
        Ok(out)
    }

    /// Dimensionality of every vector this provider produces.
    fn dimensions(&self) -> usize;

    /// Model identifier, for logs and telemetry.
    fn model_name(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    model: &'a str,
    #[serde(rename = "inputText")]
    input_text: &'a str,
}

#[derive(Debug, Deserialize)]
struct InvokeResponse {
    embedding: Vec<f32>,
}

/// HTTP embedding provider speaking a Titan-style invoke protocol:
/// one `{"model", "inputText"}` request per text, `{"embedding": [...]}`
/// back. Batches fan out concurrently through the default `embed_batch`.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dims: usize,
    call_timeout: std::time::Duration,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.embedding_endpoint.clone(),
            model: config.embedding_model.clone(),
            api_key: config.api_key.clone(),
            dims: config.embedding_dimensions,
            call_timeout: config.embed_timeout,
        }
    }

    async fn invoke(&self, text: &str) -> Result<Vec<f32>, LoreError> {
        let url = format!("{}/invoke", self.endpoint.trim_end_matches('/'));
        let body = InvokeRequest {
            model: &self.model,
            input_text: text,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(LoreError::Upstream(format!(
                "embedding endpoint returned {status}: {detail}"
            )));
        }

        let parsed: InvokeResponse = response
            .json()
            .await
            .map_err(|err| LoreError::Upstream(format!("malformed embedding response: {err}")))?;
        Ok(parsed.embedding)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LoreError> {
        let vector = timeout(self.call_timeout, self.invoke(text))
            .await
            .map_err(|_| LoreError::Timeout {
                operation: "embedding call",
                seconds: self.call_timeout.as_secs(),
            })??;

        if vector.len() != self.dims {
            return Err(LoreError::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Deterministic in-process embedding provider for tests and offline runs.
///
/// Vectors are derived from a content hash, so identical text always embeds
/// identically and distinct texts diverge. Failures can be injected per text
/// to exercise retry paths.
pub struct MockEmbeddingProvider {
    dims: usize,
    pending_failures: Mutex<HashMap<String, u32>>,
    calls: AtomicUsize,
}

impl MockEmbeddingProvider {
    pub fn new() -> Self {
        Self::with_dimensions(8)
    }

    pub fn with_dimensions(dims: usize) -> Self {
        Self {
            dims,
            pending_failures: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Make the next `times` embed calls for `text` fail with an upstream
    /// error before succeeding again.
    pub fn fail_times(&self, text: impl Into<String>, times: u32) {
        self.pending_failures.lock().insert(text.into(), times);
    }

    /// Total number of embed calls observed.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut failures = self.pending_failures.lock();
            if let Some(remaining) = failures.get_mut(text) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(LoreError::Upstream(format!(
                        "injected embedding failure for '{}'",
                        text.chars().take(24).collect::<String>()
                    )));
                }
            }
        }

        let digest = Sha256::digest(text.as_bytes());
        let vector: Vec<f32> = digest
            .iter()
            .cycle()
            .take(self.dims)
            .map(|byte| (*byte as f32) / 255.0 - 0.5)
            .collect();
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "mock-embedder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embeddings_are_deterministic() {
        let provider = MockEmbeddingProvider::new();
        let a = provider.embed("hello world").await.unwrap();
        let b = provider.embed("hello world").await.unwrap();
        let c = provider.embed("goodbye world").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), provider.dimensions());
    }

    #[tokio::test]
    async fn batch_reports_partial_failures_as_none() {
        let provider = MockEmbeddingProvider::new();
        provider.fail_times("bad", 1);

        let texts = vec!["good".to_string(), "bad".to_string(), "fine".to_string()];
        let results = provider.embed_batch(&texts).await.unwrap();
        assert!(results[0].is_some());
        assert!(results[1].is_none());
        assert!(results[2].is_some());
    }

    #[tokio::test]
    async fn injected_failure_clears_after_exhaustion() {
        let provider = MockEmbeddingProvider::new();
        provider.fail_times("flaky", 2);

        assert!(provider.embed("flaky").await.is_err());
        assert!(provider.embed("flaky").await.is_err());
        assert!(provider.embed("flaky").await.is_ok());
    }
}
