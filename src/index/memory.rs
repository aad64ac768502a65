//! In-memory vector index with exact cosine search.
//!
//! Suitable for tests and small single-process deployments. Concurrency is
//! a read/write lock over the chunk map; reads never block each other.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ChunkRecord, ScoredChunk, VectorIndex};
use crate::types::LoreError;

#[derive(Default)]
pub struct MemoryIndex {
    chunks: RwLock<HashMap<String, ChunkRecord>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), LoreError> {
        let mut guard = self.chunks.write();
        for chunk in chunks {
            if chunk.embedding.is_none() {
                tracing::debug!(chunk_id = %chunk.id, "skipping chunk without embedding");
                continue;
            }
            guard.insert(chunk.id.clone(), chunk);
        }
        Ok(())
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<ChunkRecord>, LoreError> {
        Ok(self.chunks.read().get(id).cloned())
    }

    async fn update_chunk(
        &self,
        id: &str,
        content: &str,
        embedding: Vec<f32>,
    ) -> Result<(), LoreError> {
        let mut guard = self.chunks.write();
        let chunk = guard.get_mut(id).ok_or_else(|| LoreError::ChunkNotFound {
            chunk_id: id.to_string(),
        })?;
        chunk.content = content.to_string();
        chunk.embedding = Some(embedding);
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, LoreError> {
        let mut guard = self.chunks.write();
        let before = guard.len();
        guard.retain(|_, chunk| chunk.document_id != document_id);
        Ok(before - guard.len())
    }

    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<ScoredChunk>, LoreError> {
        let guard = self.chunks.read();
        let mut scored: Vec<ScoredChunk> = guard
            .values()
            .filter_map(|chunk| {
                let embedding = chunk.embedding.as_ref()?;
                Some(ScoredChunk {
                    chunk: chunk.clone(),
                    similarity: cosine_similarity(embedding, query),
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn count(&self) -> Result<usize, LoreError> {
        Ok(self.chunks.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(doc: &str, ordinal: usize, content: &str, embedding: Vec<f32>) -> ChunkRecord {
        ChunkRecord::new(doc, "https://example.com/src", ordinal, content)
            .with_embedding(embedding)
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_id() {
        let index = MemoryIndex::new();
        let chunk = record("doc-1", 0, "first", vec![1.0, 0.0]);
        index.upsert_chunks(vec![chunk.clone()]).await.unwrap();
        index.upsert_chunks(vec![chunk]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn search_orders_by_similarity() {
        let index = MemoryIndex::new();
        index
            .upsert_chunks(vec![
                record("doc-1", 0, "east", vec![1.0, 0.0]),
                record("doc-1", 1, "north", vec![0.0, 1.0]),
                record("doc-1", 2, "northeast", vec![0.7, 0.7]),
            ])
            .await
            .unwrap();

        let hits = index.search(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.content, "east");
        assert_eq!(hits[1].chunk.content, "northeast");
        assert!(hits[0].similarity >= hits[1].similarity);
    }

    #[tokio::test]
    async fn update_replaces_in_place() {
        let index = MemoryIndex::new();
        let chunk = record("doc-1", 0, "stale answer", vec![1.0, 0.0]);
        let id = chunk.id.clone();
        index.upsert_chunks(vec![chunk]).await.unwrap();

        index
            .update_chunk(&id, "fresh answer", vec![0.0, 1.0])
            .await
            .unwrap();

        let stored = index.get_chunk(&id).await.unwrap().unwrap();
        assert_eq!(stored.content, "fresh answer");
        assert_eq!(stored.ordinal, 0);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_of_unknown_chunk_is_not_found() {
        let index = MemoryIndex::new();
        let err = index
            .update_chunk("missing", "text", vec![1.0])
            .await
            .unwrap_err();
        assert!(matches!(err, LoreError::ChunkNotFound { .. }));
    }

    #[tokio::test]
    async fn delete_document_removes_only_that_document() {
        let index = MemoryIndex::new();
        index
            .upsert_chunks(vec![
                record("doc-1", 0, "a", vec![1.0, 0.0]),
                record("doc-1", 1, "b", vec![0.0, 1.0]),
                record("doc-2", 0, "c", vec![0.5, 0.5]),
            ])
            .await
            .unwrap();

        let removed = index.delete_document("doc-1").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn chunks_without_embeddings_are_skipped() {
        let index = MemoryIndex::new();
        let chunk = ChunkRecord::new("doc-1", "https://example.com", 0, "no vector");
        index.upsert_chunks(vec![chunk]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
    }
}
