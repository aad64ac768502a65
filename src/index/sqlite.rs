//! SQLite-backed vector index using the `sqlite-vec` extension.
//!
//! Embeddings are stored as JSON float arrays and compared with
//! `vec_distance_cosine` at query time. Chunk ids are the primary key, so
//! `INSERT OR REPLACE` gives the idempotent upsert the ingestion pipeline
//! relies on.

use std::mem::transmute;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Once;

use async_trait::async_trait;
use tokio_rusqlite::{Connection, OptionalExtension, ffi};

use super::{ChunkRecord, ScoredChunk, VectorIndex};
use crate::types::LoreError;

const SELECT_COLUMNS: &str =
    "id, document_id, source_url, ordinal, content, metadata, embedding";

#[derive(Clone)]
pub struct SqliteIndex {
    conn: Connection,
}

impl SqliteIndex {
    /// Opens (or creates) the index at `path` and prepares the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LoreError> {
        Self::register_sqlite_vec()?;
        let conn = Connection::open(path)
            .await
            .map_err(|err| LoreError::Storage(err.to_string()))?;

        conn.call(|conn| {
            conn.query_row("select vec_version()", [], |row| row.get::<_, String>(0))
                .map_err(tokio_rusqlite::Error::<tokio_rusqlite::rusqlite::Error>::Error)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS chunks (
                     id TEXT PRIMARY KEY,
                     document_id TEXT NOT NULL,
                     source_url TEXT NOT NULL,
                     ordinal INTEGER NOT NULL,
                     content TEXT NOT NULL,
                     metadata TEXT NOT NULL,
                     embedding TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS chunks_document_idx ON chunks(document_id);",
            )
            .map_err(tokio_rusqlite::Error::<tokio_rusqlite::rusqlite::Error>::Error)?;
            Ok::<_, tokio_rusqlite::Error<tokio_rusqlite::rusqlite::Error>>(())
        })
        .await
        .map_err(|err| LoreError::Storage(err.to_string()))?;

        Ok(Self { conn })
    }

    fn register_sqlite_vec() -> Result<(), LoreError> {
        use std::sync::Mutex;

        static INIT: Once = Once::new();
        static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

        INIT.call_once(|| {
            let result = unsafe {
                type SqliteExtensionInit = unsafe extern "C" fn(
                    *mut ffi::sqlite3,
                    *mut *mut c_char,
                    *const ffi::sqlite3_api_routines,
                ) -> i32;

                let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
                let init_fn: SqliteExtensionInit =
                    transmute::<unsafe extern "C" fn(), SqliteExtensionInit>(init);
                let rc = ffi::sqlite3_auto_extension(Some(init_fn));
                if rc != 0 {
                    Err(format!(
                        "failed to register sqlite-vec extension (code {rc})"
                    ))
                } else {
                    Ok(())
                }
            };
            *INIT_RESULT.lock().expect("init result mutex poisoned") = Some(result);
        });

        INIT_RESULT
            .lock()
            .expect("init result mutex poisoned")
            .clone()
            .expect("init was called but result not set")
            .map_err(LoreError::Storage)
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), LoreError> {
        let rows: Vec<(ChunkRecord, String)> = chunks
            .into_iter()
            .filter_map(|chunk| {
                let embedding = chunk.embedding.as_ref()?;
                let encoded = serde_json::to_string(embedding).ok()?;
                Some((chunk, encoded))
            })
            .collect();
        if rows.is_empty() {
            return Ok(());
        }

        self.conn
            .call(move |conn| {
                let tx = conn.transaction().map_err(tokio_rusqlite::Error::<tokio_rusqlite::rusqlite::Error>::Error)?;
                {
                    let mut stmt = tx
                        .prepare(
                            "INSERT OR REPLACE INTO chunks \
                             (id, document_id, source_url, ordinal, content, metadata, embedding) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        )
                        .map_err(tokio_rusqlite::Error::<tokio_rusqlite::rusqlite::Error>::Error)?;
                    for (chunk, embedding) in rows {
                        stmt.execute((
                            chunk.id,
                            chunk.document_id,
                            chunk.source_url,
                            chunk.ordinal as i64,
                            chunk.content,
                            chunk.metadata.to_string(),
                            embedding,
                        ))
                        .map_err(tokio_rusqlite::Error::<tokio_rusqlite::rusqlite::Error>::Error)?;
                    }
                }
                tx.commit().map_err(tokio_rusqlite::Error::<tokio_rusqlite::rusqlite::Error>::Error)?;
                Ok::<_, tokio_rusqlite::Error<tokio_rusqlite::rusqlite::Error>>(())
            })
            .await
            .map_err(|err| LoreError::Storage(err.to_string()))
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<ChunkRecord>, LoreError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!("SELECT {SELECT_COLUMNS} FROM chunks WHERE id = ?1"))
                    .map_err(tokio_rusqlite::Error::<tokio_rusqlite::rusqlite::Error>::Error)?;

                stmt.query_row([&id], |row| {
                    let ordinal: i64 = row.get(3)?;
                    let metadata: String = row.get(5)?;
                    let embedding: String = row.get(6)?;
                    Ok(ChunkRecord {
                        id: row.get(0)?,
                        document_id: row.get(1)?,
                        source_url: row.get(2)?,
                        ordinal: ordinal as usize,
                        content: row.get(4)?,
                        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                        embedding: serde_json::from_str(&embedding).ok(),
                    })
                })
                .optional()
                .map_err(tokio_rusqlite::Error::<tokio_rusqlite::rusqlite::Error>::Error)
            })
            .await
            .map_err(|err| LoreError::Storage(err.to_string()))
    }

    async fn update_chunk(
        &self,
        id: &str,
        content: &str,
        embedding: Vec<f32>,
    ) -> Result<(), LoreError> {
        let id = id.to_string();
        let id_for_err = id.clone();
        let content = content.to_string();
        let encoded = serde_json::to_string(&embedding)?;

        let updated = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE chunks SET content = ?1, embedding = ?2 WHERE id = ?3",
                    (content, encoded, id),
                )
                .map_err(tokio_rusqlite::Error::<tokio_rusqlite::rusqlite::Error>::Error)
            })
            .await
            .map_err(|err| LoreError::Storage(err.to_string()))?;

        if updated == 0 {
            return Err(LoreError::ChunkNotFound {
                chunk_id: id_for_err,
            });
        }
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, LoreError> {
        let document_id = document_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM chunks WHERE document_id = ?1", [&document_id])
                    .map_err(tokio_rusqlite::Error::<tokio_rusqlite::rusqlite::Error>::Error)
            })
            .await
            .map_err(|err| LoreError::Storage(err.to_string()))
    }

    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<ScoredChunk>, LoreError> {
        let query_json = serde_json::to_string(query)?;
        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {SELECT_COLUMNS}, \
                         vec_distance_cosine(vec_f32(embedding), vec_f32(?1)) AS distance \
                         FROM chunks ORDER BY distance ASC LIMIT {top_k}"
                    ))
                    .map_err(tokio_rusqlite::Error::<tokio_rusqlite::rusqlite::Error>::Error)?;

                let rows = stmt
                    .query_map([&query_json], |row| {
                        let ordinal: i64 = row.get(3)?;
                        let metadata: String = row.get(5)?;
                        let embedding: String = row.get(6)?;
                        let distance: f32 = row.get(7)?;
                        Ok(ScoredChunk {
                            chunk: ChunkRecord {
                                id: row.get(0)?,
                                document_id: row.get(1)?,
                                source_url: row.get(2)?,
                                ordinal: ordinal as usize,
                                content: row.get(4)?,
                                metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                                embedding: serde_json::from_str(&embedding).ok(),
                            },
                            similarity: 1.0 - distance,
                        })
                    })
                    .map_err(tokio_rusqlite::Error::<tokio_rusqlite::rusqlite::Error>::Error)?;

                let mut results = Vec::new();
                for row in rows {
                    results.push(row.map_err(tokio_rusqlite::Error::<tokio_rusqlite::rusqlite::Error>::Error)?);
                }
                Ok::<_, tokio_rusqlite::Error<tokio_rusqlite::rusqlite::Error>>(results)
            })
            .await
            .map_err(|err| LoreError::Storage(err.to_string()))
    }

    async fn count(&self) -> Result<usize, LoreError> {
        self.conn
            .call(|conn| {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
                    .map_err(tokio_rusqlite::Error::<tokio_rusqlite::rusqlite::Error>::Error)?;
                Ok::<_, tokio_rusqlite::Error<tokio_rusqlite::rusqlite::Error>>(count as usize)
            })
            .await
            .map_err(|err| LoreError::Storage(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(doc: &str, ordinal: usize, content: &str, embedding: Vec<f32>) -> ChunkRecord {
        ChunkRecord::new(doc, "https://example.com/doc.pdf", ordinal, content)
            .with_embedding(embedding)
    }

    #[tokio::test]
    async fn upsert_and_search_round_trip() {
        let dir = tempdir().unwrap();
        let index = SqliteIndex::open(dir.path().join("chunks.db"))
            .await
            .unwrap();

        index
            .upsert_chunks(vec![
                record("doc-1", 0, "east", vec![1.0, 0.0]),
                record("doc-1", 1, "north", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = index.search(&[1.0, 0.0], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.content, "east");
    }

    #[tokio::test]
    async fn reupsert_does_not_duplicate() {
        let dir = tempdir().unwrap();
        let index = SqliteIndex::open(dir.path().join("chunks.db"))
            .await
            .unwrap();

        let chunk = record("doc-1", 0, "stable", vec![0.5, 0.5]);
        index.upsert_chunks(vec![chunk.clone()]).await.unwrap();
        index.upsert_chunks(vec![chunk]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_preserves_identity_and_count() {
        let dir = tempdir().unwrap();
        let index = SqliteIndex::open(dir.path().join("chunks.db"))
            .await
            .unwrap();

        let chunk = record("doc-1", 2, "old text", vec![1.0, 0.0]);
        let id = chunk.id.clone();
        index.upsert_chunks(vec![chunk]).await.unwrap();

        index
            .update_chunk(&id, "new text", vec![0.0, 1.0])
            .await
            .unwrap();

        let stored = index.get_chunk(&id).await.unwrap().unwrap();
        assert_eq!(stored.content, "new text");
        assert_eq!(stored.ordinal, 2);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_unknown_chunk_fails_and_changes_nothing() {
        let dir = tempdir().unwrap();
        let index = SqliteIndex::open(dir.path().join("chunks.db"))
            .await
            .unwrap();

        let err = index
            .update_chunk("nope", "text", vec![1.0])
            .await
            .unwrap_err();
        assert!(matches!(err, LoreError::ChunkNotFound { .. }));
        assert_eq!(index.count().await.unwrap(), 0);
    }
}
