//! Vector Store — per-user chunk embeddings with semantic search.
//!
//! The embedding backend and chunking algorithm are black boxes per the
//! spec this implements; this crate only changed its schema to key chunks
//! by a stable string `doc_id` (the same id the File Registry assigns)
//! instead of an integer row id, and to hold many chunks per document under
//! a per-user collection.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, Once};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fastembed::{EmbeddingModel, TextEmbedding, TextInitOptions};
use libsqlite3_sys::sqlite3_auto_extension;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, Row, SqlitePool};
use tokio::task;
use tracing::{instrument, warn};

use sqlite_vec::sqlite3_vec_init;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Clone)]
pub struct FastEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
}

impl FastEmbedder {
    pub fn new(model: EmbeddingModel, cache_dir: Option<PathBuf>) -> Result<Self> {
        let mut options = TextInitOptions::new(model);
        if let Some(dir) = cache_dir {
            options = options.with_cache_dir(dir);
        }
        let model = TextEmbedding::try_new(options)?;
        Ok(Self {
            model: Arc::new(Mutex::new(model)),
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = text.to_string();
        let model = self.model.clone();
        let embedding = task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| anyhow!("embedding model lock poisoned"))?;
            let mut embeddings = guard.embed(vec![text], None)?;
            if embeddings.is_empty() {
                return Err(anyhow!("embedding model returned empty result"));
            }
            Ok::<Vec<f32>, anyhow::Error>(embeddings.remove(0))
        })
        .await??;
        Ok(embedding)
    }
}

/// Deterministic fallback embedder used in tests and when no fastembed model
/// is reachable (offline CI, no cache dir).
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    pub dims: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dims: 256 }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vec = vec![0.0f32; self.dims];
        for token in text.split_whitespace() {
            let mut hash = 5381u64;
            for b in token.as_bytes() {
                hash = ((hash << 5).wrapping_add(hash)) ^ u64::from(*b);
            }
            let idx = (hash as usize) % self.dims;
            vec[idx] += 1.0;
        }
        normalize(&mut vec);
        Ok(vec)
    }
}

/// One chunk of one document, as stored and returned from search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: i64,
    pub user_id: String,
    pub doc_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub metadata: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub doc_id: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub score: f32,
}

/// One chunk to upsert, produced by the Ingestion Pipeline's chunker.
pub struct NewChunk<'a> {
    pub user_id: &'a str,
    pub doc_id: &'a str,
    pub chunk_index: i64,
    pub content: &'a str,
    pub metadata: serde_json::Value,
    pub embedding: &'a [f32],
}

#[derive(Clone)]
pub struct VectorStore {
    pool: SqlitePool,
    sqlite_vec_available: bool,
}

impl VectorStore {
    pub async fn new(db_path: &Path) -> Result<Self> {
        register_sqlite_vec();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str("sqlite:")?
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;
        let mut store = Self {
            pool,
            sqlite_vec_available: false,
        };
        store.init_schema().await?;
        store.sqlite_vec_available = store.detect_sqlite_vec().await.unwrap_or(false);
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[instrument(skip_all)]
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL,
                embedding TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, doc_id, chunk_index)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS chunks_user_doc ON chunks(user_id, doc_id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Upsert one chunk, keyed by `(user_id, doc_id, chunk_index)`. A
    /// re-ingested document overwrites its prior chunks one index at a time;
    /// callers that shrink a document's chunk count should follow with
    /// [`Self::delete_doc_chunks_from`].
    pub async fn upsert_chunk(&self, chunk: &NewChunk<'_>) -> Result<i64> {
        let metadata_json = serde_json::to_string(&chunk.metadata)?;
        let embedding_json = serde_json::to_string(chunk.embedding)?;
        let now = Utc::now();

        let row = sqlx::query(
            "INSERT INTO chunks (user_id, doc_id, chunk_index, content, metadata, embedding, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id, doc_id, chunk_index) DO UPDATE SET
                content = excluded.content,
                metadata = excluded.metadata,
                embedding = excluded.embedding,
                updated_at = excluded.updated_at
             RETURNING id",
        )
        .bind(chunk.user_id)
        .bind(chunk.doc_id)
        .bind(chunk.chunk_index)
        .bind(chunk.content)
        .bind(metadata_json)
        .bind(embedding_json)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    /// Drop any chunk at or past `from_index` for `doc_id` — used when a
    /// re-ingested document produced fewer chunks than its previous version.
    pub async fn delete_doc_chunks_from(&self, user_id: &str, doc_id: &str, from_index: i64) -> Result<()> {
        sqlx::query("DELETE FROM chunks WHERE user_id = ?1 AND doc_id = ?2 AND chunk_index >= ?3")
            .bind(user_id)
            .bind(doc_id)
            .bind(from_index)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_doc(&self, user_id: &str, doc_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks WHERE user_id = ?1 AND doc_id = ?2")
            .bind(user_id)
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete every chunk for `user_id` whose `doc_id` is not in
    /// `valid_doc_ids` — the coherence invariant between the Registry and
    /// the Vector Store (a provider reset, or a registry entry pruned out
    /// from under a stale chunk).
    pub async fn scrub_orphaned(&self, user_id: &str, valid_doc_ids: &HashSet<String>) -> Result<()> {
        let rows = sqlx::query("SELECT DISTINCT doc_id FROM chunks WHERE user_id = ?1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let doc_id: String = row.try_get("doc_id")?;
            if !valid_doc_ids.contains(&doc_id) {
                self.delete_doc(user_id, &doc_id).await?;
            }
        }
        Ok(())
    }

    pub async fn count_for_user(&self, user_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT doc_id) FROM chunks WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn list_user_chunks(&self, user_id: &str) -> Result<Vec<(String, String, serde_json::Value, Vec<f32>)>> {
        let rows = sqlx::query("SELECT doc_id, content, metadata, embedding FROM chunks WHERE user_id = ?1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let metadata_json: String = row.try_get("metadata")?;
                let embedding_json: String = row.try_get("embedding")?;
                Ok((
                    row.try_get("doc_id")?,
                    row.try_get("content")?,
                    serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
                    serde_json::from_str(&embedding_json).unwrap_or_default(),
                ))
            })
            .collect()
    }

    pub async fn search_semantic<E: Embedder + ?Sized>(
        &self,
        embedder: &E,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let query_embedding = embedder.embed(query).await?;
        self.search_with_embedding(user_id, &query_embedding, limit).await
    }

    pub async fn search_with_embedding(
        &self,
        user_id: &str,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        if self.sqlite_vec_available {
            if let Ok(hits) = self.search_with_embedding_sqlite_vec(user_id, query_embedding, limit).await {
                return Ok(hits);
            }
        }

        let chunks = self.list_user_chunks(user_id).await?;
        let mut scored: Vec<SearchHit> = chunks
            .into_iter()
            .map(|(doc_id, content, metadata, embedding)| {
                let score = cosine_similarity(query_embedding, &embedding);
                SearchHit { doc_id, content, metadata, score }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn detect_sqlite_vec(&self) -> Result<bool> {
        let version = sqlx::query_scalar::<_, String>("SELECT vec_version()").fetch_one(&self.pool).await;
        Ok(version.is_ok())
    }

    async fn search_with_embedding_sqlite_vec(
        &self,
        user_id: &str,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let payload = serde_json::to_string(query_embedding)?;
        let rows = sqlx::query(
            "SELECT doc_id, content, metadata,
                    (1.0 - vec_distance_cosine(vec_f32(?1), vec_f32(embedding))) as score
             FROM chunks WHERE user_id = ?2 ORDER BY score DESC LIMIT ?3",
        )
        .bind(payload)
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let metadata_json: String = row.try_get("metadata")?;
                Ok(SearchHit {
                    doc_id: row.try_get("doc_id")?,
                    content: row.try_get("content")?,
                    metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
                    score: row.try_get("score")?,
                })
            })
            .collect()
    }
}

fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for i in 0..len {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub fn embedder_from_env() -> Result<Arc<dyn Embedder>> {
    let backend = std::env::var("RELAY_EMBED_BACKEND").unwrap_or_else(|_| "fastembed".to_string());
    if backend.eq_ignore_ascii_case("hash") {
        return Ok(Arc::new(HashEmbedder::default()));
    }

    let model_name = std::env::var("RELAY_EMBED_MODEL").unwrap_or_else(|_| "nomic-embed-text-v1.5".to_string());
    let model = EmbeddingModel::from_str(&model_name).unwrap_or(EmbeddingModel::NomicEmbedTextV15);
    let cache_dir = std::env::var("RELAY_EMBED_CACHE_DIR").ok().map(PathBuf::from);
    let embedder = FastEmbedder::new(model, cache_dir)?;
    Ok(Arc::new(embedder))
}

pub fn embedder_from_env_or_hash() -> Arc<dyn Embedder> {
    match embedder_from_env() {
        Ok(embedder) => embedder,
        Err(err) => {
            warn!("fast embedding unavailable, falling back to hash embedder: {}", err);
            Arc::new(HashEmbedder::default())
        }
    }
}

fn register_sqlite_vec() {
    static INIT: Once = Once::new();
    INIT.call_once(|| unsafe {
        let _ = sqlite3_auto_extension(Some(std::mem::transmute(sqlite3_vec_init as *const ())));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> VectorStore {
        register_sqlite_vec();
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await.unwrap();
        let store = VectorStore { pool, sqlite_vec_available: false };
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn upsert_then_search_ranks_by_similarity() {
        let store = test_store().await;
        let embedder = HashEmbedder::default();

        store
            .upsert_chunk(&NewChunk {
                user_id: "u1",
                doc_id: "doc-a",
                chunk_index: 0,
                content: "the quarterly lease renewal terms",
                metadata: serde_json::json!({}),
                embedding: &embedder.embed("the quarterly lease renewal terms").await.unwrap(),
            })
            .await
            .unwrap();
        store
            .upsert_chunk(&NewChunk {
                user_id: "u1",
                doc_id: "doc-b",
                chunk_index: 0,
                content: "a recipe for banana bread",
                metadata: serde_json::json!({}),
                embedding: &embedder.embed("a recipe for banana bread").await.unwrap(),
            })
            .await
            .unwrap();

        let hits = store.search_semantic(&embedder, "u1", "lease renewal", 5).await.unwrap();
        assert_eq!(hits[0].doc_id, "doc-a");
    }

    #[tokio::test]
    async fn scrub_orphaned_removes_chunks_not_in_registry() {
        let store = test_store().await;
        let embedding = vec![0.1f32; 4];
        store
            .upsert_chunk(&NewChunk {
                user_id: "u1",
                doc_id: "keep",
                chunk_index: 0,
                content: "kept",
                metadata: serde_json::json!({}),
                embedding: &embedding,
            })
            .await
            .unwrap();
        store
            .upsert_chunk(&NewChunk {
                user_id: "u1",
                doc_id: "drop",
                chunk_index: 0,
                content: "dropped",
                metadata: serde_json::json!({}),
                embedding: &embedding,
            })
            .await
            .unwrap();

        let mut valid = HashSet::new();
        valid.insert("keep".to_string());
        store.scrub_orphaned("u1", &valid).await.unwrap();

        assert_eq!(store.count_for_user("u1").await.unwrap(), 1);
    }
}
