//! File Registry (C3) — the per-user idempotence ledger.
//!
//! One JSON file per user under `<data_root>/registry/<user_id>.json`,
//! holding a map of canonical source path -> [`RegistryEntry`]. The whole
//! file is loaded into memory at the start of a sync run and flushed back
//! via temp-file-plus-rename at the end of each batch, matching §4.3's
//! "loaded into memory at start of a sync run; writes are buffered and
//! flushed at the end of each batch."

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::instrument;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryEntry {
    pub doc_id: String,
    pub provider_id: Option<String>,
    pub ingested_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// One user's registry file, held in memory for the duration of a sync run.
///
/// Cheaply [`Clone`]-able: the map lives behind an `Arc<Mutex<_>>` so a
/// single [`FileRegistry`] can be shared across the pipeline and the
/// classifier/action-executor stages that also touch it within one run.
#[derive(Clone)]
pub struct FileRegistry {
    path: PathBuf,
    entries: Arc<Mutex<HashMap<String, RegistryEntry>>>,
}

impl FileRegistry {
    /// Load (or initialize empty) the registry for one user.
    #[instrument(skip_all, fields(user_id))]
    pub async fn load(registry_root: &Path, user_id: &str) -> Result<Self> {
        std::fs::create_dir_all(registry_root)
            .with_context(|| format!("creating registry dir {:?}", registry_root))?;
        let path = registry_root.join(format!("{user_id}.json"));

        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e).context("reading registry file"),
        };

        Ok(FileRegistry {
            path,
            entries: Arc::new(Mutex::new(entries)),
        })
    }

    pub async fn file_exists(&self, path: &str) -> bool {
        self.entries.lock().await.contains_key(path)
    }

    pub async fn lookup(&self, path: &str) -> Option<RegistryEntry> {
        self.entries.lock().await.get(path).cloned()
    }

    /// Upsert one entry and flush the whole registry to disk.
    pub async fn register(&self, path: &str, doc_id: &str, metadata: serde_json::Value) -> Result<()> {
        {
            let mut entries = self.entries.lock().await;
            entries.insert(
                path.to_string(),
                RegistryEntry {
                    doc_id: doc_id.to_string(),
                    provider_id: None,
                    ingested_at: Utc::now(),
                    metadata,
                },
            );
        }
        self.flush().await
    }

    /// Batch variant of [`Self::register`]: applies every entry, then
    /// flushes once. This is what [`crate`]'s pipeline callers use at the
    /// end of a `FlushBatch` so one sync batch costs one disk write.
    pub async fn register_batch(&self, items: &[(String, String, serde_json::Value)]) -> Result<()> {
        {
            let mut entries = self.entries.lock().await;
            for (path, doc_id, metadata) in items {
                entries.insert(
                    path.clone(),
                    RegistryEntry {
                        doc_id: doc_id.clone(),
                        provider_id: None,
                        ingested_at: Utc::now(),
                        metadata: metadata.clone(),
                    },
                );
            }
        }
        self.flush().await
    }

    /// Update `metadata.email_id == email_id` on every matching entry. Used
    /// after classification persists a result (§4.7 side effects).
    pub async fn update_email_classification(&self, email_id: &str, classified_action: &str) -> Result<()> {
        {
            let mut entries = self.entries.lock().await;
            for entry in entries.values_mut() {
                if entry.metadata.get("email_id").and_then(|v| v.as_str()) == Some(email_id) {
                    if let Some(obj) = entry.metadata.as_object_mut() {
                        obj.insert(
                            "classified_action".to_string(),
                            serde_json::Value::String(classified_action.to_string()),
                        );
                    }
                }
            }
        }
        self.flush().await
    }

    pub async fn list_by_prefix(&self, prefix: &str) -> Vec<(String, RegistryEntry)> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, entry)| (path.clone(), entry.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn flush(&self) -> Result<()> {
        let entries = self.entries.lock().await;
        let json = serde_json::to_vec_pretty(&*entries)?;
        drop(entries);

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_lookup_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::load(dir.path(), "u1").await.unwrap();
        registry
            .register("/google_email/u1/c1/abc", "abc", serde_json::json!({"subject": "hi"}))
            .await
            .unwrap();

        let entry = registry.lookup("/google_email/u1/c1/abc").await.unwrap();
        assert_eq!(entry.doc_id, "abc");
        assert!(registry.file_exists("/google_email/u1/c1/abc").await);
        assert!(!registry.file_exists("/google_email/u1/c1/other").await);
    }

    #[tokio::test]
    async fn persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = FileRegistry::load(dir.path(), "u1").await.unwrap();
            registry.register("/mbox/u1/c1/x", "x", serde_json::json!({})).await.unwrap();
        }
        let reloaded = FileRegistry::load(dir.path(), "u1").await.unwrap();
        assert!(reloaded.file_exists("/mbox/u1/c1/x").await);
    }

    #[tokio::test]
    async fn update_email_classification_touches_matching_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::load(dir.path(), "u1").await.unwrap();
        registry
            .register("/google_email/u1/c1/a", "a", serde_json::json!({"email_id": "e1"}))
            .await
            .unwrap();
        registry
            .register("/google_email/u1/c1/b", "b", serde_json::json!({"email_id": "e2"}))
            .await
            .unwrap();

        registry.update_email_classification("e1", "forward").await.unwrap();

        let a = registry.lookup("/google_email/u1/c1/a").await.unwrap();
        let b = registry.lookup("/google_email/u1/c1/b").await.unwrap();
        assert_eq!(a.metadata["classified_action"], "forward");
        assert!(b.metadata.get("classified_action").is_none());
    }

    #[tokio::test]
    async fn registry_uniqueness_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::load(dir.path(), "u1").await.unwrap();
        registry.register("/mbox/u1/c1/x", "v1", serde_json::json!({})).await.unwrap();
        registry.register("/mbox/u1/c1/x", "v2", serde_json::json!({})).await.unwrap();
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.lookup("/mbox/u1/c1/x").await.unwrap().doc_id, "v2");
    }
}
