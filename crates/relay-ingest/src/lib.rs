//! Ingestion Pipeline (C5) — fetch, dedupe, chunk, and persist.
//!
//! This crate owns the dedupe/chunk/persist half of a sync pull. Fetching
//! is the adapter's job (relay-providers implements [`EmailSource`]); the
//! pipeline only knows how to turn whatever the adapter yields into rows in
//! the Content Store, entries in the File Registry, and chunks in the
//! Vector Store.

mod chunk;
pub mod doc_id;

pub use chunk::{chunk_text, TextChunk};
pub use doc_id::{canonical_attachment_path, canonical_email_path, canonical_file_path, CanonicalSource};
pub use relay_store::{EmailFolder, SourceType};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_registry::FileRegistry;
use relay_store::{ContentStore, NewEmail, SyncStatusValue};
use relay_vector::{Embedder, NewChunk, VectorStore};
use tracing::{info, instrument, warn};
use uuid::Uuid;

const MIN_BODY_LEN: usize = 100;

/// Senders whose mail is never persisted, regardless of source — ported from
/// `ingest_mbox.py`'s `senderAvoidList`. Enforced once here, in the one place
/// every adapter's output passes through, rather than duplicated per adapter.
const SENDER_AVOID_LIST: &[&str] = &[
    "no-reply@ilucca.net",
    "no-reply-powerbi@microsoft.com",
    "no-reply@microsoft.com",
    "no-reply@app-notifs.gymlib.com",
    "hello@supermood.co",
    "noreply@eu.ecoonline.net",
    "noreply@notilus-tne.cegid.cloud",
    "noreply@wetransfer.com",
];

/// Spam filter: avoid-listed sender, or a body too short to be real content.
fn is_spam(raw: &RawEmail) -> bool {
    SENDER_AVOID_LIST.iter().any(|blocked| raw.sender.eq_ignore_ascii_case(blocked)) || raw.body_text.chars().count() < MIN_BODY_LEN
}

/// One message as normalized by a provider adapter, ready for dedupe.
#[derive(Debug, Clone)]
pub struct RawEmail {
    pub provider_item_id: String,
    pub conversation_id: String,
    pub internet_message_id: Option<String>,
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub body_text: String,
    pub sent_date: DateTime<Utc>,
    pub folder: EmailFolder,
    pub attachments: Vec<RawAttachment>,
}

#[derive(Debug, Clone)]
pub struct RawAttachment {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// A lazy source of messages for one `(user, provider)` pull. Implemented by
/// provider adapters; `next_batch` returns an empty `Vec` when exhausted.
#[async_trait]
pub trait EmailSource: Send {
    async fn next_batch(&mut self) -> Result<Vec<RawEmail>>;
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PullResult {
    pub success: bool,
    pub total_items_found: usize,
    pub items_ingested: usize,
    pub items_skipped: usize,
    pub batches: usize,
    pub errors: Vec<String>,
    pub duration: Duration,
}

struct PendingItem {
    path: String,
    doc_id: String,
    conversation_id: String,
    metadata: serde_json::Value,
    body_text: String,
}

pub struct Pipeline {
    content_store: ContentStore,
    registry: FileRegistry,
    vector_store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    data_root: PathBuf,
}

impl Pipeline {
    pub fn new(
        content_store: ContentStore,
        registry: FileRegistry,
        vector_store: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        data_root: PathBuf,
    ) -> Self {
        Self { content_store, registry, vector_store, embedder, data_root }
    }

    /// Run one pull for `(user_id, source)`, batching at `batch_size` items
    /// (default 20). `provider_id` identifies the remote
    /// account/connection for doc-id hashing; `canonical_source` and
    /// `source_type` select the path prefix and the Content Store's
    /// `source_type` column.
    #[instrument(skip(self, source), fields(user_id, provider_id))]
    pub async fn pull_emails(
        &self,
        user_id: &str,
        provider_id: &str,
        canonical_source: CanonicalSource,
        source_type: SourceType,
        mut source: Box<dyn EmailSource + '_>,
        batch_size: usize,
        force_reingest: bool,
    ) -> Result<PullResult> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let temp_dir = self.data_root.join("tmp").join(user_id).join(run_id.to_string());
        tokio::fs::create_dir_all(&temp_dir).await?;

        let mut total_items_found = 0usize;
        let mut items_ingested = 0usize;
        let mut items_skipped = 0usize;
        let mut batches = 0usize;
        let mut errors = Vec::new();
        let mut batch: Vec<PendingItem> = Vec::new();

        loop {
            let yielded = source.next_batch().await?;
            if yielded.is_empty() {
                break;
            }

            for raw in yielded {
                if is_spam(&raw) {
                    continue;
                }
                total_items_found += 1;

                let doc_id = match &raw.internet_message_id {
                    Some(imid) => doc_id::mbox_email_doc_id(
                        provider_id,
                        raw.subject.as_deref().unwrap_or(""),
                        raw.sent_date,
                        &raw.sender,
                        &raw.body_text,
                        imid,
                    ),
                    None => doc_id::email_doc_id(
                        provider_id,
                        raw.subject.as_deref().unwrap_or(""),
                        raw.sent_date,
                        &raw.sender,
                        &raw.body_text,
                    ),
                };

                let path = canonical_email_path(canonical_source, user_id, &raw.conversation_id, &doc_id);

                if !force_reingest && self.registry.file_exists(&path).await {
                    items_skipped += 1;
                    continue;
                }

                let metadata = serde_json::json!({
                    "email_id": raw.provider_item_id,
                    "conversation_id": raw.conversation_id,
                    "subject": raw.subject,
                    "sender": raw.sender,
                    "sent_date": raw.sent_date,
                });

                self.content_store
                    .emails()
                    .save(&NewEmail {
                        user_id,
                        email_id: &raw.provider_item_id,
                        conversation_id: Some(&raw.conversation_id),
                        sender: &raw.sender,
                        recipients: &raw.recipients,
                        subject: raw.subject.as_deref(),
                        body_text: &raw.body_text,
                        sent_date: raw.sent_date,
                        folder: raw.folder,
                        source_type,
                    })
                    .await?;

                let temp_path = temp_dir.join(format!("{doc_id}.txt"));
                tokio::fs::write(&temp_path, &raw.body_text).await?;

                for attachment in &raw.attachments {
                    let attachment_path =
                        canonical_attachment_path(canonical_source, user_id, &raw.conversation_id, &attachment.filename);
                    let attachment_temp = temp_dir.join(sanitize_filename(&attachment.filename));
                    tokio::fs::write(&attachment_temp, &attachment.bytes).await?;
                    // Attachments are registered as their own entries but are not
                    // chunked/embedded — only message bodies feed the chunker.
                    self.registry
                        .register(&attachment_path, &doc_id, serde_json::json!({"filename": attachment.filename}))
                        .await?;
                }

                batch.push(PendingItem {
                    path,
                    doc_id,
                    conversation_id: raw.conversation_id.clone(),
                    metadata,
                    body_text: raw.body_text.clone(),
                });

                if batch.len() >= batch_size {
                    let flushed = self.flush_batch(user_id, std::mem::take(&mut batch)).await;
                    items_ingested += flushed.ingested;
                    errors.extend(flushed.errors);
                    batches += 1;
                    self.report_progress(user_id, source_type, total_items_found, items_ingested, errors.len()).await;
                }
            }
        }

        if !batch.is_empty() {
            let flushed = self.flush_batch(user_id, batch).await;
            items_ingested += flushed.ingested;
            errors.extend(flushed.errors);
            batches += 1;
            self.report_progress(user_id, source_type, total_items_found, items_ingested, errors.len()).await;
        }

        tokio::fs::remove_dir_all(&temp_dir).await.ok();

        let result = PullResult {
            success: errors.is_empty(),
            total_items_found,
            items_ingested,
            items_skipped,
            batches,
            errors,
            duration: started.elapsed(),
        };
        info!(
            total = result.total_items_found,
            ingested = result.items_ingested,
            skipped = result.items_skipped,
            "pull complete"
        );
        Ok(result)
    }

    /// Upserts an `in_progress` `SyncStatus` row after every batch flush
    /// (§4.5 step 3). `total_documents` tracks items scanned so far rather
    /// than a true upfront total — `EmailSource` yields lazily and never
    /// reports a total ahead of completion.
    async fn report_progress(&self, user_id: &str, source_type: SourceType, processed: usize, succeeded: usize, failed: usize) {
        let result = self
            .content_store
            .sync_status()
            .upsert(&SyncStatusValue {
                user_id,
                source_type: source_type.as_str(),
                status: "in_progress",
                items_processed: processed as i64,
                items_succeeded: succeeded as i64,
                items_failed: failed as i64,
                total_documents: processed as i64,
                last_successful_sync: None,
                error_details: None,
                metadata: serde_json::json!({}),
            })
            .await;

        if let Err(e) = result {
            warn!(user_id, source_type = source_type.as_str(), error = %e, "failed to persist in-progress SyncStatus");
        }
    }

    async fn flush_batch(&self, user_id: &str, items: Vec<PendingItem>) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        let mut registry_items = Vec::new();
        let mut retry: Vec<PendingItem> = Vec::new();

        for item in items {
            match self.chunk_and_index(user_id, &item).await {
                Ok(()) => {
                    registry_items.push((item.path, item.doc_id, item.metadata));
                    outcome.ingested += 1;
                }
                Err(e) => {
                    warn!("chunk/index failed for {}, retrying once: {}", item.doc_id, e);
                    retry.push(item);
                }
            }
        }

        for item in retry {
            match self.chunk_and_index(user_id, &item).await {
                Ok(()) => {
                    registry_items.push((item.path, item.doc_id, item.metadata));
                    outcome.ingested += 1;
                }
                Err(e) => {
                    outcome.errors.push(format!("{}: {}", item.doc_id, e));
                }
            }
        }

        if let Err(e) = self.registry.register_batch(&registry_items).await {
            outcome.errors.push(format!("registry flush failed: {e}"));
        }

        outcome
    }

    async fn chunk_and_index(&self, user_id: &str, item: &PendingItem) -> Result<()> {
        let chunks = chunk_text(&item.body_text);
        for chunk in &chunks {
            let embedding = self.embedder.embed(&chunk.text).await?;
            self.vector_store
                .upsert_chunk(&NewChunk {
                    user_id,
                    doc_id: &item.doc_id,
                    chunk_index: chunk.index as i64,
                    content: &chunk.text,
                    metadata: serde_json::json!({
                        "conversation_id": item.conversation_id,
                    }),
                    embedding: &embedding,
                })
                .await?;
        }
        self.vector_store.delete_doc_chunks_from(user_id, &item.doc_id, chunks.len() as i64).await?;
        Ok(())
    }

    /// Delete all documents and chunks sourced from `provider_id`, and scrub
    /// any embeddings left behind. Used when a user disconnects a provider.
    pub async fn reset_provider(&self, user_id: &str, registry_prefix: &str) -> Result<()> {
        let entries = self.registry.list_by_prefix(registry_prefix).await;
        let valid: HashSet<String> = entries.iter().map(|(_, e)| e.doc_id.clone()).collect();
        self.vector_store.scrub_orphaned(user_id, &valid).await?;
        Ok(())
    }
}

#[derive(Default)]
struct FlushOutcome {
    ingested: usize,
    errors: Vec<String>,
}

fn sanitize_filename(name: &str) -> String {
    name.chars().map(|c| if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_vector::HashEmbedder;
    use std::sync::Mutex;

    struct FixedSource {
        batches: Mutex<Vec<Vec<RawEmail>>>,
    }

    #[async_trait]
    impl EmailSource for FixedSource {
        async fn next_batch(&mut self) -> Result<Vec<RawEmail>> {
            Ok(self.batches.lock().unwrap().pop().unwrap_or_default())
        }
    }

    fn sample_email(id: &str, conv: &str, body: &str) -> RawEmail {
        RawEmail {
            provider_item_id: id.to_string(),
            conversation_id: conv.to_string(),
            internet_message_id: None,
            sender: "a@example.com".to_string(),
            recipients: vec!["b@example.com".to_string()],
            subject: Some("hello".to_string()),
            body_text: body.to_string(),
            sent_date: Utc::now(),
            folder: EmailFolder::Inbox,
            attachments: Vec::new(),
        }
    }

    async fn test_pipeline(temp_root: &std::path::Path) -> Pipeline {
        let db_path = temp_root.join("content.sqlite3");
        let vec_path = temp_root.join("vectors.sqlite3");
        let content_store = ContentStore::new(&db_path).await.unwrap();
        let registry = FileRegistry::load(&temp_root.join("registry"), "u1").await.unwrap();
        let vector_store = Arc::new(VectorStore::new(&vec_path).await.unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
        Pipeline::new(content_store, registry, vector_store, embedder, temp_root.to_path_buf())
    }

    #[tokio::test]
    async fn pull_ingests_then_skips_on_second_run() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path()).await;

        let first_batch = vec![sample_email("e1", "c1", "hello world"), sample_email("e2", "c1", "goodbye world")];
        let source = Box::new(FixedSource { batches: Mutex::new(vec![vec![], first_batch]) });

        let result = pipeline
            .pull_emails("u1", "acct1", CanonicalSource::GoogleEmail, SourceType::GoogleEmail, source, 20, false)
            .await
            .unwrap();

        assert_eq!(result.items_ingested, 2);
        assert_eq!(result.items_skipped, 0);
        assert!(result.success);

        let second_batch = vec![sample_email("e1", "c1", "hello world"), sample_email("e2", "c1", "goodbye world")];
        let source = Box::new(FixedSource { batches: Mutex::new(vec![vec![], second_batch]) });
        let result = pipeline
            .pull_emails("u1", "acct1", CanonicalSource::GoogleEmail, SourceType::GoogleEmail, source, 20, false)
            .await
            .unwrap();

        assert_eq!(result.items_ingested, 0);
        assert_eq!(result.items_skipped, 2);
    }

    #[tokio::test]
    async fn avoid_listed_sender_and_short_body_never_reach_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path()).await;

        let mut spam = sample_email("e1", "c1", &"x".repeat(150));
        spam.sender = "no-reply@microsoft.com".to_string();
        let short = sample_email("e2", "c1", "too short");
        let real = sample_email("e3", "c1", &"y".repeat(150));

        let source = Box::new(FixedSource { batches: Mutex::new(vec![vec![], vec![spam, short, real]]) });
        let result = pipeline
            .pull_emails("u1", "acct1", CanonicalSource::GoogleEmail, SourceType::GoogleEmail, source, 20, false)
            .await
            .unwrap();

        assert_eq!(result.total_items_found, 1);
        assert_eq!(result.items_ingested, 1);
        assert!(pipeline.content_store.emails().search_by_user("u1", 10).await.unwrap().iter().all(|e| e.email_id == "e3"));
    }

    #[tokio::test]
    async fn force_reingest_bypasses_registry_skip() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path()).await;

        for force in [false, true] {
            let batch = vec![sample_email("e1", "c1", "hello world")];
            let source = Box::new(FixedSource { batches: Mutex::new(vec![vec![], batch]) });
            let result = pipeline
                .pull_emails("u1", "acct1", CanonicalSource::GoogleEmail, SourceType::GoogleEmail, source, 20, force)
                .await
                .unwrap();
            if force {
                assert_eq!(result.items_ingested, 1);
            }
        }
    }
}
