//! Content Store (C4) — typed repositories over a SQLite database.
//!
//! Each repository exposes CRUD plus the handful of domain methods the
//! Ingestion Pipeline, Classifier, and Action Executor need. Every write is
//! its own transaction; there is deliberately no cross-repository
//! transaction (§4.4).

mod emails;
mod peripheral;
mod provider_changes;
mod sync_status;

pub use emails::{Email, EmailFolder, Emails, NewEmail, SourceType};
pub use peripheral::{ChatMessages, Conversations, StyleAnalyses, UserPreferences};
pub use provider_changes::{ChangeType, ProviderChange, ProviderChanges};
pub use sync_status::{SyncStatus, SyncStatusRepo, SyncStatusValue};

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, SqlitePool};
use tracing::instrument;

#[derive(Clone)]
pub struct ContentStore {
    pool: SqlitePool,
}

impl ContentStore {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str("sqlite:")?
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(8).connect_with(options).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn emails(&self) -> Emails<'_> {
        Emails::new(&self.pool)
    }

    pub fn sync_status(&self) -> SyncStatusRepo<'_> {
        SyncStatusRepo::new(&self.pool)
    }

    pub fn provider_changes(&self) -> ProviderChanges<'_> {
        ProviderChanges::new(&self.pool)
    }

    pub fn user_preferences(&self) -> UserPreferences<'_> {
        UserPreferences::new(&self.pool)
    }

    pub fn conversations(&self) -> Conversations<'_> {
        Conversations::new(&self.pool)
    }

    pub fn chat_messages(&self) -> ChatMessages<'_> {
        ChatMessages::new(&self.pool)
    }

    pub fn style_analyses(&self) -> StyleAnalyses<'_> {
        StyleAnalyses::new(&self.pool)
    }

    #[instrument(skip_all)]
    async fn init_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL;").execute(&self.pool).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS emails (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                email_id TEXT NOT NULL,
                conversation_id TEXT,
                sender TEXT NOT NULL,
                recipients TEXT NOT NULL,
                subject TEXT,
                body_text TEXT NOT NULL,
                sent_date TEXT NOT NULL,
                folder TEXT NOT NULL,
                source_type TEXT NOT NULL,
                is_classified INTEGER NOT NULL DEFAULT 0,
                classified_action TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, email_id, source_type)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS emails_user_unclassified ON emails(user_id, source_type, is_classified)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS emails_user_conversation ON emails(user_id, conversation_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS provider_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                user_id TEXT NOT NULL,
                change_type TEXT NOT NULL,
                item_id TEXT NOT NULL,
                change_date TEXT NOT NULL,
                details TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_status (
                user_id TEXT NOT NULL,
                source_type TEXT NOT NULL,
                status TEXT NOT NULL,
                items_processed INTEGER NOT NULL DEFAULT 0,
                items_succeeded INTEGER NOT NULL DEFAULT 0,
                items_failed INTEGER NOT NULL DEFAULT 0,
                total_documents INTEGER NOT NULL DEFAULT 0,
                last_successful_sync TEXT,
                last_sync_attempt TEXT NOT NULL,
                error_details TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (user_id, source_type)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS user_preferences (
                user_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS style_analyses (
                user_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS chat_messages_conversation ON chat_messages(conversation_id, created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emails::{EmailFolder, NewEmail, SourceType};
    use chrono::Utc;

    async fn test_store() -> ContentStore {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await.unwrap();
        let store = ContentStore { pool };
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn save_then_search_roundtrips() {
        let store = test_store().await;
        let recipients = vec!["b@example.com".to_string()];
        store
            .emails()
            .save(&NewEmail {
                user_id: "u1",
                email_id: "e1",
                conversation_id: Some("c1"),
                sender: "a@example.com",
                recipients: &recipients,
                subject: Some("hello"),
                body_text: "hi there",
                sent_date: Utc::now(),
                folder: EmailFolder::Inbox,
                source_type: SourceType::GoogleEmail,
            })
            .await
            .unwrap();

        let found = store.emails().search_by_user("u1", 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].recipients, recipients);
    }

    #[tokio::test]
    async fn resync_upserts_rather_than_duplicates() {
        let store = test_store().await;
        let recipients = vec!["b@example.com".to_string()];
        for subject in ["first", "second"] {
            store
                .emails()
                .save(&NewEmail {
                    user_id: "u1",
                    email_id: "e1",
                    conversation_id: None,
                    sender: "a@example.com",
                    recipients: &recipients,
                    subject: Some(subject),
                    body_text: "body",
                    sent_date: Utc::now(),
                    folder: EmailFolder::Inbox,
                    source_type: SourceType::GoogleEmail,
                })
                .await
                .unwrap();
        }

        let found = store.emails().search_by_user("u1", 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].subject.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn get_unclassified_then_update_classification() {
        let store = test_store().await;
        let recipients = vec!["b@example.com".to_string()];
        let id = store
            .emails()
            .save(&NewEmail {
                user_id: "u1",
                email_id: "e1",
                conversation_id: None,
                sender: "a@example.com",
                recipients: &recipients,
                subject: None,
                body_text: "body",
                sent_date: Utc::now(),
                folder: EmailFolder::Inbox,
                source_type: SourceType::GoogleEmail,
            })
            .await
            .unwrap();

        let unclassified = store.emails().get_unclassified("u1", 10).await.unwrap();
        assert_eq!(unclassified.len(), 1);

        store.emails().update_classification(id, "reply").await.unwrap();
        let unclassified = store.emails().get_unclassified("u1", 10).await.unwrap();
        assert!(unclassified.is_empty());
    }

    #[tokio::test]
    async fn sync_status_upsert_preserves_last_successful_sync_on_failure() {
        let store = test_store().await;
        let repo = store.sync_status();
        let first_success = Utc::now();

        repo.upsert(&SyncStatusValue {
            user_id: "u1",
            source_type: "google_email",
            status: "ok",
            items_processed: 10,
            items_succeeded: 10,
            items_failed: 0,
            total_documents: 10,
            last_successful_sync: Some(first_success),
            error_details: None,
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();

        repo.upsert(&SyncStatusValue {
            user_id: "u1",
            source_type: "google_email",
            status: "failed",
            items_processed: 5,
            items_succeeded: 0,
            items_failed: 5,
            total_documents: 10,
            last_successful_sync: None,
            error_details: Some("rate limited"),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();

        let status = repo.get("u1", "google_email").await.unwrap().unwrap();
        assert_eq!(status.status, "failed");
        assert_eq!(status.last_successful_sync, Some(first_success));
    }

    #[tokio::test]
    async fn provider_changes_log_then_list_by_user() {
        let store = test_store().await;
        store
            .provider_changes()
            .log("google_email", "u1", ChangeType::Add, "e1", serde_json::json!({"action": "reply", "to": "b@example.com"}))
            .await
            .unwrap();

        let changes = store.provider_changes().list_by_user("u1", 10).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, "add");
    }

    #[tokio::test]
    async fn user_preferences_get_upsert_roundtrips() {
        let store = test_store().await;
        assert!(store.user_preferences().get("u1").await.unwrap().is_none());
        store
            .user_preferences()
            .upsert("u1", &serde_json::json!({"auto_archive": true}))
            .await
            .unwrap();
        let prefs = store.user_preferences().get("u1").await.unwrap().unwrap();
        assert_eq!(prefs["auto_archive"], true);
    }
}
