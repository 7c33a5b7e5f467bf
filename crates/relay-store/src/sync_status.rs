use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

/// Snapshot of one `(user, source_type)` sync run. "Latest wins" — a new
/// call to [`SyncStatusRepo::upsert`] replaces the row rather than
/// accumulating history; durable history lives in [`crate::ProviderChanges`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncStatus {
    pub user_id: String,
    pub source_type: String,
    pub status: String,
    pub items_processed: i64,
    pub items_succeeded: i64,
    pub items_failed: i64,
    pub total_documents: i64,
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub last_sync_attempt: DateTime<Utc>,
    pub error_details: Option<String>,
    pub metadata: serde_json::Value,
}

/// Input to an upsert; `last_successful_sync` is only advanced when the
/// caller passes one (a failed run still records `last_sync_attempt`).
pub struct SyncStatusValue<'a> {
    pub user_id: &'a str,
    pub source_type: &'a str,
    pub status: &'a str,
    pub items_processed: i64,
    pub items_succeeded: i64,
    pub items_failed: i64,
    pub total_documents: i64,
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub error_details: Option<&'a str>,
    pub metadata: serde_json::Value,
}

pub struct SyncStatusRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SyncStatusRepo<'a> {
    pub(crate) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, value), fields(user_id = value.user_id, source_type = value.source_type))]
    pub async fn upsert(&self, value: &SyncStatusValue<'_>) -> Result<()> {
        let now = Utc::now();
        let metadata_json = serde_json::to_string(&value.metadata)?;

        sqlx::query(
            "INSERT INTO sync_status (
                user_id, source_type, status, items_processed, items_succeeded,
                items_failed, total_documents, last_successful_sync,
                last_sync_attempt, error_details, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(user_id, source_type) DO UPDATE SET
                status = excluded.status,
                items_processed = excluded.items_processed,
                items_succeeded = excluded.items_succeeded,
                items_failed = excluded.items_failed,
                total_documents = excluded.total_documents,
                last_successful_sync = COALESCE(excluded.last_successful_sync, sync_status.last_successful_sync),
                last_sync_attempt = excluded.last_sync_attempt,
                error_details = excluded.error_details,
                metadata = excluded.metadata",
        )
        .bind(value.user_id)
        .bind(value.source_type)
        .bind(value.status)
        .bind(value.items_processed)
        .bind(value.items_succeeded)
        .bind(value.items_failed)
        .bind(value.total_documents)
        .bind(value.last_successful_sync)
        .bind(now)
        .bind(value.error_details)
        .bind(metadata_json)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, user_id: &str, source_type: &str) -> Result<Option<SyncStatus>> {
        let row = sqlx::query("SELECT * FROM sync_status WHERE user_id = ?1 AND source_type = ?2")
            .bind(user_id)
            .bind(source_type)
            .fetch_optional(self.pool)
            .await?;

        row.map(|row| {
            let metadata_json: String = row.try_get("metadata")?;
            Ok(SyncStatus {
                user_id: row.try_get("user_id")?,
                source_type: row.try_get("source_type")?,
                status: row.try_get("status")?,
                items_processed: row.try_get("items_processed")?,
                items_succeeded: row.try_get("items_succeeded")?,
                items_failed: row.try_get("items_failed")?,
                total_documents: row.try_get("total_documents")?,
                last_successful_sync: row.try_get("last_successful_sync")?,
                last_sync_attempt: row.try_get("last_sync_attempt")?,
                error_details: row.try_get("error_details")?,
                metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
            })
        })
        .transpose()
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<SyncStatus>> {
        let rows = sqlx::query("SELECT * FROM sync_status WHERE user_id = ?1")
            .bind(user_id)
            .fetch_all(self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let metadata_json: String = row.try_get("metadata")?;
                Ok(SyncStatus {
                    user_id: row.try_get("user_id")?,
                    source_type: row.try_get("source_type")?,
                    status: row.try_get("status")?,
                    items_processed: row.try_get("items_processed")?,
                    items_succeeded: row.try_get("items_succeeded")?,
                    items_failed: row.try_get("items_failed")?,
                    total_documents: row.try_get("total_documents")?,
                    last_successful_sync: row.try_get("last_successful_sync")?,
                    last_sync_attempt: row.try_get("last_sync_attempt")?,
                    error_details: row.try_get("error_details")?,
                    metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
                })
            })
            .collect()
    }
}
