use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

/// Append-only audit trail of actions taken against a provider on a user's
/// behalf — sends, forwards, flags, moves. Never updated or deleted; the
/// Action Executor writes one row per dispatch that produced a side effect
/// (no row for `no_action`, since there was none to log). The specific
/// action taken (reply, forward, flag, ...) lives in the row's `details`
/// JSON; `change_type` itself is the data model's fixed four-value
/// vocabulary, not a mirror of the action catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Add,
    Modify,
    Remove,
    Create,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Add => "add",
            ChangeType::Modify => "modify",
            ChangeType::Remove => "remove",
            ChangeType::Create => "create",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderChange {
    pub id: i64,
    pub provider: String,
    pub user_id: String,
    pub change_type: String,
    pub item_id: String,
    pub change_date: DateTime<Utc>,
    pub details: serde_json::Value,
}

pub struct ProviderChanges<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ProviderChanges<'a> {
    pub(crate) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, details), fields(provider, user_id, change_type = change_type.as_str()))]
    pub async fn log(
        &self,
        provider: &str,
        user_id: &str,
        change_type: ChangeType,
        item_id: &str,
        details: serde_json::Value,
    ) -> Result<i64> {
        let now = Utc::now();
        let details_json = serde_json::to_string(&details)?;

        let row = sqlx::query(
            "INSERT INTO provider_changes (provider, user_id, change_type, item_id, change_date, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) RETURNING id",
        )
        .bind(provider)
        .bind(user_id)
        .bind(change_type.as_str())
        .bind(item_id)
        .bind(now)
        .bind(details_json)
        .fetch_one(self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    pub async fn list_by_user(&self, user_id: &str, limit: i64) -> Result<Vec<ProviderChange>> {
        let rows = sqlx::query(
            "SELECT * FROM provider_changes WHERE user_id = ?1 ORDER BY change_date DESC LIMIT ?2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let details_json: String = row.try_get("details")?;
                Ok(ProviderChange {
                    id: row.try_get("id")?,
                    provider: row.try_get("provider")?,
                    user_id: row.try_get("user_id")?,
                    change_type: row.try_get("change_type")?,
                    item_id: row.try_get("item_id")?,
                    change_date: row.try_get("change_date")?,
                    details: serde_json::from_str(&details_json).unwrap_or(serde_json::Value::Null),
                })
            })
            .collect()
    }

    pub async fn list_by_item(&self, item_id: &str) -> Result<Vec<ProviderChange>> {
        let rows = sqlx::query("SELECT * FROM provider_changes WHERE item_id = ?1 ORDER BY change_date DESC")
            .bind(item_id)
            .fetch_all(self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let details_json: String = row.try_get("details")?;
                Ok(ProviderChange {
                    id: row.try_get("id")?,
                    provider: row.try_get("provider")?,
                    user_id: row.try_get("user_id")?,
                    change_type: row.try_get("change_type")?,
                    item_id: row.try_get("item_id")?,
                    change_date: row.try_get("change_date")?,
                    details: serde_json::from_str(&details_json).unwrap_or(serde_json::Value::Null),
                })
            })
            .collect()
    }
}
