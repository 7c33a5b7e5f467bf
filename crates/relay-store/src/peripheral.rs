use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

/// Minimal typed CRUD over a single JSON payload column. These four tables
/// (user preferences, writing-style analysis, conversations, chat messages)
/// are read far more than written and have no cross-table joins, so each
/// gets a `get`/`upsert` pair rather than a bespoke schema.
macro_rules! json_blob_repo {
    ($repo:ident, $table:literal) => {
        pub struct $repo<'a> {
            pool: &'a SqlitePool,
        }

        impl<'a> $repo<'a> {
            pub(crate) fn new(pool: &'a SqlitePool) -> Self {
                Self { pool }
            }

            pub async fn get(&self, user_id: &str) -> Result<Option<serde_json::Value>> {
                let row = sqlx::query(concat!("SELECT payload FROM ", $table, " WHERE user_id = ?1"))
                    .bind(user_id)
                    .fetch_optional(self.pool)
                    .await?;
                row.map(|row| {
                    let payload: String = row.try_get("payload")?;
                    Ok(serde_json::from_str(&payload)?)
                })
                .transpose()
            }

            pub async fn upsert(&self, user_id: &str, payload: &serde_json::Value) -> Result<()> {
                let now = Utc::now();
                let payload_json = serde_json::to_string(payload)?;
                sqlx::query(concat!(
                    "INSERT INTO ",
                    $table,
                    " (user_id, payload, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(user_id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at"
                ))
                .bind(user_id)
                .bind(payload_json)
                .bind(now)
                .execute(self.pool)
                .await?;
                Ok(())
            }
        }
    };
}

json_blob_repo!(UserPreferences, "user_preferences");
json_blob_repo!(StyleAnalyses, "style_analyses");

pub struct Conversations<'a> {
    pool: &'a SqlitePool,
}

impl<'a> Conversations<'a> {
    pub(crate) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, id: &str, user_id: &str, title: Option<&str>) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET title = excluded.title, updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(user_id)
        .bind(title)
        .bind(now)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<(String, Option<String>)>> {
        let row = sqlx::query("SELECT user_id, title FROM conversations WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool)
            .await?;
        row.map(|row| Ok((row.try_get("user_id")?, row.try_get("title")?)))
            .transpose()
    }
}

pub struct ChatMessages<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ChatMessages<'a> {
    pub(crate) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, conversation_id: &str, role: &str, content: &str) -> Result<i64> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO chat_messages (conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4) RETURNING id",
        )
        .bind(conversation_id)
        .bind(role)
        .bind(content)
        .bind(now)
        .fetch_one(self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    pub async fn list(&self, conversation_id: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT role, content FROM chat_messages WHERE conversation_id = ?1 ORDER BY created_at ASC",
        )
        .bind(conversation_id)
        .fetch_all(self.pool)
        .await?;
        rows.into_iter()
            .map(|row| Ok((row.try_get("role")?, row.try_get("content")?)))
            .collect()
    }
}
