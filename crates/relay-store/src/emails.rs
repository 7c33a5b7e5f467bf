use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    GoogleEmail,
    MicrosoftEmail,
    Mbox,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::GoogleEmail => "google_email",
            SourceType::MicrosoftEmail => "microsoft_email",
            SourceType::Mbox => "mbox",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "google_email" => Some(SourceType::GoogleEmail),
            "microsoft_email" => Some(SourceType::MicrosoftEmail),
            "mbox" => Some(SourceType::Mbox),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailFolder {
    Inbox,
    Sent,
    Drafts,
    Archive,
    Trash,
    Other,
}

impl EmailFolder {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailFolder::Inbox => "inbox",
            EmailFolder::Sent => "sent",
            EmailFolder::Drafts => "drafts",
            EmailFolder::Archive => "archive",
            EmailFolder::Trash => "trash",
            EmailFolder::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "inbox" => EmailFolder::Inbox,
            "sent" => EmailFolder::Sent,
            "drafts" => EmailFolder::Drafts,
            "archive" => EmailFolder::Archive,
            "trash" => EmailFolder::Trash,
            _ => EmailFolder::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Email {
    pub id: i64,
    pub user_id: String,
    pub email_id: String,
    pub conversation_id: Option<String>,
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub body_text: String,
    pub sent_date: DateTime<Utc>,
    pub folder: EmailFolder,
    pub source_type: SourceType,
    pub is_classified: bool,
    pub classified_action: Option<String>,
}

impl Email {
    fn from_row(row: sqlx::sqlite::SqliteRow) -> Result<Self> {
        let recipients: String = row.try_get("recipients")?;
        let folder: String = row.try_get("folder")?;
        let source_type: String = row.try_get("source_type")?;
        Ok(Email {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            email_id: row.try_get("email_id")?,
            conversation_id: row.try_get("conversation_id")?,
            sender: row.try_get("sender")?,
            recipients: serde_json::from_str(&recipients).unwrap_or_default(),
            subject: row.try_get("subject")?,
            body_text: row.try_get("body_text")?,
            sent_date: row.try_get("sent_date")?,
            folder: EmailFolder::parse(&folder),
            source_type: SourceType::parse(&source_type).unwrap_or(SourceType::GoogleEmail),
            is_classified: row.try_get::<i64, _>("is_classified")? != 0,
            classified_action: row.try_get("classified_action")?,
        })
    }
}

/// What the ingestion pipeline hands the store when persisting one message.
pub struct NewEmail<'a> {
    pub user_id: &'a str,
    pub email_id: &'a str,
    pub conversation_id: Option<&'a str>,
    pub sender: &'a str,
    pub recipients: &'a [String],
    pub subject: Option<&'a str>,
    pub body_text: &'a str,
    pub sent_date: DateTime<Utc>,
    pub folder: EmailFolder,
    pub source_type: SourceType,
}

pub struct Emails<'a> {
    pool: &'a SqlitePool,
}

impl<'a> Emails<'a> {
    pub(crate) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert on `(user_id, email_id, source_type)` — a re-synced message
    /// overwrites the prior row rather than duplicating it.
    #[instrument(skip(self, email), fields(user_id = email.user_id, email_id = email.email_id))]
    pub async fn save(&self, email: &NewEmail<'_>) -> Result<i64> {
        let now = Utc::now();
        let recipients_json = serde_json::to_string(email.recipients)?;

        let row = sqlx::query(
            "INSERT INTO emails (
                user_id, email_id, conversation_id, sender, recipients, subject,
                body_text, sent_date, folder, source_type, is_classified,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11)
            ON CONFLICT(user_id, email_id, source_type) DO UPDATE SET
                conversation_id = excluded.conversation_id,
                sender = excluded.sender,
                recipients = excluded.recipients,
                subject = excluded.subject,
                body_text = excluded.body_text,
                sent_date = excluded.sent_date,
                folder = excluded.folder,
                updated_at = excluded.updated_at
            RETURNING id",
        )
        .bind(email.user_id)
        .bind(email.email_id)
        .bind(email.conversation_id)
        .bind(email.sender)
        .bind(recipients_json)
        .bind(email.subject)
        .bind(email.body_text)
        .bind(email.sent_date)
        .bind(email.folder.as_str())
        .bind(email.source_type.as_str())
        .bind(now)
        .fetch_one(self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    pub async fn search_by_user(&self, user_id: &str, limit: i64) -> Result<Vec<Email>> {
        let rows = sqlx::query("SELECT * FROM emails WHERE user_id = ?1 ORDER BY sent_date DESC LIMIT ?2")
            .bind(user_id)
            .bind(limit)
            .fetch_all(self.pool)
            .await?;
        rows.into_iter().map(Email::from_row).collect()
    }

    pub async fn get_by_conversation(&self, user_id: &str, conversation_id: &str) -> Result<Vec<Email>> {
        let rows = sqlx::query(
            "SELECT * FROM emails WHERE user_id = ?1 AND conversation_id = ?2 ORDER BY sent_date ASC",
        )
        .bind(user_id)
        .bind(conversation_id)
        .fetch_all(self.pool)
        .await?;
        rows.into_iter().map(Email::from_row).collect()
    }

    /// Unclassified messages for a user, oldest first, per the ingestion
    /// pipeline's batch order.
    pub async fn get_unclassified(&self, user_id: &str, limit: i64) -> Result<Vec<Email>> {
        let rows = sqlx::query(
            "SELECT * FROM emails WHERE user_id = ?1 AND is_classified = 0 ORDER BY sent_date ASC LIMIT ?2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;
        rows.into_iter().map(Email::from_row).collect()
    }

    #[instrument(skip(self))]
    pub async fn update_classification(&self, email_row_id: i64, action: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query("UPDATE emails SET is_classified = 1, classified_action = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(action)
            .bind(now)
            .bind(email_row_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}
