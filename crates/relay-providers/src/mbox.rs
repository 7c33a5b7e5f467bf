//! Read-only mbox adapter, grounded in `ingest_mbox.py`'s
//! `parse_mbox_message`/`read_mbox_file`. The avoid-list/short-body spam
//! filter those functions apply is enforced centrally by
//! `relay_ingest::Pipeline::pull_emails` for every source, not here. Has no
//! write operations — nothing downstream ever dispatches an action against a
//! local mbox file.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use tracing::warn;

use relay_ingest::{EmailFolder, EmailSource, RawAttachment, RawEmail};

/// Parses an entire mbox file into [`RawEmail`]s up front; `next_batch`
/// hands them out in one shot then reports exhaustion, since a local file
/// has no pagination concept.
pub struct MboxSource {
    path: PathBuf,
    emails: Option<Vec<RawEmail>>,
}

impl MboxSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), emails: None }
    }

    fn parse_file(&self) -> Result<Vec<RawEmail>> {
        let bytes = std::fs::read(&self.path).map_err(|e| anyhow!("reading mbox file {}: {e}", self.path.display()))?;
        let text = String::from_utf8_lossy(&bytes);

        let mut messages = Vec::new();
        let mut current = String::new();
        for line in text.split_inclusive('\n') {
            if line.starts_with("From ") && !current.is_empty() {
                messages.push(std::mem::take(&mut current));
            }
            current.push_str(line);
        }
        if !current.trim().is_empty() {
            messages.push(current);
        }

        let parser = MessageParser::default();
        let mut emails = Vec::with_capacity(messages.len());

        for (idx, raw_message) in messages.into_iter().enumerate() {
            let fallback_id = format!("{}:{}", self.path.display(), idx);
            match parse_one(&parser, raw_message.as_bytes(), &fallback_id) {
                Some(email) => emails.push(email),
                None => continue,
            }
        }

        Ok(emails)
    }
}

fn parse_one(parser: &MessageParser, bytes: &[u8], fallback_id: &str) -> Option<RawEmail> {
    let message = parser.parse(bytes)?;

    let subject = message.subject().map(|s| s.to_string());
    let sender = message
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_default();

    let recipients = message
        .to()
        .map(|addrs| addrs.iter().filter_map(|a| a.address()).map(|s| s.to_string()).collect())
        .unwrap_or_default();

    let body_text = message
        .body_text(0)
        .map(|c| c.to_string())
        .or_else(|| message.body_html(0).map(|c| crate::email::html_to_text(c.as_ref())))
        .unwrap_or_default();

    let internet_message_id = message.message_id().map(|s| s.to_string());
    let conversation_id = internet_message_id.clone().unwrap_or_else(|| fallback_id.to_string());

    let sent_date: DateTime<Utc> = message
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let attachments = message
        .attachments()
        .filter_map(|att| {
            let filename = att.attachment_name()?.to_string();
            let bytes = att.contents().to_vec();
            if bytes.is_empty() {
                return None;
            }
            Some(RawAttachment { filename, content_type: att.content_type().map(|ct| ct.ctype().to_string()), bytes })
        })
        .collect();

    Some(RawEmail {
        provider_item_id: internet_message_id.clone().unwrap_or_else(|| fallback_id.to_string()),
        conversation_id,
        internet_message_id,
        sender,
        recipients,
        subject,
        body_text,
        sent_date,
        folder: EmailFolder::Other,
        attachments,
    })
}

#[async_trait]
impl EmailSource for MboxSource {
    async fn next_batch(&mut self) -> Result<Vec<RawEmail>> {
        if self.emails.is_none() {
            self.emails = Some(self.parse_file()?);
        }
        match self.emails.as_mut() {
            Some(remaining) if !remaining.is_empty() => Ok(std::mem::take(remaining)),
            _ => {
                warn!("mbox source {} exhausted", self.path.display());
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_sample_mbox(body_long: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "From foo@bar.com Mon Jan  1 00:00:00 2026\r\nFrom: sender@example.com\r\nTo: me@example.com\r\nSubject: Test\r\nMessage-ID: <abc123@example.com>\r\nDate: Thu, 1 Jan 2026 00:00:00 +0000\r\n\r\n{body_long}\r\n"
        )
        .unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn short_body_still_parses_into_raw_email() {
        let file = write_sample_mbox("too short");
        let mut source = MboxSource::new(file.path());
        let batch = source.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body_text, "too short");
    }

    #[tokio::test]
    async fn long_body_parses_into_raw_email() {
        let long_body = "x".repeat(150);
        let file = write_sample_mbox(&long_body);
        let mut source = MboxSource::new(file.path());
        let batch = source.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subject.as_deref(), Some("Test"));
        assert_eq!(batch[0].internet_message_id.as_deref(), Some("<abc123@example.com>"));

        let exhausted = source.next_batch().await.unwrap();
        assert!(exhausted.is_empty());
    }
}
