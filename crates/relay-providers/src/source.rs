//! Bridges [`EmailCapability`] (used directly by the Action Executor and
//! the tool-server multiplexer) into [`relay_ingest::EmailSource`] (used by
//! the Ingestion Pipeline), so Gmail and Outlook adapters only need to
//! implement fetching once.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use relay_ingest::{EmailSource, RawAttachment, RawEmail};

use crate::email::{EmailCapability, FetchOptions, NormalizedAttachment, NormalizedEmail};

/// Runs the capability's own paginated `fetch_emails` once, then reports
/// exhaustion — the adapter has already walked every page internally by
/// the time it returns, so there is nothing left to page through here.
pub struct CapabilityEmailSource {
    capability: Arc<dyn EmailCapability>,
    options: FetchOptions,
    exhausted: bool,
}

impl CapabilityEmailSource {
    pub fn new(capability: Arc<dyn EmailCapability>, options: FetchOptions) -> Self {
        Self { capability, options, exhausted: false }
    }
}

#[async_trait]
impl EmailSource for CapabilityEmailSource {
    async fn next_batch(&mut self) -> Result<Vec<RawEmail>> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        self.exhausted = true;

        let (emails, _scanned) = self.capability.fetch_emails(&self.options).await?;
        Ok(emails.into_iter().map(normalized_to_raw).collect())
    }
}

fn normalized_to_raw(email: NormalizedEmail) -> RawEmail {
    RawEmail {
        provider_item_id: email.message_id,
        conversation_id: email.conversation_id,
        internet_message_id: None,
        sender: email.sender,
        recipients: email.recipients,
        subject: email.subject,
        body_text: email.body_text,
        sent_date: email.sent_date,
        folder: email.folder,
        attachments: email.attachments.into_iter().map(normalized_attachment_to_raw).collect(),
    }
}

fn normalized_attachment_to_raw(attachment: NormalizedAttachment) -> RawAttachment {
    RawAttachment { filename: attachment.filename, content_type: attachment.content_type, bytes: attachment.bytes }
}
