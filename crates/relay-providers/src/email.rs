use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_ingest::EmailFolder;

use crate::retry::AdapterError;

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub folders: Vec<String>,
    pub query: Option<String>,
    pub limit: usize,
    pub min_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NormalizedAttachment {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// `{messageId, providerId, subject, sender, recipients[], cc[], bcc[],
/// sentDate, conversationId, folder, bodyText, bodyHtml, attachments[],
/// hasAttachments}` per §4.2.
#[derive(Debug, Clone)]
pub struct NormalizedEmail {
    pub message_id: String,
    pub provider_id: String,
    pub subject: Option<String>,
    pub sender: String,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub sent_date: DateTime<Utc>,
    pub conversation_id: String,
    pub folder: EmailFolder,
    pub body_text: String,
    pub body_html: Option<String>,
    pub attachments: Vec<NormalizedAttachment>,
}

impl NormalizedEmail {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct DraftRef {
    pub message_id: String,
    pub thread_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub subject: String,
    pub body: String,
    pub html_body: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

/// Capability set shared by every email-bearing provider — Gmail, Outlook,
/// and (read path only) local mbox files. Both the Ingestion Pipeline and
/// the Action Executor talk to providers exclusively through this trait.
#[async_trait]
pub trait EmailCapability: Send + Sync {
    fn provider_id(&self) -> &str;

    /// May refresh tokens; returns whether the adapter is ready to make
    /// calls. Adapters with no credential concept (mbox) always return true.
    async fn authenticate(&self) -> Result<bool, AdapterError>;

    async fn fetch_emails(&self, opts: &FetchOptions) -> Result<(Vec<NormalizedEmail>, usize), AdapterError>;

    /// Creates a draft on both providers; never sends automatically.
    async fn send_email(&self, message: &OutboundMessage) -> Result<DraftRef, AdapterError> {
        let _ = message;
        Err(AdapterError::InvalidArgument(format!("{} does not support sending mail", self.provider_id())))
    }

    async fn reply_to_email(
        &self,
        email_id: &str,
        body: &str,
        cc: &[String],
        include_original: bool,
    ) -> Result<DraftRef, AdapterError> {
        let _ = (email_id, body, cc, include_original);
        Err(AdapterError::InvalidArgument(format!("{} does not support replying", self.provider_id())))
    }

    async fn forward_email(
        &self,
        email_id: &str,
        recipients: &[String],
        comment: Option<&str>,
    ) -> Result<DraftRef, AdapterError> {
        let _ = (email_id, recipients, comment);
        Err(AdapterError::InvalidArgument(format!("{} does not support forwarding", self.provider_id())))
    }

    async fn flag_email(&self, email_id: &str, mark_important: bool, mark_read: Option<bool>) -> Result<(), AdapterError> {
        let _ = (email_id, mark_important, mark_read);
        Err(AdapterError::InvalidArgument(format!("{} does not support flagging", self.provider_id())))
    }

    async fn move_email(&self, email_id: &str, destination_folder: &str) -> Result<(), AdapterError> {
        let _ = (email_id, destination_folder);
        Err(AdapterError::InvalidArgument(format!("{} does not support moving mail", self.provider_id())))
    }
}

/// Best-effort HTML-to-text: strips tags, collapses whitespace runs, keeps
/// paragraph breaks. Not a layout-aware renderer (see Non-goals).
pub fn html_to_text(html: &str) -> String {
    let mut out = String::new();
    let mut in_tag = false;
    let mut chars = html.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '<' => {
                in_tag = true;
                let mut tag = String::new();
                while let Some(&next) = chars.peek() {
                    if next == '>' {
                        chars.next();
                        break;
                    }
                    tag.push(next);
                    chars.next();
                }
                let tag_lower = tag.to_ascii_lowercase();
                if tag_lower.starts_with("br") || tag_lower.starts_with("/p") || tag_lower.starts_with("/div") {
                    out.push('\n');
                }
                in_tag = false;
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }

    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    let mut lines = Vec::new();
    for line in decoded.lines() {
        let collapsed: String = line.split_whitespace().collect::<Vec<_>>().join(" ");
        lines.push(collapsed);
    }
    lines.join("\n").trim().to_string()
}

/// Resolves a caller-given folder name to a provider well-known folder,
/// per the `inbox|sent|drafts|archive|trash|junk` alias table in §6.
/// Anything else is treated as a user-defined label.
pub fn resolve_folder_alias(name: &str) -> EmailFolder {
    match name.to_ascii_lowercase().as_str() {
        "inbox" => EmailFolder::Inbox,
        "sent" | "sentitems" => EmailFolder::Sent,
        "drafts" => EmailFolder::Drafts,
        "archive" => EmailFolder::Archive,
        "trash" | "deleteditems" => EmailFolder::Trash,
        _ => EmailFolder::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_to_text_strips_tags_and_collapses_whitespace() {
        let html = "<p>Hello   <b>world</b></p><br><p>Second   line</p>";
        let text = html_to_text(html);
        assert!(text.contains("Hello world"));
        assert!(text.contains("Second line"));
    }

    #[test]
    fn resolve_folder_alias_maps_known_names() {
        assert!(matches!(resolve_folder_alias("sentitems"), EmailFolder::Sent));
        assert!(matches!(resolve_folder_alias("deleteditems"), EmailFolder::Trash));
        assert!(matches!(resolve_folder_alias("Projects/Q1"), EmailFolder::Other));
    }
}
