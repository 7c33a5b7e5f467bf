//! Gmail adapter: message list plus per-message fetch against the Gmail
//! REST API, implemented against [`EmailCapability`].

use anyhow::anyhow;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use relay_auth::{AuthBridge, Credential, OAuthConfig, Provider, TokenStore};

use crate::email::{
    resolve_folder_alias, DraftRef, EmailCapability, FetchOptions, NormalizedAttachment, NormalizedEmail,
    OutboundMessage,
};
use crate::retry::{AdapterError, RetryPolicy};

const USERS_ME: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

pub struct GoogleEmailAdapter {
    user_id: String,
    http: reqwest::Client,
    token_store: TokenStore,
    auth_bridge: AuthBridge,
    oauth: OAuthConfig,
    retry: RetryPolicy,
}

impl GoogleEmailAdapter {
    pub fn new(user_id: impl Into<String>, token_store: TokenStore, oauth: OAuthConfig) -> Self {
        Self {
            user_id: user_id.into(),
            http: reqwest::Client::new(),
            token_store,
            auth_bridge: AuthBridge::new(),
            oauth,
            retry: RetryPolicy::default(),
        }
    }

    async fn bearer_token(&self) -> Result<String, AdapterError> {
        let oauth = self.oauth.clone();
        let bridge = self.auth_bridge.clone();
        let check = self
            .token_store
            .check(&self.user_id, Provider::Google, move |cred: Credential| {
                let oauth = oauth.clone();
                async move {
                    let refresh_token = cred
                        .refresh_token
                        .clone()
                        .ok_or_else(|| anyhow!("google credential has no refresh token"))?;
                    bridge.refresh_token(Provider::Google, &refresh_token, &oauth).await
                }
            })
            .await;

        if !check.valid {
            return Err(AdapterError::AuthFailed(
                check.error.unwrap_or_else(|| "google credential invalid or expired".to_string()),
            ));
        }

        self.token_store
            .load_credential(&self.user_id, Provider::Google)
            .map(|c| c.access_token)
            .ok_or_else(|| AdapterError::AuthFailed("google credential missing after check".to_string()))
    }

    async fn list_message_ids(&self, token: &str, opts: &FetchOptions) -> Result<Vec<String>, AdapterError> {
        let mut query_parts = Vec::new();
        if let Some(min_date) = opts.min_date {
            query_parts.push(format!("after:{}", min_date.format("%Y/%m/%d")));
        }
        if let Some(q) = &opts.query {
            query_parts.push(q.clone());
        }
        let query = query_parts.join(" ");

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        let limit = if opts.limit == 0 { 100 } else { opts.limit };

        loop {
            let mut params: Vec<(&str, String)> = vec![("maxResults", limit.min(500).to_string())];
            if !query.is_empty() {
                params.push(("q", query.clone()));
            }
            if let Some(pt) = &page_token {
                params.push(("pageToken", pt.clone()));
            }

            let response = self
                .retry
                .call("gmail:list", || {
                    self.http
                        .get(format!("{USERS_ME}/messages"))
                        .query(&params)
                        .bearer_auth(token)
                })
                .await?;

            let list: GmailListResponse = response
                .json()
                .await
                .map_err(|e| AdapterError::PermanentUpstream(format!("gmail list decode: {e}")))?;

            if let Some(messages) = list.messages {
                ids.extend(messages.into_iter().map(|m| m.id));
            }

            if ids.len() >= limit {
                ids.truncate(limit);
                break;
            }
            match list.next_page_token {
                Some(pt) => page_token = Some(pt),
                None => break,
            }
        }

        Ok(ids)
    }

    async fn fetch_raw_message(&self, token: &str, id: &str) -> Result<GmailMessage, AdapterError> {
        let response = self
            .retry
            .call("gmail:get", || {
                self.http
                    .get(format!("{USERS_ME}/messages/{id}"))
                    .query(&[("format", "full")])
                    .bearer_auth(token)
            })
            .await?;

        response.json().await.map_err(|e| AdapterError::PermanentUpstream(format!("gmail message decode: {e}")))
    }

    async fn fetch_message(&self, token: &str, id: &str) -> Result<NormalizedEmail, AdapterError> {
        let message = self.fetch_raw_message(token, id).await?;
        Ok(normalize_gmail_message(message))
    }

    async fn create_draft(&self, token: &str, raw: Vec<u8>, thread_id: Option<&str>) -> Result<DraftRef, AdapterError> {
        let encoded = URL_SAFE_NO_PAD.encode(raw);
        let mut message = serde_json::json!({ "raw": encoded });
        if let Some(thread_id) = thread_id {
            message["threadId"] = serde_json::Value::String(thread_id.to_string());
        }
        let body = serde_json::json!({ "message": message });

        let response = self
            .retry
            .call("gmail:draft", || {
                self.http.post(format!("{USERS_ME}/drafts")).bearer_auth(token).json(&body)
            })
            .await?;

        let draft: GmailDraftResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("gmail draft decode: {e}")))?;

        Ok(DraftRef { message_id: draft.message.id, thread_id: draft.message.thread_id.unwrap_or_default() })
    }
}

fn gmail_header(headers: &[GmailHeader], name: &str) -> Option<String> {
    headers.iter().find(|h| h.name.eq_ignore_ascii_case(name)).and_then(|h| h.value.clone())
}

fn reply_subject(original: Option<&str>) -> String {
    match original {
        Some(s) if s.to_ascii_lowercase().starts_with("re:") => s.to_string(),
        Some(s) => format!("Re: {s}"),
        None => "Re:".to_string(),
    }
}

fn forward_subject(original: Option<&str>) -> String {
    match original {
        Some(s) if s.to_ascii_lowercase().starts_with("fwd:") || s.to_ascii_lowercase().starts_with("fw:") => s.to_string(),
        Some(s) => format!("Fwd: {s}"),
        None => "Fwd:".to_string(),
    }
}

#[async_trait]
impl EmailCapability for GoogleEmailAdapter {
    fn provider_id(&self) -> &str {
        "google_email"
    }

    async fn authenticate(&self) -> Result<bool, AdapterError> {
        self.bearer_token().await.map(|_| true)
    }

    async fn fetch_emails(&self, opts: &FetchOptions) -> Result<(Vec<NormalizedEmail>, usize), AdapterError> {
        let token = self.bearer_token().await?;
        let ids = self.list_message_ids(&token, opts).await?;
        let scanned = ids.len();

        let mut emails = Vec::with_capacity(ids.len());
        for id in ids {
            match self.fetch_message(&token, &id).await {
                Ok(email) => emails.push(email),
                Err(e) => warn!("gmail: skipping message {id}: {e}"),
            }
        }
        info!("gmail: fetched {} of {} scanned messages", emails.len(), scanned);
        Ok((emails, scanned))
    }

    async fn send_email(&self, message: &OutboundMessage) -> Result<DraftRef, AdapterError> {
        let token = self.bearer_token().await?;
        let raw = build_rfc822(message);
        self.create_draft(&token, raw, None).await
    }

    async fn reply_to_email(
        &self,
        email_id: &str,
        body: &str,
        cc: &[String],
        include_original: bool,
    ) -> Result<DraftRef, AdapterError> {
        let token = self.bearer_token().await?;
        let original = self.fetch_raw_message(&token, email_id).await?;
        let headers = original.payload.as_ref().and_then(|p| p.headers.clone()).unwrap_or_default();

        let subject = reply_subject(gmail_header(&headers, "subject").as_deref());
        let to_addr = gmail_header(&headers, "from").unwrap_or_default();
        let message_id_header = gmail_header(&headers, "message-id");
        let references = gmail_header(&headers, "references");

        let mut full_body = body.to_string();
        if include_original {
            let normalized = normalize_gmail_message(original.clone());
            full_body.push_str("\n\n---------- Original message ----------\n");
            full_body.push_str(&normalized.body_text);
        }

        let outbound = OutboundMessage {
            subject,
            body: full_body,
            html_body: None,
            to: vec![to_addr],
            cc: cc.to_vec(),
            bcc: Vec::new(),
        };

        let mut extra_headers = Vec::new();
        if let Some(mid) = &message_id_header {
            extra_headers.push(("In-Reply-To", mid.clone()));
            let refs = match &references {
                Some(r) => format!("{r} {mid}"),
                None => mid.clone(),
            };
            extra_headers.push(("References", refs));
        }

        let raw = build_rfc822_with_headers(&outbound, &extra_headers);
        self.create_draft(&token, raw, original.thread_id.as_deref()).await
    }

    async fn forward_email(
        &self,
        email_id: &str,
        recipients: &[String],
        comment: Option<&str>,
    ) -> Result<DraftRef, AdapterError> {
        let token = self.bearer_token().await?;
        let original = self.fetch_raw_message(&token, email_id).await?;
        let headers = original.payload.as_ref().and_then(|p| p.headers.clone()).unwrap_or_default();
        let normalized = normalize_gmail_message(original.clone());

        let subject = forward_subject(gmail_header(&headers, "subject").as_deref());

        let mut body = String::new();
        if let Some(c) = comment {
            body.push_str(c);
            body.push_str("\n\n");
        }
        body.push_str("---------- Forwarded message ---------\n");
        body.push_str(&format!("From: {}\n", normalized.sender));
        body.push_str(&format!("Date: {}\n", normalized.sent_date.to_rfc2822()));
        body.push_str(&format!("Subject: {}\n", normalized.subject.clone().unwrap_or_default()));
        body.push_str(&format!("To: {}\n\n", normalized.recipients.join(", ")));
        body.push_str(&normalized.body_text);

        let outbound =
            OutboundMessage { subject, body, html_body: None, to: recipients.to_vec(), cc: Vec::new(), bcc: Vec::new() };

        let raw = build_rfc822(&outbound);
        self.create_draft(&token, raw, None).await
    }

    async fn flag_email(&self, email_id: &str, mark_important: bool, mark_read: Option<bool>) -> Result<(), AdapterError> {
        let token = self.bearer_token().await?;
        let mut add_labels = Vec::new();
        let mut remove_labels = Vec::new();

        if mark_important {
            add_labels.push("IMPORTANT");
        } else {
            remove_labels.push("IMPORTANT");
        }
        match mark_read {
            Some(true) => remove_labels.push("UNREAD"),
            Some(false) => add_labels.push("UNREAD"),
            None => {}
        }

        let body = serde_json::json!({ "addLabelIds": add_labels, "removeLabelIds": remove_labels });
        self.retry
            .call("gmail:modify", || {
                self.http
                    .post(format!("{USERS_ME}/messages/{email_id}/modify"))
                    .bearer_auth(&token)
                    .json(&body)
            })
            .await?;
        Ok(())
    }

    async fn move_email(&self, email_id: &str, destination_folder: &str) -> Result<(), AdapterError> {
        let token = self.bearer_token().await?;
        let label = match resolve_folder_alias(destination_folder) {
            relay_ingest::EmailFolder::Archive => None,
            relay_ingest::EmailFolder::Trash => Some("TRASH"),
            _ => Some("INBOX"),
        };

        let body = match label {
            Some(l) => serde_json::json!({ "addLabelIds": [l], "removeLabelIds": ["INBOX"] }),
            None => serde_json::json!({ "removeLabelIds": ["INBOX"] }),
        };

        self.retry
            .call("gmail:move", || {
                self.http
                    .post(format!("{USERS_ME}/messages/{email_id}/modify"))
                    .bearer_auth(&token)
                    .json(&body)
            })
            .await?;
        Ok(())
    }
}

fn build_rfc822(message: &OutboundMessage) -> Vec<u8> {
    build_rfc822_with_headers(message, &[])
}

fn build_rfc822_with_headers(message: &OutboundMessage, extra_headers: &[(&str, String)]) -> Vec<u8> {
    let mut raw = String::new();
    raw.push_str(&format!("To: {}\r\n", message.to.join(", ")));
    if !message.cc.is_empty() {
        raw.push_str(&format!("Cc: {}\r\n", message.cc.join(", ")));
    }
    for (name, value) in extra_headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str(&format!("Subject: {}\r\n", message.subject));
    raw.push_str("Content-Type: text/plain; charset=UTF-8\r\n\r\n");
    raw.push_str(&message.body);
    raw.into_bytes()
}

fn normalize_gmail_message(message: GmailMessage) -> NormalizedEmail {
    let headers = message.payload.as_ref().and_then(|p| p.headers.clone()).unwrap_or_default();
    let header = |name: &str| headers.iter().find(|h| h.name.eq_ignore_ascii_case(name)).and_then(|h| h.value.clone());

    let subject = header("subject");
    let sender = header("from").unwrap_or_default();
    let recipients = split_addresses(header("to").as_deref().unwrap_or_default());
    let cc = split_addresses(header("cc").as_deref().unwrap_or_default());
    let bcc = split_addresses(header("bcc").as_deref().unwrap_or_default());

    let sent_date = message
        .internal_date
        .as_ref()
        .and_then(|ts| ts.parse::<i64>().ok())
        .and_then(|ts| DateTime::from_timestamp_millis(ts))
        .unwrap_or_else(Utc::now);

    let (body_text, body_html, attachments) = message
        .payload
        .as_ref()
        .map(extract_parts)
        .unwrap_or_default();

    NormalizedEmail {
        message_id: message.id.clone(),
        provider_id: "google_email".to_string(),
        subject,
        sender,
        recipients,
        cc,
        bcc,
        sent_date,
        conversation_id: message.thread_id.unwrap_or(message.id),
        folder: if message.label_ids.iter().any(|l| l == "SENT") {
            crate::email::resolve_folder_alias("sent")
        } else {
            crate::email::resolve_folder_alias("inbox")
        },
        body_text,
        body_html,
        attachments,
    }
}

fn split_addresses(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

fn extract_parts(payload: &GmailPayload) -> (String, Option<String>, Vec<NormalizedAttachment>) {
    let mut body_text = String::new();
    let mut body_html: Option<String> = None;
    let mut attachments = Vec::new();
    walk_parts(payload, &mut body_text, &mut body_html, &mut attachments);

    if body_text.is_empty() {
        if let Some(html) = &body_html {
            body_text = crate::email::html_to_text(html);
        }
    }

    (body_text, body_html, attachments)
}

fn walk_parts(part: &GmailPayload, text: &mut String, html: &mut Option<String>, attachments: &mut Vec<NormalizedAttachment>) {
    let mime = part.mime_type.as_deref().unwrap_or_default();

    if let Some(filename) = &part.filename {
        if !filename.is_empty() {
            if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
                if let Ok(bytes) = URL_SAFE_NO_PAD.decode(data) {
                    if !bytes.is_empty() {
                        attachments.push(NormalizedAttachment {
                            filename: filename.clone(),
                            content_type: part.mime_type.clone(),
                            bytes,
                        });
                    }
                }
            }
            return;
        }
    }

    if mime == "text/plain" {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
            if let Ok(bytes) = URL_SAFE_NO_PAD.decode(data) {
                text.push_str(&String::from_utf8_lossy(&bytes));
            }
        }
    } else if mime == "text/html" {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
            if let Ok(bytes) = URL_SAFE_NO_PAD.decode(data) {
                *html = Some(String::from_utf8_lossy(&bytes).to_string());
            }
        }
    }

    if let Some(parts) = &part.parts {
        for sub in parts {
            walk_parts(sub, text, html, attachments);
        }
    }
}

#[derive(Debug, Deserialize)]
struct GmailListResponse {
    messages: Option<Vec<GmailMessageRef>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailMessageRef {
    id: String,
}

#[derive(Debug, Deserialize, Clone)]
struct GmailMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    #[serde(rename = "labelIds", default)]
    label_ids: Vec<String>,
    payload: Option<GmailPayload>,
}

#[derive(Debug, Deserialize, Clone)]
struct GmailPayload {
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    filename: Option<String>,
    headers: Option<Vec<GmailHeader>>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPayload>>,
}

#[derive(Debug, Deserialize, Clone)]
struct GmailHeader {
    name: String,
    value: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct GmailBody {
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailDraftResponse {
    message: GmailDraftMessage,
}

#[derive(Debug, Deserialize)]
struct GmailDraftMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_addresses_trims_and_drops_empty() {
        let addrs = split_addresses("a@x.com, b@x.com ,  ");
        assert_eq!(addrs, vec!["a@x.com".to_string(), "b@x.com".to_string()]);
    }

    #[test]
    fn walk_parts_finds_plain_text_and_attachment() {
        let payload = GmailPayload {
            mime_type: Some("multipart/mixed".to_string()),
            filename: None,
            headers: None,
            body: None,
            parts: Some(vec![
                GmailPayload {
                    mime_type: Some("text/plain".to_string()),
                    filename: None,
                    headers: None,
                    body: Some(GmailBody { data: Some(URL_SAFE_NO_PAD.encode("hello world")) }),
                    parts: None,
                },
                GmailPayload {
                    mime_type: Some("application/pdf".to_string()),
                    filename: Some("report.pdf".to_string()),
                    headers: None,
                    body: Some(GmailBody { data: Some(URL_SAFE_NO_PAD.encode("%PDF-1.4")) }),
                    parts: None,
                },
            ]),
        };

        let (text, html, attachments) = extract_parts(&payload);
        assert_eq!(text, "hello world");
        assert!(html.is_none());
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].filename, "report.pdf");
    }
}
