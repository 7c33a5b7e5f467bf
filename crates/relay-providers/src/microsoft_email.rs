//! Outlook/Microsoft Graph adapter, structurally mirroring
//! [`crate::google_email::GoogleEmailAdapter`] against the Graph REST shape
//! instead of Gmail's.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use relay_auth::{AuthBridge, Credential, OAuthConfig, Provider, TokenStore};

use crate::email::{
    resolve_folder_alias, DraftRef, EmailCapability, FetchOptions, NormalizedAttachment, NormalizedEmail,
    OutboundMessage,
};
use crate::retry::{AdapterError, RetryPolicy};

const GRAPH_ROOT: &str = "https://graph.microsoft.com/v1.0/me";

pub struct MicrosoftEmailAdapter {
    user_id: String,
    http: reqwest::Client,
    token_store: TokenStore,
    auth_bridge: AuthBridge,
    oauth: OAuthConfig,
    retry: RetryPolicy,
}

impl MicrosoftEmailAdapter {
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
            .check(&self.user_id, Provider::Microsoft, move |cred: Credential| {
                let oauth = oauth.clone();
                async move {
                    let refresh_token = cred
                        .refresh_token
                        .clone()
                        .ok_or_else(|| anyhow!("microsoft credential has no refresh token"))?;
                    bridge.refresh_token(Provider::Microsoft, &refresh_token, &oauth).await
                }
            })
            .await;

        if !check.valid {
            return Err(AdapterError::AuthFailed(
                check.error.unwrap_or_else(|| "microsoft credential invalid or expired".to_string()),
            ));
        }

        self.token_store
            .load_credential(&self.user_id, Provider::Microsoft)
            .map(|c| c.access_token)
            .ok_or_else(|| AdapterError::AuthFailed("microsoft credential missing after check".to_string()))
    }

    fn folder_segment(folder: &str) -> &'static str {
        match resolve_folder_alias(folder) {
            relay_ingest::EmailFolder::Inbox => "inbox",
            relay_ingest::EmailFolder::Sent => "sentitems",
            relay_ingest::EmailFolder::Drafts => "drafts",
            relay_ingest::EmailFolder::Archive => "archive",
            relay_ingest::EmailFolder::Trash => "deleteditems",
            relay_ingest::EmailFolder::Other => "inbox",
        }
    }
}

#[async_trait]
impl EmailCapability for MicrosoftEmailAdapter {
    fn provider_id(&self) -> &str {
        "microsoft_email"
    }

    async fn authenticate(&self) -> Result<bool, AdapterError> {
        self.bearer_token().await.map(|_| true)
    }

    async fn fetch_emails(&self, opts: &FetchOptions) -> Result<(Vec<NormalizedEmail>, usize), AdapterError> {
        let token = self.bearer_token().await?;
        let folders = if opts.folders.is_empty() { vec!["inbox".to_string()] } else { opts.folders.clone() };
        let limit = if opts.limit == 0 { 100 } else { opts.limit };

        let mut emails = Vec::new();
        let mut scanned = 0usize;

        for folder in folders {
            let segment = Self::folder_segment(&folder);
            let mut url = format!("{GRAPH_ROOT}/mailFolders/{segment}/messages");
            let mut params: Vec<(&str, String)> = vec![("$top", limit.min(999).to_string())];
            if let Some(min_date) = opts.min_date {
                params.push(("$filter", format!("receivedDateTime ge {}", min_date.to_rfc3339())));
            }
            if let Some(q) = &opts.query {
                params.push(("$search", format!("\"{q}\"")));
            }

            loop {
                let response = self
                    .retry
                    .call("graph:messages", || self.http.get(&url).query(&params).bearer_auth(&token))
                    .await?;

                let page: GraphMessageList = response
                    .json()
                    .await
                    .map_err(|e| AdapterError::PermanentUpstream(format!("graph message list decode: {e}")))?;

                scanned += page.value.len();
                for msg in page.value {
                    emails.push(normalize_graph_message(msg, &folder));
                    if emails.len() >= limit {
                        break;
                    }
                }

                if emails.len() >= limit {
                    break;
                }
                match page.next_link {
                    Some(next) => {
                        url = next;
                        params.clear();
                    }
                    None => break,
                }
            }
        }

        info!("graph: fetched {} of {} scanned messages", emails.len(), scanned);
        Ok((emails, scanned))
    }

    async fn send_email(&self, message: &OutboundMessage) -> Result<DraftRef, AdapterError> {
        let token = self.bearer_token().await?;
        let body = serde_json::json!({
            "subject": message.subject,
            "body": { "contentType": "Text", "content": message.body },
            "toRecipients": to_recipient_list(&message.to),
            "ccRecipients": to_recipient_list(&message.cc),
            "bccRecipients": to_recipient_list(&message.bcc),
        });

        let response = self
            .retry
            .call("graph:create_draft", || {
                self.http.post(format!("{GRAPH_ROOT}/messages")).bearer_auth(&token).json(&body)
            })
            .await?;

        let draft: GraphDraftResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("graph draft decode: {e}")))?;

        Ok(DraftRef { message_id: draft.id, thread_id: draft.conversation_id.unwrap_or_default() })
    }

    async fn flag_email(&self, email_id: &str, mark_important: bool, mark_read: Option<bool>) -> Result<(), AdapterError> {
        let token = self.bearer_token().await?;
        let mut body = serde_json::Map::new();
        body.insert(
            "importance".to_string(),
            serde_json::Value::String(if mark_important { "high".to_string() } else { "normal".to_string() }),
        );
        if let Some(read) = mark_read {
            body.insert("isRead".to_string(), serde_json::Value::Bool(read));
        }

        self.retry
            .call("graph:patch_message", || {
                self.http
                    .patch(format!("{GRAPH_ROOT}/messages/{email_id}"))
                    .bearer_auth(&token)
                    .json(&serde_json::Value::Object(body.clone()))
            })
            .await?;
        Ok(())
    }

    async fn move_email(&self, email_id: &str, destination_folder: &str) -> Result<(), AdapterError> {
        let token = self.bearer_token().await?;
        let segment = Self::folder_segment(destination_folder);
        let body = serde_json::json!({ "destinationId": segment });

        self.retry
            .call("graph:move", || {
                self.http.post(format!("{GRAPH_ROOT}/messages/{email_id}/move")).bearer_auth(&token).json(&body)
            })
            .await?;
        Ok(())
    }

    /// `createReply` produces a draft already addressed to the sender with
    /// quoted history attached by Graph; the body/cc are then patched in.
    async fn reply_to_email(
        &self,
        email_id: &str,
        body: &str,
        cc: &[String],
        include_original: bool,
    ) -> Result<DraftRef, AdapterError> {
        let token = self.bearer_token().await?;

        let response = self
            .retry
            .call("graph:create_reply", || {
                self.http.post(format!("{GRAPH_ROOT}/messages/{email_id}/createReply")).bearer_auth(&token).json(&serde_json::json!({}))
            })
            .await?;
        let draft: GraphDraftResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("graph create reply decode: {e}")))?;

        let mut content = body.to_string();
        if include_original {
            let get_response = self
                .retry
                .call("graph:get_message", || self.http.get(format!("{GRAPH_ROOT}/messages/{email_id}")).bearer_auth(&token))
                .await?;
            if let Ok(original) = get_response.json::<GraphMessage>().await {
                if let Some(b) = original.body {
                    let text = if b.content_type.eq_ignore_ascii_case("html") { crate::email::html_to_text(&b.content) } else { b.content };
                    content.push_str("\n\n---------- Original message ----------\n");
                    content.push_str(&text);
                }
            }
        }

        let patch_body = serde_json::json!({
            "body": { "contentType": "Text", "content": content },
            "ccRecipients": to_recipient_list(cc),
        });
        self.retry
            .call("graph:patch_reply_draft", || {
                self.http.patch(format!("{GRAPH_ROOT}/messages/{}", draft.id)).bearer_auth(&token).json(&patch_body)
            })
            .await?;

        Ok(DraftRef { message_id: draft.id, thread_id: draft.conversation_id.unwrap_or_default() })
    }

    /// Graph's native `/forward` action sends the message immediately rather
    /// than producing a draft (unlike Gmail, which only ever drafts). There
    /// is no new resource id to report, so the original message/conversation
    /// ids are returned as the `DraftRef`.
    async fn forward_email(
        &self,
        email_id: &str,
        recipients: &[String],
        comment: Option<&str>,
    ) -> Result<DraftRef, AdapterError> {
        let token = self.bearer_token().await?;

        let get_response = self
            .retry
            .call("graph:get_message", || self.http.get(format!("{GRAPH_ROOT}/messages/{email_id}")).bearer_auth(&token))
            .await?;
        let original: GraphMessage = get_response
            .json()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("graph message decode: {e}")))?;

        let body = serde_json::json!({
            "comment": comment.unwrap_or(""),
            "toRecipients": to_recipient_list(recipients),
        });
        self.retry
            .call("graph:forward", || {
                self.http.post(format!("{GRAPH_ROOT}/messages/{email_id}/forward")).bearer_auth(&token).json(&body)
            })
            .await?;

        Ok(DraftRef { message_id: email_id.to_string(), thread_id: original.conversation_id.unwrap_or_default() })
    }
}

fn to_recipient_list(addrs: &[String]) -> Vec<serde_json::Value> {
    addrs
        .iter()
        .map(|a| serde_json::json!({ "emailAddress": { "address": a } }))
        .collect()
}

fn normalize_graph_message(msg: GraphMessage, folder: &str) -> NormalizedEmail {
    let sender = msg.from.and_then(|f| f.email_address).map(|a| a.address).unwrap_or_default();
    let recipients = msg.to_recipients.unwrap_or_default().into_iter().filter_map(|r| r.email_address).map(|a| a.address).collect();
    let cc = msg.cc_recipients.unwrap_or_default().into_iter().filter_map(|r| r.email_address).map(|a| a.address).collect();
    let bcc = msg.bcc_recipients.unwrap_or_default().into_iter().filter_map(|r| r.email_address).map(|a| a.address).collect();

    let sent_date = msg.received_date_time.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)).unwrap_or_else(Utc::now);

    let (body_text, body_html) = match msg.body {
        Some(b) if b.content_type.eq_ignore_ascii_case("html") => {
            let html = b.content.clone();
            (crate::email::html_to_text(&b.content), Some(html))
        }
        Some(b) => (b.content, None),
        None => (String::new(), None),
    };

    if body_text.is_empty() {
        warn!("graph: message {} has empty body after normalization", msg.id);
    }

    NormalizedEmail {
        message_id: msg.id.clone(),
        provider_id: "microsoft_email".to_string(),
        subject: msg.subject,
        sender,
        recipients,
        cc,
        bcc,
        sent_date,
        conversation_id: msg.conversation_id.unwrap_or(msg.id),
        folder: resolve_folder_alias(folder),
        body_text,
        body_html,
        attachments: Vec::new(),
    }
}

#[derive(Debug, Deserialize)]
struct GraphMessageList {
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphMessage {
    id: String,
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
    subject: Option<String>,
    from: Option<GraphRecipient>,
    #[serde(rename = "toRecipients")]
    to_recipients: Option<Vec<GraphRecipient>>,
    #[serde(rename = "ccRecipients")]
    cc_recipients: Option<Vec<GraphRecipient>>,
    #[serde(rename = "bccRecipients")]
    bcc_recipients: Option<Vec<GraphRecipient>>,
    #[serde(rename = "receivedDateTime")]
    received_date_time: Option<String>,
    body: Option<GraphBody>,
}

#[derive(Debug, Deserialize)]
struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    address: String,
}

#[derive(Debug, Deserialize)]
struct GraphBody {
    #[serde(rename = "contentType")]
    content_type: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct GraphDraftResponse {
    id: String,
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_graph_message_prefers_plain_text_for_retrieval() {
        let msg = GraphMessage {
            id: "m1".to_string(),
            conversation_id: Some("c1".to_string()),
            subject: Some("hi".to_string()),
            from: Some(GraphRecipient { email_address: Some(GraphEmailAddress { address: "a@x.com".to_string() }) }),
            to_recipients: Some(vec![GraphRecipient { email_address: Some(GraphEmailAddress { address: "b@x.com".to_string() }) }]),
            cc_recipients: None,
            bcc_recipients: None,
            received_date_time: Some("2026-01-01T00:00:00Z".to_string()),
            body: Some(GraphBody { content_type: "HTML".to_string(), content: "<p>Hello</p>".to_string() }),
        };

        let normalized = normalize_graph_message(msg, "inbox");
        assert_eq!(normalized.body_text, "Hello");
        assert!(normalized.body_html.unwrap().contains("<p>"));
        assert_eq!(normalized.conversation_id, "c1");
    }
}
