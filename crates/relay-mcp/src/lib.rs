//! Tool-server surface (C9): the two assistant-facing tools (`retrieve_documents`
//! and the adapter multiplexer) plus a supplemented admin surface, all framed
//! as the same `{id, tool|method, params}` → `{id, ok, result|error}` request/
//! response pair via `McpHandler`/`ToolRequest`/`ToolResponse`. There is no
//! per-source instant-recall routing here — retrieval always goes through
//! the vector store.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_core::{PairOutcome, RelayConfig, SyncManager};
use relay_providers::{
    AdapterFactory, CalendarCapability, DriveCapability, EmailCapability, ListFilesOptions, NewCalendarEvent, OutboundMessage,
    ProviderKind,
};
use relay_store::ContentStore;
use relay_vector::{embedder_from_env_or_hash, Embedder, VectorStore};

const MAX_PROMPT_LEN: usize = 10_000;
const PREVIEW_LEN: usize = 400;

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolRequest {
    pub id: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolResponse {
    pub id: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResponse {
    fn ok(id: Option<String>, result: Value) -> Self {
        Self { id, ok: true, result: Some(result), error: None }
    }

    fn err(id: Option<String>, error: impl ToString) -> Self {
        Self { id, ok: false, result: None, error: Some(error.to_string()) }
    }
}

#[derive(Debug, Deserialize)]
struct RetrieveDocumentsParams {
    prompt: String,
}

#[derive(Debug, Serialize)]
struct RetrievedDocument {
    doc_id: String,
    score: f32,
    preview: String,
    metadata: Value,
}

/// Process-wide context for one user's tool-server connection (§4.9: the
/// wire schemas carry no `user` field, so one connection — and one running
/// `relay-mcp` process — is scoped to exactly one authenticated user).
#[derive(Clone)]
pub struct McpContext {
    pub user_id: String,
    pub content_store: Arc<ContentStore>,
    pub vector_store: Arc<VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub adapter_factory: Arc<AdapterFactory>,
    pub config: RelayConfig,
    pub sync_manager: Option<Arc<SyncManager>>,
}

impl McpContext {
    pub fn new(
        user_id: impl Into<String>,
        content_store: Arc<ContentStore>,
        vector_store: Arc<VectorStore>,
        adapter_factory: Arc<AdapterFactory>,
        config: RelayConfig,
        sync_manager: Option<Arc<SyncManager>>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            content_store,
            vector_store,
            embedder: embedder_from_env_or_hash(),
            adapter_factory,
            config,
            sync_manager,
        }
    }
}

pub struct McpHandler {
    ctx: McpContext,
}

impl McpHandler {
    pub fn new(ctx: McpContext) -> Self {
        Self { ctx }
    }

    pub async fn handle(&self, request: ToolRequest) -> ToolResponse {
        let id = request.id.clone();

        if let Some(method) = &request.method {
            return match self.handle_admin(method, request.params).await {
                Ok(result) => ToolResponse::ok(id, result),
                Err(e) => ToolResponse::err(id, e),
            };
        }

        match request.tool.as_deref() {
            Some("retrieve_documents") => match self.handle_retrieve_documents(request.params).await {
                Ok(result) => ToolResponse::ok(id, result),
                Err(e) => ToolResponse::err(id, e),
            },
            Some(tool_name) => match self.handle_adapter_call(tool_name, request.params).await {
                Ok(result) => ToolResponse::ok(id, result),
                Err(e) => ToolResponse::err(id, e),
            },
            None => ToolResponse::err(id, "request carries neither `tool` nor `method`"),
        }
    }

    /// `retrieve_documents(prompt)` (§4.9): K, collection, rerank,
    /// split-prompt, and HyDE are fixed by `config.mcp` and never read from
    /// `params` — a prompt-controlled caller cannot widen retrieval scope.
    async fn handle_retrieve_documents(&self, params: Value) -> Result<Value> {
        let params: RetrieveDocumentsParams = serde_json::from_value(params).map_err(|_| anyhow!("invalid retrieve_documents params"))?;
        if params.prompt.len() > MAX_PROMPT_LEN {
            return Err(anyhow!("prompt exceeds {MAX_PROMPT_LEN} characters"));
        }

        let top_k = self.ctx.config.mcp.default_top_k.max(0) as usize;
        let min_score = self.ctx.config.mcp.min_score as f32;

        let hits = self
            .ctx
            .vector_store
            .search_semantic(&*self.ctx.embedder, &self.ctx.user_id, &params.prompt, top_k)
            .await?;

        let documents: Vec<RetrievedDocument> = hits
            .into_iter()
            .filter(|hit| hit.score >= min_score)
            .map(|hit| RetrievedDocument { doc_id: hit.doc_id, score: hit.score, preview: truncate(&hit.content, PREVIEW_LEN), metadata: hit.metadata })
            .collect();

        Ok(serde_json::json!({ "documents": documents }))
    }

    /// Adapter multiplexer (§4.9): `tool_name` names a capability-trait
    /// operation; `preferred_*_provider` picks the account (Google before
    /// Microsoft, `LocalFs` as the drive fallback), and the call is
    /// dispatched against whichever adapter that resolves to.
    async fn handle_adapter_call(&self, tool_name: &str, params: Value) -> Result<Value> {
        match tool_name {
            "send_email" | "reply_to_email" | "forward_email" | "flag_email" | "move_email" | "fetch_emails" => {
                self.dispatch_email(tool_name, params).await
            }
            "list_files" | "get_file_content" | "list_folders" => self.dispatch_drive(tool_name, params).await,
            "list_events" | "create_event" | "update_event" => self.dispatch_calendar(tool_name, params).await,
            other => Err(anyhow!("unknown tool '{other}'")),
        }
    }

    async fn email_adapter(&self) -> Result<Arc<dyn EmailCapability>> {
        let kind = self.ctx.adapter_factory.preferred_email_provider(&self.ctx.user_id).ok_or_else(|| anyhow!("no email provider authenticated for this user"))?;
        Ok(self.ctx.adapter_factory.email_adapter(&self.ctx.user_id, kind)?)
    }

    async fn drive_adapter(&self) -> Result<Arc<dyn DriveCapability>> {
        let kind = self.ctx.adapter_factory.preferred_drive_provider(&self.ctx.user_id).unwrap_or(ProviderKind::LocalFs);
        Ok(self.ctx.adapter_factory.drive_adapter(&self.ctx.user_id, kind)?)
    }

    async fn calendar_adapter(&self) -> Result<Arc<dyn CalendarCapability>> {
        let kind = self.ctx.adapter_factory.preferred_calendar_provider(&self.ctx.user_id).ok_or_else(|| anyhow!("no calendar provider authenticated for this user"))?;
        Ok(self.ctx.adapter_factory.calendar_adapter(&self.ctx.user_id, kind)?)
    }

    async fn dispatch_email(&self, tool_name: &str, params: Value) -> Result<Value> {
        let adapter = self.email_adapter().await?;
        let result = match tool_name {
            "send_email" => {
                let message: OutboundMessage = parse_outbound_message(&params)?;
                let draft = adapter.send_email(&message).await?;
                serde_json::json!({"message_id": draft.message_id, "thread_id": draft.thread_id})
            }
            "reply_to_email" => {
                let email_id = require_str(&params, "email_id")?;
                let body = require_str(&params, "body")?;
                let cc = optional_str_vec(&params, "cc");
                let include_original = params.get("include_original").and_then(Value::as_bool).unwrap_or(true);
                let draft = adapter.reply_to_email(&email_id, &body, &cc, include_original).await?;
                serde_json::json!({"message_id": draft.message_id, "thread_id": draft.thread_id})
            }
            "forward_email" => {
                let email_id = require_str(&params, "email_id")?;
                let recipients = optional_str_vec(&params, "recipients");
                let comment = params.get("comment").and_then(Value::as_str);
                let draft = adapter.forward_email(&email_id, &recipients, comment).await?;
                serde_json::json!({"message_id": draft.message_id, "thread_id": draft.thread_id})
            }
            "flag_email" => {
                let email_id = require_str(&params, "email_id")?;
                let mark_important = params.get("mark_important").and_then(Value::as_bool).unwrap_or(true);
                let mark_read = params.get("mark_read").and_then(Value::as_bool);
                adapter.flag_email(&email_id, mark_important, mark_read).await?;
                Value::Null
            }
            "move_email" => {
                let email_id = require_str(&params, "email_id")?;
                let destination = require_str(&params, "destination_folder")?;
                adapter.move_email(&email_id, &destination).await?;
                Value::Null
            }
            "fetch_emails" => {
                let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(20) as usize;
                let (emails, total) = adapter
                    .fetch_emails(&relay_providers::FetchOptions { folders: optional_str_vec(&params, "folders"), query: None, limit, min_date: None })
                    .await?;
                serde_json::json!({
                    "total_in_folder": total,
                    "emails": emails.into_iter().map(|e| serde_json::json!({
                        "message_id": e.message_id,
                        "subject": e.subject,
                        "sender": e.sender,
                        "sent_date": e.sent_date,
                    })).collect::<Vec<_>>(),
                })
            }
            _ => unreachable!("filtered by handle_adapter_call"),
        };
        Ok(result)
    }

    async fn dispatch_drive(&self, tool_name: &str, params: Value) -> Result<Value> {
        let adapter = self.drive_adapter().await?;
        let result = match tool_name {
            "list_files" => {
                let opts = ListFilesOptions {
                    folder_id: params.get("folder_id").and_then(Value::as_str).map(String::from),
                    query: params.get("query").and_then(Value::as_str).map(String::from),
                    limit: params.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize,
                };
                let files = adapter.list_files(&opts).await?;
                serde_json::json!(files.into_iter().map(|f| serde_json::json!({
                    "file_id": f.file_id, "name": f.name, "mime_type": f.mime_type,
                    "modified_at": f.modified_at, "is_folder": f.is_folder,
                })).collect::<Vec<_>>())
            }
            "get_file_content" => {
                let file_id = require_str(&params, "file_id")?;
                let file = adapter.get_file_content(&file_id).await?;
                serde_json::json!({"mime_type": file.mime_type, "extension": file.extension, "byte_len": file.bytes.len()})
            }
            "list_folders" => {
                let folders = adapter.list_folders().await?;
                serde_json::json!(folders.into_iter().map(|f| serde_json::json!({"file_id": f.file_id, "name": f.name})).collect::<Vec<_>>())
            }
            _ => unreachable!("filtered by handle_adapter_call"),
        };
        Ok(result)
    }

    async fn dispatch_calendar(&self, tool_name: &str, params: Value) -> Result<Value> {
        let adapter = self.calendar_adapter().await?;
        let result = match tool_name {
            "list_events" => {
                let from = require_datetime(&params, "from")?;
                let to = require_datetime(&params, "to")?;
                let events = adapter.list_events(from, to).await?;
                serde_json::json!(events.into_iter().map(event_to_json).collect::<Vec<_>>())
            }
            "create_event" => {
                let event = parse_new_event(&params)?;
                serde_json::to_value(event_to_json(adapter.create_event(&event).await?))?
            }
            "update_event" => {
                let event_id = require_str(&params, "event_id")?;
                let event = parse_new_event(&params)?;
                serde_json::to_value(event_to_json(adapter.update_event(&event_id, &event).await?))?
            }
            _ => unreachable!("filtered by handle_adapter_call"),
        };
        Ok(result)
    }

    /// `ping`/`get_status`/`sync_provider`/`discover` (§4.9, §6) — the admin
    /// surface every operable daemon needs, sharing the same request frame
    /// as the assistant-facing tools.
    async fn handle_admin(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            "ping" => Ok(serde_json::json!({"pong": true})),
            "get_status" => {
                let rows = self.ctx.content_store.sync_status().list_by_user(&self.ctx.user_id).await?;
                Ok(serde_json::to_value(rows)?)
            }
            "sync_provider" => {
                let manager = self.ctx.sync_manager.clone().ok_or_else(|| anyhow!("sync manager not attached to this connection"))?;
                let provider = require_str(&params, "provider")?;
                let outcome: PairOutcome = manager.sync_now(&self.ctx.user_id, &provider).await?;
                Ok(serde_json::to_value(outcome)?)
            }
            "discover" => {
                let factory = &self.ctx.adapter_factory;
                Ok(serde_json::json!({
                    "email": factory.preferred_email_provider(&self.ctx.user_id).map(|k| k.as_str()),
                    "drive": factory.preferred_drive_provider(&self.ctx.user_id).map(|k| k.as_str()),
                    "calendar": factory.preferred_calendar_provider(&self.ctx.user_id).map(|k| k.as_str()),
                }))
            }
            other => Err(anyhow!("unknown admin method '{other}'")),
        }
    }
}

fn event_to_json(event: relay_providers::CalendarEvent) -> Value {
    serde_json::json!({
        "event_id": event.event_id, "title": event.title, "start": event.start, "end": event.end,
        "location": event.location, "attendees": event.attendees,
    })
}

fn parse_new_event(params: &Value) -> Result<NewCalendarEvent> {
    Ok(NewCalendarEvent {
        title: require_str(params, "title")?,
        start: require_datetime(params, "start")?,
        end: require_datetime(params, "end")?,
        location: params.get("location").and_then(Value::as_str).map(String::from),
        attendees: optional_str_vec(params, "attendees"),
    })
}

fn parse_outbound_message(params: &Value) -> Result<OutboundMessage> {
    Ok(OutboundMessage {
        subject: require_str(params, "subject")?,
        body: require_str(params, "body")?,
        html_body: params.get("html_body").and_then(Value::as_str).map(String::from),
        to: optional_str_vec(params, "to"),
        cc: optional_str_vec(params, "cc"),
        bcc: optional_str_vec(params, "bcc"),
    })
}

fn require_str(params: &Value, key: &str) -> Result<String> {
    params.get(key).and_then(Value::as_str).map(String::from).ok_or_else(|| anyhow!("missing required param '{key}'"))
}

fn require_datetime(params: &Value, key: &str) -> Result<DateTime<Utc>> {
    let raw = require_str(params, key)?;
    raw.parse().map_err(|_| anyhow!("param '{key}' is not a valid RFC3339 timestamp"))
}

fn optional_str_vec(params: &Value, key: &str) -> Vec<String> {
    params.get(key).and_then(Value::as_array).map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect()).unwrap_or_default()
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_preserves_short_text() {
        assert_eq!(truncate("hello", 10), "hello");
    }

    #[test]
    fn truncate_appends_ellipsis_past_the_limit() {
        let text = "a".repeat(500);
        let truncated = truncate(&text, PREVIEW_LEN);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.chars().count(), PREVIEW_LEN + 3);
    }

    #[test]
    fn require_str_errors_on_missing_key() {
        let params = serde_json::json!({"other": "value"});
        assert!(require_str(&params, "email_id").is_err());
    }

    #[test]
    fn optional_str_vec_defaults_to_empty() {
        let params = serde_json::json!({});
        assert!(optional_str_vec(&params, "cc").is_empty());
    }
}
