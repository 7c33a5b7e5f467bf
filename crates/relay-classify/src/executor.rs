//! Translates a classification into a provider-side side effect, grounded
//! in `email_action_executor.py`'s `_execute_action` per-action branches and
//! `_extract_recipients`'s regex-based address pull, reimplemented as an
//! exhaustive match over [`Action`] instead of string branching.
//!
//! `reply`/`new_email` only ever create drafts. `forward` drafts on Google
//! but sends immediately through Microsoft Graph's native forward endpoint
//! — the one write path that is not a draft, per each adapter's
//! [`EmailCapability`] implementation.

use std::collections::HashSet;

use anyhow::Result;
use regex::Regex;
use relay_providers::{EmailCapability, OutboundMessage};
use relay_store::{ChangeType, ContentStore};
use tracing::warn;

use crate::model::{Action, ClassificationResult};

const EMAIL_REGEX: &str = r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}";
const MAX_SUBJECT_PREFIX_LEN: usize = 100;

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub action: Action,
    pub success: bool,
    pub details: String,
}

pub struct ActionExecutor<'a> {
    store: &'a ContentStore,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(store: &'a ContentStore) -> Self {
        Self { store }
    }

    /// Dispatches `classification` against `capability`, the provider
    /// adapter for the email's originating account, and records the
    /// attempt to `provider_changes` regardless of outcome. Attempted once;
    /// a failure here is not retried within this cycle (§4.8).
    pub async fn execute(
        &self,
        user_id: &str,
        email_id: &str,
        original_subject: &str,
        capability: &dyn EmailCapability,
        classification: &ClassificationResult,
    ) -> Result<ExecutionOutcome> {
        let outcome = dispatch(email_id, original_subject, capability, classification).await;

        // `change_type` is the data model's fixed {add, modify, remove, create}
        // vocabulary, not the action catalogue itself — the action taken is
        // recorded in `details.action` below. `no_action` has no side effect
        // to log, so it never writes a row here.
        let change_type = match classification.action {
            Action::Reply | Action::Forward | Action::NewEmail => Some(ChangeType::Add),
            Action::FlagImportant => Some(ChangeType::Modify),
            Action::Archive => Some(ChangeType::Modify),
            Action::Delete => Some(ChangeType::Remove),
            Action::NoAction => None,
        };

        if let Some(change_type) = change_type {
            self.store
                .provider_changes()
                .log(
                    capability.provider_id(),
                    user_id,
                    change_type,
                    email_id,
                    serde_json::json!({
                        "action": classification.action.as_str(),
                        "success": outcome.success,
                        "details": outcome.details,
                    }),
                )
                .await?;
        }

        Ok(outcome)
    }
}

async fn dispatch(
    email_id: &str,
    original_subject: &str,
    capability: &dyn EmailCapability,
    classification: &ClassificationResult,
) -> ExecutionOutcome {
    let action = classification.action;
    match action {
        Action::Reply => {
            let body = classification
                .suggested_response
                .clone()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "Auto-generated response based on classification.".to_string());

            match capability.reply_to_email(email_id, &body, &[], true).await {
                Ok(draft) => success(action, format!("draft reply created ({})", draft.message_id)),
                Err(e) => failure(action, format!("reply failed: {e}")),
            }
        }
        Action::Forward => {
            let recipients = extract_recipients(classification.suggested_response.as_deref());
            if recipients.is_empty() {
                return failure(action, "no forward recipients identified".to_string());
            }
            let comment = if classification.reasoning.is_empty() { None } else { Some(classification.reasoning.as_str()) };
            match capability.forward_email(email_id, &recipients, comment).await {
                Ok(draft) => success(action, format!("forwarded to {} ({})", recipients.join(", "), draft.message_id)),
                Err(e) => failure(action, format!("forward failed: {e}")),
            }
        }
        Action::NewEmail => {
            let recipients = extract_recipients(classification.suggested_response.as_deref());
            if recipients.is_empty() {
                return failure(action, "no recipients identified for new email".to_string());
            }
            let body = classification.suggested_response.clone().unwrap_or_default();
            let subject = derive_new_email_subject(&body, original_subject);

            let message = OutboundMessage { subject, body, html_body: None, to: recipients.clone(), cc: Vec::new(), bcc: Vec::new() };
            match capability.send_email(&message).await {
                Ok(draft) => success(action, format!("new email drafted to {} ({})", recipients.join(", "), draft.message_id)),
                Err(e) => failure(action, format!("new email failed: {e}")),
            }
        }
        Action::FlagImportant => match capability.flag_email(email_id, true, None).await {
            Ok(()) => success(action, "flagged as important".to_string()),
            Err(e) => failure(action, format!("flag failed: {e}")),
        },
        Action::Archive => match capability.move_email(email_id, "archive").await {
            Ok(()) => success(action, "archived".to_string()),
            Err(e) => failure(action, format!("archive failed: {e}")),
        },
        Action::Delete => match capability.move_email(email_id, "trash").await {
            Ok(()) => success(action, "moved to trash".to_string()),
            Err(e) => failure(action, format!("delete failed: {e}")),
        },
        Action::NoAction => success(action, "no action required".to_string()),
    }
}

fn success(action: Action, details: String) -> ExecutionOutcome {
    ExecutionOutcome { action, success: true, details }
}

fn failure(action: Action, details: String) -> ExecutionOutcome {
    warn!("action {} failed: {}", action.as_str(), details);
    ExecutionOutcome { action, success: false, details }
}

/// Order-preserving, deduplicated email-address extraction — mirrors
/// `_extract_recipients`'s `dict.fromkeys` dedup over regex matches.
fn extract_recipients(text: Option<&str>) -> Vec<String> {
    let Some(text) = text else { return Vec::new() };
    let re = Regex::new(EMAIL_REGEX).expect("static email regex is valid");
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for m in re.find_iter(text) {
        let addr = m.as_str().to_string();
        if seen.insert(addr.clone()) {
            out.push(addr);
        }
    }
    out
}

/// `subject = first ':'-separated prefix if <= 100 chars, else "Follow-up: " + originalSubject`.
fn derive_new_email_subject(suggested_response: &str, original_subject: &str) -> String {
    if let Some((prefix, _)) = suggested_response.split_once(':') {
        let prefix = prefix.trim();
        if !prefix.is_empty() && prefix.len() <= MAX_SUBJECT_PREFIX_LEN {
            return prefix.to_string();
        }
    }
    format!("Follow-up: {original_subject}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_providers::{AdapterError, DraftRef, FetchOptions, NormalizedEmail};
    use std::sync::Mutex;

    struct StubCapability {
        reply_calls: Mutex<Vec<String>>,
        forward_calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl StubCapability {
        fn new() -> Self {
            Self { reply_calls: Mutex::new(Vec::new()), forward_calls: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl EmailCapability for StubCapability {
        fn provider_id(&self) -> &str {
            "stub"
        }

        async fn authenticate(&self) -> Result<bool, AdapterError> {
            Ok(true)
        }

        async fn fetch_emails(&self, _opts: &FetchOptions) -> Result<(Vec<NormalizedEmail>, usize), AdapterError> {
            Ok((Vec::new(), 0))
        }

        async fn reply_to_email(&self, email_id: &str, body: &str, _cc: &[String], _include_original: bool) -> Result<DraftRef, AdapterError> {
            self.reply_calls.lock().unwrap().push(body.to_string());
            Ok(DraftRef { message_id: format!("draft-{email_id}"), thread_id: email_id.to_string() })
        }

        async fn forward_email(&self, email_id: &str, recipients: &[String], _comment: Option<&str>) -> Result<DraftRef, AdapterError> {
            self.forward_calls.lock().unwrap().push((email_id.to_string(), recipients.to_vec()));
            Ok(DraftRef { message_id: format!("fwd-{email_id}"), thread_id: email_id.to_string() })
        }
    }

    fn classification(action: Action, suggested_response: Option<&str>) -> ClassificationResult {
        ClassificationResult { action, priority: crate::model::Priority::Medium, reasoning: String::new(), suggested_response: suggested_response.map(String::from) }
    }

    #[tokio::test]
    async fn forward_with_no_recipients_fails_without_calling_adapter() {
        let capability = StubCapability::new();
        let outcome = dispatch("e1", "Original", &capability, &classification(Action::Forward, Some("no addresses here"))).await;
        assert!(!outcome.success);
        assert!(capability.forward_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forward_extracts_and_dedupes_recipients() {
        let capability = StubCapability::new();
        let response = Some("please send to accounting@x.com and also accounting@x.com, cc ceo@x.com");
        let outcome = dispatch("e1", "Original", &capability, &classification(Action::Forward, response)).await;
        assert!(outcome.success);
        let calls = capability.forward_calls.lock().unwrap();
        assert_eq!(calls[0].1, vec!["accounting@x.com".to_string(), "ceo@x.com".to_string()]);
    }

    #[tokio::test]
    async fn reply_falls_back_to_default_body_when_suggested_response_is_empty() {
        let capability = StubCapability::new();
        let outcome = dispatch("e1", "Original", &capability, &classification(Action::Reply, None)).await;
        assert!(outcome.success);
        assert_eq!(capability.reply_calls.lock().unwrap()[0], "Auto-generated response based on classification.");
    }

    #[test]
    fn new_email_subject_prefers_short_colon_prefix() {
        assert_eq!(derive_new_email_subject("Meeting recap: let's sync tomorrow", "Original"), "Meeting recap");
        assert_eq!(derive_new_email_subject("no colon here", "Original"), "Follow-up: Original");
    }
}
