//! Prompt construction and response parsing, grounded in
//! `classification.py`'s `EmailClassifier`: same four-section prompt shape,
//! same label-based parser, same call-failure/parse-miss default split.

use std::time::Duration;

use relay_store::Email;
use tracing::warn;

use crate::llm::LlmClient;
use crate::model::{Action, ClassificationResult, ClassificationRule, Priority};

const CLASSIFICATION_TIMEOUT: Duration = Duration::from_secs(30);
const CLASSIFICATION_TEMPERATURE: f32 = 0.2;

pub struct EmailClassifier<C> {
    llm: C,
}

impl<C: LlmClient> EmailClassifier<C> {
    pub fn new(llm: C) -> Self {
        Self { llm }
    }

    /// Classifies one email. Never fails: an LLM error or a per-email
    /// timeout both resolve to [`ClassificationResult::call_failure_default`].
    /// The returned `bool` is `false` exactly in that case, telling the
    /// caller not to set `is_classified` so the next cycle retries.
    pub async fn classify(&self, email: &Email, history: &[Email], rules: &[ClassificationRule]) -> (ClassificationResult, bool) {
        let prompt = build_prompt(email, history, rules);

        match tokio::time::timeout(CLASSIFICATION_TIMEOUT, self.llm.complete(&prompt, CLASSIFICATION_TEMPERATURE)).await {
            Ok(Ok(text)) => (parse_classification_response(&text), true),
            Ok(Err(e)) => {
                warn!("classification call failed for email {}: {e}", email.email_id);
                (ClassificationResult::call_failure_default(e), false)
            }
            Err(_) => {
                warn!("classification call timed out for email {}", email.email_id);
                (ClassificationResult::call_failure_default("request timed out"), false)
            }
        }
    }
}

fn format_email(email: &Email) -> String {
    format!(
        "EMAIL DETAILS:\nFrom: {}\nTo: {}\nSubject: {}\nDate: {}\n\nCONTENT:\n{}\n",
        email.sender,
        email.recipients.join(", "),
        email.subject.as_deref().unwrap_or(""),
        email.sent_date.to_rfc3339(),
        email.body_text,
    )
}

fn format_history(history: &[Email]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let blocks: Vec<String> = history
        .iter()
        .enumerate()
        .map(|(i, email)| {
            format!(
                "EMAIL {}:\nFrom: {}\nTo: {}\nSubject: {}\nDate: {}\nContent: {}\n",
                i + 1,
                email.sender,
                email.recipients.join(", "),
                email.subject.as_deref().unwrap_or(""),
                email.sent_date.to_rfc3339(),
                email.body_text,
            )
        })
        .collect();
    format!("\n\nCONVERSATION HISTORY:\n{}", blocks.join("\n"))
}

fn format_rules(rules: &[ClassificationRule]) -> String {
    if rules.is_empty() {
        return String::new();
    }
    let mut out = String::from("\nUSER CLASSIFICATION RULES:\n");
    for (i, rule) in rules.iter().enumerate() {
        let mut line = format!("{}. When an email contains \"{}\", perform action \"{}\"", i + 1, rule.keyword, rule.action);
        if let Some(recipient) = &rule.recipient {
            if !recipient.is_empty() && (rule.action == "forward" || rule.action == "new_email") {
                line.push_str(&format!(" to {recipient}"));
            }
        }
        if let Some(description) = &rule.description {
            if !description.is_empty() {
                line.push_str(&format!(" - {description}"));
            }
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn build_prompt(email: &Email, history: &[Email], rules: &[ClassificationRule]) -> String {
    let action_options: Vec<&str> = Action::ALL.iter().map(|a| a.as_str()).collect();
    let priority_options: Vec<&str> = Priority::ALL.iter().map(|p| p.as_str()).collect();

    let action_guidelines: String =
        Action::ALL.iter().map(|a| format!("- \"{}\": {}", a.as_str(), a.description())).collect::<Vec<_>>().join("\n");
    let priority_guidelines: String =
        Priority::ALL.iter().map(|p| format!("- \"{}\": {}", p.as_str(), p.description())).collect::<Vec<_>>().join("\n");

    format!(
        "You are an intelligent email assistant. Analyze the following email and determine the most appropriate action to take.\n\n\
         {email}\n{history}\n{rules}\n\n\
         Based on this information, please categorize the email and suggest an action to take.\n\
         For your response, follow this format exactly:\n\n\
         ACTION: [One of: {actions}]\n\
         PRIORITY: [One of: {priorities}]\n\
         REASONING: [Briefly explain why you chose this action and priority]\n\
         SUGGESTED_RESPONSE: [A brief outline of how to respond, if applicable]\n\n\
         For the ACTION field, use the following guidelines:\n{action_guidelines}\n\n\
         For the PRIORITY field:\n{priority_guidelines}\n",
        email = format_email(email),
        history = format_history(history),
        rules = format_rules(rules),
        actions = action_options.join(", "),
        priorities = priority_options.join(", "),
    )
}

/// Parses the four labeled lines out of the LLM's response. Matches the
/// catalogues case-insensitively; anything unparsed collapses to the
/// `no_action`/`medium` parse-miss defaults independently per field.
pub fn parse_classification_response(response: &str) -> ClassificationResult {
    let mut action = Action::NoAction;
    let mut priority = Priority::Medium;
    let mut reasoning = String::new();
    let mut suggested_response = None;

    if let Some((_, rest)) = response.split_once("ACTION:") {
        let line = rest.split('\n').next().unwrap_or("").trim();
        if let Some(parsed) = Action::parse(line) {
            action = parsed;
        }
    }

    if let Some((_, rest)) = response.split_once("PRIORITY:") {
        let line = rest.split('\n').next().unwrap_or("").trim();
        if let Some(parsed) = Priority::parse(line) {
            priority = parsed;
        }
    }

    if let Some((_, rest)) = response.split_once("REASONING:") {
        let block = rest.split("SUGGESTED_RESPONSE:").next().unwrap_or("");
        reasoning = block.trim().to_string();
    }

    if let Some((_, rest)) = response.split_once("SUGGESTED_RESPONSE:") {
        suggested_response = Some(rest.trim().to_string());
    }

    ClassificationResult { action, priority, reasoning, suggested_response }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::test_support::StubLlmClient;
    use chrono::Utc;
    use relay_store::{EmailFolder, SourceType};

    fn sample_email(body: &str) -> Email {
        Email {
            id: 1,
            user_id: "u1".to_string(),
            email_id: "e1".to_string(),
            conversation_id: None,
            sender: "alice@example.com".to_string(),
            recipients: vec!["bob@example.com".to_string()],
            subject: Some("Invoice due".to_string()),
            body_text: body.to_string(),
            sent_date: Utc::now(),
            folder: EmailFolder::Inbox,
            source_type: SourceType::GoogleEmail,
            is_classified: false,
            classified_action: None,
        }
    }

    #[test]
    fn parses_well_formed_response() {
        let response = "ACTION: forward\nPRIORITY: high\nREASONING: needs accounting\nSUGGESTED_RESPONSE: accounting@x.com please handle";
        let result = parse_classification_response(response);
        assert_eq!(result.action, Action::Forward);
        assert_eq!(result.priority, Priority::High);
        assert_eq!(result.reasoning, "needs accounting");
        assert_eq!(result.suggested_response.as_deref(), Some("accounting@x.com please handle"));
    }

    #[test]
    fn unparseable_action_collapses_to_no_action_default() {
        let response = "ACTION: shred\nPRIORITY: urgent\nREASONING: nonsense";
        let result = parse_classification_response(response);
        assert_eq!(result.action, Action::NoAction);
        assert_eq!(result.priority, Priority::Medium);
    }

    #[tokio::test]
    async fn llm_failure_produces_call_failure_default() {
        let classifier = EmailClassifier::new(StubLlmClient::failing("gateway unreachable"));
        let email = sample_email("please forward to accounting");
        let (result, succeeded) = classifier.classify(&email, &[], &[]).await;
        assert!(!succeeded);
        assert_eq!(result.action, Action::Reply);
        assert_eq!(result.priority, Priority::Medium);
        assert!(result.reasoning.contains("gateway unreachable"));
    }

    #[tokio::test]
    async fn successful_call_is_parsed() {
        let classifier = EmailClassifier::new(StubLlmClient::ok("ACTION: archive\nPRIORITY: low\nREASONING: newsletter\nSUGGESTED_RESPONSE:"));
        let email = sample_email("weekly digest");
        let (result, succeeded) = classifier.classify(&email, &[], &[]).await;
        assert!(succeeded);
        assert_eq!(result.action, Action::Archive);
        assert_eq!(result.priority, Priority::Low);
    }
}
