use serde::{Deserialize, Serialize};

/// Action catalogue, grounded in `classification.py`'s `EmailActionType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Reply,
    Forward,
    NewEmail,
    NoAction,
    FlagImportant,
    Archive,
    Delete,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::Reply,
        Action::Forward,
        Action::NewEmail,
        Action::NoAction,
        Action::FlagImportant,
        Action::Archive,
        Action::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Reply => "reply",
            Action::Forward => "forward",
            Action::NewEmail => "new_email",
            Action::NoAction => "no_action",
            Action::FlagImportant => "flag_important",
            Action::Archive => "archive",
            Action::Delete => "delete",
        }
    }

    /// Case-insensitive catalogue match; unknown values parse-miss to `None`
    /// so the caller can fall back to `no_action`.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str().eq_ignore_ascii_case(s.trim()))
    }

    pub fn description(&self) -> &'static str {
        match self {
            Action::Reply => "The email requires a direct response",
            Action::Forward => "The email should be forwarded to someone else",
            Action::NewEmail => "A new email should be composed (not a direct reply)",
            Action::NoAction => "No action needed at this time",
            Action::FlagImportant => "The email should be flagged for later attention",
            Action::Archive => "The email can be archived",
            Action::Delete => "The email can be deleted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
    }

    pub fn description(&self) -> &'static str {
        match self {
            Priority::High => "Urgent, should be handled immediately",
            Priority::Medium => "Important but not urgent",
            Priority::Low => "Can be handled when convenient",
        }
    }
}

/// One classification rule out of a user's `rules` preference, formatted
/// into the prompt as `when email contains "<keyword>", perform "<action>"
/// [to <recipient>]`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationRule {
    pub keyword: String,
    pub action: String,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Result of one classification pass. `action`/`priority` are never left
/// ambiguous: a parse-miss or an LLM call failure both resolve to a concrete
/// default rather than an `Option`.
#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub action: Action,
    pub priority: Priority,
    pub reasoning: String,
    pub suggested_response: Option<String>,
}

impl ClassificationResult {
    /// The call-failure default (distinct from the parser's per-field
    /// parse-miss defaults): reply at medium priority, error text in
    /// `reasoning`, no suggested response.
    pub fn call_failure_default(error: impl std::fmt::Display) -> Self {
        Self {
            action: Action::Reply,
            priority: Priority::Medium,
            reasoning: format!("Default classification due to error: {error}"),
            suggested_response: None,
        }
    }
}
