//! Token Store & Credential Checker (C1).
//!
//! Persists per-user OAuth credentials for each provider on disk and answers
//! "can this user sync X?" without talking to the provider, except for the
//! one case where a stored credential is expired but refreshable.

mod bridge;
mod pickle;
mod store;

pub use bridge::{AuthBridge, OAuthConfig};
pub use store::TokenStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Microsoft,
    Local,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Microsoft => "microsoft",
            Provider::Local => "local",
        }
    }

    /// Directory name under `data/auth/` holding this provider's token files.
    fn token_dir(&self) -> &'static str {
        match self {
            Provider::Google => "google_user_token",
            Provider::Microsoft => "microsoft_user_token",
            Provider::Local => "local_user_token",
        }
    }

    /// Filename extension for this provider's token file.
    fn extension(&self) -> &'static str {
        match self {
            Provider::Google => "pickle",
            Provider::Microsoft | Provider::Local => "json",
        }
    }
}

/// A stored OAuth credential for one `(user, provider)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
}

impl Credential {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => exp <= Utc::now(),
            None => false,
        }
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh_token.is_some()
    }
}

/// Result of `TokenStore::check` — a pure read of the on-disk credential
/// plus, if needed, a single refresh attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialCheck {
    pub authenticated: bool,
    pub valid: bool,
    pub expired: bool,
    pub refreshable: bool,
    pub error: Option<String>,
}

impl CredentialCheck {
    fn absent() -> Self {
        CredentialCheck {
            authenticated: false,
            valid: false,
            expired: false,
            refreshable: false,
            error: None,
        }
    }
}
