//! Provider Adapters (C2): one uniform capability set per family (email,
//! drive, calendar), implemented against Gmail, Microsoft Graph, local
//! storage, and local mbox files.
//!
//! [`ProviderKind`] is an exhaustive tagged enum rather than a string-keyed
//! provider map; [`AdapterFactory`] builds the concrete adapter for a
//! `(user, kind)` pair and picks the user's preferred provider per
//! capability family.

pub mod calendar;
pub mod drive;
pub mod email;
mod google_email;
pub mod localfs;
pub mod mbox;
mod microsoft_email;
pub mod retry;
mod source;

pub use calendar::{CalendarCapability, CalendarEvent, GoogleCalendarAdapter, NewCalendarEvent, OutlookCalendarAdapter};
pub use drive::{DriveCapability, DriveFile, FetchedFile, GoogleDriveAdapter, ListFilesOptions, OneDriveAdapter};
pub use email::{
    html_to_text, resolve_folder_alias, DraftRef, EmailCapability, FetchOptions, NormalizedAttachment, NormalizedEmail,
    OutboundMessage,
};
pub use google_email::GoogleEmailAdapter;
pub use localfs::LocalFsAdapter;
pub use mbox::MboxSource;
pub use microsoft_email::MicrosoftEmailAdapter;
pub use retry::{AdapterError, RetryPolicy};
pub use source::CapabilityEmailSource;

use std::path::PathBuf;
use std::sync::Arc;

use relay_auth::{OAuthConfig, Provider, TokenStore};

/// Capability families from §4.2, flattened into one tag so dispatch is an
/// exhaustive match rather than branching on a provider name string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    GoogleEmail,
    MicrosoftEmail,
    GoogleDrive,
    OneDrive,
    GoogleCalendar,
    OutlookCalendar,
    LocalFs,
    Mbox,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GoogleEmail => "google_email",
            ProviderKind::MicrosoftEmail => "microsoft_email",
            ProviderKind::GoogleDrive => "google_storage",
            ProviderKind::OneDrive => "microsoft_storage",
            ProviderKind::GoogleCalendar => "google_calendar",
            ProviderKind::OutlookCalendar => "outlook_calendar",
            ProviderKind::LocalFs => "local_fs",
            ProviderKind::Mbox => "mbox",
        }
    }
}

/// Builds concrete adapters for a user, and answers "which provider should
/// the multiplexer use for this capability family" by asking the Token
/// Store which credential is valid, Google before Microsoft (§4.9).
pub struct AdapterFactory {
    token_store: TokenStore,
    data_root: PathBuf,
    google_oauth: Option<OAuthConfig>,
    microsoft_oauth: Option<OAuthConfig>,
}

impl AdapterFactory {
    pub fn new(
        token_store: TokenStore,
        data_root: PathBuf,
        google_oauth: Option<OAuthConfig>,
        microsoft_oauth: Option<OAuthConfig>,
    ) -> Self {
        Self { token_store, data_root, google_oauth, microsoft_oauth }
    }

    fn require_google(&self) -> Result<OAuthConfig, AdapterError> {
        self.google_oauth.clone().ok_or_else(|| AdapterError::InvalidArgument("google oauth not configured".to_string()))
    }

    fn require_microsoft(&self) -> Result<OAuthConfig, AdapterError> {
        self.microsoft_oauth
            .clone()
            .ok_or_else(|| AdapterError::InvalidArgument("microsoft oauth not configured".to_string()))
    }

    /// Has a stored credential that is not expired, without attempting a
    /// refresh — used only to rank providers for the multiplexer, not to
    /// gate an actual adapter call (adapters refresh lazily on their own).
    fn has_fresh_credential(&self, user_id: &str, provider: Provider) -> bool {
        self.token_store
            .load_credential(user_id, provider)
            .map(|c| !c.is_expired() || c.is_refreshable())
            .unwrap_or(false)
    }

    pub fn preferred_email_provider(&self, user_id: &str) -> Option<ProviderKind> {
        if self.has_fresh_credential(user_id, Provider::Google) {
            Some(ProviderKind::GoogleEmail)
        } else if self.has_fresh_credential(user_id, Provider::Microsoft) {
            Some(ProviderKind::MicrosoftEmail)
        } else {
            None
        }
    }

    pub fn preferred_drive_provider(&self, user_id: &str) -> Option<ProviderKind> {
        if self.has_fresh_credential(user_id, Provider::Google) {
            Some(ProviderKind::GoogleDrive)
        } else if self.has_fresh_credential(user_id, Provider::Microsoft) {
            Some(ProviderKind::OneDrive)
        } else {
            Some(ProviderKind::LocalFs)
        }
    }

    pub fn preferred_calendar_provider(&self, user_id: &str) -> Option<ProviderKind> {
        if self.has_fresh_credential(user_id, Provider::Google) {
            Some(ProviderKind::GoogleCalendar)
        } else if self.has_fresh_credential(user_id, Provider::Microsoft) {
            Some(ProviderKind::OutlookCalendar)
        } else {
            None
        }
    }

    pub fn email_adapter(&self, user_id: &str, kind: ProviderKind) -> Result<Arc<dyn EmailCapability>, AdapterError> {
        match kind {
            ProviderKind::GoogleEmail => {
                Ok(Arc::new(GoogleEmailAdapter::new(user_id, self.token_store.clone(), self.require_google()?)))
            }
            ProviderKind::MicrosoftEmail => {
                Ok(Arc::new(MicrosoftEmailAdapter::new(user_id, self.token_store.clone(), self.require_microsoft()?)))
            }
            other => Err(AdapterError::InvalidArgument(format!("{} has no email capability", other.as_str()))),
        }
    }

    pub fn drive_adapter(&self, user_id: &str, kind: ProviderKind) -> Result<Arc<dyn DriveCapability>, AdapterError> {
        match kind {
            ProviderKind::GoogleDrive => {
                Ok(Arc::new(GoogleDriveAdapter::new(user_id, self.token_store.clone(), self.require_google()?)))
            }
            ProviderKind::OneDrive => {
                Ok(Arc::new(OneDriveAdapter::new(user_id, self.token_store.clone(), self.require_microsoft()?)))
            }
            ProviderKind::LocalFs => Ok(Arc::new(LocalFsAdapter::new(&self.data_root, user_id))),
            other => Err(AdapterError::InvalidArgument(format!("{} has no drive capability", other.as_str()))),
        }
    }

    pub fn calendar_adapter(&self, user_id: &str, kind: ProviderKind) -> Result<Arc<dyn CalendarCapability>, AdapterError> {
        match kind {
            ProviderKind::GoogleCalendar => {
                Ok(Arc::new(GoogleCalendarAdapter::new(user_id, self.token_store.clone(), self.require_google()?)))
            }
            ProviderKind::OutlookCalendar => {
                Ok(Arc::new(OutlookCalendarAdapter::new(user_id, self.token_store.clone(), self.require_microsoft()?)))
            }
            other => Err(AdapterError::InvalidArgument(format!("{} has no calendar capability", other.as_str()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_provider_falls_back_to_local_fs_with_no_credential() {
        let tmp = tempfile::tempdir().unwrap();
        let token_store = TokenStore::load(tmp.path()).unwrap();
        let factory = AdapterFactory::new(token_store, tmp.path().to_path_buf(), None, None);

        assert_eq!(factory.preferred_email_provider("nobody"), None);
        assert_eq!(factory.preferred_drive_provider("nobody"), Some(ProviderKind::LocalFs));
        assert_eq!(factory.preferred_calendar_provider("nobody"), None);
    }

    #[test]
    fn email_adapter_rejects_a_kind_with_no_email_capability() {
        let tmp = tempfile::tempdir().unwrap();
        let token_store = TokenStore::load(tmp.path()).unwrap();
        let factory = AdapterFactory::new(token_store, tmp.path().to_path_buf(), None, None);

        let err = factory.email_adapter("u1", ProviderKind::LocalFs).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidArgument(_)));
    }
}
