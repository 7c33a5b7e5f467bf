use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use tracing::{info, instrument, warn};

use crate::pickle::{self, PickleValue};
use crate::{Credential, CredentialCheck, Provider};

/// File-based credential store, rooted at `<data_root>/data/auth/`.
///
/// Google credentials are read/written through the minimal pickle codec in
/// [`crate::pickle`]; Microsoft (and the synthetic `local` provider) use
/// plain JSON. Both live one file per user, matching §6's on-disk layout.
#[derive(Debug, Clone)]
pub struct TokenStore {
    auth_root: PathBuf,
}

impl TokenStore {
    /// `data_root` is the configured data directory; token files live under
    /// `<data_root>/auth/<provider>_user_token/<user_id>.<ext>`.
    pub fn load(data_root: &Path) -> Result<Self> {
        let auth_root = data_root.join("auth");
        std::fs::create_dir_all(&auth_root)?;
        Ok(TokenStore { auth_root })
    }

    pub fn path(&self) -> &Path {
        &self.auth_root
    }

    fn token_path(&self, provider: Provider, user_id: &str) -> PathBuf {
        self.auth_root
            .join(provider.token_dir())
            .join(format!("{user_id}.{}", provider.extension()))
    }

    #[instrument(skip(self))]
    pub fn load_credential(&self, user_id: &str, provider: Provider) -> Option<Credential> {
        let path = self.token_path(provider, user_id);
        let bytes = std::fs::read(&path).ok()?;
        match provider {
            Provider::Google => match pickle::decode(&bytes) {
                Ok(value) => credential_from_pickle(provider, &value),
                Err(e) => {
                    warn!("malformed google token file for {}: {}", user_id, e);
                    None
                }
            },
            Provider::Microsoft | Provider::Local => match serde_json::from_slice::<Credential>(&bytes) {
                Ok(cred) => Some(cred),
                Err(e) => {
                    warn!("malformed {} token file for {}: {}", provider.as_str(), user_id, e);
                    None
                }
            },
        }
    }

    /// Atomic rename-based write: the credential is serialized to a temp
    /// file in the same directory, then renamed over the target path so a
    /// concurrent reader never observes a partial write.
    #[instrument(skip(self, credential))]
    pub fn save(&self, user_id: &str, provider: Provider, credential: &Credential) -> Result<()> {
        let path = self.token_path(provider, user_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let bytes = match provider {
            Provider::Google => encode_google_pickle(credential),
            Provider::Microsoft | Provider::Local => serde_json::to_vec_pretty(credential)?,
        };

        let tmp_path = path.with_extension(format!("{}.tmp", provider.extension()));
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, &path)?;
        info!("saved credential for {} / {}", user_id, provider.as_str());
        Ok(())
    }

    /// Pure function of the stored credential, with at most one refresh
    /// attempt when `expired && refreshable`. Never retries; the sync layer
    /// owns retry policy.
    pub async fn check<F, Fut>(
        &self,
        user_id: &str,
        provider: Provider,
        refresh: F,
    ) -> CredentialCheck
    where
        F: FnOnce(Credential) -> Fut,
        Fut: std::future::Future<Output = Result<Credential>>,
    {
        let Some(credential) = self.load_credential(user_id, provider) else {
            return CredentialCheck::absent();
        };

        if !credential.is_expired() {
            return CredentialCheck {
                authenticated: true,
                valid: true,
                expired: false,
                refreshable: credential.is_refreshable(),
                error: None,
            };
        }

        if !credential.is_refreshable() {
            return CredentialCheck {
                authenticated: true,
                valid: false,
                expired: true,
                refreshable: false,
                error: None,
            };
        }

        match refresh(credential).await {
            Ok(refreshed) => {
                if let Err(e) = self.save(user_id, provider, &refreshed) {
                    warn!("refreshed credential for {} but failed to persist: {}", user_id, e);
                }
                CredentialCheck {
                    authenticated: true,
                    valid: true,
                    expired: false,
                    refreshable: true,
                    error: None,
                }
            }
            Err(e) => CredentialCheck {
                authenticated: true,
                valid: false,
                expired: true,
                refreshable: true,
                error: Some(e.to_string()),
            },
        }
    }

    /// Enumerate `user_id`s that have a (possibly invalid) credential file
    /// for `provider`.
    pub fn list_users_with_credential(&self, provider: Provider) -> Vec<String> {
        let dir = self.auth_root.join(provider.token_dir());
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };

        let ext = format!(".{}", provider.extension());
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                name.strip_suffix(&ext).map(|s| s.to_string())
            })
            .collect()
    }
}

fn credential_from_pickle(provider: Provider, value: &PickleValue) -> Option<Credential> {
    let dict = value.as_dict()?;
    // google-auth stores these under slightly different names depending on
    // version (`token`/`_token`, `expiry`/`_expiry`); check both.
    let access_token = value
        .get_str("token")
        .or_else(|| value.get_str("_token"))
        .unwrap_or_default();
    let refresh_token = value.get_str("refresh_token").or_else(|| value.get_str("_refresh_token"));
    let scope = value
        .get_str_list("scopes")
        .or_else(|| value.get_str_list("_scopes"))
        .map(|s| s.join(" "));
    let expires_at = dict
        .get("expiry")
        .or_else(|| dict.get("_expiry"))
        .and_then(pickle_value_to_datetime);

    Some(Credential {
        provider,
        access_token,
        refresh_token,
        expires_at,
        scope,
        token_type: Some("Bearer".to_string()),
    })
}

/// `google-auth` stores `expiry` as a naive UTC datetime via its own reduce
/// chain; the minimal decoder surfaces unrecognized objects as strings, so
/// accept either an RFC3339 string or leave it absent rather than guess.
fn pickle_value_to_datetime(value: &PickleValue) -> Option<DateTime<Utc>> {
    match value {
        PickleValue::Str(s) => DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc)),
        PickleValue::Float(secs) => Utc.timestamp_opt(*secs as i64, 0).single(),
        PickleValue::Int(secs) => Utc.timestamp_opt(*secs, 0).single(),
        _ => None,
    }
}

fn encode_google_pickle(credential: &Credential) -> Vec<u8> {
    let mut fields: Vec<(&str, PickleValue)> = vec![
        ("token", PickleValue::Str(credential.access_token.clone())),
    ];
    if let Some(refresh) = &credential.refresh_token {
        fields.push(("refresh_token", PickleValue::Str(refresh.clone())));
    }
    if let Some(expiry) = credential.expires_at {
        fields.push(("expiry", PickleValue::Str(expiry.to_rfc3339())));
    }
    if let Some(scope) = &credential.scope {
        fields.push((
            "scopes",
            PickleValue::List(scope.split_whitespace().map(|s| PickleValue::Str(s.to_string())).collect()),
        ));
    }
    pickle::encode_flat_dict(&fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_credential_is_not_authenticated() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::load(dir.path()).unwrap();
        let check = store
            .check("u1", Provider::Microsoft, |c| async move { Ok(c) })
            .await;
        assert!(!check.authenticated);
    }

    #[test]
    fn save_then_load_roundtrips_microsoft_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::load(dir.path()).unwrap();
        let cred = Credential {
            provider: Provider::Microsoft,
            access_token: "tok".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: None,
            scope: Some("Mail.Read".to_string()),
            token_type: Some("Bearer".to_string()),
        };
        store.save("u1", Provider::Microsoft, &cred).unwrap();
        let loaded = store.load_credential("u1", Provider::Microsoft).unwrap();
        assert_eq!(loaded.access_token, "tok");
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh"));
    }

    #[test]
    fn save_then_load_roundtrips_google_pickle() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::load(dir.path()).unwrap();
        let cred = Credential {
            provider: Provider::Google,
            access_token: "gtok".to_string(),
            refresh_token: Some("grefresh".to_string()),
            expires_at: None,
            scope: Some("https://mail.google.com/".to_string()),
            token_type: Some("Bearer".to_string()),
        };
        store.save("u2", Provider::Google, &cred).unwrap();
        let loaded = store.load_credential("u2", Provider::Google).unwrap();
        assert_eq!(loaded.access_token, "gtok");
        assert_eq!(loaded.refresh_token.as_deref(), Some("grefresh"));
    }

    #[test]
    fn list_users_with_credential_enumerates_token_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::load(dir.path()).unwrap();
        let cred = Credential {
            provider: Provider::Microsoft,
            access_token: "t".to_string(),
            refresh_token: None,
            expires_at: None,
            scope: None,
            token_type: None,
        };
        store.save("alice", Provider::Microsoft, &cred).unwrap();
        store.save("bob", Provider::Microsoft, &cred).unwrap();
        let mut users = store.list_users_with_credential(Provider::Microsoft);
        users.sort();
        assert_eq!(users, vec!["alice".to_string(), "bob".to_string()]);
    }
}
