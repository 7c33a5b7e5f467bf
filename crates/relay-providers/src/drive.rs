//! Drive-family adapters: Google Drive and OneDrive listing/fetch against
//! [`DriveCapability`] (files.list-style query params, pagination via a
//! next-page token).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use relay_auth::{AuthBridge, Credential, OAuthConfig, Provider, TokenStore};

use crate::retry::{AdapterError, RetryPolicy};

#[derive(Debug, Clone, Default)]
pub struct ListFilesOptions {
    pub folder_id: Option<String>,
    pub query: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct DriveFile {
    pub file_id: String,
    pub name: String,
    pub mime_type: String,
    pub modified_at: DateTime<Utc>,
    pub is_folder: bool,
}

#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub extension: String,
}

/// `ListFiles`/`GetFileContent`/`ListFolders` per §4.2. Native-format
/// documents (Google Docs/Sheets/Slides) are exported to a neutral format
/// by the adapter rather than handed back in their internal representation.
#[async_trait]
pub trait DriveCapability: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn list_files(&self, opts: &ListFilesOptions) -> Result<Vec<DriveFile>, AdapterError>;

    async fn get_file_content(&self, file_id: &str) -> Result<FetchedFile, AdapterError>;

    async fn list_folders(&self) -> Result<Vec<DriveFile>, AdapterError>;
}

const GOOGLE_NATIVE_EXPORTS: &[(&str, &str, &str)] = &[
    ("application/vnd.google-apps.document", "application/pdf", "pdf"),
    ("application/vnd.google-apps.spreadsheet", "application/pdf", "pdf"),
    ("application/vnd.google-apps.presentation", "application/pdf", "pdf"),
    ("application/vnd.google-apps.drawing", "image/png", "png"),
    ("application/vnd.google-apps.script", "text/plain", "txt"),
];

pub struct GoogleDriveAdapter {
    user_id: String,
    http: reqwest::Client,
    token_store: TokenStore,
    auth_bridge: AuthBridge,
    oauth: OAuthConfig,
    retry: RetryPolicy,
}

impl GoogleDriveAdapter {
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
                        .ok_or_else(|| anyhow::anyhow!("google credential has no refresh token"))?;
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
}

#[async_trait]
impl DriveCapability for GoogleDriveAdapter {
    fn provider_id(&self) -> &str {
        "google_storage"
    }

    async fn list_files(&self, opts: &ListFilesOptions) -> Result<Vec<DriveFile>, AdapterError> {
        let token = self.bearer_token().await?;

        let mut q_parts = vec!["trashed = false".to_string(), "mimeType != 'application/vnd.google-apps.folder'".to_string()];
        if let Some(folder_id) = &opts.folder_id {
            q_parts.push(format!("'{folder_id}' in parents"));
        }
        if let Some(query) = &opts.query {
            q_parts.push(format!("name contains '{}'", query.replace('\'', "\\'")));
        }
        let q = q_parts.join(" and ");
        let limit = if opts.limit == 0 { 100 } else { opts.limit };

        let params: Vec<(&str, String)> = vec![
            ("q", q),
            ("fields", "files(id,name,mimeType,modifiedTime)".to_string()),
            ("pageSize", limit.min(1000).to_string()),
        ];

        let response = self
            .retry
            .call("drive:list", || {
                self.http.get("https://www.googleapis.com/drive/v3/files").query(&params).bearer_auth(&token)
            })
            .await?;

        let list: GoogleDriveListResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("drive list decode: {e}")))?;

        Ok(list
            .files
            .into_iter()
            .take(limit)
            .map(|f| DriveFile {
                file_id: f.id,
                name: f.name,
                mime_type: f.mime_type,
                modified_at: f.modified_time.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)).unwrap_or_else(Utc::now),
                is_folder: false,
            })
            .collect())
    }

    async fn get_file_content(&self, file_id: &str) -> Result<FetchedFile, AdapterError> {
        let token = self.bearer_token().await?;

        let meta_response = self
            .retry
            .call("drive:get_meta", || {
                self.http
                    .get(format!("https://www.googleapis.com/drive/v3/files/{file_id}"))
                    .query(&[("fields", "mimeType")])
                    .bearer_auth(&token)
            })
            .await?;
        let meta: GoogleDriveFileMeta = meta_response
            .json()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("drive meta decode: {e}")))?;

        if let Some((_, export_mime, ext)) = GOOGLE_NATIVE_EXPORTS.iter().find(|(native, _, _)| *native == meta.mime_type) {
            let response = self
                .retry
                .call("drive:export", || {
                    self.http
                        .get(format!("https://www.googleapis.com/drive/v3/files/{file_id}/export"))
                        .query(&[("mimeType", *export_mime)])
                        .bearer_auth(&token)
                })
                .await?;
            let bytes = response.bytes().await.map_err(|e| AdapterError::TransientUpstream(e.to_string()))?;
            return Ok(FetchedFile { bytes: bytes.to_vec(), mime_type: export_mime.to_string(), extension: ext.to_string() });
        }

        let response = self
            .retry
            .call("drive:download", || {
                self.http
                    .get(format!("https://www.googleapis.com/drive/v3/files/{file_id}"))
                    .query(&[("alt", "media")])
                    .bearer_auth(&token)
            })
            .await?;
        let bytes = response.bytes().await.map_err(|e| AdapterError::TransientUpstream(e.to_string()))?;
        let extension = extension_from_mime(&meta.mime_type);
        Ok(FetchedFile { bytes: bytes.to_vec(), mime_type: meta.mime_type, extension })
    }

    async fn list_folders(&self) -> Result<Vec<DriveFile>, AdapterError> {
        let token = self.bearer_token().await?;
        let params: Vec<(&str, String)> = vec![
            ("q", "mimeType = 'application/vnd.google-apps.folder' and trashed = false".to_string()),
            ("fields", "files(id,name,modifiedTime)".to_string()),
        ];

        let response = self
            .retry
            .call("drive:list_folders", || {
                self.http.get("https://www.googleapis.com/drive/v3/files").query(&params).bearer_auth(&token)
            })
            .await?;

        let list: GoogleDriveListResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("drive folder list decode: {e}")))?;

        Ok(list
            .files
            .into_iter()
            .map(|f| DriveFile {
                file_id: f.id,
                name: f.name,
                mime_type: "application/vnd.google-apps.folder".to_string(),
                modified_at: f.modified_time.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)).unwrap_or_else(Utc::now),
                is_folder: true,
            })
            .collect())
    }
}

fn extension_from_mime(mime: &str) -> String {
    match mime {
        "application/pdf" => "pdf",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "text/plain" => "txt",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        _ => "bin",
    }
    .to_string()
}

pub struct OneDriveAdapter {
    user_id: String,
    http: reqwest::Client,
    token_store: TokenStore,
    auth_bridge: AuthBridge,
    oauth: OAuthConfig,
    retry: RetryPolicy,
}

impl OneDriveAdapter {
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
                        .ok_or_else(|| anyhow::anyhow!("microsoft credential has no refresh token"))?;
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
}

#[async_trait]
impl DriveCapability for OneDriveAdapter {
    fn provider_id(&self) -> &str {
        "microsoft_storage"
    }

    async fn list_files(&self, opts: &ListFilesOptions) -> Result<Vec<DriveFile>, AdapterError> {
        let token = self.bearer_token().await?;
        let limit = if opts.limit == 0 { 100 } else { opts.limit };

        let url = match &opts.folder_id {
            Some(id) => format!("https://graph.microsoft.com/v1.0/me/drive/items/{id}/children"),
            None => "https://graph.microsoft.com/v1.0/me/drive/root/children".to_string(),
        };

        let mut params: Vec<(&str, String)> = vec![("$top", limit.min(200).to_string())];
        if let Some(q) = &opts.query {
            params.push(("$search", format!("\"{q}\"")));
        }

        let response = self
            .retry
            .call("onedrive:list", || self.http.get(&url).query(&params).bearer_auth(&token))
            .await?;

        let list: GraphDriveItemList = response
            .json()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("onedrive list decode: {e}")))?;

        Ok(list
            .value
            .into_iter()
            .filter(|item| item.folder.is_none())
            .take(limit)
            .map(|item| DriveFile {
                file_id: item.id,
                name: item.name,
                mime_type: item.file.and_then(|f| f.mime_type).unwrap_or_else(|| "application/octet-stream".to_string()),
                modified_at: item
                    .last_modified_date_time
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
                is_folder: false,
            })
            .collect())
    }

    async fn get_file_content(&self, file_id: &str) -> Result<FetchedFile, AdapterError> {
        let token = self.bearer_token().await?;

        let meta_response = self
            .retry
            .call("onedrive:get_meta", || {
                self.http.get(format!("https://graph.microsoft.com/v1.0/me/drive/items/{file_id}")).bearer_auth(&token)
            })
            .await?;
        let meta: GraphDriveItem = meta_response
            .json()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("onedrive meta decode: {e}")))?;
        let mime_type = meta.file.and_then(|f| f.mime_type).unwrap_or_else(|| "application/octet-stream".to_string());

        let response = self
            .retry
            .call("onedrive:download", || {
                self.http
                    .get(format!("https://graph.microsoft.com/v1.0/me/drive/items/{file_id}/content"))
                    .bearer_auth(&token)
            })
            .await?;
        let bytes = response.bytes().await.map_err(|e| AdapterError::TransientUpstream(e.to_string()))?;
        let extension = extension_from_mime(&mime_type);
        Ok(FetchedFile { bytes: bytes.to_vec(), mime_type, extension })
    }

    async fn list_folders(&self) -> Result<Vec<DriveFile>, AdapterError> {
        let token = self.bearer_token().await?;
        let response = self
            .retry
            .call("onedrive:list_folders", || {
                self.http.get("https://graph.microsoft.com/v1.0/me/drive/root/children").bearer_auth(&token)
            })
            .await?;

        let list: GraphDriveItemList = response
            .json()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("onedrive folder list decode: {e}")))?;

        Ok(list
            .value
            .into_iter()
            .filter(|item| item.folder.is_some())
            .map(|item| DriveFile {
                file_id: item.id,
                name: item.name,
                mime_type: "folder".to_string(),
                modified_at: item
                    .last_modified_date_time
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
                is_folder: true,
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct GoogleDriveListResponse {
    files: Vec<GoogleDriveFile>,
}

#[derive(Debug, Deserialize)]
struct GoogleDriveFile {
    id: String,
    name: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
    #[serde(rename = "modifiedTime")]
    modified_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleDriveFileMeta {
    #[serde(rename = "mimeType")]
    mime_type: String,
}

#[derive(Debug, Deserialize)]
struct GraphDriveItemList {
    value: Vec<GraphDriveItem>,
}

#[derive(Debug, Deserialize)]
struct GraphDriveItem {
    id: String,
    name: String,
    #[serde(rename = "lastModifiedDateTime")]
    last_modified_date_time: Option<String>,
    file: Option<GraphFileFacet>,
    folder: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GraphFileFacet {
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_from_mime_maps_known_types() {
        assert_eq!(extension_from_mime("application/pdf"), "pdf");
        assert_eq!(extension_from_mime("application/x-unknown"), "bin");
    }
}
