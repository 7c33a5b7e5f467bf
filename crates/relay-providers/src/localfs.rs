//! Trivial local-filesystem adapter over `data/storage/user_<user_id>/`
//! (§6). Mirrors [`crate::drive::DriveCapability`] so the multiplexer can
//! treat it the same as a remote Drive, without any network retry policy
//! since there is nothing to retry against.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::drive::{DriveCapability, DriveFile, FetchedFile, ListFilesOptions};
use crate::retry::AdapterError;

pub struct LocalFsAdapter {
    root: PathBuf,
}

impl LocalFsAdapter {
    /// `data_root` is the configured data directory; files live under
    /// `<data_root>/storage/user_<user_id>/`.
    pub fn new(data_root: &std::path::Path, user_id: &str) -> Self {
        Self { root: data_root.join("storage").join(format!("user_{user_id}")) }
    }
}

#[async_trait]
impl DriveCapability for LocalFsAdapter {
    fn provider_id(&self) -> &str {
        "local_fs"
    }

    async fn list_files(&self, opts: &ListFilesOptions) -> Result<Vec<DriveFile>, AdapterError> {
        let dir = match &opts.folder_id {
            Some(sub) => self.root.join(sub),
            None => self.root.clone(),
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AdapterError::PermanentUpstream(format!("localfs read_dir {}: {e}", dir.display()))),
        };

        let limit = if opts.limit == 0 { usize::MAX } else { opts.limit };
        let mut files = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("localfs read_dir entry: {e}")))?
        {
            if files.len() >= limit {
                break;
            }
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if metadata.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(query) = &opts.query {
                if !name.to_lowercase().contains(&query.to_lowercase()) {
                    continue;
                }
            }

            let modified_at = metadata
                .modified()
                .ok()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(Utc::now);

            files.push(DriveFile {
                file_id: entry.path().to_string_lossy().to_string(),
                name,
                mime_type: mime_guess_from_name(&entry.file_name().to_string_lossy()),
                modified_at,
                is_folder: false,
            });
        }

        Ok(files)
    }

    async fn get_file_content(&self, file_id: &str) -> Result<FetchedFile, AdapterError> {
        let path = PathBuf::from(file_id);
        if !path.starts_with(&self.root) {
            return Err(AdapterError::InvalidArgument("localfs: file path outside user storage root".to_string()));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => AdapterError::NotFound(format!("localfs: {}", path.display())),
                _ => AdapterError::PermanentUpstream(format!("localfs read {}: {e}", path.display())),
            })?;

        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let mime_type = mime_guess_from_name(&name);
        let extension = path.extension().map(|e| e.to_string_lossy().to_string()).unwrap_or_else(|| "bin".to_string());
        Ok(FetchedFile { bytes, mime_type, extension })
    }

    async fn list_folders(&self) -> Result<Vec<DriveFile>, AdapterError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AdapterError::PermanentUpstream(format!("localfs read_dir {}: {e}", self.root.display()))),
        };

        let mut folders = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AdapterError::PermanentUpstream(format!("localfs read_dir entry: {e}")))?
        {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !metadata.is_dir() {
                continue;
            }
            let modified_at = metadata.modified().ok().map(DateTime::<Utc>::from).unwrap_or_else(Utc::now);
            folders.push(DriveFile {
                file_id: entry.path().to_string_lossy().to_string(),
                name: entry.file_name().to_string_lossy().to_string(),
                mime_type: "inode/directory".to_string(),
                modified_at,
                is_folder: true,
            });
        }
        Ok(folders)
    }
}

fn mime_guess_from_name(name: &str) -> String {
    match name.rsplit('.').next().unwrap_or_default().to_lowercase().as_str() {
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_and_reads_files_under_user_root() {
        let tmp = tempfile::tempdir().unwrap();
        let user_dir = tmp.path().join("storage").join("user_u1");
        tokio::fs::create_dir_all(&user_dir).await.unwrap();
        tokio::fs::write(user_dir.join("notes.txt"), b"hello").await.unwrap();

        let adapter = LocalFsAdapter::new(tmp.path(), "u1");
        let files = adapter.list_files(&ListFilesOptions::default()).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "notes.txt");

        let content = adapter.get_file_content(&files[0].file_id).await.unwrap();
        assert_eq!(content.bytes, b"hello");
    }

    #[tokio::test]
    async fn rejects_file_ids_outside_the_user_root() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = LocalFsAdapter::new(tmp.path(), "u1");
        let err = adapter.get_file_content("/etc/passwd").await.unwrap_err();
        assert!(matches!(err, AdapterError::InvalidArgument(_)));
    }
}
