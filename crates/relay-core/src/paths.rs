//! Filesystem layout rooted at the configured `data_root` (§6): separate
//! SQLite files for content and vectors, plus per-user auth/registry/storage
//! subdirectories, instead of a single database under a platform-specific
//! application-support directory.

use std::path::{Path, PathBuf};

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct RelayPaths {
    pub data_root: PathBuf,
    pub content_db_path: PathBuf,
    pub vector_db_path: PathBuf,
    pub auth_root: PathBuf,
    pub registry_root: PathBuf,
    pub storage_root: PathBuf,
    pub socket_path: PathBuf,
    pub admin_socket_path: PathBuf,
}

impl RelayPaths {
    pub fn from_root(data_root: PathBuf) -> Self {
        Self {
            content_db_path: data_root.join("content.sqlite3"),
            vector_db_path: data_root.join("vectors.sqlite3"),
            auth_root: data_root.join("auth"),
            registry_root: data_root.join("registry"),
            storage_root: data_root.join("storage"),
            socket_path: data_root.join("mcp.sock"),
            admin_socket_path: data_root.join("admin.sock"),
            data_root,
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_root)?;
        std::fs::create_dir_all(&self.auth_root)?;
        std::fs::create_dir_all(&self.registry_root)?;
        std::fs::create_dir_all(&self.storage_root)?;
        std::fs::create_dir_all(self.data_root.join("tmp"))?;
        Ok(())
    }

    /// `data/storage/user_<user_id>/` (§6), the local-storage root the
    /// multiplexer's `LocalFs` drive fallback reads and writes.
    pub fn user_storage_dir(&self, user_id: &str) -> PathBuf {
        self.storage_root.join(format!("user_{user_id}"))
    }
}

/// `<data_root>/tmp/` is also where the Ingestion Pipeline stages per-run
/// temp files; exposed so callers can point a fresh [`relay_ingest::Pipeline`]
/// at the same root without re-deriving the path.
pub fn temp_root(data_root: &Path) -> PathBuf {
    data_root.join("tmp")
}
