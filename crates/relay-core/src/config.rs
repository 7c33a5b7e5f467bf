//! Configuration surface (§6): a TOML file with environment-variable
//! overrides; a missing file or missing section falls back to defaults
//! rather than erroring.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub data_root: String,
    pub sync: SyncConfig,
    pub mcp: McpConfig,
    pub worker_pool: WorkerPoolConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            data_root: "./data".to_string(),
            sync: SyncConfig::default(),
            mcp: McpConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub providers: HashMap<String, SyncProviderConfig>,
    pub email_processing: EmailProcessingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncProviderConfig {
    pub limit_per_folder: i64,
    pub force_reingest: bool,
    pub save_attachments: bool,
    pub days_filter: i64,
}

impl Default for SyncProviderConfig {
    fn default() -> Self {
        Self { limit_per_folder: 50, force_reingest: false, save_attachments: true, days_filter: 2 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmailProcessingConfig {
    pub limit_per_sync: i64,
    pub auto_actions: bool,
}

impl Default for EmailProcessingConfig {
    fn default() -> Self {
        Self { limit_per_sync: 500, auto_actions: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub default_top_k: i64,
    pub min_score: f64,
    pub split_prompt: bool,
    pub use_hyde: bool,
    pub rerank: bool,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self { default_top_k: 50, min_score: 0.2, split_prompt: false, use_hyde: false, rerank: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub size: usize,
    pub request_timeout_secs: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { size: 4, request_timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_secs: f64,
    pub factor: f64,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { base_delay_secs: 1.0, factor: 2.0, max_retries: 3 }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> relay_providers::RetryPolicy {
        relay_providers::RetryPolicy {
            base_delay: std::time::Duration::from_secs_f64(self.base_delay_secs),
            factor: self.factor,
            max_retries: self.max_retries,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl RelayConfig {
    /// Loads `path` if it exists, falling back to defaults; then applies
    /// `RELAY_<SECTION>_<KEY>` environment overrides on top. Per-provider
    /// `sync.<provider>.*` settings are TOML-only: splitting a dynamic
    /// provider name like `google_email` back out of an env key such as
    /// `RELAY_SYNC_GOOGLE_EMAIL_LIMIT_PER_FOLDER` is ambiguous (is the
    /// provider `google` or `google_email`?), so those stay config-file-only
    /// (recorded as an open decision).
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&contents).with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_str("RELAY_DATA_ROOT") {
            self.data_root = v;
        }

        if let Some(v) = env_i64("RELAY_SYNC_EMAIL_PROCESSING_LIMIT_PER_SYNC") {
            self.sync.email_processing.limit_per_sync = v;
        }
        if let Some(v) = env_bool("RELAY_SYNC_EMAIL_PROCESSING_AUTO_ACTIONS") {
            self.sync.email_processing.auto_actions = v;
        }

        if let Some(v) = env_i64("RELAY_MCP_DEFAULT_TOP_K") {
            self.mcp.default_top_k = v;
        }
        if let Some(v) = env_f64("RELAY_MCP_MIN_SCORE") {
            self.mcp.min_score = v;
        }
        if let Some(v) = env_bool("RELAY_MCP_SPLIT_PROMPT") {
            self.mcp.split_prompt = v;
        }
        if let Some(v) = env_bool("RELAY_MCP_USE_HYDE") {
            self.mcp.use_hyde = v;
        }
        if let Some(v) = env_bool("RELAY_MCP_RERANK") {
            self.mcp.rerank = v;
        }

        if let Some(v) = env_usize("RELAY_WORKER_POOL_SIZE") {
            self.worker_pool.size = v;
        }
        if let Some(v) = env_i64("RELAY_WORKER_POOL_REQUEST_TIMEOUT_SECS") {
            self.worker_pool.request_timeout_secs = v as u64;
        }

        if let Some(v) = env_f64("RELAY_RETRY_BASE_DELAY_SECS") {
            self.retry.base_delay_secs = v;
        }
        if let Some(v) = env_f64("RELAY_RETRY_FACTOR") {
            self.retry.factor = v;
        }
        if let Some(v) = env_i64("RELAY_RETRY_MAX_RETRIES") {
            self.retry.max_retries = v as u32;
        }

        if let Some(v) = env_str("RELAY_LOGGING_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env_str("RELAY_LOGGING_FORMAT") {
            self.logging.format = if v.eq_ignore_ascii_case("json") { LogFormat::Json } else { LogFormat::Pretty };
        }
    }

    /// Provider config for `name`, falling back to that provider's defaults
    /// if absent from the TOML file.
    pub fn provider(&self, name: &str) -> SyncProviderConfig {
        self.sync.providers.get(name).cloned().unwrap_or_default()
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = RelayConfig::load(Path::new("/nonexistent/relay.toml")).unwrap();
        assert_eq!(config.worker_pool.size, 4);
        assert_eq!(config.sync.email_processing.limit_per_sync, 500);
        assert!(!config.sync.email_processing.auto_actions);
    }

    #[test]
    fn provider_falls_back_to_defaults_when_unconfigured() {
        let config = RelayConfig::default();
        let provider = config.provider("google_email");
        assert_eq!(provider.limit_per_folder, 50);
        assert_eq!(provider.days_filter, 2);
    }

    #[test]
    fn parses_provider_table_from_toml() {
        let toml = r#"
            data_root = "/srv/relay"

            [sync.providers.google_email]
            limit_per_folder = 100
            days_filter = 7

            [sync.email_processing]
            auto_actions = true
        "#;
        let config: RelayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.data_root, "/srv/relay");
        assert_eq!(config.provider("google_email").limit_per_folder, 100);
        assert_eq!(config.provider("google_email").days_filter, 7);
        assert!(config.sync.email_processing.auto_actions);
    }
}
