//! The sync daemon (C6) and stdio tool-server (C9) binary. One process
//! serves exactly one already-authenticated user over a single stdio
//! connection: line-delimited JSON frames on stdin/stdout, where `tool`
//! requests and `method` (admin) requests share the same stream,
//! disambiguated the way `McpHandler` already dispatches them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use relay_auth::OAuthConfig;
use relay_classify::HttpLlmClient;
use relay_core::{LogFormat, RelayConfig, RelayPaths, SyncManager};
use relay_mcp::{McpContext, McpHandler, ToolRequest, ToolResponse};
use relay_providers::AdapterFactory;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("RELAY_CONFIG_PATH").unwrap_or_else(|_| "./relay.toml".to_string());
    let config = RelayConfig::load(std::path::Path::new(&config_path))?;
    init_tracing(&config);

    let user_id = std::env::var("RELAY_USER_ID").context(
        "RELAY_USER_ID must name the single user this daemon instance serves",
    )?;

    let paths = RelayPaths::from_root(PathBuf::from(&config.data_root));
    paths.ensure_dirs()?;

    let google_oauth = oauth_from_env("GOOGLE");
    let microsoft_oauth = oauth_from_env("MICROSOFT");
    let llm = llm_client_from_env();

    info!("initializing sync manager (loading embedder, opening stores)...");
    let manager = Arc::new(
        SyncManager::init(paths.clone(), config.clone(), google_oauth.clone(), microsoft_oauth.clone(), llm)
            .await
            .context("initializing sync manager")?,
    );
    info!("sync manager ready");

    let tick_secs: u64 = std::env::var("RELAY_SYNC_TICK_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(300);
    let tick_handle = manager.clone().spawn_tick_loop(Duration::from_secs(tick_secs));

    // `RELAY_MODE=background` runs only the tick loop with no stdio tool
    // surface attached, for an operator-launched always-on sync daemon
    // (`relay-cli daemon start`). Default mode serves one stdio connection
    // for an external assistant and exits when that connection closes.
    if std::env::var("RELAY_MODE").as_deref() == Ok("background") {
        info!("running in background mode (tick loop only, no stdio tool surface)");
        tick_handle.await?;
        return Ok(());
    }

    let adapter_factory = Arc::new(AdapterFactory::new(
        relay_auth::TokenStore::load(&paths.data_root)?,
        paths.data_root.clone(),
        google_oauth,
        microsoft_oauth,
    ));

    let ctx = McpContext::new(
        user_id,
        Arc::new(manager.content_store().clone()),
        manager.vector_store(),
        adapter_factory,
        config,
        Some(manager),
    );
    let handler = Arc::new(McpHandler::new(ctx));

    serve_stdio(handler).await
}

async fn serve_stdio(handler: Arc<McpHandler>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ToolRequest>(trimmed) {
            Ok(request) => handler.handle(request).await,
            Err(err) => {
                error!("invalid request frame: {err}");
                ToolResponse { id: None, ok: false, result: None, error: Some(format!("invalid request: {err}")) }
            }
        };
        let payload = serde_json::to_string(&response)?;
        stdout.write_all(payload.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

/// Reads `ROOT_CLIENT_ID`/`ROOT_CLIENT_SECRET`/`ROOT_AUTH_URL`/`ROOT_TOKEN_URL`/
/// `ROOT_REDIRECT_URI` for `root ∈ {GOOGLE, MICROSOFT}`; returns `None` if the
/// client id is unset, so a daemon with only one provider configured doesn't
/// fail to start over the other.
fn oauth_from_env(root: &str) -> Option<OAuthConfig> {
    let client_id = std::env::var(format!("{root}_CLIENT_ID")).ok()?;
    let client_secret = std::env::var(format!("{root}_CLIENT_SECRET")).unwrap_or_default();
    let auth_url = std::env::var(format!("{root}_AUTH_URL")).unwrap_or_default();
    let token_url = std::env::var(format!("{root}_TOKEN_URL")).unwrap_or_default();
    let redirect_uri = std::env::var(format!("{root}_REDIRECT_URI")).ok();
    Some(OAuthConfig { client_id, client_secret, auth_url, token_url, redirect_uri })
}

fn llm_client_from_env() -> HttpLlmClient {
    let base_url = std::env::var("LLM_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    let api_key = std::env::var("LLM_API_KEY").unwrap_or_default();
    let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
    HttpLlmClient::new(base_url, api_key, model)
}

fn init_tracing(config: &RelayConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_writer(std::io::stderr).with_env_filter(filter);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}
