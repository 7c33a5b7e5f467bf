//! Operator CLI: drives the same library the daemon uses directly for
//! one-shot admin operations (`status`, `sync-now`, `sync-mbox`,
//! `discover`), and manages the long-running `relay-server` process itself
//! (`daemon start/stop/restart/status/logs`) — there is no admin socket to
//! dial (the daemon's only connection is reserved for one assistant's stdio
//! session), so everything but process lifecycle goes straight through the
//! library the daemon itself runs on.

mod paths;

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use relay_auth::OAuthConfig;
use relay_classify::HttpLlmClient;
use relay_core::{RelayConfig, SyncManager};

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Operator CLI for the sync daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show SyncStatus rows, optionally filtered to one user
    Status {
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Run one sync pass for a single (user, provider) pair right now
    SyncNow {
        #[arg(long)]
        user_id: String,
        /// google_email | microsoft_email
        #[arg(long)]
        provider: String,
    },
    /// Ingest a local mbox file for a user
    SyncMbox {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        path: std::path::PathBuf,
        #[arg(long)]
        force_reingest: bool,
    },
    /// Show which provider the multiplexer would pick per capability
    Discover {
        #[arg(long)]
        user_id: String,
    },
    /// Manage the background daemon process
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

#[derive(Subcommand)]
enum DaemonCommand {
    /// Report whether the daemon's pid file points at a live process
    Status,
    /// Spawn `relay-server` in background (tick-loop-only) mode
    Start,
    /// Stop, then start again
    Restart,
    /// Send SIGTERM to the daemon if it is running
    Stop,
    /// Print the last N lines of the daemon log
    Logs {
        #[arg(short = 'n', default_value = "50")]
        lines: usize,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Status { user_id, json } => cmd_status(user_id, json).await,
        Commands::SyncNow { user_id, provider } => cmd_sync_now(&user_id, &provider).await,
        Commands::SyncMbox { user_id, path, force_reingest } => cmd_sync_mbox(&user_id, &path, force_reingest).await,
        Commands::Discover { user_id } => cmd_discover(&user_id).await,
        Commands::Daemon { command } => cmd_daemon(command),
    }
}

async fn build_manager() -> Result<Arc<SyncManager>> {
    let config_path = std::env::var("RELAY_CONFIG_PATH").unwrap_or_else(|_| "./relay.toml".to_string());
    let config = RelayConfig::load(std::path::Path::new(&config_path))?;
    let paths = paths::relay_paths();
    let manager = SyncManager::init(paths, config, oauth_from_env("GOOGLE"), oauth_from_env("MICROSOFT"), llm_client_from_env())
        .await
        .context("initializing sync manager")?;
    Ok(Arc::new(manager))
}

async fn cmd_status(user_id: Option<String>, json: bool) -> Result<()> {
    let manager = build_manager().await?;
    let rows = match &user_id {
        Some(uid) => manager.content_store().sync_status().list_by_user(uid).await?,
        None => return Err(anyhow!("--user-id is currently required (no cross-user listing endpoint exists)")),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("no sync status recorded for {}", user_id.unwrap());
        return Ok(());
    }
    for row in rows {
        println!(
            "{:<16} {:<10} processed={:<5} succeeded={:<5} failed={:<5} last_success={}",
            row.source_type,
            row.status,
            row.items_processed,
            row.items_succeeded,
            row.items_failed,
            row.last_successful_sync.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string()),
        );
    }
    Ok(())
}

async fn cmd_sync_now(user_id: &str, provider: &str) -> Result<()> {
    let manager = build_manager().await?;
    let outcome = manager.sync_now(user_id, provider).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.success {
        return Err(anyhow!(outcome.error.unwrap_or_else(|| "sync failed".to_string())));
    }
    Ok(())
}

async fn cmd_sync_mbox(user_id: &str, path: &std::path::Path, force_reingest: bool) -> Result<()> {
    let manager = build_manager().await?;
    let outcome = manager.sync_mbox(user_id, path, force_reingest).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.success {
        return Err(anyhow!(outcome.error.unwrap_or_else(|| "sync failed".to_string())));
    }
    Ok(())
}

async fn cmd_discover(user_id: &str) -> Result<()> {
    let config_path = std::env::var("RELAY_CONFIG_PATH").unwrap_or_else(|_| "./relay.toml".to_string());
    let config = RelayConfig::load(std::path::Path::new(&config_path))?;
    let paths = paths::relay_paths();
    paths.ensure_dirs()?;
    let token_store = relay_auth::TokenStore::load(&paths.data_root)?;
    let factory = relay_providers::AdapterFactory::new(token_store, paths.data_root.clone(), oauth_from_env("GOOGLE"), oauth_from_env("MICROSOFT"));
    let _ = config;

    println!(
        "{}",
        serde_json::json!({
            "email": factory.preferred_email_provider(user_id).map(|k| k.as_str()),
            "drive": factory.preferred_drive_provider(user_id).map(|k| k.as_str()),
            "calendar": factory.preferred_calendar_provider(user_id).map(|k| k.as_str()),
        })
    );
    Ok(())
}

fn cmd_daemon(command: DaemonCommand) -> Result<()> {
    match command {
        DaemonCommand::Status => {
            match read_pid() {
                Some(pid) if process_alive(pid) => println!("running (pid {pid})"),
                Some(pid) => println!("stale pid file (pid {pid} not running)"),
                None => println!("not running"),
            }
            Ok(())
        }
        DaemonCommand::Start => start_daemon(),
        DaemonCommand::Stop => stop_daemon(),
        DaemonCommand::Restart => {
            let _ = stop_daemon();
            start_daemon()
        }
        DaemonCommand::Logs { lines } => {
            let log_path = paths::log_file();
            let contents = std::fs::read_to_string(&log_path).with_context(|| format!("reading {}", log_path.display()))?;
            for line in contents.lines().rev().take(lines).collect::<Vec<_>>().into_iter().rev() {
                println!("{line}");
            }
            Ok(())
        }
    }
}

fn start_daemon() -> Result<()> {
    if let Some(pid) = read_pid() {
        if process_alive(pid) {
            return Err(anyhow!("daemon already running (pid {pid})"));
        }
    }

    let data_root = paths::data_root();
    std::fs::create_dir_all(&data_root)?;
    let log_file = std::fs::File::create(paths::log_file())?;

    let child = std::process::Command::new("relay-server")
        .env("RELAY_MODE", "background")
        .env("RELAY_DATA_ROOT", &data_root)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file.try_clone()?))
        .stderr(Stdio::from(log_file))
        .spawn()
        .context("spawning relay-server (is it on PATH?)")?;

    std::fs::write(paths::pid_file(), child.id().to_string())?;
    println!("started daemon (pid {})", child.id());
    Ok(())
}

fn stop_daemon() -> Result<()> {
    let pid = read_pid().ok_or_else(|| anyhow!("no pid file — daemon is not running"))?;
    if !process_alive(pid) {
        std::fs::remove_file(paths::pid_file()).ok();
        return Err(anyhow!("stale pid file removed; daemon was not running"));
    }
    std::process::Command::new("kill").arg(pid.to_string()).status().context("sending SIGTERM")?;
    std::fs::remove_file(paths::pid_file()).ok();
    println!("stopped daemon (pid {pid})");
    Ok(())
}

fn read_pid() -> Option<u32> {
    std::fs::read_to_string(paths::pid_file()).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill").args(["-0", &pid.to_string()]).status().map(|s| s.success()).unwrap_or(false)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

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
