//! The Sync Manager (C6): enumerates authenticated `(user, provider)` pairs,
//! runs the Ingestion Pipeline for each, then the Classifier and Action
//! Executor for email providers (§4.6).
//!
//! Scheduling is a worker-pool shape: a `Semaphore` bounds concurrency and a
//! real per-pair lock replaces tracking in-progress providers by name. There
//! is no ring/graph prioritization here — every due pair is simply
//! dispatched up to the worker-pool size.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use relay_auth::{OAuthConfig, Provider, TokenStore};
use relay_classify::{ActionExecutor, ClassificationPass, EmailClassifier, HttpLlmClient};
use relay_ingest::{doc_id::CanonicalSource, Pipeline, SourceType};
use relay_providers::{AdapterFactory, CapabilityEmailSource, EmailCapability, FetchOptions, MboxSource, ProviderKind};
use relay_registry::FileRegistry;
use relay_store::{ContentStore, SyncStatusValue};
use relay_vector::{embedder_from_env_or_hash, Embedder, VectorStore};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::lock::PairLockMap;
use crate::paths::RelayPaths;
use crate::RelayConfig;

const EMAIL_BATCH_SIZE: usize = 20;

/// Outcome of one `(user, provider)` sync, reported back to whatever
/// triggered it (the tick loop or an admin "sync now" request).
#[derive(Debug, Clone, Serialize)]
pub struct PairOutcome {
    pub user_id: String,
    pub provider: String,
    pub items_found: usize,
    pub items_ingested: usize,
    pub items_skipped: usize,
    pub classified: usize,
    pub actions_executed: usize,
    pub success: bool,
    pub error: Option<String>,
}

impl PairOutcome {
    fn failed(user_id: &str, provider: &str, error: impl ToString) -> Self {
        Self {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            items_found: 0,
            items_ingested: 0,
            items_skipped: 0,
            classified: 0,
            actions_executed: 0,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

pub struct SyncManager {
    config: RelayConfig,
    paths: RelayPaths,
    content_store: ContentStore,
    vector_store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    token_store: TokenStore,
    adapter_factory: Arc<AdapterFactory>,
    classifier: EmailClassifier<HttpLlmClient>,
    pair_locks: Arc<PairLockMap>,
    worker_permits: Arc<Semaphore>,
}

impl SyncManager {
    pub async fn init(
        paths: RelayPaths,
        config: RelayConfig,
        google_oauth: Option<OAuthConfig>,
        microsoft_oauth: Option<OAuthConfig>,
        llm: HttpLlmClient,
    ) -> Result<Self> {
        paths.ensure_dirs()?;
        let content_store = ContentStore::new(&paths.content_db_path).await?;
        let vector_store = Arc::new(VectorStore::new(&paths.vector_db_path).await?);
        let embedder = embedder_from_env_or_hash();
        let token_store = TokenStore::load(&paths.data_root)?;
        let adapter_factory =
            Arc::new(AdapterFactory::new(token_store.clone(), paths.data_root.clone(), google_oauth, microsoft_oauth));
        let classifier = EmailClassifier::new(llm);
        let worker_permits = Arc::new(Semaphore::new(config.worker_pool.size.max(1)));

        Ok(Self {
            config,
            paths,
            content_store,
            vector_store,
            embedder,
            token_store,
            adapter_factory,
            classifier,
            pair_locks: Arc::new(PairLockMap::new()),
            worker_permits,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn content_store(&self) -> &ContentStore {
        &self.content_store
    }

    pub fn vector_store(&self) -> Arc<VectorStore> {
        self.vector_store.clone()
    }

    /// One full pass over every credential-backed `(user, provider)` pair,
    /// bounded by `worker_pool.size` concurrent tasks. Used both by the
    /// background tick loop and by an admin "sync now" request that wants
    /// every pair rather than one.
    pub async fn run_once(self: &Arc<Self>) -> Vec<PairOutcome> {
        let pairs = self.enumerate_pairs();
        info!(pairs = pairs.len(), "starting sync pass");

        let mut tasks = JoinSet::new();
        for (user_id, kind) in pairs {
            let manager = self.clone();
            let permits = self.worker_permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.expect("worker semaphore is never closed");
                manager.sync_pair(&user_id, kind).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("sync task panicked: {e}"),
            }
        }
        outcomes
    }

    /// Spawns the background tick loop as its own task, driven by
    /// `tokio::time::interval` (§4.6). The returned handle is for shutdown
    /// bookkeeping only; the loop itself never returns under normal
    /// operation.
    pub fn spawn_tick_loop(self: Arc<Self>, period: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let outcomes = self.run_once().await;
                let failed = outcomes.iter().filter(|o| !o.success).count();
                info!(ran = outcomes.len(), failed, "tick complete");
            }
        })
    }

    /// Admin "sync now" entry point for a single credential-backed pair
    /// (§4.6: "a manual sync now admin request ... can also enqueue a
    /// single pass outside the regular tick, sharing the same worker pool
    /// and per-pair lock map"). `provider` is one of `google_email` /
    /// `microsoft_email`.
    pub async fn sync_now(self: &Arc<Self>, user_id: &str, provider: &str) -> Result<PairOutcome> {
        let kind = match provider {
            "google_email" => ProviderKind::GoogleEmail,
            "microsoft_email" => ProviderKind::MicrosoftEmail,
            other => anyhow::bail!("sync_now does not support provider '{other}'"),
        };
        let _permit = self.worker_permits.clone().acquire_owned().await?;
        Ok(self.sync_pair(user_id, kind).await)
    }

    /// Syncs a local mbox file for `user_id`. Mbox has no credential, so it
    /// is never part of [`Self::enumerate_pairs`]'s automatic tick — it is
    /// only reachable through an explicit admin call naming the file.
    pub async fn sync_mbox(self: &Arc<Self>, user_id: &str, mbox_path: &Path, force_reingest: bool) -> Result<PairOutcome> {
        let _permit = self.worker_permits.clone().acquire_owned().await?;
        let _guard = self.pair_locks.acquire(user_id, "mbox").await;

        self.record_sync_started(user_id, "mbox").await;

        let registry = FileRegistry::load(&self.paths.registry_root, user_id).await?;
        let pipeline = Pipeline::new(
            self.content_store.clone(),
            registry,
            self.vector_store.clone(),
            self.embedder.clone(),
            self.paths.data_root.clone(),
        );
        let source = Box::new(MboxSource::new(mbox_path));
        let provider_id = mbox_path.to_string_lossy().to_string();

        let pull = pipeline
            .pull_emails(user_id, &provider_id, CanonicalSource::Mbox, SourceType::Mbox, source, EMAIL_BATCH_SIZE, force_reingest)
            .await?;

        self.record_sync_status(user_id, "mbox", &pull).await;

        Ok(PairOutcome {
            user_id: user_id.to_string(),
            provider: "mbox".to_string(),
            items_found: pull.total_items_found,
            items_ingested: pull.items_ingested,
            items_skipped: pull.items_skipped,
            classified: 0,
            actions_executed: 0,
            success: pull.success,
            error: if pull.errors.is_empty() { None } else { Some(pull.errors.join("; ")) },
        })
    }

    fn enumerate_pairs(&self) -> Vec<(String, ProviderKind)> {
        let mut pairs = Vec::new();
        for user_id in self.token_store.list_users_with_credential(Provider::Google) {
            pairs.push((user_id, ProviderKind::GoogleEmail));
        }
        for user_id in self.token_store.list_users_with_credential(Provider::Microsoft) {
            pairs.push((user_id, ProviderKind::MicrosoftEmail));
        }
        pairs
    }

    #[instrument(skip(self), fields(user_id, provider = kind.as_str()))]
    async fn sync_pair(&self, user_id: &str, kind: ProviderKind) -> PairOutcome {
        let provider = kind.as_str();
        let _guard = self.pair_locks.acquire(user_id, provider).await;

        match self.try_sync_pair(user_id, kind).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(user_id, provider, error = %e, "sync pair failed");
                let _ = self
                    .content_store
                    .sync_status()
                    .upsert(&SyncStatusValue {
                        user_id,
                        source_type: provider,
                        status: "failed",
                        items_processed: 0,
                        items_succeeded: 0,
                        items_failed: 0,
                        total_documents: 0,
                        last_successful_sync: None,
                        error_details: Some(&e.to_string()),
                        metadata: serde_json::json!({}),
                    })
                    .await;
                PairOutcome::failed(user_id, provider, e)
            }
        }
    }

    async fn try_sync_pair(&self, user_id: &str, kind: ProviderKind) -> Result<PairOutcome> {
        let provider = kind.as_str();
        let provider_config = self.config.provider(provider);
        let capability = self.adapter_factory.email_adapter(user_id, kind)?;

        self.record_sync_started(user_id, provider).await;

        let options = FetchOptions {
            folders: Vec::new(),
            query: None,
            limit: provider_config.limit_per_folder as usize,
            min_date: Some(Utc::now() - chrono::Duration::days(provider_config.days_filter)),
        };

        let registry = FileRegistry::load(&self.paths.registry_root, user_id).await?;
        let pipeline = Pipeline::new(
            self.content_store.clone(),
            registry.clone(),
            self.vector_store.clone(),
            self.embedder.clone(),
            self.paths.data_root.clone(),
        );

        let canonical_source = match kind {
            ProviderKind::GoogleEmail => CanonicalSource::GoogleEmail,
            ProviderKind::MicrosoftEmail => CanonicalSource::MicrosoftEmail,
            other => anyhow::bail!("{} is not an email provider", other.as_str()),
        };
        let source_type = match kind {
            ProviderKind::GoogleEmail => SourceType::GoogleEmail,
            ProviderKind::MicrosoftEmail => SourceType::MicrosoftEmail,
            _ => unreachable!("checked above"),
        };

        let source = Box::new(CapabilityEmailSource::new(capability.clone(), options));
        let pull = pipeline
            .pull_emails(user_id, provider, canonical_source, source_type, source, EMAIL_BATCH_SIZE, provider_config.force_reingest)
            .await?;

        self.record_sync_status(user_id, provider, &pull).await;

        let (classified, actions_executed) = self.classify_and_act(user_id, &registry, capability.as_ref()).await;

        Ok(PairOutcome {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            items_found: pull.total_items_found,
            items_ingested: pull.items_ingested,
            items_skipped: pull.items_skipped,
            classified,
            actions_executed,
            success: pull.success,
            error: if pull.errors.is_empty() { None } else { Some(pull.errors.join("; ")) },
        })
    }

    /// Writes the `in_progress, progress=0` row required before a pull
    /// starts (§4.6 step 3, §5's `pending → in_progress → {completed|failed}`
    /// transition). The pipeline itself upserts further `in_progress` rows as
    /// batches flush; this is only the initial marker.
    async fn record_sync_started(&self, user_id: &str, provider: &str) {
        let result = self
            .content_store
            .sync_status()
            .upsert(&relay_store::SyncStatusValue {
                user_id,
                source_type: provider,
                status: "in_progress",
                items_processed: 0,
                items_succeeded: 0,
                items_failed: 0,
                total_documents: 0,
                last_successful_sync: None,
                error_details: None,
                metadata: serde_json::json!({}),
            })
            .await;

        if let Err(e) = result {
            warn!(user_id, provider, error = %e, "failed to persist in-progress SyncStatus");
        }
    }

    async fn record_sync_status(&self, user_id: &str, provider: &str, pull: &relay_ingest::PullResult) {
        let status = if pull.success { "completed" } else { "failed" };
        let error_details = if pull.errors.is_empty() { None } else { Some(pull.errors.join("; ")) };

        let result = self
            .content_store
            .sync_status()
            .upsert(&relay_store::SyncStatusValue {
                user_id,
                source_type: provider,
                status,
                items_processed: pull.total_items_found as i64,
                items_succeeded: pull.items_ingested as i64,
                items_failed: pull.errors.len() as i64,
                total_documents: pull.total_items_found as i64,
                last_successful_sync: pull.success.then(Utc::now),
                error_details: error_details.as_deref(),
                metadata: serde_json::json!({"batches": pull.batches}),
            })
            .await;

        if let Err(e) = result {
            warn!(user_id, provider, error = %e, "failed to persist SyncStatus");
        }
    }

    /// Runs the Classifier pass (§4.7) with `limit_per_sync`, then the
    /// Action Executor (§4.8) over every result if `auto_actions` is set.
    /// Failures here never fail the sync as a whole — the pull already
    /// completed and its `SyncStatus` is already recorded.
    #[instrument(skip_all, fields(user_id))]
    async fn classify_and_act(&self, user_id: &str, registry: &FileRegistry, capability: &dyn EmailCapability) -> (usize, usize) {
        let pass = ClassificationPass::new(&self.classifier, &self.content_store, registry);
        let limit = self.config.sync.email_processing.limit_per_sync;

        let results = match pass.run(user_id, limit).await {
            Ok(results) => results,
            Err(e) => {
                warn!(user_id, error = %e, "classification pass failed");
                return (0, 0);
            }
        };
        let classified = results.len();

        if !self.config.sync.email_processing.auto_actions {
            return (classified, 0);
        }

        let executor = ActionExecutor::new(&self.content_store);
        let mut executed = 0;
        for (email, classification) in &results {
            let subject = email.subject.as_deref().unwrap_or("");
            match executor.execute(user_id, &email.email_id, subject, capability, classification).await {
                Ok(outcome) => {
                    executed += 1;
                    if !outcome.success {
                        warn!(user_id, email_id = %email.email_id, details = %outcome.details, "action executor reported failure");
                    }
                }
                Err(e) => warn!(user_id, email_id = %email.email_id, error = %e, "action executor errored"),
            }
        }

        (classified, executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_outcome_failed_carries_the_error_message() {
        let outcome = PairOutcome::failed("u1", "google_email", "boom");
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("boom"));
        assert_eq!(outcome.items_ingested, 0);
    }
}
