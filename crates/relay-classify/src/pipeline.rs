//! Ties the pure classifier to the Content Store and File Registry: loads
//! conversation history and user rules, runs the classifier, and persists
//! `is_classified` only on a genuine (non-default) result (§4.7).

use anyhow::Result;
use relay_registry::FileRegistry;
use relay_store::{ContentStore, Email};
use tracing::info;

use crate::classifier::EmailClassifier;
use crate::llm::LlmClient;
use crate::model::{ClassificationResult, ClassificationRule};

pub struct ClassificationPass<'a, C> {
    classifier: &'a EmailClassifier<C>,
    store: &'a ContentStore,
    registry: &'a FileRegistry,
}

impl<'a, C: LlmClient> ClassificationPass<'a, C> {
    pub fn new(classifier: &'a EmailClassifier<C>, store: &'a ContentStore, registry: &'a FileRegistry) -> Self {
        Self { classifier, store, registry }
    }

    /// Classifies every unclassified email for `user_id`, up to `limit`
    /// (the Sync Manager's `limit_per_sync`, default 500).
    pub async fn run(&self, user_id: &str, limit: i64) -> Result<Vec<(Email, ClassificationResult)>> {
        let pending = self.store.emails().get_unclassified(user_id, limit).await?;
        let rules = self.load_rules(user_id).await?;

        let mut results = Vec::with_capacity(pending.len());
        for email in pending {
            let history = match &email.conversation_id {
                Some(cid) => self.store.emails().get_by_conversation(user_id, cid).await?,
                None => Vec::new(),
            };

            let (result, succeeded) = self.classifier.classify(&email, &history, &rules).await;

            if succeeded {
                self.store.emails().update_classification(email.id, result.action.as_str()).await?;
                self.registry.update_email_classification(&email.email_id, result.action.as_str()).await?;
                info!("classified email {} as {}", email.email_id, result.action.as_str());
            }

            results.push((email, result));
        }

        Ok(results)
    }

    async fn load_rules(&self, user_id: &str) -> Result<Vec<ClassificationRule>> {
        let Some(prefs) = self.store.user_preferences().get(user_id).await? else {
            return Ok(Vec::new());
        };
        let rules = prefs
            .get("rules")
            .and_then(|v| serde_json::from_value::<Vec<ClassificationRule>>(v.clone()).ok())
            .unwrap_or_default();
        Ok(rules)
    }
}
