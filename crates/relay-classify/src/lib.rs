//! Email Classifier (C7) + Action Executor (C8): an LLM judgment over each
//! newly ingested email, followed by a provider-side action dispatched
//! through the same [`relay_providers::EmailCapability`] the Ingestion
//! Pipeline reads from.

mod classifier;
mod executor;
mod llm;
mod model;
mod pipeline;

pub use classifier::{parse_classification_response, EmailClassifier};
pub use executor::{ActionExecutor, ExecutionOutcome};
pub use llm::{HttpLlmClient, LlmClient};
pub use model::{Action, ClassificationResult, ClassificationRule, Priority};
pub use pipeline::ClassificationPass;
