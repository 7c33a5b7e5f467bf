//! A thin trait around the LLM gateway, keeping outbound HTTP calls behind
//! one retrying wrapper so the network boundary is mockable in tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use relay_providers::RetryPolicy;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str, temperature: f32) -> Result<String>;
}

/// OpenAI-compatible chat completion client: one user-role message per
/// call, no streaming, no function calling — classification needs none of
/// it.
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    retry: RetryPolicy,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str, temperature: f32) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = ChatRequest { model: &self.model, temperature, messages: vec![ChatMessage { role: "user", content: prompt }] };

        let response = self
            .retry
            .call("llm completion", || self.http.post(&url).bearer_auth(&self.api_key).json(&body))
            .await?;

        let parsed: ChatResponse = response.json().await?;
        parsed.choices.into_iter().next().map(|c| c.message.content).ok_or_else(|| anyhow!("llm completion returned no choices"))
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Returns a fixed response (or fails) without touching the network —
    /// used by classifier tests.
    pub struct StubLlmClient {
        pub response: Mutex<Result<String, String>>,
    }

    impl StubLlmClient {
        pub fn ok(response: impl Into<String>) -> Self {
            Self { response: Mutex::new(Ok(response.into())) }
        }

        pub fn failing(error: impl Into<String>) -> Self {
            Self { response: Mutex::new(Err(error.into())) }
        }
    }

    #[async_trait]
    impl LlmClient for StubLlmClient {
        async fn complete(&self, _prompt: &str, _temperature: f32) -> Result<String> {
            match &*self.response.lock().unwrap() {
                Ok(text) => Ok(text.clone()),
                Err(e) => Err(anyhow!("{e}")),
            }
        }
    }
}
