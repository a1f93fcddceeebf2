//! LLM capability: chat-completions transport.
//!
//! Prompt construction lives with the analysis workflow; this module only
//! knows how to move a system+user prompt pair through an OpenAI-compatible
//! HTTP endpoint and hand back the raw response text.

use crate::config::LlmConfig;
use crate::error::{LiveError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Chat-completion capability used by the analysis workflow.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one completion and return the assistant message text.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, timeout, or a response that
    /// carries no assistant content.
    async fn complete(&self, system: &str, user: &str, timeout: Duration) -> Result<String>;
}

/// HTTP client for any server implementing the chat completions API.
pub struct HttpLlm {
    config: LlmConfig,
    client: reqwest::Client,
}

impl HttpLlm {
    /// Create the client.
    ///
    /// # Errors
    ///
    /// Returns a config error when the base URL or model is missing.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            return Err(LiveError::Config("llm.api_url is not set".to_owned()));
        }
        if config.model.trim().is_empty() {
            return Err(LiveError::Config("llm.model is not set".to_owned()));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LiveError::Llm(format!("cannot build HTTP client: {e}")))?;
        info!(url = %config.api_url, model = %config.model, "LLM client configured");
        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .api_url
            .strip_suffix("/v1")
            .unwrap_or(&self.config.api_url);
        format!("{}/v1/chat/completions", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmClient for HttpLlm {
    async fn complete(&self, system: &str, user: &str, timeout: Duration) -> Result<String> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "stream": false,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        let mut request = self
            .client
            .post(self.endpoint())
            .timeout(timeout)
            .json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LiveError::Llm(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LiveError::Llm(format!(
                "provider returned {status}: {}",
                text.chars().take(200).collect::<String>()
            )));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LiveError::Llm(format!("bad response body: {e}")))?;
        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LiveError::Llm("response carries no content".to_owned()))?;
        Ok(content.to_owned())
    }
}

/// Scripted client for tests: replays queued responses, then a default.
pub struct MockLlm {
    script: std::sync::Mutex<std::collections::VecDeque<Result<String>>>,
    default: String,
}

impl MockLlm {
    pub fn new(default: &str) -> Self {
        Self {
            script: std::sync::Mutex::new(std::collections::VecDeque::new()),
            default: default.to_owned(),
        }
    }

    pub fn push_response(&self, text: &str) {
        self.script
            .lock()
            .expect("mock llm lock")
            .push_back(Ok(text.to_owned()));
    }

    pub fn push_error(&self, message: &str) {
        self.script
            .lock()
            .expect("mock llm lock")
            .push_back(Err(LiveError::Llm(message.to_owned())));
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, _system: &str, _user: &str, _timeout: Duration) -> Result<String> {
        if let Some(step) = self.script.lock().expect("mock llm lock").pop_front() {
            return step;
        }
        Ok(self.default.clone())
    }
}
