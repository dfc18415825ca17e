use crate::anthropic::AnthropicClient;
use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, ChatResponse};
use std::time::Duration;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const GLM_BASE_URL: &str = "https://open.bigmodel.cn/api/anthropic";

/// Backend speaking the Anthropic Messages API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    Glm,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Glm => "glm",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::Anthropic => ANTHROPIC_BASE_URL,
            Self::Glm => GLM_BASE_URL,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::Anthropic => "claude-3-5-sonnet-20241022",
            Self::Glm => "glm-4.7",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: Provider,
    pub api_key: String,
    pub model: String,
    /// Overrides the provider's default endpoint. `None` keeps the default.
    pub base_url: Option<String>,
    pub max_tokens: u32,
    /// `None` means a request may wait on the provider indefinitely.
    pub timeout: Option<Duration>,
}

impl LlmConfig {
    pub fn new(provider: Provider, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: api_key.into(),
            model: provider.default_model().to_string(),
            base_url: None,
            max_tokens: 4096,
            timeout: None,
        }
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| self.provider.default_base_url())
    }
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    model: String,
    inner: AnthropicClient,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(cfg: &LlmConfig) -> Result<Self> {
        if cfg.api_key.trim().is_empty() {
            return Err(LlmError::InvalidInput("api key is required".to_string()));
        }
        if cfg.model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model is required".to_string()));
        }

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = cfg.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().unwrap_or_else(|e| {
            tracing::warn!(%e, "reqwest client build failed; falling back to default client");
            reqwest::Client::new()
        });

        let messages_url = messages_url(cfg.base_url());
        tracing::debug!(
            provider = cfg.provider.as_str(),
            model = %cfg.model,
            %messages_url,
            "completion client configured"
        );
        Ok(Self {
            provider: cfg.provider,
            model: cfg.model.clone(),
            inner: AnthropicClient::new(
                http,
                &cfg.api_key,
                &cfg.model,
                &messages_url,
                cfg.max_tokens,
            ),
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One request/response round trip. No retries.
    #[tracing::instrument(level = "info", skip_all, fields(turns = messages.len()))]
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        self.inner.chat(messages).await
    }
}

fn messages_url(base_url: &str) -> String {
    format!("{}/v1/messages", base_url.trim_end_matches('/'))
}
