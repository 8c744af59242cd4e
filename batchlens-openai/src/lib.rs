//! An [`Analyzer`] backed by an OpenAI-compatible chat completions API.
//!
//! The model is asked to classify an ERP batch-job error and to answer with a JSON object of the
//! shape `{"category", "severity", "explanation", "suggestions"}`.
//!
//! ```no_run
//! # use batchlens::prelude::*;
//! # use batchlens::store::memory::InMemoryJobStore;
//! use batchlens_openai::{OpenAiAnalyzer, OpenAiConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let analyzer = OpenAiAnalyzer::new(OpenAiConfig::new("sk-..."))?;
//! let handle = Batchlens::new(InMemoryJobStore::new(), analyzer).spawn();
//! handle.submit("ORA-00060: deadlock detected while waiting for resource").await?;
//! # Ok(())
//! # }
//! ```
use std::time::Duration;

use async_trait::async_trait;
use batchlens::analyzer::{Analysis, AnalysisError, Analyzer};
use reqwest::StatusCode;
use thiserror::Error;

mod types;

use types::{ChatMessage, ChatRequest, ChatResponse, ErrorResponse, ResponseFormat};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const SYSTEM_PROMPT: &str = "You are an expert in ERP batch processing. \
Classify the batch job error you are given and explain its likely cause. \
Answer with a single JSON object with the fields \
\"category\" (for example \"Code Defect\", \"Data Issue\", \"Infrastructure\", \"Configuration\"), \
\"severity\" (one of \"Low\", \"Medium\", \"High\", \"Critical\"), \
\"explanation\" (a short paragraph) and \
\"suggestions\" (a list of concrete remediation steps).";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    /// Base URL of the API, without the `/chat/completions` suffix.
    pub base_url: String,
    pub model: String,
    pub request_timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            model: DEFAULT_MODEL.to_owned(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Reads `OPENAI_API_KEY`, `OPENAI_BASE_URL` and `OPENAI_MODEL`.
    ///
    /// Returns `None` when no API key is set.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())?;
        let mut config = Self::new(api_key);
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            config.model = model;
        }
        Some(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Error)]
pub enum OpenAiError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct OpenAiAnalyzer {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiAnalyzer {
    pub fn new(config: OpenAiConfig) -> Result<Self, OpenAiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    async fn send(&self, description: &str) -> Result<String, AnalysisError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: description,
                },
            ],
            temperature: 0.2,
            max_tokens: 800,
            response_format: ResponseFormat::JSON_OBJECT,
        };

        let response = self
            .client
            .post(self.config.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| self.transport_error(err))?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let response: ChatResponse = serde_json::from_str(&body)
            .map_err(|err| AnalysisError::Malformed(format!("Invalid response body: {err}")))?;
        if let Some(usage) = &response.usage {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "Analysis token usage"
            );
        }
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| AnalysisError::Malformed("Response has no message content".to_owned()))
    }

    fn transport_error(&self, err: reqwest::Error) -> AnalysisError {
        if err.is_timeout() {
            AnalysisError::Timeout(self.config.request_timeout)
        } else {
            AnalysisError::Unavailable(err.to_string())
        }
    }
}

#[async_trait]
impl Analyzer for OpenAiAnalyzer {
    async fn analyze(&self, description: &str) -> Result<Analysis, AnalysisError> {
        let content = self.send(description).await?;
        parse_analysis(&content)
            .inspect_err(|err| tracing::warn!(?err, "Unusable analysis response: {content}"))
    }
}

/// Rate limits and server side errors are worth retrying, anything else is the request's fault.
fn status_error(status: StatusCode, body: &str) -> AnalysisError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|response| response.error.message)
        .unwrap_or_else(|_| body.trim().to_owned());
    let message = format!("{status}: {message}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        AnalysisError::Unavailable(message)
    } else {
        AnalysisError::Rejected(message)
    }
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn parse_analysis(content: &str) -> Result<Analysis, AnalysisError> {
    let analysis: Analysis = serde_json::from_str(strip_code_fence(content))
        .map_err(|err| AnalysisError::Malformed(err.to_string()))?;
    if analysis.category.trim().is_empty() || analysis.severity.trim().is_empty() {
        return Err(AnalysisError::Malformed(
            "Analysis is missing a category or severity".to_owned(),
        ));
    }
    Ok(analysis)
}
