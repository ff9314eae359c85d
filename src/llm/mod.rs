//! LLM integration.
//!
//! Supports:
//! - **OpenAI**: chat completions over HTTP
//! - **Gemini**: `generateContent` over HTTP
//!
//! Both sit behind [`LlmProvider`]. The backend in use is picked once at
//! startup from an ordered list of candidates: the first one with a
//! credential wins, and any substitution for the configured primary is
//! logged.

mod gemini;
mod openai;
pub mod retry;

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use retry::RetryPolicy;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::SecretString;

use crate::error::LlmError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    OpenAi,
    Gemini,
}

impl LlmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
        }
    }
}

impl fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "gemini" | "google" => Ok(Self::Gemini),
            other => Err(format!("unknown LLM provider: {other}")),
        }
    }
}

/// One generation call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the backend to emit a JSON document.
    pub json_mode: bool,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: 0.7,
            max_tokens: 500,
            json_mode: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

/// Uniform text generation over heterogeneous backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// `{backend}-{model}`, e.g. `openai-gpt-4-turbo-preview`.
    fn name(&self) -> String;

    async fn generate(&self, request: &GenerateRequest) -> Result<String, LlmError>;
}

/// A backend the process may use, with its credential if one is configured.
#[derive(Debug, Clone)]
pub struct LlmCandidate {
    pub backend: LlmBackend,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub base_url: String,
}

/// Build the provider for one candidate with a known credential.
pub fn create_provider(
    candidate: &LlmCandidate,
    api_key: SecretString,
    http: reqwest::Client,
) -> Arc<dyn LlmProvider> {
    match candidate.backend {
        LlmBackend::OpenAi => Arc::new(OpenAiProvider::new(
            http,
            api_key,
            &candidate.model,
            &candidate.base_url,
        )),
        LlmBackend::Gemini => Arc::new(GeminiProvider::new(
            http,
            api_key,
            &candidate.model,
            &candidate.base_url,
        )),
    }
}

/// Pick the first candidate that has a credential.
///
/// The first entry is the configured primary. Falling back to a later entry
/// keeps the system working in a degraded configuration and is logged.
pub fn select_provider(candidates: &[LlmCandidate]) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let http = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| LlmError::RequestFailed {
            provider: "http".to_string(),
            reason: format!("Failed to build HTTP client: {e}"),
        })?;

    let primary = candidates.first().ok_or(LlmError::NoCredentials)?;
    for candidate in candidates {
        let Some(api_key) = candidate.api_key.clone() else {
            continue;
        };
        if candidate.backend != primary.backend {
            tracing::warn!(
                primary = %primary.backend,
                substitute = %candidate.backend,
                "Primary LLM provider has no credential, substituting"
            );
        }
        let provider = create_provider(candidate, api_key, http);
        tracing::info!(provider = %provider.name(), "Selected LLM provider");
        return Ok(provider);
    }
    Err(LlmError::NoCredentials)
}

/// Map a non-success HTTP status to the matching error.
pub(crate) fn status_error(provider: &str, status: StatusCode, body: &str) -> LlmError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthFailed {
            provider: provider.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        },
        _ => LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: format!("HTTP {status}: {}", truncate(body, 300)),
        },
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
