//! OpenAI chat completions backend.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{GenerateRequest, LlmProvider, status_error};
use crate::error::LlmError;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

pub struct OpenAiProvider {
    client: Client,
    api_key: SecretString,
    model: String,
    endpoint: String,
}

impl OpenAiProvider {
    pub fn new(client: Client, api_key: SecretString, model: &str, base_url: &str) -> Self {
        Self {
            client,
            api_key,
            model: model.to_string(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
        }
    }

    /// JSON response format is only honoured by the gpt-4 family.
    fn supports_json_mode(&self) -> bool {
        self.model.contains("gpt-4")
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> String {
        format!("openai-{}", self.model)
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, LlmError> {
        let provider = self.name();
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: (request.json_mode && self.supports_json_mode())
                .then_some(ResponseFormat {
                    kind: "json_object",
                }),
        };

        let res = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: provider.clone(),
                reason: e.to_string(),
            })?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(status_error(&provider, status, &text));
        }

        let parsed: ChatResponse = res.json().await.map_err(|e| LlmError::InvalidResponse {
            provider: provider.clone(),
            reason: e.to_string(),
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .ok_or_else(|| LlmError::InvalidResponse {
                provider,
                reason: "response contained no message content".to_string(),
            })
    }
}
