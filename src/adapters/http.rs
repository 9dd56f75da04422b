//! HTTP generator speaking the OpenAI-compatible chat-completions API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{GenerationRequest, Generator, GeneratorError};

/// Connection settings for [`HttpGenerator`]
#[derive(Debug, Clone)]
pub struct HttpGeneratorConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`
    pub base_url: String,

    /// Bearer token; `None` means unconfigured
    pub api_key: Option<String>,

    /// Per-request timeout
    pub timeout: Duration,
}

/// Generator backed by a chat-completions endpoint
pub struct HttpGenerator {
    config: HttpGeneratorConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl HttpGenerator {
    pub fn new(config: HttpGeneratorConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Build API URL
    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn api_key(&self) -> Result<&str, GeneratorError> {
        self.config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| GeneratorError::Configuration("no API key set".to_string()))
    }

    fn system_message(request: &GenerationRequest) -> String {
        match &request.schema_hint {
            Some(hint) => format!(
                "{}\n\nRespond with an object of this shape:\n{}",
                request.system_instruction, hint
            ),
            None => request.system_instruction.clone(),
        }
    }
}

fn map_status(status: StatusCode, body: &str) -> GeneratorError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            GeneratorError::Configuration(format!("credentials rejected ({})", status))
        }
        _ => GeneratorError::Request(format!("HTTP {}: {}", status, body.trim())),
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GeneratorError> {
        let api_key = self.api_key()?;
        debug!(module = %request.module, model = %request.model, "Calling generator");

        let response = self
            .client
            .post(self.api_url("chat/completions"))
            .bearer_auth(api_key)
            .timeout(self.config.timeout)
            .json(&serde_json::json!({
                "model": request.model,
                "messages": [
                    { "role": "system", "content": Self::system_message(request) },
                    { "role": "user", "content": request.prompt },
                ],
            }))
            .send()
            .await
            .map_err(|e| GeneratorError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GeneratorError::Request(format!("Malformed response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GeneratorError::Request("Response contained no content".to_string()))
    }

    async fn health_check(&self) -> Result<(), GeneratorError> {
        let api_key = self.api_key()?;

        let response = self
            .client
            .get(self.api_url("models"))
            .bearer_auth(api_key)
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| GeneratorError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }
        Ok(())
    }
}
