//! Ollama completion provider (`POST /api/generate`).
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CompletionService, Prompt};
use crate::resilience::ServiceError;

pub struct OllamaCompletion {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
    format: &'a str,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaCompletion {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            temperature: 0.1,
        }
    }
}

#[async_trait]
impl CompletionService for OllamaCompletion {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ServiceError> {
        if prompt.user.trim().is_empty() {
            return Err(ServiceError::InvalidInput("empty prompt".into()));
        }

        let url = format!("{}/api/generate", self.base_url);
        debug!(model = %self.model, chars = prompt.user.len(), "Requesting completion");

        let response = self
            .client
            .post(&url)
            .json(&GenerateRequest {
                model: &self.model,
                system: &prompt.system,
                prompt: &prompt.user,
                stream: false,
                format: "json",
                options: GenerateOptions {
                    temperature: self.temperature,
                },
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| ServiceError::MalformedResponse(format!("generate response: {e}")))?;
        Ok(parsed.response)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
