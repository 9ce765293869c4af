//! Completion service boundary used by the analyzer.
pub mod mock;
pub mod ollama;

use async_trait::async_trait;
use serde::Serialize;

use crate::resilience::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// A reasoning engine that answers a prompt with raw text (expected, but not
/// guaranteed, to be JSON).
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ServiceError>;

    fn model_id(&self) -> &str;
}
