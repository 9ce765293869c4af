/// Scripted completion service for tests and offline runs.
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CompletionService, Prompt};
use crate::resilience::ServiceError;

type Responder = Box<dyn Fn(&Prompt) -> Result<String, ServiceError> + Send + Sync>;

/// Answers from a fixed queue, or by computing the reply from the prompt.
/// Every prompt received is recorded.
pub struct ScriptedCompletion {
    queue: Mutex<VecDeque<Result<String, ServiceError>>>,
    responder: Option<Responder>,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedCompletion {
    /// Replies with `responses` in order, then with `{"reviews": []}`.
    pub fn from_responses<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<String, ServiceError>>,
    {
        Self {
            queue: Mutex::new(responses.into_iter().collect()),
            responder: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&Prompt) -> Result<String, ServiceError> + Send + Sync + 'static,
    {
        Self {
            queue: Mutex::new(VecDeque::new()),
            responder: Some(Box::new(responder)),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ServiceError> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.clone());

        if let Some(responder) = &self.responder {
            return responder(prompt);
        }
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Ok(r#"{"reviews": []}"#.to_string()))
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}
