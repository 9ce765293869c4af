//! Batched embedding through the embedding endpoint's orchestrator.
use std::sync::Arc;

use tracing::{debug, warn};

use super::EmbeddingService;
use crate::resilience::{Orchestrator, ServiceError};

/// One batch that could not be embedded.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    /// Index of the first text of the batch.
    pub start: usize,
    pub len: usize,
    pub error: ServiceError,
}

/// Result of embedding a list of texts. Batches that succeeded keep their
/// vectors even when others failed.
#[derive(Debug, Default)]
pub struct EmbeddingOutcome {
    pub vectors: Vec<Option<Vec<f32>>>,
    pub failures: Vec<BatchFailure>,
}

impl EmbeddingOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// All vectors in input order, or the first batch error.
    pub fn into_complete(self) -> Result<Vec<Vec<f32>>, ServiceError> {
        if let Some(failure) = self.failures.into_iter().next() {
            return Err(failure.error);
        }
        self.vectors
            .into_iter()
            .map(|v| v.ok_or_else(|| ServiceError::MalformedResponse("missing vector".into())))
            .collect()
    }
}

#[derive(Clone)]
pub struct EmbeddingClient {
    service: Arc<dyn EmbeddingService>,
    orchestrator: Arc<Orchestrator>,
    batch_size: usize,
}

impl EmbeddingClient {
    pub fn new(
        service: Arc<dyn EmbeddingService>,
        orchestrator: Arc<Orchestrator>,
        batch_size: usize,
    ) -> Self {
        Self {
            service,
            orchestrator,
            batch_size: batch_size.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.service.dimensions()
    }

    pub fn model_id(&self) -> &str {
        self.service.model_id()
    }

    /// Embed one batch, checking that the service returned one vector of the
    /// expected size per text.
    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        let dims = self.service.dimensions();
        self.orchestrator
            .call(|| async {
                let vectors = self.service.embed(batch).await?;
                if vectors.len() != batch.len() {
                    return Err(ServiceError::MalformedResponse(format!(
                        "expected {} embeddings, got {}",
                        batch.len(),
                        vectors.len()
                    )));
                }
                if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
                    return Err(ServiceError::MalformedResponse(format!(
                        "expected {dims} dimensions, got {}",
                        bad.len()
                    )));
                }
                Ok(vectors)
            })
            .await
    }

    /// Embed every text in batches of `batch_size`.
    ///
    /// Once the circuit is open the remaining batches are marked failed
    /// without being sent.
    pub async fn embed_all(&self, texts: &[String]) -> EmbeddingOutcome {
        let mut outcome = EmbeddingOutcome {
            vectors: vec![None; texts.len()],
            failures: Vec::new(),
        };

        let mut circuit_open: Option<ServiceError> = None;
        for (batch_no, batch) in texts.chunks(self.batch_size).enumerate() {
            let start = batch_no * self.batch_size;

            if let Some(err) = &circuit_open {
                outcome.failures.push(BatchFailure {
                    start,
                    len: batch.len(),
                    error: err.clone(),
                });
                continue;
            }

            match self.embed_batch(batch).await {
                Ok(vectors) => {
                    debug!(start, count = vectors.len(), "Embedded batch");
                    for (i, v) in vectors.into_iter().enumerate() {
                        outcome.vectors[start + i] = Some(v);
                    }
                }
                Err(e) => {
                    warn!(start, count = batch.len(), "Embedding batch failed: {e}");
                    if e.is_circuit_open() {
                        circuit_open = Some(e.clone());
                    }
                    outcome.failures.push(BatchFailure {
                        start,
                        len: batch.len(),
                        error: e,
                    });
                }
            }
        }

        outcome
    }

    /// Embed a single text.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| ServiceError::MalformedResponse("empty embedding response".into()))
    }
}
