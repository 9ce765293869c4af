/// Embedding service boundary and the batched, resilient client on top of it.
pub mod client;
pub mod mock;
pub mod ollama;

pub use client::{BatchFailure, EmbeddingClient, EmbeddingOutcome};

use async_trait::async_trait;

use crate::resilience::ServiceError;

/// Trait for text embedding implementations.
///
/// All implementations must be `Send + Sync` to allow concurrent use
/// behind `Arc`. Callers go through [`EmbeddingClient`], which adds
/// batching, validation and the embedding endpoint's orchestrator.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Embed a batch of texts, one vector per text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;

    /// Return the dimensionality of the embedding vectors.
    fn dimensions(&self) -> usize;

    /// Identifier of the model producing the vectors.
    fn model_id(&self) -> &str;
}
