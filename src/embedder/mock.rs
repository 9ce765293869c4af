/// Mock embedder for testing purposes.
///
/// Generates deterministic embeddings by hashing identifier tokens into
/// buckets, so texts sharing vocabulary land close to each other.
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::EmbeddingService;
use crate::resilience::ServiceError;

pub struct MockEmbedder {
    pub dimensions: usize,
    failure: Option<(String, ServiceError)>,
    calls: AtomicUsize,
    texts: AtomicUsize,
}

impl MockEmbedder {
    /// Create a new `MockEmbedder` with the given dimensionality.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            failure: None,
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        }
    }

    /// Fail any batch containing a text with `marker` in it.
    #[must_use]
    pub fn failing_on(mut self, marker: impl Into<String>, error: ServiceError) -> Self {
        self.failure = Some((marker.into(), error));
        self
    }

    /// Number of `embed` calls received.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of texts received across all calls.
    pub fn texts_embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    /// Embed one text synchronously.
    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimensions];

        let lowered = text.to_lowercase();
        let tokens = lowered
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|t| !t.is_empty());
        for token in tokens {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let hash = hasher.finish();
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            embedding[bucket] += sign;
        }

        // L2 normalize
        let norm_sq: f32 = embedding.iter().map(|v| v * v).sum();
        if norm_sq > 0.0 {
            let inv = 1.0 / norm_sq.sqrt();
            for v in &mut embedding {
                *v *= inv;
            }
        } else if let Some(first) = embedding.first_mut() {
            *first = 1.0;
        }

        embedding
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingService for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((marker, error)) = &self.failure {
            if texts.iter().any(|t| t.contains(marker.as_str())) {
                return Err(error.clone());
            }
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        "mock"
    }
}
