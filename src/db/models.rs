use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

/// A stored unit of code. Lines are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub language: String,
    pub symbol: Option<String>,
}

impl Chunk {
    pub fn overlaps(&self, start_line: usize, end_line: usize) -> bool {
        self.start_line <= end_line && start_line <= self.end_line
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Cosine similarity mapped to `[0, 1]`.
    pub similarity: f64,
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: String,
    pub fingerprint: String,
    pub language: String,
    pub indexed_at: DateTime<Utc>,
    /// Derived from the stored chunk rows, never stored separately.
    pub chunk_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectRecord {
    pub id: String,
    pub root_path: String,
    pub created_at: DateTime<Utc>,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub file_count: usize,
    pub chunk_count: usize,
}
