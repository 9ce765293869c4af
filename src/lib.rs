//! # codeward: Incremental Semantic Code Index + RAG Security Review
//!
//! Keeps a per-project vector index of a source tree in sync with the files on
//! disk, then reviews code for security issues by sending each piece to a
//! language model together with related code retrieved from other files.
//!
//! ## Architecture
//!
//! - **[`config`]**: JSON configuration with per-field defaults and validation
//! - **[`db`]**: SQLite + sqlite-vec chunk store (projects, files, chunks, vector search)
//! - **[`indexer`]**: File discovery, change detection, Tree-sitter spans, chunking, sync
//! - **[`embedder`]**: Embedding service boundary, batching client, Ollama + mock backends
//! - **[`llm`]**: Completion service boundary, Ollama + scripted backends
//! - **[`resilience`]**: Timeout, retry with backoff and circuit breaking per endpoint
//! - **[`context`]**: Cross-file evidence retrieval, deduplication and budget packing
//! - **[`analyzer`]**: Prompting, lenient response parsing, line resolution, validation

pub mod analyzer;
pub mod config;
pub mod context;
pub mod db;
pub mod embedder;
pub mod indexer;
pub mod llm;
pub mod resilience;
