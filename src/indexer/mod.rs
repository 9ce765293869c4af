//! Incremental indexing: discovery, change detection, chunking and storage.
pub mod changes;
pub mod chunker;
pub mod code_parser;
pub mod core;
pub mod fingerprint;
pub mod languages;
pub mod locks;
pub mod scan;

pub use changes::{ChangeSet, detect};
pub use chunker::{ChunkCandidate, Chunker};
pub use code_parser::{NoSpans, Span, StructuralParser, TreeSitterParser};
pub use self::core::{FileFailure, IndexError, IndexReport, Indexer};
pub use locks::FileLocks;
pub use scan::{ScanError, ScanFailure, ScanResult, ScannedFile, scan};
