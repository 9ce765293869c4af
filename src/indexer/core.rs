use crate::db::Db;
use crate::db::models::{Chunk, EmbeddedChunk};
use crate::embedder::EmbeddingClient;
use crate::indexer::changes::{self, ChangeSet};
use crate::indexer::chunker::Chunker;
use crate::indexer::code_parser::StructuralParser;
use crate::indexer::fingerprint::chunk_id;
use crate::indexer::locks::FileLocks;
use crate::indexer::scan::{ScanResult, ScannedFile};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("chunk store error: {0}")]
    Store(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Default, Serialize)]
pub struct IndexReport {
    pub project_id: String,
    pub added: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Files whose chunks were (re)written.
    pub indexed: usize,
    pub chunks_written: usize,
    pub failures: Vec<FileFailure>,
    /// Files never started because the run was cancelled.
    pub skipped: Vec<String>,
    pub aborted: bool,
    pub duration_ms: u64,
}

enum FileOutcome {
    Indexed { chunks: usize },
    Failed { failure: FileFailure, circuit_open: bool },
    Skipped(String),
}

/// Keeps a project's slice of the chunk store in sync with its source tree.
#[derive(Clone)]
pub struct Indexer {
    db: Arc<TokioMutex<Db>>,
    embedder: EmbeddingClient,
    chunker: Chunker,
    parser: Arc<dyn StructuralParser>,
    locks: FileLocks,
    concurrency: usize,
}

impl Indexer {
    pub fn new(
        db: Arc<TokioMutex<Db>>,
        embedder: EmbeddingClient,
        chunker: Chunker,
        parser: Arc<dyn StructuralParser>,
        locks: FileLocks,
        concurrency: usize,
    ) -> Self {
        Self {
            db,
            embedder,
            chunker,
            parser,
            locks,
            concurrency: concurrency.max(1),
        }
    }

    /// Bring the index of `project_id` in line with `scan`.
    ///
    /// Only added and modified files are embedded (every file with
    /// `force_full`); deleted files are removed. A file is committed only if
    /// all of its chunks were embedded, so a failure leaves the previously
    /// indexed version in place.
    pub async fn index(
        &self,
        project_id: &str,
        root: &Path,
        scan: &ScanResult,
        force_full: bool,
        cancel: &CancellationToken,
    ) -> Result<IndexReport, IndexError> {
        let started = Instant::now();
        let mut report = IndexReport {
            project_id: project_id.to_string(),
            ..Default::default()
        };
        report.failures = scan
            .failures
            .iter()
            .map(|f| FileFailure {
                path: f.path.clone(),
                reason: f.reason.clone(),
            })
            .collect();

        let stored = {
            let db = self.db.lock().await;
            db.upsert_project(project_id, &root.to_string_lossy())?;
            db.list_file_records(project_id)?
        };

        let mut changes = changes::detect(
            scan.files
                .iter()
                .map(|f| (f.relative_path.as_str(), f.fingerprint.as_str())),
            &stored,
        );
        // Still on disk, just unreadable this run: keep the last indexed version.
        changes
            .deleted
            .retain(|path| !scan.failures.iter().any(|f| f.covers(path)));
        report.added = changes.added.len();
        report.modified = changes.modified.len();
        report.unchanged = changes.unchanged.len();
        report.deleted = changes.deleted.len();
        info!(
            "Project {project_id}: {} added, {} modified, {} unchanged, {} deleted",
            report.added, report.modified, report.unchanged, report.deleted
        );

        for path in &changes.deleted {
            let _guard = self.locks.lock(project_id, path).await;
            let db = self.db.lock().await;
            db.delete_file(project_id, path)?;
            debug!("Removed {path} from index");
        }

        let to_embed = files_to_embed(scan, &changes, force_full);
        let results: Vec<FileOutcome> = stream::iter(to_embed)
            .map(|file| self.run_file(project_id, file, cancel))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for outcome in results {
            match outcome {
                FileOutcome::Indexed { chunks } => {
                    report.indexed += 1;
                    report.chunks_written += chunks;
                }
                FileOutcome::Failed {
                    failure,
                    circuit_open,
                } => {
                    report.aborted |= circuit_open;
                    report.failures.push(failure);
                }
                FileOutcome::Skipped(path) => report.skipped.push(path),
            }
        }
        report.failures.sort_by(|a, b| a.path.cmp(&b.path));
        report.skipped.sort();
        report.aborted |= cancel.is_cancelled();

        if !report.aborted {
            self.db.lock().await.mark_indexed(project_id)?;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Indexed {} files ({} chunks), {} failed, {} skipped in {}ms",
            report.indexed,
            report.chunks_written,
            report.failures.len(),
            report.skipped.len(),
            report.duration_ms
        );
        Ok(report)
    }

    async fn run_file(
        &self,
        project_id: &str,
        file: &ScannedFile,
        cancel: &CancellationToken,
    ) -> FileOutcome {
        if cancel.is_cancelled() {
            return FileOutcome::Skipped(file.relative_path.clone());
        }

        match self.index_file(project_id, file).await {
            Ok(chunks) => FileOutcome::Indexed { chunks },
            Err((reason, circuit_open)) => {
                if circuit_open {
                    error!("Embedding endpoint unavailable, aborting run: {reason}");
                    cancel.cancel();
                } else {
                    warn!("Failed to index {}: {reason}", file.relative_path);
                }
                FileOutcome::Failed {
                    failure: FileFailure {
                        path: file.relative_path.clone(),
                        reason,
                    },
                    circuit_open,
                }
            }
        }
    }

    /// Chunk, embed and commit one file. Errors carry whether the embedding
    /// circuit was open.
    async fn index_file(
        &self,
        project_id: &str,
        file: &ScannedFile,
    ) -> Result<usize, (String, bool)> {
        let path = file.relative_path.as_str();
        let _guard = self.locks.lock(project_id, path).await;

        let spans = self.parser.spans(&file.content, file.language);
        let candidates = self.chunker.chunk(&file.content, spans.as_deref());
        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();

        let outcome = self.embedder.embed_all(&texts).await;
        if let Some(failure) = outcome.failures.first() {
            return Err((
                format!(
                    "embedding failed for {} of {} chunks: {}",
                    outcome.failures.iter().map(|f| f.len).sum::<usize>(),
                    texts.len(),
                    failure.error
                ),
                failure.error.is_circuit_open(),
            ));
        }
        let vectors = outcome.into_complete().map_err(|e| (e.to_string(), false))?;

        let chunks: Vec<EmbeddedChunk> = candidates
            .into_iter()
            .zip(vectors)
            .map(|(c, embedding)| EmbeddedChunk {
                chunk: Chunk {
                    chunk_id: chunk_id(path, c.start_line, c.end_line),
                    path: path.to_string(),
                    start_line: c.start_line,
                    end_line: c.end_line,
                    content: c.text,
                    language: file.language.to_string(),
                    symbol: c.symbol,
                },
                embedding,
            })
            .collect();

        let mut db = self.db.lock().await;
        db.replace_file(project_id, path, &file.fingerprint, file.language, &chunks)
            .map_err(|e| (format!("store write failed: {e}"), false))?;
        debug!("Indexed {path} ({} chunks)", chunks.len());
        Ok(chunks.len())
    }
}

fn files_to_embed<'a>(
    scan: &'a ScanResult,
    changes: &ChangeSet,
    force_full: bool,
) -> Vec<&'a ScannedFile> {
    let by_path: HashMap<&str, &ScannedFile> = scan
        .files
        .iter()
        .map(|f| (f.relative_path.as_str(), f))
        .collect();

    let mut paths: Vec<&String> = changes.added.iter().chain(&changes.modified).collect();
    if force_full {
        paths.extend(&changes.unchanged);
    }
    paths.sort();
    paths
        .into_iter()
        .filter_map(|p| by_path.get(p.as_str()).copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::embedder::mock::MockEmbedder;
    use crate::indexer::code_parser::TreeSitterParser;
    use crate::indexer::scan::scan;
    use crate::resilience::{BreakerConfig, CircuitBreaker, Orchestrator, RetryPolicy, ServiceError};
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn orchestrator(failure_threshold: u32) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            "embedding",
            Arc::new(CircuitBreaker::new(
                "embedding",
                BreakerConfig {
                    failure_threshold,
                    ..BreakerConfig::default()
                },
            )),
            RetryPolicy::none(),
            Duration::from_secs(5),
        ))
    }

    fn indexer(embedder: Arc<MockEmbedder>, concurrency: usize) -> (Indexer, Arc<TokioMutex<Db>>) {
        let db = Arc::new(TokioMutex::new(Db::open_in_memory("mock", 32).unwrap()));
        let client = EmbeddingClient::new(embedder, orchestrator(5), 16);
        let indexer = Indexer::new(
            db.clone(),
            client,
            Chunker::new(20, 5, 60, 3),
            Arc::new(TreeSitterParser::new().unwrap()),
            FileLocks::new(),
            concurrency,
        );
        (indexer, db)
    }

    #[tokio::test]
    async fn test_indexer_differential_sync() {
        let temp_dir = tempdir().unwrap();
        let dir_path = temp_dir.path();
        fs::write(dir_path.join("a.py"), "def a():\n    return 1\n").unwrap();
        fs::write(dir_path.join("b.py"), "def b():\n    return 2\n").unwrap();
        fs::write(dir_path.join("c.go"), "package main\n\nfunc c() {}\n").unwrap();

        let embedder = Arc::new(MockEmbedder::new(32));
        let (indexer, db) = indexer(embedder.clone(), 4);
        let cancel = CancellationToken::new();

        // First sync
        let scanned = scan(dir_path, &[]).unwrap();
        let res1 = indexer.index("p", dir_path, &scanned, false, &cancel).await.unwrap();
        assert_eq!(res1.added, 3);
        assert_eq!(res1.indexed, 3);
        assert!(res1.failures.is_empty());
        let embedded_after_first = embedder.texts_embedded();

        // Second sync immediately - nothing to embed
        let res2 = indexer.index("p", dir_path, &scanned, false, &cancel).await.unwrap();
        assert_eq!(res2.unchanged, 3);
        assert_eq!(res2.indexed, 0);
        assert_eq!(embedder.texts_embedded(), embedded_after_first);

        // Modify one, delete one
        fs::write(dir_path.join("a.py"), "def a():\n    return 10\n").unwrap();
        fs::remove_file(dir_path.join("b.py")).unwrap();
        let scanned = scan(dir_path, &[]).unwrap();
        let res3 = indexer.index("p", dir_path, &scanned, false, &cancel).await.unwrap();
        assert_eq!((res3.modified, res3.deleted, res3.unchanged), (1, 1, 1));
        assert_eq!(res3.indexed, 1);

        let db = db.lock().await;
        let records = db.list_file_records("p").unwrap();
        assert_eq!(records.len(), 2);
        assert!(!records.contains_key("b.py"));
        assert!(db.get_file_chunks("p", "b.py").unwrap().is_empty());
        let a_chunks = db.get_file_chunks("p", "a.py").unwrap();
        assert!(a_chunks.iter().any(|c| c.content.contains("return 10")));
        // Chunk-id set mirrors stored chunks
        let ids: std::collections::BTreeSet<_> =
            a_chunks.iter().map(|c| c.chunk_id.clone()).collect();
        assert_eq!(records["a.py"].chunk_ids, ids);
    }

    #[tokio::test]
    async fn test_force_full_reembeds_unchanged() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("a.py"), "x = 1\n").unwrap();
        let embedder = Arc::new(MockEmbedder::new(32));
        let (indexer, _db) = indexer(embedder.clone(), 1);
        let cancel = CancellationToken::new();
        let scanned = scan(temp_dir.path(), &[]).unwrap();

        indexer.index("p", temp_dir.path(), &scanned, false, &cancel).await.unwrap();
        let res = indexer.index("p", temp_dir.path(), &scanned, true, &cancel).await.unwrap();
        assert_eq!(res.unchanged, 1);
        assert_eq!(res.indexed, 1);
        assert_eq!(embedder.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_file_keeps_previous_version() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.py"), "value = 'good'\n").unwrap();

        let good = Arc::new(MockEmbedder::new(32));
        let (indexer, db) = indexer(good, 1);
        let cancel = CancellationToken::new();
        indexer
            .index("p", root, &scan(root, &[]).unwrap(), false, &cancel)
            .await
            .unwrap();

        // Same store, an embedder that rejects the new content
        let bad = Arc::new(
            MockEmbedder::new(32).failing_on("POISON", ServiceError::InvalidInput("nope".into())),
        );
        let failing = Indexer::new(
            db.clone(),
            EmbeddingClient::new(bad, orchestrator(5), 16),
            Chunker::new(20, 5, 60, 3),
            Arc::new(TreeSitterParser::new().unwrap()),
            FileLocks::new(),
            1,
        );
        fs::write(root.join("a.py"), "value = 'POISON'\n").unwrap();
        let res = failing
            .index("p", root, &scan(root, &[]).unwrap(), false, &cancel)
            .await
            .unwrap();
        assert_eq!(res.failures.len(), 1);
        assert_eq!(res.failures[0].path, "a.py");
        assert!(!res.aborted);

        let chunks = db.lock().await.get_file_chunks("p", "a.py").unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("good"));
    }

    #[tokio::test]
    async fn test_unreadable_file_keeps_previous_version() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.py"), "def a():\n    return 1\n").unwrap();
        fs::write(root.join("b.py"), "def b():\n    return 2\n").unwrap();

        let (indexer, db) = indexer(Arc::new(MockEmbedder::new(32)), 1);
        let cancel = CancellationToken::new();
        indexer
            .index("p", root, &scan(root, &[]).unwrap(), false, &cancel)
            .await
            .unwrap();
        let before = db.lock().await.get_file_chunks("p", "a.py").unwrap();
        assert!(!before.is_empty());

        fs::write(root.join("a.py"), [0xff, 0xfe, 0x78]).unwrap();
        let res = indexer
            .index("p", root, &scan(root, &[]).unwrap(), false, &cancel)
            .await
            .unwrap();
        assert_eq!(res.deleted, 0);
        assert_eq!(res.unchanged, 1);
        assert_eq!(res.failures.len(), 1);
        assert_eq!(res.failures[0].path, "a.py");

        let db = db.lock().await;
        assert!(db.list_file_records("p").unwrap().contains_key("a.py"));
        assert_eq!(db.get_file_chunks("p", "a.py").unwrap(), before);
    }

    #[tokio::test]
    async fn test_open_circuit_aborts_and_lists_skipped() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        for name in ["a.py", "b.py", "c.py", "d.py"] {
            fs::write(root.join(name), format!("name = '{name}'\n")).unwrap();
        }

        let embedder = Arc::new(MockEmbedder::new(32).failing_on("name", ServiceError::Timeout));
        let db = Arc::new(TokioMutex::new(Db::open_in_memory("mock", 32).unwrap()));
        let indexer = Indexer::new(
            db,
            EmbeddingClient::new(embedder.clone(), orchestrator(1), 16),
            Chunker::new(20, 5, 60, 3),
            Arc::new(TreeSitterParser::new().unwrap()),
            FileLocks::new(),
            1,
        );
        let cancel = CancellationToken::new();
        let res = indexer
            .index("p", root, &scan(root, &[]).unwrap(), false, &cancel)
            .await
            .unwrap();

        // a.py trips the breaker, b.py is rejected fast, the rest never start
        assert!(res.aborted);
        assert!(cancel.is_cancelled());
        assert_eq!(res.failures.len(), 2);
        assert_eq!(res.skipped, vec!["c.py".to_string(), "d.py".to_string()]);
        assert_eq!(embedder.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_everything() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("a.py"), "x = 1\n").unwrap();
        let (indexer, db) = indexer(Arc::new(MockEmbedder::new(32)), 2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let res = indexer
            .index("p", temp_dir.path(), &scan(temp_dir.path(), &[]).unwrap(), false, &cancel)
            .await
            .unwrap();
        assert_eq!(res.skipped, vec!["a.py".to_string()]);
        assert!(res.aborted);
        assert_eq!(db.lock().await.chunk_count("p").unwrap(), 0);
    }
}
