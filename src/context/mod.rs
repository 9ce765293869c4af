//! Retrieval of cross-file evidence for a piece of code.
//!
//! The assembler embeds the focal text, over-fetches neighbours from the
//! chunk store, removes anything that would only echo the focal code back,
//! and packs what is left into a character budget. Neighbours are chosen by
//! embedding similarity alone, so the evidence is approximate: related code
//! that reads differently can be missed and lookalike code can be included.
use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, warn};

use crate::db::Db;
use crate::db::models::{Chunk, ScoredChunk};
use crate::db::search::ChunkFilter;
use crate::embedder::EmbeddingClient;
use crate::resilience::ServiceError;

/// Extra candidates fetched beyond `top_k` to survive duplicate filtering.
/// The focal span itself is excluded by the query.
const OVER_FETCH: usize = 5;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] ServiceError),

    #[error("chunk store query failed: {0}")]
    Store(#[from] rusqlite::Error),
}

/// The code evidence is gathered for.
#[derive(Debug, Clone, Copy)]
pub enum Focal<'a> {
    /// A chunk already in the store.
    Chunk(&'a Chunk),
    /// Arbitrary text, optionally located in a file.
    Text {
        text: &'a str,
        path: Option<&'a str>,
        lines: Option<(usize, usize)>,
    },
}

impl<'a> Focal<'a> {
    pub fn text(&self) -> &'a str {
        match *self {
            Focal::Chunk(chunk) => chunk.content.as_str(),
            Focal::Text { text, .. } => text,
        }
    }

    fn chunk_id(&self) -> Option<&'a str> {
        match *self {
            Focal::Chunk(chunk) => Some(chunk.chunk_id.as_str()),
            Focal::Text { .. } => None,
        }
    }

    fn path(&self) -> Option<&'a str> {
        match *self {
            Focal::Chunk(chunk) => Some(chunk.path.as_str()),
            Focal::Text { path, .. } => path,
        }
    }

    fn lines(&self) -> Option<(usize, usize)> {
        match *self {
            Focal::Chunk(chunk) => Some((chunk.start_line, chunk.end_line)),
            Focal::Text { lines, .. } => lines,
        }
    }

    /// True if `chunk` covers (part of) the focal code itself.
    fn overlaps(&self, chunk: &Chunk) -> bool {
        match self.path() {
            Some(path) if path == chunk.path => match self.lines() {
                Some((start, end)) => chunk.overlaps(start, end),
                // Location in the file unknown: the whole file is focal.
                None => true,
            },
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceItem {
    pub chunk_id: String,
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub similarity: f64,
}

/// Ranked related code, most similar first.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Evidence {
    pub items: Vec<EvidenceItem>,
}

impl Evidence {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Characters of code carried, the quantity the budget limits.
    pub fn total_chars(&self) -> usize {
        self.items.iter().map(|i| i.content.chars().count()).sum()
    }

    pub fn render(&self) -> String {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                format!(
                    "[Related Code {}] From {}:{}-{}\n{}\n",
                    i + 1,
                    item.path,
                    item.start_line,
                    item.end_line,
                    item.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Token-set Jaccard similarity.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let (a, b) = (tokens(a), tokens(b));
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let inter = a.intersection(&b).count();
    let union = a.union(&b).count();
    inter as f64 / union as f64
}

struct Seen {
    normalized: String,
    raw: String,
}

#[derive(Clone)]
pub struct ContextAssembler {
    db: Arc<TokioMutex<Db>>,
    embedder: EmbeddingClient,
    near_duplicate_threshold: f64,
}

impl ContextAssembler {
    pub fn new(
        db: Arc<TokioMutex<Db>>,
        embedder: EmbeddingClient,
        near_duplicate_threshold: f64,
    ) -> Self {
        Self {
            db,
            embedder,
            near_duplicate_threshold,
        }
    }

    /// Evidence for `focal`, or empty evidence if retrieval fails.
    pub async fn assemble(
        &self,
        project_id: &str,
        focal: Focal<'_>,
        top_k: usize,
        char_budget: usize,
    ) -> Evidence {
        match self.try_assemble(project_id, focal, top_k, char_budget).await {
            Ok(evidence) => evidence,
            Err(e) => {
                warn!("Context retrieval failed, continuing without evidence: {e}");
                Evidence::default()
            }
        }
    }

    pub async fn try_assemble(
        &self,
        project_id: &str,
        focal: Focal<'_>,
        top_k: usize,
        char_budget: usize,
    ) -> Result<Evidence, RetrievalError> {
        if top_k == 0 || focal.text().trim().is_empty() {
            return Ok(Evidence::default());
        }

        let vector = self.embedder.embed_one(focal.text()).await?;

        let exclude: Vec<String> = focal.chunk_id().map(str::to_string).into_iter().collect();
        let candidates = {
            let db = self.db.lock().await;
            db.query(
                project_id,
                &vector,
                top_k + OVER_FETCH,
                &ChunkFilter {
                    exclude_ids: &exclude,
                    exclude_path: focal.path(),
                    exclude_lines: focal.lines(),
                    ..Default::default()
                },
            )?
        };
        let fetched = candidates.len();

        let mut items = self.select(focal, candidates, top_k);
        let kept = items.len();

        let mut total: usize = items.iter().map(|i| i.content.chars().count()).sum();
        while total > char_budget {
            match items.pop() {
                Some(dropped) => total -= dropped.content.chars().count(),
                None => break,
            }
        }

        debug!(
            "Evidence: fetched {fetched}, kept {kept}, {} within budget ({total} chars)",
            items.len()
        );
        Ok(Evidence { items })
    }

    /// Drop self-matches and near-duplicates, keeping the best `top_k`.
    fn select(
        &self,
        focal: Focal<'_>,
        candidates: Vec<ScoredChunk>,
        top_k: usize,
    ) -> Vec<EvidenceItem> {
        let mut ids = HashSet::new();
        let mut seen = vec![Seen {
            normalized: normalize_whitespace(focal.text()),
            raw: focal.text().to_string(),
        }];
        let mut items = Vec::new();

        for ScoredChunk { chunk, similarity } in candidates {
            if items.len() == top_k {
                break;
            }
            if focal.chunk_id() == Some(chunk.chunk_id.as_str()) || focal.overlaps(&chunk) {
                continue;
            }
            if !ids.insert(chunk.chunk_id.clone()) {
                continue;
            }
            let normalized = normalize_whitespace(&chunk.content);
            let duplicate = seen.iter().any(|s| {
                s.normalized == normalized
                    || jaccard(&s.raw, &chunk.content) >= self.near_duplicate_threshold
            });
            if duplicate {
                continue;
            }

            seen.push(Seen {
                normalized,
                raw: chunk.content.clone(),
            });
            items.push(EvidenceItem {
                chunk_id: chunk.chunk_id,
                path: chunk.path,
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                content: chunk.content,
                similarity,
            });
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::EmbeddedChunk;
    use crate::embedder::mock::MockEmbedder;
    use crate::resilience::{BreakerConfig, CircuitBreaker, Orchestrator, RetryPolicy};
    use std::time::Duration;

    const DIMS: usize = 64;

    fn client(embedder: Arc<MockEmbedder>) -> EmbeddingClient {
        let orchestrator = Arc::new(Orchestrator::new(
            "embedding",
            Arc::new(CircuitBreaker::new("embedding", BreakerConfig::default())),
            RetryPolicy::none(),
            Duration::from_secs(5),
        ));
        EmbeddingClient::new(embedder, orchestrator, 8)
    }

    fn chunk(path: &str, start: usize, end: usize, content: &str) -> Chunk {
        Chunk {
            chunk_id: crate::indexer::fingerprint::chunk_id(path, start, end),
            path: path.to_string(),
            start_line: start,
            end_line: end,
            content: content.to_string(),
            language: "python".to_string(),
            symbol: None,
        }
    }

    async fn store(chunks: &[Chunk]) -> (Arc<TokioMutex<Db>>, Arc<MockEmbedder>) {
        let embedder = Arc::new(MockEmbedder::new(DIMS));
        let mut db = Db::open_in_memory("mock", DIMS).unwrap();
        db.upsert_project("p", "/p").unwrap();
        let mut by_path: std::collections::BTreeMap<&str, Vec<EmbeddedChunk>> = Default::default();
        for c in chunks {
            by_path.entry(&c.path).or_default().push(EmbeddedChunk {
                chunk: c.clone(),
                embedding: embedder.vector(&c.content),
            });
        }
        for (path, items) in by_path {
            db.replace_file("p", path, "sha256:x", "python", &items).unwrap();
        }
        (Arc::new(TokioMutex::new(db)), embedder)
    }

    #[tokio::test]
    async fn test_single_chunk_project_has_no_evidence() {
        let only = chunk("app.py", 1, 3, "def handler(request):\n    return request.args");
        let (db, embedder) = store(std::slice::from_ref(&only)).await;
        let assembler = ContextAssembler::new(db, client(embedder), 0.9);

        let evidence = assembler.assemble("p", Focal::Chunk(&only), 5, 10_000).await;
        assert!(evidence.is_empty());
        assert_eq!(evidence.render(), "");
    }

    #[tokio::test]
    async fn test_filters_self_overlap_and_duplicates() {
        let focal = chunk("api.py", 10, 20, "def get_user(uid):\n    return db.find_user(uid)");
        let overlapping = chunk("api.py", 15, 30, "    return db.find_user(uid)\n\ndef other(): pass");
        let same_file_far = chunk("api.py", 100, 110, "def find_user_audit(uid):\n    log(uid)");
        let copy = chunk("legacy/api.py", 10, 20, "def get_user(uid):\n        return db.find_user(uid)");
        let related = chunk("db.py", 1, 8, "def find_user(uid):\n    cursor.execute('SELECT * FROM users WHERE id=' + uid)");
        let (db, embedder) = store(&[
            focal.clone(),
            overlapping,
            same_file_far.clone(),
            copy,
            related.clone(),
        ])
        .await;
        let assembler = ContextAssembler::new(db, client(embedder), 0.9);

        let evidence = assembler.assemble("p", Focal::Chunk(&focal), 5, 10_000).await;
        let ids: Vec<_> = evidence.items.iter().map(|i| i.chunk_id.clone()).collect();
        assert_eq!(evidence.len(), 2, "{ids:?}");
        assert!(ids.contains(&related.chunk_id));
        assert!(ids.contains(&same_file_far.chunk_id));
        // Ranked
        assert!(evidence.items[0].similarity >= evidence.items[1].similarity);
    }

    #[tokio::test]
    async fn test_top_k_and_budget() {
        let focal = chunk("main.py", 1, 5, "token session user login password");
        let others: Vec<Chunk> = (0..6)
            .map(|i| {
                chunk(
                    &format!("mod{i}.py"),
                    1,
                    5,
                    &format!("token session user value{i} extra{i} more{i}"),
                )
            })
            .collect();
        let mut all = vec![focal.clone()];
        all.extend(others);
        let (db, embedder) = store(&all).await;
        let assembler = ContextAssembler::new(db, client(embedder), 0.9);

        let evidence = assembler.assemble("p", Focal::Chunk(&focal), 3, 10_000).await;
        assert_eq!(evidence.len(), 3);

        let one_len = evidence.items[0].content.chars().count();
        let tight = assembler
            .assemble("p", Focal::Chunk(&focal), 3, one_len + 1)
            .await;
        assert_eq!(tight.len(), 1);
        assert_eq!(tight.items[0].chunk_id, evidence.items[0].chunk_id);
        assert!(tight.total_chars() <= one_len + 1);

        let none = assembler.assemble("p", Focal::Chunk(&focal), 3, 0).await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_text_focal_without_lines_excludes_whole_file() {
        let a = chunk("a.py", 1, 3, "alpha beta gamma");
        let b = chunk("b.py", 1, 3, "alpha beta delta");
        let (db, embedder) = store(&[a, b.clone()]).await;
        let assembler = ContextAssembler::new(db, client(embedder), 0.9);

        let evidence = assembler
            .assemble(
                "p",
                Focal::Text {
                    text: "alpha beta",
                    path: Some("a.py"),
                    lines: None,
                },
                5,
                1_000,
            )
            .await;
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence.items[0].chunk_id, b.chunk_id);
        assert!(evidence.render().starts_with("[Related Code 1] From b.py:1-3\n"));
    }

    #[tokio::test]
    async fn test_many_chunk_focal_file_still_gets_evidence() {
        let mut chunks: Vec<Chunk> = (0..30)
            .map(|i| {
                chunk(
                    "views.py",
                    i * 3 + 1,
                    i * 3 + 2,
                    &format!("def view_{i}(request):\n    return render(request, 'page_{i}.html')"),
                )
            })
            .collect();
        let focal_text = chunks
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let lookup = chunk(
            "db.py",
            1,
            2,
            "def lookup_user(uid):\n    return cursor.execute(query + uid)",
        );
        chunks.push(lookup.clone());
        let (db, embedder) = store(&chunks).await;
        let assembler = ContextAssembler::new(db, client(embedder), 0.9);

        let evidence = assembler
            .assemble(
                "p",
                Focal::Text {
                    text: &focal_text,
                    path: Some("views.py"),
                    lines: Some((1, 90)),
                },
                5,
                12_000,
            )
            .await;
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence.items[0].chunk_id, lookup.chunk_id);
    }

    // Neighbours are ranked by embedding similarity only. Code that shares
    // vocabulary with the focal chunk outranks code that is actually called
    // by it but reads differently, so evidence trades recall for cost.
    #[tokio::test]
    async fn test_lookalike_code_outranks_related_code() {
        let focal = chunk("api.py", 1, 2, "def get_user(uid):\n    return db.find_user(uid)");
        let lookalike = chunk(
            "billing/customers.py",
            1,
            2,
            "def get_user(uid):\n    return cache.find_user(uid)",
        );
        let related = chunk(
            "store.py",
            1,
            3,
            "class Store:\n    def lookup(self, key):\n        return self.conn.execute(SQL, (key,)).fetchone()",
        );
        let (db, embedder) = store(&[focal.clone(), lookalike.clone(), related.clone()]).await;
        let assembler = ContextAssembler::new(db, client(embedder), 0.9);

        let evidence = assembler.assemble("p", Focal::Chunk(&focal), 1, 10_000).await;
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence.items[0].chunk_id, lookalike.chunk_id);
        assert_ne!(evidence.items[0].chunk_id, related.chunk_id);
    }

    #[tokio::test]
    async fn test_retrieval_failure_degrades_to_empty() {
        let a = chunk("a.py", 1, 3, "alpha");
        let (db, _) = store(&[a]).await;
        let failing = Arc::new(MockEmbedder::new(DIMS).failing_on("", ServiceError::Timeout));
        let assembler = ContextAssembler::new(db, client(failing), 0.9);

        let focal = Focal::Text {
            text: "anything",
            path: None,
            lines: None,
        };
        assert!(assembler.try_assemble("p", focal, 5, 100).await.is_err());
        assert!(assembler.assemble("p", focal, 5, 100).await.is_empty());
    }

    #[test]
    fn test_jaccard() {
        assert_eq!(jaccard("a b c", "a b c"), 1.0);
        assert_eq!(jaccard("a b", "c d"), 0.0);
        assert!((jaccard("a b c", "a b d") - 0.5).abs() < 1e-9);
    }
}
