//! Chunk store backed by SQLite and sqlite-vec
use rusqlite::{Connection, OptionalExtension, Result, params};
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;
use tracing::{info, warn};

pub mod files;
pub mod models;
pub mod projects;
pub mod search;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    root_path TEXT NOT NULL,
    created_at DATETIME NOT NULL,
    last_indexed_at DATETIME
);

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    path TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    language TEXT NOT NULL,
    indexed_at DATETIME NOT NULL,
    UNIQUE(project_id, path),
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_files_project ON files(project_id);

CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    project_id TEXT NOT NULL,
    chunk_id TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    content TEXT NOT NULL,
    language TEXT NOT NULL,
    symbol TEXT,
    UNIQUE(project_id, chunk_id),
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id);
CREATE INDEX IF NOT EXISTS idx_chunks_project ON chunks(project_id);

CREATE TABLE IF NOT EXISTS index_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const META_MODEL: &str = "embedding_model";
const META_DIMENSIONS: &str = "embedding_dimensions";

static INIT_VEC: Once = Once::new();

/// Initialize the sqlite-vec extension. Safe to call multiple times.
fn init_sqlite_vec() {
    INIT_VEC.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// A SQLite connection initialized with sqlite-vec, the application schema and
/// a vector table sized for one embedding model.
pub struct Db {
    pub(crate) conn: Connection,
    model: String,
    dimensions: usize,
    reset: bool,
}

impl Db {
    /// Open a database at the given path for vectors produced by `model` with
    /// `dimensions` components.
    ///
    /// If the database was built with a different model or dimension, every
    /// vector, chunk and file record is discarded so the next run re-embeds
    /// the whole tree.
    pub fn open<P: AsRef<Path>>(path: P, model: &str, dimensions: usize) -> Result<Self> {
        let path = path.as_ref();
        info!("Initializing database: {}", path.display());

        // Register sqlite-vec extension globally
        init_sqlite_vec();

        let conn = Connection::open(path)?;
        Self::init(conn, model, dimensions)
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory(model: &str, dimensions: usize) -> Result<Self> {
        init_sqlite_vec();
        let conn = Connection::open_in_memory()?;
        Self::init(conn, model, dimensions)
    }

    fn init(conn: Connection, model: &str, dimensions: usize) -> Result<Self> {
        let vec_version: String = conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;
        info!("sqlite-vec version: {}", vec_version);

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;

        let mut db = Self {
            conn,
            model: model.to_string(),
            dimensions,
            reset: false,
        };
        db.ensure_embedding_space()?;

        info!("Database initialized successfully");
        Ok(db)
    }

    /// Embedding model id the stored vectors belong to.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// True when opening discarded an index built for another embedding space.
    pub fn was_reset(&self) -> bool {
        self.reset
    }

    fn meta(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM index_meta WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()
    }

    fn ensure_embedding_space(&mut self) -> Result<()> {
        let stored_model = self.meta(META_MODEL)?;
        let stored_dims = self
            .meta(META_DIMENSIONS)?
            .and_then(|d| d.parse::<usize>().ok());

        let matches = stored_model.as_deref() == Some(self.model.as_str())
            && stored_dims == Some(self.dimensions);

        if !matches && (stored_model.is_some() || stored_dims.is_some()) {
            warn!(
                "Embedding space changed ({:?}/{:?} -> {}/{}), discarding existing index",
                stored_model, stored_dims, self.model, self.dimensions
            );
            let tx = self.conn.transaction()?;
            tx.execute_batch("DROP TABLE IF EXISTS vec_chunks;")?;
            // Cascades to chunks
            tx.execute("DELETE FROM files", [])?;
            tx.execute("UPDATE projects SET last_indexed_at = NULL", [])?;
            tx.commit()?;
            self.reset = true;
        }

        self.conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS vec_chunks USING vec0(embedding FLOAT[{}]);",
            self.dimensions
        ))?;

        if !matches {
            self.conn.execute(
                "INSERT OR REPLACE INTO index_meta (key, value) VALUES (?, ?)",
                params![META_MODEL, self.model],
            )?;
            self.conn.execute(
                "INSERT OR REPLACE INTO index_meta (key, value) VALUES (?, ?)",
                params![META_DIMENSIONS, self.dimensions.to_string()],
            )?;
        }
        Ok(())
    }
}

/// Helper to serialize a float32 vector into bytes for vec0 virtual table
pub fn serialize_vector(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Chunk, EmbeddedChunk};

    #[test]
    fn test_db_init() {
        let db = Db::open_in_memory("mock", 8).expect("Failed to open in-memory DB");

        let tables: usize = db
            .conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN ('projects', 'files', 'chunks', 'index_meta', 'vec_chunks');",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
        assert!(!db.was_reset());
        assert_eq!(db.meta(META_MODEL).unwrap().as_deref(), Some("mock"));
    }

    #[test]
    fn test_serialize_vector() {
        let vec = vec![1.0, 2.0, -3.5];
        let bytes = serialize_vector(&vec);
        assert_eq!(bytes.len(), 12);

        // 1.0f32 in hex: 0x3f800000 -> little endian: 00 00 80 3f
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x80, 0x3f]);
        // -3.5f32 in hex: 0xc0600000 -> little endian: 00 00 60 c0
        assert_eq!(&bytes[8..12], &[0x00, 0x00, 0x60, 0xc0]);
    }

    #[test]
    fn test_reopen_with_other_model_discards_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");

        {
            let mut db = Db::open(&path, "model-a", 4).unwrap();
            db.upsert_project("proj", "/src/proj").unwrap();
            let chunk = Chunk {
                chunk_id: "c1".into(),
                path: "a.py".into(),
                start_line: 1,
                end_line: 3,
                content: "print(1)".into(),
                language: "python".into(),
                symbol: None,
            };
            db.replace_file(
                "proj",
                "a.py",
                "sha256:00",
                "python",
                &[EmbeddedChunk {
                    chunk,
                    embedding: vec![1.0, 0.0, 0.0, 0.0],
                }],
            )
            .unwrap();
            assert_eq!(db.chunk_count("proj").unwrap(), 1);
        }

        // Same model: index survives.
        {
            let db = Db::open(&path, "model-a", 4).unwrap();
            assert!(!db.was_reset());
            assert_eq!(db.chunk_count("proj").unwrap(), 1);
        }

        // Different dimension: everything is dropped, projects stay.
        let db = Db::open(&path, "model-a", 6).unwrap();
        assert!(db.was_reset());
        assert_eq!(db.chunk_count("proj").unwrap(), 0);
        assert!(db.list_file_records("proj").unwrap().is_empty());
        assert_eq!(db.list_projects().unwrap().len(), 1);
        let vec_rows: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM vec_chunks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(vec_rows, 0);
    }
}
