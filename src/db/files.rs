use super::{Db, models::*, serialize_vector};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Result, Transaction, params};
use std::collections::{BTreeSet, HashMap};

fn insert_chunk(
    tx: &Transaction<'_>,
    project_id: &str,
    file_id: i64,
    item: &EmbeddedChunk,
) -> Result<()> {
    let c = &item.chunk;
    tx.execute(
        "INSERT INTO chunks (file_id, project_id, chunk_id, start_line, end_line, content, language, symbol) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            file_id,
            project_id,
            c.chunk_id,
            c.start_line as i64,
            c.end_line as i64,
            c.content,
            c.language,
            c.symbol,
        ],
    )?;
    let row_id = tx.last_insert_rowid();

    let vector_blob = serialize_vector(&item.embedding);
    tx.execute(
        "INSERT INTO vec_chunks (rowid, embedding) VALUES (?, ?)",
        params![row_id, vector_blob],
    )?;
    Ok(())
}

pub(crate) fn map_chunk_row(row: &rusqlite::Row<'_>) -> Result<Chunk> {
    Ok(Chunk {
        chunk_id: row.get(0)?,
        path: row.get(1)?,
        start_line: row.get::<_, i64>(2)? as usize,
        end_line: row.get::<_, i64>(3)? as usize,
        content: row.get(4)?,
        language: row.get(5)?,
        symbol: row.get(6)?,
    })
}

impl Db {
    /// Returns path -> record for every indexed file of a project.
    pub fn list_file_records(&self, project_id: &str) -> Result<HashMap<String, FileRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT path, fingerprint, language, indexed_at FROM files WHERE project_id = ?",
        )?;
        let rows = stmt.query_map(params![project_id], |row| {
            let indexed_at: DateTime<Utc> = row.get(3)?;
            Ok(FileRecord {
                path: row.get(0)?,
                fingerprint: row.get(1)?,
                language: row.get(2)?,
                indexed_at,
                chunk_ids: BTreeSet::new(),
            })
        })?;

        let mut records = HashMap::new();
        for row in rows {
            let record = row?;
            records.insert(record.path.clone(), record);
        }

        let mut stmt = self.conn.prepare(
            "SELECT f.path, c.chunk_id FROM chunks c JOIN files f ON c.file_id = f.id WHERE f.project_id = ?",
        )?;
        let rows = stmt.query_map(params![project_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (path, chunk_id) = row?;
            if let Some(record) = records.get_mut(&path) {
                record.chunk_ids.insert(chunk_id);
            }
        }

        Ok(records)
    }

    fn file_id(&self, project_id: &str, path: &str) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM files WHERE project_id = ? AND path = ?",
                params![project_id, path],
                |row| row.get(0),
            )
            .optional()
    }

    /// Deletes a file record, its chunks and their vectors in one transaction.
    pub fn delete_file(&self, project_id: &str, path: &str) -> Result<bool> {
        let Some(file_id) = self.file_id(project_id, path)? else {
            return Ok(false);
        };
        let tx = self.conn.unchecked_transaction()?;
        // Virtual table cascade deletion workaround
        tx.execute(
            "DELETE FROM vec_chunks WHERE rowid IN (SELECT id FROM chunks WHERE file_id = ?)",
            params![file_id],
        )?;
        // Cascade deletes chunks
        let rows = tx.execute("DELETE FROM files WHERE id = ?", params![file_id])?;
        tx.commit()?;
        Ok(rows > 0)
    }

    /// Replaces everything stored for one file (record, chunks, vectors) in a
    /// single transaction.
    pub fn replace_file(
        &mut self,
        project_id: &str,
        path: &str,
        fingerprint: &str,
        language: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;

        let file_id: i64 = tx.query_row(
            r#"
            INSERT INTO files (project_id, path, fingerprint, language, indexed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(project_id, path) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                language = excluded.language,
                indexed_at = excluded.indexed_at
            RETURNING id
            "#,
            params![project_id, path, fingerprint, language, Utc::now()],
            |row| row.get(0),
        )?;

        // Clean up old contents if any (re-indexing)
        tx.execute(
            "DELETE FROM vec_chunks WHERE rowid IN (SELECT id FROM chunks WHERE file_id = ?)",
            params![file_id],
        )?;
        tx.execute("DELETE FROM chunks WHERE file_id = ?", params![file_id])?;

        for item in chunks {
            insert_chunk(&tx, project_id, file_id, item)?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Inserts chunks into an already indexed file, replacing any stored chunk
    /// with the same id. Other chunks of the file are left alone.
    pub fn upsert_chunks(
        &mut self,
        project_id: &str,
        path: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<()> {
        let file_id = self
            .file_id(project_id, path)?
            .ok_or(rusqlite::Error::QueryReturnedNoRows)?;

        let tx = self.conn.transaction()?;
        for item in chunks {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM chunks WHERE project_id = ? AND chunk_id = ?",
                    params![project_id, item.chunk.chunk_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(row_id) = existing {
                tx.execute("DELETE FROM vec_chunks WHERE rowid = ?", params![row_id])?;
                tx.execute("DELETE FROM chunks WHERE id = ?", params![row_id])?;
            }
            insert_chunk(&tx, project_id, file_id, item)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Chunks stored for one file, in line order.
    pub fn get_file_chunks(&self, project_id: &str, path: &str) -> Result<Vec<Chunk>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT c.chunk_id, f.path, c.start_line, c.end_line, c.content, c.language, c.symbol
            FROM chunks c
            JOIN files f ON c.file_id = f.id
            WHERE f.project_id = ? AND f.path = ?
            ORDER BY c.start_line, c.end_line
            "#,
        )?;
        let rows = stmt.query_map(params![project_id, path], map_chunk_row)?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row?);
        }
        Ok(chunks)
    }

    pub fn chunk_count(&self, project_id: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE project_id = ?",
            params![project_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(path: &str, start: usize, end: usize, content: &str) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: Chunk {
                chunk_id: format!("{path}:{start}:{end}"),
                path: path.to_string(),
                start_line: start,
                end_line: end,
                content: content.to_string(),
                language: "python".to_string(),
                symbol: None,
            },
            embedding: vec![0.1; 8],
        }
    }

    fn vec_rows(db: &Db) -> i64 {
        db.conn
            .query_row("SELECT COUNT(*) FROM vec_chunks", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_files_crud() {
        let mut db = Db::open_in_memory("mock", 8).unwrap();
        db.upsert_project("p", "/p").unwrap();

        db.replace_file(
            "p",
            "app.py",
            "sha256:aa",
            "python",
            &[chunk("app.py", 1, 10, "Hello"), chunk("app.py", 8, 20, "World")],
        )
        .unwrap();

        let records = db.list_file_records("p").unwrap();
        assert_eq!(records.len(), 1);
        let record = &records["app.py"];
        assert_eq!(record.fingerprint, "sha256:aa");
        assert_eq!(record.chunk_ids.len(), 2);
        assert_eq!(vec_rows(&db), 2);

        // Re-index replaces old chunks
        db.replace_file(
            "p",
            "app.py",
            "sha256:bb",
            "python",
            &[chunk("app.py", 1, 5, "Replaced")],
        )
        .unwrap();
        let records = db.list_file_records("p").unwrap();
        assert_eq!(records["app.py"].fingerprint, "sha256:bb");
        assert_eq!(db.chunk_count("p").unwrap(), 1);
        assert_eq!(vec_rows(&db), 1);

        let stored = db.get_file_chunks("p", "app.py").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "Replaced");

        assert!(db.delete_file("p", "app.py").unwrap());
        assert!(!db.delete_file("p", "app.py").unwrap());
        assert_eq!(db.chunk_count("p").unwrap(), 0);
        assert_eq!(vec_rows(&db), 0);
    }

    #[test]
    fn test_delete_file_is_atomic() {
        let mut db = Db::open_in_memory("mock", 8).unwrap();
        db.upsert_project("p", "/p").unwrap();
        db.replace_file("p", "a.py", "sha256:aa", "python", &[chunk("a.py", 1, 4, "x")])
            .unwrap();
        db.conn
            .execute_batch(
                "CREATE TRIGGER keep_files BEFORE DELETE ON files BEGIN SELECT RAISE(ABORT, 'read only'); END;",
            )
            .unwrap();

        assert!(db.delete_file("p", "a.py").is_err());
        // The vector delete ran first and was rolled back with the rest.
        assert_eq!(vec_rows(&db), 1);
        assert_eq!(db.chunk_count("p").unwrap(), 1);
    }

    #[test]
    fn test_upsert_chunks_replaces_by_id() {
        let mut db = Db::open_in_memory("mock", 8).unwrap();
        db.upsert_project("p", "/p").unwrap();
        db.replace_file(
            "p",
            "a.py",
            "sha256:aa",
            "python",
            &[chunk("a.py", 1, 10, "one"), chunk("a.py", 11, 20, "two")],
        )
        .unwrap();

        db.upsert_chunks(
            "p",
            "a.py",
            &[chunk("a.py", 11, 20, "two, revised"), chunk("a.py", 21, 25, "three")],
        )
        .unwrap();

        let stored = db.get_file_chunks("p", "a.py").unwrap();
        let contents: Vec<_> = stored.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two, revised", "three"]);
        assert_eq!(vec_rows(&db), 3);

        // Unknown file
        assert!(db.upsert_chunks("p", "missing.py", &[]).is_err());
    }
}
