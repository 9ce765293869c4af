use super::{Db, models::ProjectRecord};
use chrono::{DateTime, Utc};
use rusqlite::{Result, params};

impl Db {
    /// Registers a project, or refreshes its root path if it already exists.
    pub fn upsert_project(&self, project_id: &str, root_path: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO projects (id, root_path, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET root_path = excluded.root_path
            "#,
            params![project_id, root_path, Utc::now()],
        )?;
        Ok(())
    }

    pub fn mark_indexed(&self, project_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE projects SET last_indexed_at = ? WHERE id = ?",
            params![Utc::now(), project_id],
        )?;
        Ok(())
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT
                p.id,
                p.root_path,
                p.created_at,
                p.last_indexed_at,
                (SELECT COUNT(*) FROM files f WHERE f.project_id = p.id),
                (SELECT COUNT(*) FROM chunks c WHERE c.project_id = p.id)
            FROM projects p
            ORDER BY p.id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            let created_at: DateTime<Utc> = row.get(2)?;
            let last_indexed_at: Option<DateTime<Utc>> = row.get(3)?;
            Ok(ProjectRecord {
                id: row.get(0)?,
                root_path: row.get(1)?,
                created_at,
                last_indexed_at,
                file_count: row.get::<_, i64>(4)? as usize,
                chunk_count: row.get::<_, i64>(5)? as usize,
            })
        })?;

        let mut projects = Vec::new();
        for row in rows {
            projects.push(row?);
        }
        Ok(projects)
    }

    /// Removes a project with all of its file records, chunks and vectors.
    pub fn delete_project(&mut self, project_id: &str) -> Result<bool> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM vec_chunks WHERE rowid IN (SELECT id FROM chunks WHERE project_id = ?)",
            params![project_id],
        )?;
        // Cascades to files, then chunks
        let rows = tx.execute("DELETE FROM projects WHERE id = ?", params![project_id])?;
        tx.commit()?;
        Ok(rows > 0)
    }
}
