use super::{Db, files::map_chunk_row, models::ScoredChunk, serialize_vector};
use rusqlite::Result;
use rusqlite::types::Value;

/// Restricts a nearest-neighbour query. All set fields must match.
#[derive(Debug, Default)]
pub struct ChunkFilter<'a> {
    /// Exact relative path, or a glob with `*` / `?`.
    pub path: Option<&'a str>,
    pub language: Option<&'a str>,
    pub exclude_ids: &'a [String],
    /// Skip chunks of this file that overlap `exclude_lines`, or the whole
    /// file when no lines are given.
    pub exclude_path: Option<&'a str>,
    pub exclude_lines: Option<(usize, usize)>,
}

fn glob_to_like(pattern: &str) -> String {
    let mut result = pattern.replace('\\', "\\\\");
    result = result.replace('%', "\\%");
    result = result.replace('_', "\\_");
    result = result.replace('*', "%");
    result = result.replace('?', "_");
    result
}

fn map_scored_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScoredChunk> {
    let distance: f64 = row.get(7)?;
    Ok(ScoredChunk {
        chunk: map_chunk_row(row)?,
        similarity: 1.0 - (distance / 2.0),
    })
}

impl Db {
    /// Nearest chunks of one project by cosine distance, most similar first.
    pub fn query(
        &self,
        project_id: &str,
        query_vector: &[f32],
        k: usize,
        filter: &ChunkFilter<'_>,
    ) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query = String::from(
            r#"
            SELECT
                c.chunk_id,
                f.path,
                c.start_line,
                c.end_line,
                c.content,
                c.language,
                c.symbol,
                vec_distance_cosine(v.embedding, ?) as distance
            FROM vec_chunks v
            JOIN chunks c ON v.rowid = c.id
            JOIN files f ON c.file_id = f.id
            WHERE c.project_id = ?
            "#,
        );

        let mut params: Vec<Value> = vec![
            Value::Blob(serialize_vector(query_vector)),
            Value::Text(project_id.to_string()),
        ];

        if let Some(path) = filter.path {
            if path.contains(['*', '?']) {
                query.push_str(" AND f.path LIKE ? ESCAPE '\\'");
                params.push(Value::Text(glob_to_like(path)));
            } else {
                query.push_str(" AND f.path = ?");
                params.push(Value::Text(path.to_string()));
            }
        }
        if let Some(language) = filter.language {
            query.push_str(" AND c.language = ?");
            params.push(Value::Text(language.to_string()));
        }
        if !filter.exclude_ids.is_empty() {
            let placeholders = vec!["?"; filter.exclude_ids.len()].join(", ");
            query.push_str(&format!(" AND c.chunk_id NOT IN ({placeholders})"));
            params.extend(filter.exclude_ids.iter().cloned().map(Value::Text));
        }

        if let Some(path) = filter.exclude_path {
            match filter.exclude_lines {
                Some((start, end)) => {
                    query.push_str(
                        " AND NOT (f.path = ? AND c.start_line <= ? AND c.end_line >= ?)",
                    );
                    params.push(Value::Text(path.to_string()));
                    params.push(Value::Integer(end as i64));
                    params.push(Value::Integer(start as i64));
                }
                None => {
                    query.push_str(" AND f.path != ?");
                    params.push(Value::Text(path.to_string()));
                }
            }
        }

        query.push_str(" ORDER BY distance ASC LIMIT ?");
        params.push(Value::Integer(k as i64));

        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(param_refs.as_slice(), map_scored_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }

        Ok(results)
    }
}
