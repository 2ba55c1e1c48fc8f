use super::{Db, serialize_vector};
use crate::models::Chunk;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Result, params};
use std::collections::{BTreeSet, HashMap};

impl Db {
    /// Store chunks with their embeddings, replacing whatever was stored
    /// earlier for the same source paths.
    pub fn replace_chunks(&mut self, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<()> {
        if chunks.len() != embeddings.len() {
            return Err(rusqlite::Error::InvalidParameterCount(
                embeddings.len(),
                chunks.len(),
            ));
        }

        let sources: BTreeSet<&str> = chunks.iter().map(|c| c.metadata.source.as_str()).collect();

        let tx = self.conn.transaction()?;

        for source in &sources {
            delete_source_rows(&tx, source)?;
        }

        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            tx.execute(
                r#"
                INSERT INTO chunks
                    (source, filename, doc_type, last_modified, chunk_index, total_chunks, content)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    chunk.metadata.source,
                    chunk.metadata.filename,
                    chunk.metadata.doc_type.as_str(),
                    chunk.metadata.last_modified,
                    chunk.chunk_index as i64,
                    chunk.total_chunks as i64,
                    chunk.text,
                ],
            )?;
            let chunk_id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO vec_chunks (rowid, embedding) VALUES (?, ?)",
                params![chunk_id, serialize_vector(embedding)],
            )?;
        }

        tx.commit()
    }

    /// Drop every chunk stored for `source`; returns how many were removed.
    pub fn delete_source(&mut self, source: &str) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let removed = delete_source_rows(&tx, source)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Returns a map of source path -> last_modified for every stored document.
    pub fn list_sources(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT source, MAX(last_modified) FROM chunks GROUP BY source")?;
        let rows = stmt.query_map([], |row| {
            let source: String = row.get(0)?;
            let modified: DateTime<Utc> = row.get(1)?;
            Ok((source, modified))
        })?;

        let mut sources = HashMap::new();
        for row in rows {
            let (source, modified) = row?;
            sources.insert(source, modified);
        }
        Ok(sources)
    }

    pub fn count_chunks(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

fn delete_source_rows(conn: &Connection, source: &str) -> Result<usize> {
    // vec0 has no foreign keys; clear vectors first
    conn.execute(
        "DELETE FROM vec_chunks WHERE rowid IN (SELECT id FROM chunks WHERE source = ?)",
        params![source],
    )?;
    conn.execute("DELETE FROM chunks WHERE source = ?", params![source])
}
