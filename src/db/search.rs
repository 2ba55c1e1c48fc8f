use super::{Db, serialize_vector};
use crate::models::{Chunk, DocumentMetadata, DocumentType};
use rusqlite::{Result, params};

#[derive(Debug)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub similarity: f64,
    pub chunk_id: i64,
}

fn map_search_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SearchResult> {
    let distance: f64 = row.get(8)?;
    let doc_type: String = row.get(3)?;

    Ok(SearchResult {
        chunk: Chunk {
            text: row.get(7)?,
            metadata: DocumentMetadata {
                source: row.get(1)?,
                filename: row.get(2)?,
                doc_type: DocumentType::parse(&doc_type),
                last_modified: row.get(4)?,
            },
            chunk_index: row.get::<_, i64>(5)? as usize,
            total_chunks: row.get::<_, i64>(6)? as usize,
        },
        chunk_id: row.get(0)?,
        // cosine distance is in [0, 2]
        similarity: 1.0 - (distance / 2.0),
    })
}

impl Db {
    /// Nearest chunks to `query_vector` by cosine distance, most similar first.
    pub fn search(&self, query_vector: &[f32], top_k: usize) -> Result<Vec<SearchResult>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT
                c.id,
                c.source,
                c.filename,
                c.doc_type,
                c.last_modified,
                c.chunk_index,
                c.total_chunks,
                c.content,
                vec_distance_cosine(v.embedding, ?) AS distance
            FROM vec_chunks v
            JOIN chunks c ON v.rowid = c.id
            ORDER BY distance ASC, c.id ASC
            LIMIT ?
            "#,
        )?;

        let rows = stmt.query_map(
            params![serialize_vector(query_vector), top_k as i64],
            map_search_row,
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Document;
    use chrono::Utc;
    use std::path::Path;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let mut db = Db::open_in_memory(4).unwrap();

        let doc_a = Document::new(Path::new("/kb/rust.md"), String::new(), Utc::now());
        let doc_b = Document::new(Path::new("/kb/cooking.txt"), String::new(), Utc::now());
        let a = Chunk::tag_all(&doc_a, vec!["Rust programming language".into()]);
        let b = Chunk::tag_all(&doc_b, vec!["Banana bread".into()]);

        db.replace_chunks(&a, &[unit(4, 0)]).unwrap();
        db.replace_chunks(&b, &[unit(4, 1)]).unwrap();

        let results = db.search(&unit(4, 0), 5).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.metadata.filename, "rust.md");
        assert_eq!(results[0].chunk.metadata.doc_type, DocumentType::Markdown);
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
        assert!(results[0].similarity > results[1].similarity);

        let top1 = db.search(&unit(4, 1), 1).unwrap();
        assert_eq!(top1.len(), 1);
        assert_eq!(top1[0].chunk.text, "Banana bread");
    }

    #[test]
    fn test_search_empty_store() {
        let db = Db::open_in_memory(4).unwrap();
        assert!(db.search(&unit(4, 2), 5).unwrap().is_empty());
    }
}
