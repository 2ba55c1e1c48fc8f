//! Chunk store using SQLite and sqlite-vec.
//!
//! The live index is an in-memory database; [`snapshot`] copies it to and
//! from a single file on disk.
use rusqlite::{Connection, Result};
use sqlite_vec::sqlite3_vec_init;
use std::sync::Once;
use tracing::{debug, info};

pub mod chunks;
pub mod search;
pub mod snapshot;

fn schema_sql(dimensions: usize) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    filename TEXT NOT NULL,
    doc_type TEXT NOT NULL,
    last_modified DATETIME NOT NULL,
    chunk_index INTEGER NOT NULL,
    total_chunks INTEGER NOT NULL,
    content TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source);

CREATE VIRTUAL TABLE IF NOT EXISTS vec_chunks USING vec0(
    embedding FLOAT[{dimensions}]
);
"#
    )
}

static INIT_VEC: Once = Once::new();

/// Initialize the sqlite-vec extension. Safe to call multiple times.
fn init_sqlite_vec() {
    INIT_VEC.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// A SQLite connection initialized with sqlite-vec and the chunk schema.
pub struct Db {
    pub(crate) conn: Connection,
    dimensions: usize,
}

impl Db {
    /// Open an in-memory database holding vectors of `dimensions` floats.
    pub fn open_in_memory(dimensions: usize) -> Result<Self> {
        init_sqlite_vec();
        let conn = Connection::open_in_memory()?;

        let vec_version: String = conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;
        debug!("sqlite-vec version: {}", vec_version);

        conn.execute_batch(&schema_sql(dimensions))?;
        info!("Chunk store initialized ({dimensions} dimensions)");

        Ok(Self { conn, dimensions })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Serialize a float32 vector into the little-endian blob vec0 expects.
pub fn serialize_vector(vec: &[f32]) -> Vec<u8> {
    if cfg!(target_endian = "little") {
        bytemuck::cast_slice::<f32, u8>(vec).to_vec()
    } else {
        vec.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}
