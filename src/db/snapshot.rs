use super::Db;
use rusqlite::{Result, params};
use std::path::Path;
use tracing::debug;

impl Db {
    /// Write the whole store to `path`, replacing any previous snapshot.
    ///
    /// The copy goes to a sibling temp file first and is renamed into place,
    /// so a crash mid-write never leaves a truncated snapshot behind.
    pub fn save_snapshot(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("tmp");
        if tmp.exists() {
            std::fs::remove_file(&tmp)?;
        }

        self.conn
            .execute("VACUUM INTO ?", params![tmp.to_string_lossy()])
            .map_err(std::io::Error::other)?;

        std::fs::rename(&tmp, path)?;
        debug!("Snapshot written to {}", path.display());
        Ok(())
    }

    /// Replace the store's contents with the snapshot at `path`.
    pub fn load_snapshot(&mut self, path: &Path) -> Result<usize> {
        self.conn.execute(
            "ATTACH DATABASE ? AS snap",
            params![path.to_string_lossy()],
        )?;

        let copied = self.copy_from_attached();

        // Detach even if the copy failed
        self.conn.execute("DETACH DATABASE snap", [])?;
        copied
    }

    fn copy_from_attached(&mut self) -> Result<usize> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM vec_chunks", [])?;
        tx.execute("DELETE FROM chunks", [])?;
        let copied = tx.execute(
            r#"
            INSERT INTO chunks
                (id, source, filename, doc_type, last_modified, chunk_index, total_chunks, content)
            SELECT id, source, filename, doc_type, last_modified, chunk_index, total_chunks, content
            FROM snap.chunks
            "#,
            [],
        )?;
        tx.execute(
            "INSERT INTO vec_chunks (rowid, embedding) SELECT rowid, embedding FROM snap.vec_chunks",
            [],
        )?;
        tx.commit()?;
        Ok(copied)
    }
}
