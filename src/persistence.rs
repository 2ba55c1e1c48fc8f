//! Durable snapshot of the index: restored at startup, rewritten after
//! ingestion changes it.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::index::{IndexError, VectorIndex};

pub struct SnapshotStore {
    index: Arc<dyn VectorIndex>,
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(index: Arc<dyn VectorIndex>, path: impl Into<PathBuf>) -> Self {
        Self {
            index,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot into the index if one exists.
    ///
    /// Returns the number of chunks restored; zero when starting fresh.
    pub async fn load_or_empty(&self) -> Result<usize, IndexError> {
        if !self.path.exists() {
            info!(
                "No snapshot at {}, starting with an empty index",
                self.path.display()
            );
            return Ok(0);
        }

        let metadata = std::fs::metadata(&self.path)
            .map_err(|e| IndexError::Snapshot(format!("{}: {e}", self.path.display())))?;
        if !metadata.is_file() {
            return Err(IndexError::Snapshot(format!(
                "{} is not a regular file",
                self.path.display()
            )));
        }

        let count = self.index.load(&self.path).await?;
        info!("Restored {count} chunks from {}", self.path.display());
        Ok(count)
    }

    /// Move an unreadable snapshot aside so the next save does not clobber it.
    pub fn quarantine(&self) -> std::io::Result<PathBuf> {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".corrupt");
        let target = PathBuf::from(name);
        std::fs::rename(&self.path, &target)?;
        warn!("Moved unreadable snapshot to {}", target.display());
        Ok(target)
    }

    /// Overwrite the snapshot with the current index contents.
    pub async fn save(&self) -> Result<(), IndexError> {
        self.index.save(&self.path).await?;
        info!("Index snapshot saved to {}", self.path.display());
        Ok(())
    }
}
