//! Staging directories owned by one clone attempt.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::tablet::TabletId;

/// Unique scratch directory under `<data_dir>/clone`, removed on drop.
///
/// Once a publish has moved the directory into place, [`StagingDir::persist`]
/// hands it off so drop leaves it alone.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    owned: bool,
}

impl StagingDir {
    /// Create a fresh staging directory for `tablet_id` under `clone_root`
    pub fn create(clone_root: &Path, tablet_id: TabletId) -> io::Result<Self> {
        fs::create_dir_all(clone_root)?;
        let path = clone_root.join(format!("{}.{}", tablet_id, uuid::Uuid::new_v4().simple()));
        fs::create_dir(&path)?;
        Ok(Self { path, owned: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Empty the directory for another attempt
    pub fn reset(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::create_dir(&self.path)
    }

    /// Give up ownership; the directory is no longer removed on drop
    pub fn persist(mut self) -> PathBuf {
        self.owned = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => tracing::debug!("Removed staging directory {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove staging directory {:?}: {}", self.path, e),
        }
    }
}
