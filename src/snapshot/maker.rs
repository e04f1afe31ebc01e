//! Snapshot Maker
//!
//! Source side of a clone: pins the files of a tablet in a snapshot directory
//! so they can be downloaded while the live tablet keeps changing.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::layout::SnapshotHeader;
use super::SnapshotScope;
use crate::error::{Error, Result};
use crate::tablet::{SchemaHash, TabletEngine, TabletId, TabletVersionSet};
use crate::transport::{RemoteFile, RemoteSnapshot};
use crate::util::{link_or_copy, path_age};

/// Builds, releases and expires snapshots under `<data_dir>/snapshot`
pub struct SnapshotMaker {
    engine: Arc<TabletEngine>,
}

impl SnapshotMaker {
    pub fn new(engine: Arc<TabletEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<TabletEngine> {
        &self.engine
    }

    pub fn root(&self) -> PathBuf {
        self.engine.paths().snapshot_dir()
    }

    /// Committed versions of a local tablet
    pub async fn list_versions(&self, tablet_id: TabletId) -> Result<TabletVersionSet> {
        let meta = self
            .engine
            .get_tablet(tablet_id)
            .await?
            .ok_or(Error::TabletNotFound(tablet_id))?;
        meta.version_set()
    }

    /// Pin the requested rowsets of a tablet into a new snapshot directory
    pub async fn make(
        &self,
        tablet_id: TabletId,
        schema_hash: SchemaHash,
        scope: &SnapshotScope,
    ) -> Result<RemoteSnapshot> {
        let meta = self
            .engine
            .get_tablet(tablet_id)
            .await?
            .ok_or(Error::TabletNotFound(tablet_id))?;
        if meta.schema_hash != schema_hash {
            tracing::warn!(
                "Snapshot of tablet {} requested with schema hash {}, local is {}",
                tablet_id,
                schema_hash,
                meta.schema_hash
            );
            return Err(Error::TabletNotFound(tablet_id));
        }

        let rowsets = match scope {
            SnapshotScope::Full => meta.rowsets.clone(),
            SnapshotScope::Versions(ranges) => {
                let mut picked = Vec::with_capacity(ranges.len());
                for range in ranges {
                    let rowset = meta
                        .rowsets
                        .iter()
                        .find(|r| r.version == *range)
                        .ok_or_else(|| {
                            Error::VersionUnavailable(format!(
                                "tablet {} holds no rowset {}",
                                tablet_id, range
                            ))
                        })?;
                    picked.push(rowset.clone());
                }
                picked
            }
        };

        let top = self.root().join(format!(
            "{}.{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            uuid::Uuid::new_v4().simple()
        ));
        let dir = top.join(tablet_id.to_string());
        fs::create_dir_all(&dir)?;

        let live = self.engine.tablet_data_path(&meta);
        let header = SnapshotHeader::new(tablet_id, meta.schema_hash, rowsets);
        let result = (|| -> Result<Vec<RemoteFile>> {
            let mut files = Vec::new();
            for rowset in &header.rowsets {
                for file in &rowset.files {
                    link_or_copy(&live.join(&file.name), &dir.join(&file.name))?;
                    files.push(RemoteFile {
                        name: file.name.clone(),
                        size: file.size,
                    });
                }
            }
            header.write_to(&dir)?;
            files.push(RemoteFile {
                name: super::HEADER_FILE_NAME.to_string(),
                size: fs::metadata(SnapshotHeader::path(&dir))?.len(),
            });
            Ok(files)
        })();

        let files = match result {
            Ok(files) => files,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&top) {
                    tracing::warn!("Failed to remove partial snapshot {:?}: {}", top, cleanup);
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Made snapshot of tablet {} with {} rowsets at {:?}",
            tablet_id,
            header.rowsets.len(),
            dir
        );
        Ok(RemoteSnapshot {
            path: dir.to_string_lossy().into_owned(),
            tablet_id,
            files,
        })
    }

    /// Canonical form of `path` if it lies inside the snapshot root
    pub fn resolve_path(&self, path: &Path) -> Result<Option<PathBuf>> {
        let root = self.root().canonicalize()?;
        let path = path.canonicalize()?;
        if path.starts_with(&root) && path != root {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }

    /// Remove the snapshot containing `path`
    pub fn release(&self, path: &Path) -> Result<()> {
        let resolved = match self.resolve_path(path) {
            Ok(Some(resolved)) => resolved,
            Ok(None) => {
                return Err(Error::ValidationFailed(format!(
                    "{:?} is not a snapshot",
                    path
                )))
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Snapshot {:?} already released", path);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let root = self.root().canonicalize()?;
        let top = match resolved.strip_prefix(&root).ok().and_then(|rel| rel.components().next()) {
            Some(Component::Normal(name)) => root.join(name),
            _ => return Err(Error::ValidationFailed(format!("{:?} is not a snapshot", path))),
        };

        fs::remove_dir_all(&top)?;
        tracing::debug!("Released snapshot {:?}", top);
        Ok(())
    }

    /// Remove snapshots older than `ttl` that were never released
    pub fn sweep_expired(&self, ttl: Duration) -> Result<usize> {
        let root = self.root();
        if !root.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in fs::read_dir(&root)? {
            let path = entry?.path();
            if path_age(&path)? < ttl {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Failed to remove expired snapshot {:?}: {}", path, e),
            }
        }

        if removed > 0 {
            tracing::info!("Removed {} expired snapshots", removed);
        }
        Ok(removed)
    }
}
