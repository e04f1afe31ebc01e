//! Tablet Engine
//!
//! Ties the metadata store to the on-disk layout of the data root:
//!
//! ```text
//! <root>/meta/tablet_meta.db               committed tablet metadata
//! <root>/data/<tablet>/<schema>/r<rev>/    generation directories (one live per tablet)
//! <root>/clone/<tablet>.<uuid>/            staging directories of in-flight clones
//! <root>/snapshot/<stamp>.<uuid>/<tablet>/ snapshots served to other replicas
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::meta::TabletMeta;
use super::store::{SqliteMetaStore, TabletMetaStore};
use super::{SchemaHash, TabletId};
use crate::error::Result;
use crate::util::path_age;

/// Data root directory structure
#[derive(Debug, Clone)]
pub struct EnginePaths {
    root: PathBuf,
}

impl EnginePaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Parent of all staging directories
    pub fn clone_dir(&self) -> PathBuf {
        self.root.join("clone")
    }

    /// Parent of all snapshots made for other replicas
    pub fn snapshot_dir(&self) -> PathBuf {
        self.root.join("snapshot")
    }

    /// Directory holding every generation of one tablet
    pub fn tablet_root(&self, tablet_id: TabletId, schema_hash: SchemaHash) -> PathBuf {
        self.data_dir()
            .join(tablet_id.to_string())
            .join(schema_hash.to_string())
    }

    /// Generation directory for a revision, relative to the data root
    pub fn generation_rel(
        &self,
        tablet_id: TabletId,
        schema_hash: SchemaHash,
        revision: u64,
    ) -> PathBuf {
        PathBuf::from("data")
            .join(tablet_id.to_string())
            .join(schema_hash.to_string())
            .join(format!("r{}", revision))
    }

    /// Absolute path of a root-relative data pointer
    pub fn resolve(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    /// Ensure the top-level directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.meta_dir())?;
        fs::create_dir_all(self.data_dir())?;
        fs::create_dir_all(self.clone_dir())?;
        fs::create_dir_all(self.snapshot_dir())
    }
}

/// What a recovery sweep removed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub staging_removed: usize,
    pub orphans_removed: usize,
}

/// Local storage engine: data root layout plus tablet metadata store
pub struct TabletEngine {
    paths: EnginePaths,
    store: Arc<dyn TabletMetaStore>,
}

impl TabletEngine {
    /// Open the engine rooted at `root` with the SQLite metadata store
    pub fn open(root: PathBuf) -> Result<Self> {
        let paths = EnginePaths::new(root);
        paths.ensure_dirs()?;
        let store = SqliteMetaStore::new(paths.meta_dir())?;
        Ok(Self {
            paths,
            store: Arc::new(store),
        })
    }

    /// Open the engine with an externally provided metadata store
    pub fn with_store(root: PathBuf, store: Arc<dyn TabletMetaStore>) -> Result<Self> {
        let paths = EnginePaths::new(root);
        paths.ensure_dirs()?;
        Ok(Self { paths, store })
    }

    pub fn paths(&self) -> &EnginePaths {
        &self.paths
    }

    pub fn store(&self) -> &Arc<dyn TabletMetaStore> {
        &self.store
    }

    pub async fn get_tablet(&self, tablet_id: TabletId) -> Result<Option<TabletMeta>> {
        self.store.get_tablet(tablet_id).await
    }

    /// Absolute live data directory of a tablet
    pub fn tablet_data_path(&self, meta: &TabletMeta) -> PathBuf {
        self.paths.resolve(&meta.data_dir)
    }

    /// Remove leftovers of interrupted clones.
    ///
    /// Staging directories and generation directories that no tablet points
    /// at are removed once older than `grace`. A generation directory younger
    /// than `grace` may belong to a publish that has not committed yet.
    pub async fn recover(&self, grace: Duration) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let clone_dir = self.paths.clone_dir();
        if clone_dir.exists() {
            for entry in fs::read_dir(&clone_dir)? {
                let path = entry?.path();
                if path_age(&path)? < grace {
                    continue;
                }
                match fs::remove_dir_all(&path) {
                    Ok(()) => report.staging_removed += 1,
                    Err(e) => tracing::warn!("Failed to remove stale staging {:?}: {}", path, e),
                }
            }
        }

        let live: HashSet<PathBuf> = self
            .store
            .list_tablets()
            .await?
            .into_iter()
            .map(|t| t.data_dir)
            .collect();

        for generation in self.generation_dirs()? {
            let rel = match generation.strip_prefix(self.paths.root()) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            if live.contains(&rel) || path_age(&generation)? < grace {
                continue;
            }
            match fs::remove_dir_all(&generation) {
                Ok(()) => {
                    tracing::info!("Removed orphaned tablet generation {:?}", rel);
                    report.orphans_removed += 1;
                }
                Err(e) => tracing::warn!("Failed to remove orphan {:?}: {}", generation, e),
            }
        }

        if report.staging_removed > 0 || report.orphans_removed > 0 {
            tracing::info!(
                "Recovery removed {} staging dirs and {} orphaned generations",
                report.staging_removed,
                report.orphans_removed
            );
        }
        Ok(report)
    }

    /// All `data/<tablet>/<schema>/<generation>` directories
    fn generation_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let data_dir = self.paths.data_dir();
        if !data_dir.exists() {
            return Ok(dirs);
        }

        for tablet in fs::read_dir(&data_dir)? {
            let tablet = tablet?;
            if !tablet.file_type()?.is_dir() {
                continue;
            }
            for schema in fs::read_dir(tablet.path())? {
                let schema = schema?;
                if !schema.file_type()?.is_dir() {
                    continue;
                }
                for generation in fs::read_dir(schema.path())? {
                    let generation = generation?;
                    if generation.file_type()?.is_dir() {
                        dirs.push(generation.path());
                    }
                }
            }
        }
        Ok(dirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::seed_tablet;
    use tempfile::tempdir;

    #[test]
    fn test_generation_layout() {
        let paths = EnginePaths::new(PathBuf::from("/data"));
        assert_eq!(
            paths.resolve(&paths.generation_rel(15001, 42, 3)),
            PathBuf::from("/data/data/15001/42/r3")
        );
        assert_eq!(paths.tablet_root(15001, 42), PathBuf::from("/data/data/15001/42"));
    }

    #[tokio::test]
    async fn test_recover_removes_orphans_and_staging() {
        let dir = tempdir().unwrap();
        let engine = TabletEngine::open(dir.path().to_path_buf()).unwrap();
        let meta = seed_tablet(&engine, 100, 7, &[(0, 3)]).await;

        let orphan = engine.paths().resolve(&engine.paths().generation_rel(100, 7, 9));
        fs::create_dir_all(&orphan).unwrap();
        fs::write(orphan.join("x_0.dat"), b"stale").unwrap();
        let staging = engine.paths().clone_dir().join("100.abc");
        fs::create_dir_all(&staging).unwrap();

        // young leftovers survive a sweep with a long grace period
        let report = engine.recover(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(report, RecoveryReport::default());

        let report = engine.recover(Duration::ZERO).await.unwrap();
        assert_eq!(report.staging_removed, 1);
        assert_eq!(report.orphans_removed, 1);
        assert!(!orphan.exists());
        assert!(engine.tablet_data_path(&meta).exists());
    }
}
