//! Clone Publisher
//!
//! Makes a verified staging directory live. The metadata commit is the only
//! step that changes what readers see; everything before it is undone on
//! failure and everything after it is cleanup.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use super::fetcher::FetchedSnapshot;
use super::{CloneKind, CloneMode, CloneOutcome, CloneRequest};
use crate::error::{Error, Result};
use crate::snapshot::SnapshotHeader;
use crate::tablet::{RowsetMeta, TabletEngine, TabletMeta, VersionRange};
use crate::util::{fsync_dir, link_or_copy};

/// Applies staged snapshots to the local engine
pub struct ClonePublisher {
    engine: Arc<TabletEngine>,
}

impl ClonePublisher {
    pub fn new(engine: Arc<TabletEngine>) -> Self {
        Self { engine }
    }

    /// Publish a converted snapshot.
    ///
    /// `local` is the tablet metadata the plan was made against; a tablet that
    /// changed since then fails with `VersionConflict`.
    pub async fn publish(
        &self,
        request: &CloneRequest,
        local: Option<&TabletMeta>,
        header: &SnapshotHeader,
        fetched: FetchedSnapshot,
        mode: &CloneMode,
    ) -> Result<CloneOutcome> {
        let FetchedSnapshot {
            staging,
            bytes_copied,
            elapsed,
            ..
        } = fetched;

        let (meta, is_new_tablet) = match mode {
            CloneMode::Incremental(ranges) => {
                let local = local.ok_or_else(|| {
                    Error::ValidationFailed("incremental clone of a missing tablet".into())
                })?;
                let meta = self
                    .publish_incremental(local, header, staging.path(), ranges)
                    .await?;
                (meta, false)
            }
            CloneMode::Full => {
                let staged = staging.persist();
                self.publish_full(request, local, header, staged).await?
            }
        };

        tracing::info!(
            "Published {} clone of tablet {}: version {}, revision {}",
            mode,
            meta.tablet_id,
            meta.max_version(),
            meta.revision
        );

        Ok(CloneOutcome {
            kind: mode.kind(),
            bytes_copied,
            copy_time_ms: elapsed.as_millis() as u64,
            is_new_tablet,
            committed_version: meta.max_version(),
            source: None,
            attempts: 0,
            tablet_info: Some(meta.tablet_info()),
            diagnostics: Vec::new(),
            states: Vec::new(),
        })
    }

    async fn publish_incremental(
        &self,
        local: &TabletMeta,
        header: &SnapshotHeader,
        staged: &Path,
        ranges: &[VersionRange],
    ) -> Result<TabletMeta> {
        if header.schema_hash != local.schema_hash {
            return Err(Error::ValidationFailed(format!(
                "staged schema hash {} does not match local {}",
                header.schema_hash, local.schema_hash
            )));
        }

        let mut versions = local.version_set()?;
        let mut added = Vec::with_capacity(ranges.len());
        for range in ranges {
            let mut matching = header.rowsets.iter().filter(|r| r.version == *range);
            let rowset = match (matching.next(), matching.next()) {
                (Some(rowset), None) => rowset,
                (None, _) => {
                    return Err(Error::ValidationFailed(format!(
                        "staged snapshot lacks rowset {}",
                        range
                    )))
                }
                (Some(_), Some(_)) => {
                    return Err(Error::ValidationFailed(format!(
                        "staged snapshot holds rowset {} twice",
                        range
                    )))
                }
            };
            versions.insert(*range)?;
            added.push(rowset.clone());
        }

        self.check_revision(local).await?;

        let live = self.engine.tablet_data_path(local);
        let mut linked = Vec::new();
        let result = self
            .link_and_commit(local, &added, staged, &live, &mut linked)
            .await;

        if result.is_err() && !linked.is_empty() {
            for path in &linked {
                if let Err(e) = fs::remove_file(path) {
                    tracing::error!("Failed to unlink {:?} after aborted publish: {}", path, e);
                }
            }
            if let Err(e) = fsync_dir(&live) {
                tracing::warn!("Failed to sync {:?}: {}", live, e);
            }
        }
        result
    }

    async fn link_and_commit(
        &self,
        local: &TabletMeta,
        added: &[RowsetMeta],
        staged: &Path,
        live: &Path,
        linked: &mut Vec<PathBuf>,
    ) -> Result<TabletMeta> {
        for file in added.iter().flat_map(|r| &r.files) {
            let target = live.join(&file.name);
            if target.exists() {
                return Err(Error::ValidationFailed(format!(
                    "{} already exists in the live tablet",
                    file.name
                )));
            }
            link_or_copy(&staged.join(&file.name), &target)?;
            linked.push(target);
        }
        fsync_dir(live)?;

        let mut meta = local.clone();
        meta.rowsets.extend(added.iter().cloned());
        meta.sort_rowsets();
        meta.revision = local.revision + 1;
        meta.updated_at = Utc::now();

        self.commit(&meta, Some(local.revision)).await?;
        Ok(meta)
    }

    async fn publish_full(
        &self,
        request: &CloneRequest,
        local: Option<&TabletMeta>,
        header: &SnapshotHeader,
        staged: PathBuf,
    ) -> Result<(TabletMeta, bool)> {
        let result = self.swap_in(request, local, header, &staged).await;
        // whatever was not moved into place is discarded
        if staged.exists() {
            if let Err(e) = fs::remove_dir_all(&staged) {
                tracing::warn!("Failed to remove staging directory {:?}: {}", staged, e);
            }
        }
        let meta = result?;

        if let Some(old) = local {
            let old_dir = self.engine.tablet_data_path(old);
            if old.data_dir != meta.data_dir {
                match fs::remove_dir_all(&old_dir) {
                    Ok(()) => tracing::debug!("Retired tablet generation {:?}", old.data_dir),
                    Err(e) => tracing::warn!("Failed to retire {:?}: {}", old_dir, e),
                }
            }
        }
        Ok((meta, local.is_none()))
    }

    async fn swap_in(
        &self,
        request: &CloneRequest,
        local: Option<&TabletMeta>,
        header: &SnapshotHeader,
        staged: &Path,
    ) -> Result<TabletMeta> {
        if header.schema_hash != request.schema_hash {
            return Err(Error::ValidationFailed(format!(
                "staged schema hash {} does not match requested {}",
                header.schema_hash, request.schema_hash
            )));
        }
        let versions = header.version_set()?;
        let Some(max_version) = versions.max_version() else {
            return Err(Error::ValidationFailed("staged snapshot holds no rowsets".into()));
        };
        if !versions.is_contiguous() {
            return Err(Error::ValidationFailed(format!(
                "staged versions {} have holes",
                versions
            )));
        }
        if let Some(target) = request.committed_version {
            if max_version < target {
                return Err(Error::ValidationFailed(format!(
                    "staged version {} is below target {}",
                    max_version, target
                )));
            }
        }
        if let Some(local) = local {
            if max_version < local.max_version() {
                return Err(Error::ValidationFailed(format!(
                    "staged version {} would roll back local version {}",
                    max_version,
                    local.max_version()
                )));
            }
            self.check_revision(local).await?;
        }

        let paths = self.engine.paths();
        let revision = local.map_or(1, |m| m.revision + 1);
        let rel = paths.generation_rel(request.tablet_id, request.schema_hash, revision);
        let generation = paths.resolve(&rel);
        let parent = paths.tablet_root(request.tablet_id, request.schema_hash);

        fs::create_dir_all(&parent)?;
        if generation.exists() {
            // left behind by an attempt that never committed
            tracing::warn!("Removing uncommitted generation {:?}", rel);
            fs::remove_dir_all(&generation)?;
        }
        fs::rename(staged, &generation)?;
        fsync_dir(&parent)?;

        let meta = TabletMeta {
            tablet_id: request.tablet_id,
            schema_hash: request.schema_hash,
            revision,
            data_dir: rel,
            rowsets: header.rowsets.clone(),
            updated_at: Utc::now(),
        };

        if let Err(e) = self.commit(&meta, local.map(|m| m.revision)).await {
            if let Err(cleanup) = fs::remove_dir_all(&generation) {
                tracing::error!("Failed to remove uncommitted {:?}: {}", generation, cleanup);
            }
            return Err(e);
        }
        Ok(meta)
    }

    /// Fail with `VersionConflict` if the tablet moved on since `local` was read
    async fn check_revision(&self, local: &TabletMeta) -> Result<()> {
        match self.engine.get_tablet(local.tablet_id).await? {
            Some(current) if current.revision == local.revision => Ok(()),
            Some(current) => Err(Error::VersionConflict {
                tablet_id: local.tablet_id,
                reason: format!(
                    "revision moved from {} to {}",
                    local.revision, current.revision
                ),
            }),
            None => Err(Error::VersionConflict {
                tablet_id: local.tablet_id,
                reason: "tablet was dropped".into(),
            }),
        }
    }

    /// Commit `meta`, updating when `expected_revision` is set and creating otherwise
    async fn commit(&self, meta: &TabletMeta, expected_revision: Option<u64>) -> Result<()> {
        let store = self.engine.store();
        let result = match expected_revision {
            Some(revision) => store.commit(meta, revision).await,
            None => store.create_tablet(meta).await,
        };

        result.map_err(|e| match e {
            Error::VersionConflict { .. } => e,
            Error::TabletAlreadyExists(id) => Error::VersionConflict {
                tablet_id: id,
                reason: "tablet was created concurrently".into(),
            },
            Error::TabletNotFound(id) => Error::VersionConflict {
                tablet_id: id,
                reason: "tablet was dropped".into(),
            },
            other => Error::MetadataCommitFailed(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clone::converter::SnapshotConverter;
    use crate::snapshot::{SnapshotMaker, SnapshotScope};
    use crate::test_support::{dir_fingerprint, open_engine, seed_tablet, stage_snapshot};
    use std::time::Duration;
    use tempfile::tempdir;

    fn request(tablet_id: u64) -> CloneRequest {
        CloneRequest {
            tablet_id,
            schema_hash: 5,
            signature: 1,
            sources: vec!["src".into()],
            committed_version: None,
        }
    }

    #[tokio::test]
    async fn test_incremental_extends_tablet() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let source = open_engine(src.path());
        seed_tablet(&source, 1, 5, &[(1, 10), (11, 15)]).await;
        let engine = open_engine(dst.path());
        let local = seed_tablet(&engine, 1, 5, &[(1, 10)]).await;

        let ranges = vec![VersionRange::new(11, 15)];
        let maker = SnapshotMaker::new(source);
        let fetched = stage_snapshot(&maker, &engine, 1, &SnapshotScope::Versions(ranges.clone())).await;
        let header = SnapshotConverter::new().convert(fetched.staging.path(), 1).unwrap();

        let publisher = ClonePublisher::new(Arc::clone(&engine));
        let outcome = publisher
            .publish(&request(1), Some(&local), &header, fetched, &CloneMode::Incremental(ranges))
            .await
            .unwrap();
        assert_eq!(outcome.kind, CloneKind::Incremental);
        assert_eq!(outcome.committed_version, 15);
        assert!(!outcome.is_new_tablet);

        let meta = engine.get_tablet(1).await.unwrap().unwrap();
        assert_eq!(meta.revision, local.revision + 1);
        assert_eq!(meta.data_dir, local.data_dir);
        header.verify_files(&engine.tablet_data_path(&meta)).unwrap();
        assert_eq!(fs::read_dir(engine.paths().clone_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_incremental_missing_range_leaves_tablet_untouched() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let source = open_engine(src.path());
        seed_tablet(&source, 1, 5, &[(1, 10), (11, 15), (16, 16)]).await;
        let engine = open_engine(dst.path());
        let local = seed_tablet(&engine, 1, 5, &[(1, 10)]).await;
        let before = dir_fingerprint(&engine.tablet_data_path(&local));

        let maker = SnapshotMaker::new(source);
        let scope = SnapshotScope::Versions(vec![VersionRange::new(11, 15)]);
        let fetched = stage_snapshot(&maker, &engine, 1, &scope).await;
        let header = SnapshotConverter::new().convert(fetched.staging.path(), 1).unwrap();

        let mode = CloneMode::Incremental(vec![VersionRange::new(11, 15), VersionRange::new(16, 16)]);
        let err = ClonePublisher::new(Arc::clone(&engine))
            .publish(&request(1), Some(&local), &header, fetched, &mode)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
        assert_eq!(engine.get_tablet(1).await.unwrap().unwrap(), local);
        assert_eq!(dir_fingerprint(&engine.tablet_data_path(&local)), before);
    }

    #[tokio::test]
    async fn test_full_creates_new_tablet() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let source = open_engine(src.path());
        seed_tablet(&source, 2, 5, &[(1, 3), (4, 5)]).await;
        let engine = open_engine(dst.path());

        let maker = SnapshotMaker::new(source);
        let fetched = stage_snapshot(&maker, &engine, 2, &SnapshotScope::Full).await;
        let header = SnapshotConverter::new().convert(fetched.staging.path(), 2).unwrap();

        let outcome = ClonePublisher::new(Arc::clone(&engine))
            .publish(&request(2), None, &header, fetched, &CloneMode::Full)
            .await
            .unwrap();
        assert!(outcome.is_new_tablet);
        assert_eq!(outcome.committed_version, 5);

        let meta = engine.get_tablet(2).await.unwrap().unwrap();
        assert_eq!(meta.revision, 1);
        header.verify_files(&engine.tablet_data_path(&meta)).unwrap();
    }

    #[tokio::test]
    async fn test_full_replaces_generation() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let source = open_engine(src.path());
        seed_tablet(&source, 3, 5, &[(1, 20)]).await;
        let engine = open_engine(dst.path());
        let local = seed_tablet(&engine, 3, 5, &[(1, 4), (6, 9)]).await;

        let maker = SnapshotMaker::new(source);
        let fetched = stage_snapshot(&maker, &engine, 3, &SnapshotScope::Full).await;
        let header = SnapshotConverter::new().convert(fetched.staging.path(), 3).unwrap();

        ClonePublisher::new(Arc::clone(&engine))
            .publish(&request(3), Some(&local), &header, fetched, &CloneMode::Full)
            .await
            .unwrap();

        let meta = engine.get_tablet(3).await.unwrap().unwrap();
        assert_ne!(meta.data_dir, local.data_dir);
        assert!(meta.version_set().unwrap().is_contiguous());
        assert!(!engine.tablet_data_path(&local).exists());
        // nothing left for recovery
        let report = engine.recover(Duration::ZERO).await.unwrap();
        assert_eq!(report.orphans_removed, 0);
    }

    #[tokio::test]
    async fn test_full_rejects_staged_holes() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let source = open_engine(src.path());
        seed_tablet(&source, 4, 5, &[(1, 3), (6, 8)]).await;
        let engine = open_engine(dst.path());
        let local = seed_tablet(&engine, 4, 5, &[(1, 2)]).await;
        let before = dir_fingerprint(&engine.paths().data_dir());

        let maker = SnapshotMaker::new(source);
        let fetched = stage_snapshot(&maker, &engine, 4, &SnapshotScope::Full).await;
        let header = SnapshotConverter::new().convert(fetched.staging.path(), 4).unwrap();
        let staged = fetched.staging.path().to_path_buf();

        let err = ClonePublisher::new(Arc::clone(&engine))
            .publish(&request(4), Some(&local), &header, fetched, &CloneMode::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
        assert!(!staged.exists());
        assert_eq!(engine.get_tablet(4).await.unwrap().unwrap(), local);
        assert_eq!(dir_fingerprint(&engine.paths().data_dir()), before);
    }

    #[tokio::test]
    async fn test_stale_local_is_a_conflict() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let source = open_engine(src.path());
        seed_tablet(&source, 5, 5, &[(1, 10), (11, 12)]).await;
        let engine = open_engine(dst.path());
        let mut stale = seed_tablet(&engine, 5, 5, &[(1, 10)]).await;
        stale.revision -= 1;

        let maker = SnapshotMaker::new(source);
        let ranges = vec![VersionRange::new(11, 12)];
        let fetched =
            stage_snapshot(&maker, &engine, 5, &SnapshotScope::Versions(ranges.clone())).await;
        let header = SnapshotConverter::new().convert(fetched.staging.path(), 5).unwrap();

        let err = ClonePublisher::new(Arc::clone(&engine))
            .publish(&request(5), Some(&stale), &header, fetched, &CloneMode::Incremental(ranges))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));
    }
}
