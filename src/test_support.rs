//! Helpers shared by the unit tests: tablet seeding and fault injection.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;

use crate::clone::{FetchedSnapshot, StagingDir};
use crate::config::CloneConfig;
use crate::error::{Error, Result};
use crate::snapshot::{SnapshotMaker, SnapshotScope};
use crate::tablet::{
    FileMeta, RowsetMeta, SqliteMetaStore, TabletEngine, TabletId, TabletMeta, TabletMetaStore,
    TabletVersionSet, VersionRange,
};
use crate::transport::{FileStream, RemoteFile, RemoteSnapshot, SnapshotSource};
use crate::util::file_checksum;

/// Clone settings with fast retries and no disk reserve
pub fn test_clone_config() -> CloneConfig {
    CloneConfig {
        download_max_attempts: 3,
        retry_backoff_ms: 1,
        retry_backoff_max_ms: 5,
        download_timeout_secs: 30,
        disk_reserve_mb: 0,
        ..CloneConfig::default()
    }
}

pub fn open_engine(root: &Path) -> Arc<TabletEngine> {
    Arc::new(TabletEngine::open(root.to_path_buf()).unwrap())
}

/// Write one single-segment rowset into `dir`
fn write_rowset(dir: &Path, range: VersionRange, data: &[u8]) -> RowsetMeta {
    let rowset_id = RowsetMeta::new_id();
    let name = RowsetMeta::segment_file_name(&rowset_id, 0);
    fs::write(dir.join(&name), data).unwrap();
    let (size, crc32) = file_checksum(&dir.join(&name)).unwrap();
    RowsetMeta {
        rowset_id,
        version: range,
        num_rows: range.len(),
        files: vec![FileMeta { name, size, crc32 }],
    }
}

fn rows(tablet_id: TabletId, range: VersionRange) -> Vec<u8> {
    format!("tablet {} rows {}\n", tablet_id, range)
        .repeat(64)
        .into_bytes()
}

/// Create a tablet holding one rowset per range
pub async fn seed_tablet(
    engine: &TabletEngine,
    tablet_id: TabletId,
    schema_hash: u32,
    ranges: &[(u64, u64)],
) -> TabletMeta {
    let rel = engine.paths().generation_rel(tablet_id, schema_hash, 1);
    let dir = engine.paths().resolve(&rel);
    fs::create_dir_all(&dir).unwrap();

    let rowsets = ranges
        .iter()
        .map(|&(start, end)| {
            let range = VersionRange::new(start, end);
            write_rowset(&dir, range, &rows(tablet_id, range))
        })
        .collect();

    let mut meta = TabletMeta {
        tablet_id,
        schema_hash,
        revision: 1,
        data_dir: rel,
        rowsets,
        updated_at: Utc::now(),
    };
    meta.sort_rowsets();
    engine.store().create_tablet(&meta).await.unwrap();
    meta
}

/// Commit one more rowset to an existing tablet
pub async fn append_rowset(engine: &TabletEngine, tablet_id: TabletId, range: VersionRange) -> TabletMeta {
    let mut meta = engine.get_tablet(tablet_id).await.unwrap().unwrap();
    let dir = engine.tablet_data_path(&meta);
    meta.rowsets.push(write_rowset(&dir, range, &rows(tablet_id, range)));
    commit_next(engine, meta).await
}

/// Merge every rowset inside `range` into one, as compaction on a source would
pub async fn compact(engine: &TabletEngine, tablet_id: TabletId, range: VersionRange) -> TabletMeta {
    let mut meta = engine.get_tablet(tablet_id).await.unwrap().unwrap();
    let dir = engine.tablet_data_path(&meta);

    let (merged, kept): (Vec<_>, Vec<_>) = meta
        .rowsets
        .drain(..)
        .partition(|r| range.start <= r.version.start && r.version.end <= range.end);
    let mut data = Vec::new();
    for file in merged.iter().flat_map(|r| &r.files) {
        data.extend(fs::read(dir.join(&file.name)).unwrap());
        fs::remove_file(dir.join(&file.name)).unwrap();
    }

    meta.rowsets = kept;
    meta.rowsets.push(write_rowset(&dir, range, &data));
    commit_next(engine, meta).await
}

async fn commit_next(engine: &TabletEngine, mut meta: TabletMeta) -> TabletMeta {
    meta.sort_rowsets();
    let expected = meta.revision;
    meta.revision += 1;
    engine.store().commit(&meta, expected).await.unwrap();
    meta
}

/// Size and checksum of every file under `root`, keyed by relative path
pub fn dir_fingerprint(root: &Path) -> BTreeMap<PathBuf, (u64, u32)> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, (u64, u32)>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_path_buf();
                out.insert(rel, file_checksum(&path).unwrap());
            }
        }
    }

    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

/// Copy a snapshot made by `maker` into a staging directory of `engine`
pub async fn stage_snapshot(
    maker: &SnapshotMaker,
    engine: &TabletEngine,
    tablet_id: TabletId,
    scope: &SnapshotScope,
) -> FetchedSnapshot {
    let start = Instant::now();
    let schema_hash = maker
        .engine()
        .get_tablet(tablet_id)
        .await
        .unwrap()
        .unwrap()
        .schema_hash;
    let snapshot = maker.make(tablet_id, schema_hash, scope).await.unwrap();

    let staging = StagingDir::create(&engine.paths().clone_dir(), tablet_id).unwrap();
    let mut bytes_copied = 0;
    for file in &snapshot.files {
        bytes_copied += fs::copy(
            Path::new(&snapshot.path).join(&file.name),
            staging.path().join(&file.name),
        )
        .unwrap();
    }
    maker.release(Path::new(&snapshot.path)).unwrap();

    FetchedSnapshot {
        staging,
        bytes_copied,
        elapsed: start.elapsed(),
        attempts: 1,
    }
}

/// Source wrapper that injects transport faults
pub struct FlakySource {
    inner: Arc<dyn SnapshotSource>,
    disconnects: AtomicU32,
    refuse_versions: AtomicBool,
    corrupt: AtomicBool,
    stall: AtomicBool,
}

impl FlakySource {
    pub fn new(inner: Arc<dyn SnapshotSource>) -> Self {
        Self {
            inner,
            disconnects: AtomicU32::new(0),
            refuse_versions: AtomicBool::new(false),
            corrupt: AtomicBool::new(false),
            stall: AtomicBool::new(false),
        }
    }

    /// Cut the next `n` file downloads halfway through
    pub fn disconnect_next(&self, n: u32) {
        self.disconnects.store(n, Ordering::SeqCst);
    }

    /// Answer every version-scoped snapshot request with `VersionUnavailable`
    pub fn refuse_versions(&self, refuse: bool) {
        self.refuse_versions.store(refuse, Ordering::SeqCst);
    }

    /// Make every file download hang until the caller gives up
    pub fn stall_downloads(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    /// Flip a byte in every chunk of every data file
    pub fn corrupt_bytes(&self, corrupt: bool) {
        self.corrupt.store(corrupt, Ordering::SeqCst);
    }
}

#[async_trait]
impl SnapshotSource for FlakySource {
    async fn list_versions(&self, replica: &str, tablet_id: TabletId) -> Result<TabletVersionSet> {
        self.inner.list_versions(replica, tablet_id).await
    }

    async fn make_snapshot(
        &self,
        replica: &str,
        tablet_id: TabletId,
        schema_hash: u32,
        scope: &SnapshotScope,
    ) -> Result<RemoteSnapshot> {
        if self.refuse_versions.load(Ordering::SeqCst) && matches!(scope, SnapshotScope::Versions(_)) {
            return Err(Error::VersionUnavailable("compacted away".into()));
        }
        self.inner.make_snapshot(replica, tablet_id, schema_hash, scope).await
    }

    async fn open_file(
        &self,
        replica: &str,
        snapshot: &RemoteSnapshot,
        file: &RemoteFile,
    ) -> Result<FileStream> {
        if self.stall.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        let mut stream = self.inner.open_file(replica, snapshot, file).await?;

        let disconnect = self
            .disconnects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if disconnect {
            let first = stream.next().await.transpose()?.unwrap_or_default();
            let half: Bytes = first.slice(..first.len() / 2);
            let chunks = vec![Ok(half), Err(Error::Network("connection reset by peer".into()))];
            return Ok(futures::stream::iter(chunks).boxed());
        }

        if self.corrupt.load(Ordering::SeqCst) && file.name.ends_with(".dat") {
            return Ok(stream
                .map(|chunk| {
                    chunk.map(|bytes| {
                        let mut data = bytes.to_vec();
                        if let Some(b) = data.first_mut() {
                            *b ^= 0xff;
                        }
                        Bytes::from(data)
                    })
                })
                .boxed());
        }
        Ok(stream)
    }

    async fn release_snapshot(&self, replica: &str, snapshot: &RemoteSnapshot) -> Result<()> {
        self.inner.release_snapshot(replica, snapshot).await
    }
}

/// Metadata store wrapper that injects commit faults
pub struct FaultyStore {
    inner: SqliteMetaStore,
    fail_commits: AtomicBool,
    conflicts: AtomicU32,
    crash_after_commit: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: SqliteMetaStore) -> Self {
        Self {
            inner,
            fail_commits: AtomicBool::new(false),
            conflicts: AtomicU32::new(0),
            crash_after_commit: AtomicBool::new(false),
        }
    }

    /// Make every commit and create fail with a storage error
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Reject the next `n` commits as if another writer got there first
    pub fn conflict_next(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// Panic right after a commit has been made durable
    pub fn crash_after_commit(&self, crash: bool) {
        self.crash_after_commit.store(crash, Ordering::SeqCst);
    }
}

#[async_trait]
impl TabletMetaStore for FaultyStore {
    async fn get_tablet(&self, tablet_id: TabletId) -> Result<Option<TabletMeta>> {
        self.inner.get_tablet(tablet_id).await
    }

    async fn create_tablet(&self, meta: &TabletMeta) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(Error::State("injected create failure".into()));
        }
        self.inner.create_tablet(meta).await?;
        if self.crash_after_commit.load(Ordering::SeqCst) {
            panic!("simulated crash after creating tablet {}", meta.tablet_id);
        }
        Ok(())
    }

    async fn commit(&self, meta: &TabletMeta, expected_revision: u64) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(Error::State("injected commit failure".into()));
        }
        let conflict = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflict {
            return Err(Error::VersionConflict {
                tablet_id: meta.tablet_id,
                reason: "injected conflict".into(),
            });
        }

        self.inner.commit(meta, expected_revision).await?;
        if self.crash_after_commit.load(Ordering::SeqCst) {
            panic!("simulated crash after committing tablet {}", meta.tablet_id);
        }
        Ok(())
    }

    async fn list_tablets(&self) -> Result<Vec<TabletMeta>> {
        self.inner.list_tablets().await
    }
}
