//! Snapshot Transport
//!
//! The byte transport between replicas. Implementations do not retry; the
//! clone fetcher layers its retry policy on top.

mod http;
mod local;

pub use http::HttpSnapshotSource;
pub use local::LocalSnapshotSource;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::snapshot::SnapshotScope;
use crate::tablet::{SchemaHash, TabletId, TabletVersionSet};

/// A file advertised by a remote snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    pub size: u64,
}

/// Snapshot prepared on a source replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    /// Source-side location, used to address files and to release the snapshot
    pub path: String,
    pub tablet_id: TabletId,
    pub files: Vec<RemoteFile>,
}

impl RemoteSnapshot {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Chunked body of one downloaded file
pub type FileStream = BoxStream<'static, Result<Bytes>>;

/// Remote replica as seen by the clone core
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Committed versions of a tablet on `replica`
    async fn list_versions(&self, replica: &str, tablet_id: TabletId) -> Result<TabletVersionSet>;

    /// Ask `replica` to prepare a snapshot. Fails with `VersionUnavailable` if
    /// a requested range is not held as one rowset.
    async fn make_snapshot(
        &self,
        replica: &str,
        tablet_id: TabletId,
        schema_hash: SchemaHash,
        scope: &SnapshotScope,
    ) -> Result<RemoteSnapshot>;

    /// Open one file of a prepared snapshot
    async fn open_file(
        &self,
        replica: &str,
        snapshot: &RemoteSnapshot,
        file: &RemoteFile,
    ) -> Result<FileStream>;

    /// Drop a prepared snapshot on the source
    async fn release_snapshot(&self, replica: &str, snapshot: &RemoteSnapshot) -> Result<()>;
}
