//! Loopback transport serving snapshots from engines in the same process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::io::ReaderStream;

use super::{FileStream, RemoteFile, RemoteSnapshot, SnapshotSource};
use crate::error::{Error, Result};
use crate::snapshot::{SnapshotMaker, SnapshotScope};
use crate::tablet::{SchemaHash, TabletId, TabletVersionSet};
use crate::util::is_plain_file_name;

/// Snapshot source backed by local [`SnapshotMaker`]s keyed by replica address
#[derive(Default)]
pub struct LocalSnapshotSource {
    replicas: HashMap<String, Arc<SnapshotMaker>>,
}

impl LocalSnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a replica under `address`
    pub fn with_replica(mut self, address: impl Into<String>, maker: Arc<SnapshotMaker>) -> Self {
        self.replicas.insert(address.into(), maker);
        self
    }

    fn replica(&self, address: &str) -> Result<&Arc<SnapshotMaker>> {
        self.replicas.get(address).ok_or_else(|| Error::ConnectionFailed {
            address: address.to_string(),
            reason: "no such local replica".into(),
        })
    }
}

#[async_trait]
impl SnapshotSource for LocalSnapshotSource {
    async fn list_versions(&self, replica: &str, tablet_id: TabletId) -> Result<TabletVersionSet> {
        self.replica(replica)?.list_versions(tablet_id).await
    }

    async fn make_snapshot(
        &self,
        replica: &str,
        tablet_id: TabletId,
        schema_hash: SchemaHash,
        scope: &SnapshotScope,
    ) -> Result<RemoteSnapshot> {
        self.replica(replica)?.make(tablet_id, schema_hash, scope).await
    }

    async fn open_file(
        &self,
        replica: &str,
        snapshot: &RemoteSnapshot,
        file: &RemoteFile,
    ) -> Result<FileStream> {
        let maker = self.replica(replica)?;
        if !is_plain_file_name(&file.name) {
            return Err(Error::ValidationFailed(format!("bad file name {:?}", file.name)));
        }

        let path = PathBuf::from(&snapshot.path).join(&file.name);
        let path = maker.resolve_path(&path)?.ok_or_else(|| {
            Error::ValidationFailed(format!("{:?} is outside the snapshot root", path))
        })?;

        let file = tokio::fs::File::open(&path).await?;
        Ok(ReaderStream::new(file).map(|chunk| chunk.map_err(Error::from)).boxed())
    }

    async fn release_snapshot(&self, replica: &str, snapshot: &RemoteSnapshot) -> Result<()> {
        self.replica(replica)?.release(&PathBuf::from(&snapshot.path))
    }
}
