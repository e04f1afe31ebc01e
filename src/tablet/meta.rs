//! Tablet and rowset metadata.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::version::{TabletVersionSet, Version, VersionRange};
use super::{SchemaHash, TabletId};
use crate::error::Result;

/// One data file belonging to a rowset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub crc32: u32,
}

/// Data files for one committed version range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowsetMeta {
    pub rowset_id: String,
    pub version: VersionRange,
    #[serde(default)]
    pub num_rows: u64,
    pub files: Vec<FileMeta>,
}

impl RowsetMeta {
    /// Generate a fresh rowset identifier
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Name of the n-th segment file of a rowset
    pub fn segment_file_name(rowset_id: &str, segment: u32) -> String {
        format!("{}_{}.dat", rowset_id, segment)
    }

    pub fn data_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Committed metadata for one local tablet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletMeta {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    /// Bumped on every commit; used for optimistic concurrency checks
    pub revision: u64,
    /// Live data directory, relative to the engine data root
    pub data_dir: PathBuf,
    pub rowsets: Vec<RowsetMeta>,
    pub updated_at: DateTime<Utc>,
}

impl TabletMeta {
    pub fn version_set(&self) -> Result<TabletVersionSet> {
        TabletVersionSet::new(self.rowsets.iter().map(|r| r.version).collect())
    }

    /// Highest committed version, 0 for a tablet without data
    pub fn max_version(&self) -> Version {
        self.rowsets.iter().map(|r| r.version.end).max().unwrap_or(0)
    }

    pub fn data_size(&self) -> u64 {
        self.rowsets.iter().map(RowsetMeta::data_size).sum()
    }

    pub fn sort_rowsets(&mut self) {
        self.rowsets.sort_by_key(|r| r.version);
    }

    /// Reporting view of this tablet
    pub fn tablet_info(&self) -> TabletInfo {
        TabletInfo {
            tablet_id: self.tablet_id,
            schema_hash: self.schema_hash,
            version: self.max_version(),
            rowset_count: self.rowsets.len(),
            row_count: self.rowsets.iter().map(|r| r.num_rows).sum(),
            data_size: self.data_size(),
        }
    }
}

/// Per-tablet summary handed back to the caller's reporting path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletInfo {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    pub version: Version,
    pub rowset_count: usize,
    pub row_count: u64,
    pub data_size: u64,
}
