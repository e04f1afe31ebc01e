//! Snapshot Layouts
//!
//! A snapshot directory holds the data files of some rowsets plus one header.
//!
//! Current layout (format 2): `tablet_meta.json`, a JSON [`SnapshotHeader`],
//! with files named `<rowset_id>_<segment>.dat`.
//!
//! Legacy layout (format 1): `<tablet_id>.hdr`, a JSON [`LegacyHeader`] listing
//! deltas by version, with files named `<tablet_id>_<start>_<end>_<segment>.dat`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tablet::{RowsetMeta, SchemaHash, TabletId, TabletVersionSet, VersionRange};
use crate::util::{file_checksum, write_file_atomic};

/// Format written by this crate
pub const CURRENT_FORMAT_VERSION: u32 = 2;

/// Oldest format that can still be converted
pub const LEGACY_FORMAT_VERSION: u32 = 1;

/// Header file name of the current layout
pub const HEADER_FILE_NAME: &str = "tablet_meta.json";

/// Header file name of the legacy layout
pub fn legacy_header_name(tablet_id: TabletId) -> String {
    format!("{}.hdr", tablet_id)
}

/// Data file name of one legacy delta segment
pub fn legacy_segment_name(tablet_id: TabletId, range: VersionRange, segment: u32) -> String {
    format!("{}_{}_{}_{}.dat", tablet_id, range.start, range.end, segment)
}

/// Header of a snapshot in the current layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub format_version: u32,
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    pub created_at: DateTime<Utc>,
    pub rowsets: Vec<RowsetMeta>,
}

impl SnapshotHeader {
    pub fn new(tablet_id: TabletId, schema_hash: SchemaHash, mut rowsets: Vec<RowsetMeta>) -> Self {
        rowsets.sort_by_key(|r| r.version);
        Self {
            format_version: CURRENT_FORMAT_VERSION,
            tablet_id,
            schema_hash,
            created_at: Utc::now(),
            rowsets,
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(HEADER_FILE_NAME)
    }

    /// Read the header of a current-layout snapshot directory
    pub fn load(dir: &Path) -> Result<Self> {
        let data = std::fs::read(Self::path(dir))?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::CorruptSnapshot(format!("unreadable {}: {}", HEADER_FILE_NAME, e)))
    }

    /// Durably write the header into `dir`
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        write_file_atomic(&Self::path(dir), &data)?;
        Ok(())
    }

    pub fn version_set(&self) -> Result<TabletVersionSet> {
        TabletVersionSet::new(self.rowsets.iter().map(|r| r.version).collect())
    }

    /// Rowset covering exactly `range`
    pub fn rowset(&self, range: VersionRange) -> Option<&RowsetMeta> {
        self.rowsets.iter().find(|r| r.version == range)
    }

    pub fn data_size(&self) -> u64 {
        self.rowsets.iter().map(RowsetMeta::data_size).sum()
    }

    /// Check that every listed file exists in `dir` with the recorded size and CRC32
    pub fn verify_files(&self, dir: &Path) -> Result<()> {
        for rowset in &self.rowsets {
            for file in &rowset.files {
                let path = dir.join(&file.name);
                let (size, crc) = file_checksum(&path).map_err(|e| {
                    Error::CorruptSnapshot(format!(
                        "rowset {} file {}: {}",
                        rowset.version, file.name, e
                    ))
                })?;
                if size != file.size {
                    return Err(Error::CorruptSnapshot(format!(
                        "file {} has {} bytes, expected {}",
                        file.name, size, file.size
                    )));
                }
                if crc != file.crc32 {
                    return Err(Error::CorruptSnapshot(format!(
                        "file {} checksum {:08x}, expected {:08x}",
                        file.name, crc, file.crc32
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Header of a snapshot in the legacy layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyHeader {
    pub format_version: u32,
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    pub deltas: Vec<LegacyDelta>,
}

/// One committed delta of a legacy snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyDelta {
    pub start_version: u64,
    pub end_version: u64,
    pub num_segments: u32,
    #[serde(default)]
    pub num_rows: u64,
}

impl LegacyDelta {
    pub fn range(&self) -> Result<VersionRange> {
        if self.start_version > self.end_version {
            return Err(Error::CorruptSnapshot(format!(
                "inverted delta [{}-{}]",
                self.start_version, self.end_version
            )));
        }
        Ok(VersionRange::new(self.start_version, self.end_version))
    }
}

/// Only the format field, used to route a header before parsing it fully
#[derive(Debug, Deserialize)]
struct FormatProbe {
    format_version: u32,
}

/// Read the `format_version` of a header file
pub fn probe_format(path: &Path) -> Result<u32> {
    let data = std::fs::read(path)?;
    let probe: FormatProbe = serde_json::from_slice(&data).map_err(|e| {
        Error::CorruptSnapshot(format!("unreadable header {:?}: {}", path.file_name(), e))
    })?;
    Ok(probe.format_version)
}
