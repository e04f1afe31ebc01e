//! Snapshot Converter
//!
//! Brings a staged snapshot to the current layout and verifies its files.
//! Only ever touches the staging directory.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::snapshot::layout::{legacy_header_name, legacy_segment_name, probe_format};
use crate::snapshot::{
    LegacyHeader, SnapshotHeader, CURRENT_FORMAT_VERSION, LEGACY_FORMAT_VERSION,
};
use crate::tablet::{FileMeta, RowsetMeta, TabletId};
use crate::util::file_checksum;

/// Reconciles staged snapshot layouts
#[derive(Debug, Default, Clone)]
pub struct SnapshotConverter;

impl SnapshotConverter {
    pub fn new() -> Self {
        Self
    }

    /// Convert `dir` in place if needed and return its verified header
    pub fn convert(&self, dir: &Path, tablet_id: TabletId) -> Result<SnapshotHeader> {
        let current = SnapshotHeader::path(dir);
        let legacy = dir.join(legacy_header_name(tablet_id));

        let header = if current.exists() {
            match probe_format(&current)? {
                CURRENT_FORMAT_VERSION => SnapshotHeader::load(dir)?,
                other => {
                    return Err(Error::UnsupportedFormat(format!(
                        "snapshot format version {}",
                        other
                    )))
                }
            }
        } else if legacy.exists() {
            match probe_format(&legacy)? {
                LEGACY_FORMAT_VERSION => self.convert_legacy(dir, &legacy, tablet_id)?,
                other => {
                    return Err(Error::UnsupportedFormat(format!(
                        "legacy header format version {}",
                        other
                    )))
                }
            }
        } else {
            return Err(Error::UnsupportedFormat(format!(
                "no snapshot header in {:?}",
                dir.file_name()
            )));
        };

        if header.tablet_id != tablet_id {
            return Err(Error::CorruptSnapshot(format!(
                "header names tablet {}, expected {}",
                header.tablet_id, tablet_id
            )));
        }
        header
            .version_set()
            .map_err(|e| Error::CorruptSnapshot(e.to_string()))?;

        let mut names = HashSet::new();
        for file in header.rowsets.iter().flat_map(|r| &r.files) {
            if !names.insert(file.name.as_str()) {
                return Err(Error::CorruptSnapshot(format!("file {} listed twice", file.name)));
            }
        }
        header.verify_files(dir)?;
        Ok(header)
    }

    /// Rename legacy delta files to rowset files and write a current header
    fn convert_legacy(&self, dir: &Path, legacy: &Path, tablet_id: TabletId) -> Result<SnapshotHeader> {
        let data = fs::read(legacy)?;
        let old: LegacyHeader = serde_json::from_slice(&data)
            .map_err(|e| Error::CorruptSnapshot(format!("unreadable legacy header: {}", e)))?;
        if old.tablet_id != tablet_id {
            return Err(Error::CorruptSnapshot(format!(
                "legacy header names tablet {}, expected {}",
                old.tablet_id, tablet_id
            )));
        }

        let mut rowsets = Vec::with_capacity(old.deltas.len());
        for delta in &old.deltas {
            let range = delta.range()?;
            let rowset_id = RowsetMeta::new_id();
            let mut files = Vec::with_capacity(delta.num_segments as usize);

            for segment in 0..delta.num_segments {
                let from = dir.join(legacy_segment_name(tablet_id, range, segment));
                if !from.exists() {
                    return Err(Error::CorruptSnapshot(format!(
                        "legacy segment {:?} missing",
                        from.file_name()
                    )));
                }
                let name = RowsetMeta::segment_file_name(&rowset_id, segment);
                let to = dir.join(&name);
                fs::rename(&from, &to)?;
                let (size, crc32) = file_checksum(&to)?;
                files.push(FileMeta { name, size, crc32 });
            }

            rowsets.push(RowsetMeta {
                rowset_id,
                version: range,
                num_rows: delta.num_rows,
                files,
            });
        }

        let header = SnapshotHeader::new(tablet_id, old.schema_hash, rowsets);
        header.write_to(dir)?;
        fs::remove_file(legacy)?;
        tracing::info!(
            "Converted legacy snapshot of tablet {} with {} deltas",
            tablet_id,
            header.rowsets.len()
        );
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::LegacyDelta;
    use crate::tablet::VersionRange;
    use crate::util::write_file_atomic;
    use tempfile::tempdir;

    fn write_legacy(dir: &Path, tablet_id: TabletId, format_version: u32) {
        let deltas = vec![
            LegacyDelta {
                start_version: 0,
                end_version: 4,
                num_segments: 2,
                num_rows: 50,
            },
            LegacyDelta {
                start_version: 5,
                end_version: 5,
                num_segments: 1,
                num_rows: 3,
            },
        ];
        for delta in &deltas {
            let range = VersionRange::new(delta.start_version, delta.end_version);
            for seg in 0..delta.num_segments {
                let name = legacy_segment_name(tablet_id, range, seg);
                fs::write(dir.join(&name), format!("rows of {}", name)).unwrap();
            }
        }
        let header = LegacyHeader {
            format_version,
            tablet_id,
            schema_hash: 31,
            deltas,
        };
        write_file_atomic(
            &dir.join(legacy_header_name(tablet_id)),
            &serde_json::to_vec(&header).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_converts_legacy_layout() {
        let dir = tempdir().unwrap();
        write_legacy(dir.path(), 77, LEGACY_FORMAT_VERSION);

        let header = SnapshotConverter::new().convert(dir.path(), 77).unwrap();
        assert_eq!(header.format_version, CURRENT_FORMAT_VERSION);
        assert_eq!(header.schema_hash, 31);
        assert_eq!(header.rowsets.len(), 2);
        assert_eq!(header.rowsets[0].files.len(), 2);
        assert_eq!(header.rowsets[0].num_rows, 50);
        assert!(!dir.path().join("77.hdr").exists());
        assert!(!dir.path().join("77_0_4_0.dat").exists());

        // a second pass sees the current layout and leaves it alone
        let again = SnapshotConverter::new().convert(dir.path(), 77).unwrap();
        assert_eq!(again.rowsets, header.rowsets);
    }

    #[test]
    fn test_rejects_unknown_formats() {
        let dir = tempdir().unwrap();
        write_legacy(dir.path(), 77, 0);
        assert!(matches!(
            SnapshotConverter::new().convert(dir.path(), 77),
            Err(Error::UnsupportedFormat(_))
        ));

        let empty = tempdir().unwrap();
        assert!(matches!(
            SnapshotConverter::new().convert(empty.path(), 77),
            Err(Error::UnsupportedFormat(_))
        ));

        let future = tempdir().unwrap();
        fs::write(
            SnapshotHeader::path(future.path()),
            br#"{"format_version": 3}"#,
        )
        .unwrap();
        assert!(matches!(
            SnapshotConverter::new().convert(future.path(), 77),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_rejects_other_tablet_and_missing_segment() {
        let dir = tempdir().unwrap();
        write_legacy(dir.path(), 77, LEGACY_FORMAT_VERSION);
        fs::rename(dir.path().join("77.hdr"), dir.path().join("78.hdr")).unwrap();
        assert!(matches!(
            SnapshotConverter::new().convert(dir.path(), 78),
            Err(Error::CorruptSnapshot(_))
        ));

        let dir = tempdir().unwrap();
        write_legacy(dir.path(), 77, LEGACY_FORMAT_VERSION);
        fs::remove_file(dir.path().join("77_5_5_0.dat")).unwrap();
        assert!(matches!(
            SnapshotConverter::new().convert(dir.path(), 77),
            Err(Error::CorruptSnapshot(_))
        ));
    }
}
