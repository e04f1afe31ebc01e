//! Snapshot Module
//!
//! On-disk snapshot layouts and the source-side snapshot maker.

pub mod layout;
mod maker;

pub use layout::{
    LegacyDelta, LegacyHeader, SnapshotHeader, CURRENT_FORMAT_VERSION, HEADER_FILE_NAME,
    LEGACY_FORMAT_VERSION,
};
pub use maker::SnapshotMaker;

use serde::{Deserialize, Serialize};

use crate::tablet::VersionRange;

/// Which rowsets a snapshot carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotScope {
    /// Every rowset of the tablet
    Full,
    /// Exactly the rowsets with these version ranges
    Versions(Vec<VersionRange>),
}
