//! Clone Module
//!
//! Brings a local tablet replica up to date with a source replica:
//!
//! ```text
//! CloneCoordinator
//!   -> VersionDiffPlanner   (what is missing, incremental or full)
//!   -> SnapshotFetcher      (download into a staging directory)
//!   -> SnapshotConverter    (legacy layout upgrade, checksum verification)
//!   -> ClonePublisher       (link or swap into place, commit metadata)
//! ```

pub mod converter;
pub mod coordinator;
pub mod fetcher;
pub mod planner;
pub mod publisher;
pub mod staging;

pub use converter::SnapshotConverter;
pub use coordinator::{CloneCoordinator, CloneStateMachine};
pub use fetcher::{FetchError, FetchedSnapshot, RetryPolicy, SnapshotFetcher};
pub use planner::{ClonePlan, MissingVersionSet, PlannerPolicy, VersionDiffPlanner};
pub use publisher::ClonePublisher;
pub use staging::StagingDir;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::snapshot::SnapshotScope;
use crate::tablet::{SchemaHash, TabletId, TabletInfo, Version};

/// One request to bring a local tablet up to date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneRequest {
    pub tablet_id: TabletId,
    pub schema_hash: SchemaHash,
    /// Correlation id of the task that asked for this clone
    pub signature: i64,
    /// Candidate source replicas (`host:port`), tried in order
    pub sources: Vec<String>,
    /// Version to reach; defaults to the source's max version
    pub committed_version: Option<Version>,
}

/// How the staged snapshot is obtained and applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneMode {
    Incremental(MissingVersionSet),
    Full,
}

impl CloneMode {
    /// Rowsets to ask the source for
    pub fn scope(&self) -> SnapshotScope {
        match self {
            CloneMode::Incremental(ranges) => SnapshotScope::Versions(ranges.clone()),
            CloneMode::Full => SnapshotScope::Full,
        }
    }

    pub fn kind(&self) -> CloneKind {
        match self {
            CloneMode::Incremental(_) => CloneKind::Incremental,
            CloneMode::Full => CloneKind::Full,
        }
    }
}

impl fmt::Display for CloneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloneMode::Incremental(ranges) => write!(f, "incremental ({} rowsets)", ranges.len()),
            CloneMode::Full => write!(f, "full"),
        }
    }
}

/// What a successful clone did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneKind {
    AlreadyInSync,
    Incremental,
    Full,
}

/// Coordinator states, in the only order they may be visited
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneState {
    Planning,
    Fetching,
    Converting,
    Publishing,
    Succeeded,
    Failed,
}

impl CloneState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CloneState::Succeeded | CloneState::Failed)
    }
}

impl fmt::Display for CloneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloneState::Planning => "planning",
            CloneState::Fetching => "fetching",
            CloneState::Converting => "converting",
            CloneState::Publishing => "publishing",
            CloneState::Succeeded => "succeeded",
            CloneState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of a successful clone, handed back to the caller for reporting
#[derive(Debug, Clone, Serialize)]
pub struct CloneOutcome {
    pub kind: CloneKind,
    pub bytes_copied: u64,
    pub copy_time_ms: u64,
    pub is_new_tablet: bool,
    pub committed_version: Version,
    /// Replica the data came from; `None` when nothing was copied
    pub source: Option<String>,
    pub attempts: u32,
    pub tablet_info: Option<TabletInfo>,
    pub diagnostics: Vec<String>,
    pub states: Vec<CloneState>,
}

impl CloneOutcome {
    pub fn already_in_sync(committed_version: Version, tablet_info: Option<TabletInfo>) -> Self {
        Self {
            kind: CloneKind::AlreadyInSync,
            bytes_copied: 0,
            copy_time_ms: 0,
            is_new_tablet: false,
            committed_version,
            source: None,
            attempts: 0,
            tablet_info,
            diagnostics: Vec::new(),
            states: Vec::new(),
        }
    }
}

/// Failed clone with the context gathered on the way
#[derive(Debug)]
pub struct CloneFailure {
    /// State in which the clone failed
    pub stage: CloneState,
    pub error: Error,
    pub bytes_copied: u64,
    pub attempts: u32,
    pub diagnostics: Vec<String>,
    pub states: Vec<CloneState>,
}

impl fmt::Display for CloneFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "clone failed while {} after {} bytes: {}",
            self.stage, self.bytes_copied, self.error
        )
    }
}

impl std::error::Error for CloneFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
