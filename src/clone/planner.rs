//! Version Diff Planner
//!
//! Decides how a local replica catches up with a source: not at all,
//! by fetching the missing rowsets, or by replacing the tablet wholesale.

use crate::config::CloneConfig;
use crate::tablet::{TabletVersionSet, Version, VersionRange};

/// Source ranges that exactly tile the local gaps, ascending
pub type MissingVersionSet = Vec<VersionRange>;

/// Planner decision for one source replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClonePlan {
    /// Local already holds every version up to the target
    AlreadyInSync,
    /// Fetch exactly these rowsets
    Incremental(MissingVersionSet),
    /// Replace the whole tablet
    Full,
    /// This source cannot bring the tablet to the target
    Unsatisfiable(String),
}

/// Thresholds above which one full clone beats many small rowset transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerPolicy {
    pub max_incremental_versions: u64,
    pub max_incremental_rowsets: usize,
}

impl Default for PlannerPolicy {
    fn default() -> Self {
        Self {
            max_incremental_versions: 1000,
            max_incremental_rowsets: 200,
        }
    }
}

impl From<&CloneConfig> for PlannerPolicy {
    fn from(config: &CloneConfig) -> Self {
        Self {
            max_incremental_versions: config.max_incremental_versions,
            max_incremental_rowsets: config.max_incremental_rowsets,
        }
    }
}

/// Computes the version gap between a local and a source replica
#[derive(Debug, Clone, Default)]
pub struct VersionDiffPlanner {
    policy: PlannerPolicy,
}

impl VersionDiffPlanner {
    pub fn new(policy: PlannerPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> PlannerPolicy {
        self.policy
    }

    /// Plan how `local` reaches `explicit_target` (or the source's max version)
    pub fn plan(
        &self,
        local: Option<&TabletVersionSet>,
        source: &TabletVersionSet,
        explicit_target: Option<Version>,
    ) -> ClonePlan {
        // a target the local replica already covers needs nothing from the source
        if let (Some(target), Some(local)) = (explicit_target, local) {
            if !local.is_empty() && local.missing_up_to(target).is_empty() {
                return ClonePlan::AlreadyInSync;
            }
        }

        let Some(source_max) = source.max_version() else {
            return ClonePlan::Unsatisfiable("source holds no versions".into());
        };

        let target = match explicit_target {
            Some(target) if target > source_max => {
                return ClonePlan::Unsatisfiable(format!(
                    "source max version {} is below target {}",
                    source_max, target
                ));
            }
            Some(target) => target,
            None => source_max,
        };

        let local = match local {
            Some(local) if !local.is_empty() => local,
            _ => return ClonePlan::Full,
        };

        let gaps = local.missing_up_to(target);
        if gaps.is_empty() {
            return ClonePlan::AlreadyInSync;
        }

        let missing: u64 = gaps.iter().map(VersionRange::len).sum();
        if missing > self.policy.max_incremental_versions {
            tracing::debug!(
                "{} missing versions exceed the incremental limit of {}",
                missing,
                self.policy.max_incremental_versions
            );
            return ClonePlan::Full;
        }

        let mut tiles = Vec::new();
        for gap in gaps {
            match source.exact_tiling(gap) {
                Some(ranges) => tiles.extend(ranges),
                None => {
                    tracing::debug!("Source {} cannot serve gap {} exactly", source, gap);
                    return ClonePlan::Full;
                }
            }
        }

        if tiles.len() > self.policy.max_incremental_rowsets {
            return ClonePlan::Full;
        }
        ClonePlan::Incremental(tiles)
    }
}
