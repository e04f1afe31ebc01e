//! Version ranges and tablet version sets.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Monotonically increasing committed version number
pub type Version = u64;

/// Closed interval `[start, end]` of versions held by one rowset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionRange {
    pub start: Version,
    pub end: Version,
}

impl VersionRange {
    /// Create a new range. Callers must pass `start <= end`.
    pub fn new(start: Version, end: Version) -> Self {
        debug_assert!(start <= end, "inverted version range [{}-{}]", start, end);
        Self { start, end }
    }

    /// Range covering exactly one version
    pub fn single(version: Version) -> Self {
        Self::new(version, version)
    }

    /// Number of versions in the range
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, version: Version) -> bool {
        self.start <= version && version <= self.end
    }

    pub fn overlaps(&self, other: &VersionRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    fn is_valid(&self) -> bool {
        self.start <= self.end
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.start, self.end)
    }
}

/// Ordered, non-overlapping collection of the version ranges committed for a tablet.
///
/// Ranges may have holes (a version that was never committed locally); the
/// cumulative point is the end of the gap-free chain starting at the first range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<VersionRange>", into = "Vec<VersionRange>")]
pub struct TabletVersionSet {
    ranges: Vec<VersionRange>,
}

impl TabletVersionSet {
    /// Build a version set, sorting the ranges and rejecting overlaps
    pub fn new(mut ranges: Vec<VersionRange>) -> Result<Self> {
        if let Some(bad) = ranges.iter().find(|r| !r.is_valid()) {
            return Err(Error::ValidationFailed(format!(
                "invalid version range {}-{}",
                bad.start, bad.end
            )));
        }
        ranges.sort();
        for pair in ranges.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(Error::ValidationFailed(format!(
                    "overlapping versions {} and {}",
                    pair[0], pair[1]
                )));
            }
        }
        Ok(Self { ranges })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[VersionRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// First version held
    pub fn first_version(&self) -> Option<Version> {
        self.ranges.first().map(|r| r.start)
    }

    /// Highest committed version
    pub fn max_version(&self) -> Option<Version> {
        self.ranges.last().map(|r| r.end)
    }

    /// End of the gap-free chain starting at the first range
    pub fn cumulative_point(&self) -> Option<Version> {
        let first = self.ranges.first()?;
        let mut point = first.end;
        for range in &self.ranges[1..] {
            if range.start != point + 1 {
                break;
            }
            point = range.end;
        }
        Some(point)
    }

    /// True when the ranges form one chain with no holes
    pub fn is_contiguous(&self) -> bool {
        self.cumulative_point() == self.max_version()
    }

    /// Versions in `[first_version, target]` that are not held, as ascending ranges
    pub fn missing_up_to(&self, target: Version) -> Vec<VersionRange> {
        let mut missing = Vec::new();
        let Some(mut cursor) = self.first_version() else {
            return missing;
        };

        for range in &self.ranges {
            if cursor > target {
                break;
            }
            if range.start > cursor {
                let hole_end = (range.start - 1).min(target);
                missing.push(VersionRange::new(cursor, hole_end));
            }
            cursor = cursor.max(range.end.saturating_add(1));
        }

        if cursor <= target {
            missing.push(VersionRange::new(cursor, target));
        }
        missing
    }

    /// Ranges of this set that exactly tile `gap`, in order, or `None` when the
    /// set cannot serve the gap without reaching outside it
    pub fn exact_tiling(&self, gap: VersionRange) -> Option<Vec<VersionRange>> {
        let start_idx = self.ranges.iter().position(|r| r.start == gap.start)?;
        let mut tiles = Vec::new();
        let mut expected = gap.start;

        for range in &self.ranges[start_idx..] {
            if range.start != expected || range.end > gap.end {
                return None;
            }
            tiles.push(*range);
            if range.end == gap.end {
                return Some(tiles);
            }
            expected = range.end + 1;
        }
        None
    }

    /// Insert a range, rejecting overlap with what is already held
    pub fn insert(&mut self, range: VersionRange) -> Result<()> {
        if !range.is_valid() {
            return Err(Error::ValidationFailed(format!("invalid version range {}", range)));
        }
        if let Some(existing) = self.ranges.iter().find(|r| r.overlaps(&range)) {
            return Err(Error::ValidationFailed(format!(
                "version {} overlaps existing {}",
                range, existing
            )));
        }
        let idx = self.ranges.partition_point(|r| r.start < range.start);
        self.ranges.insert(idx, range);
        Ok(())
    }
}

impl TryFrom<Vec<VersionRange>> for TabletVersionSet {
    type Error = Error;

    fn try_from(ranges: Vec<VersionRange>) -> Result<Self> {
        Self::new(ranges)
    }
}

impl From<TabletVersionSet> for Vec<VersionRange> {
    fn from(set: TabletVersionSet) -> Self {
        set.ranges
    }
}

impl fmt::Display for TabletVersionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.ranges.iter().map(|r| r.to_string()).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
