//! WolfClone - Tablet Replica Clone Engine
//!
//! Brings a local tablet replica up to date by copying data from a healthy
//! peer replica, either incrementally (only the missing version ranges) or
//! as a full snapshot.
//!
//! # Architecture
//!
//! A clone runs as a forward-only state machine:
//!
//! - Planning: probe source replicas and diff their versions against the local ones
//! - Fetching: ask the source for a snapshot and download it into staging
//! - Converting: upgrade legacy snapshot layouts and verify checksums
//! - Publishing: link or swap the data in, then commit tablet metadata
//!
//! The metadata commit is the single point of no return: any failure before
//! it leaves the local replica exactly as it was.
//!
//! The same process can serve as a source, exposing snapshot make, download
//! and release over HTTP.

pub mod api;
pub mod clone;
pub mod config;
pub mod error;
pub mod snapshot;
pub mod tablet;
pub mod transport;
pub mod util;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::WolfCloneConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clone::{CloneCoordinator, CloneKind, CloneOutcome, CloneRequest};
    pub use crate::config::WolfCloneConfig;
    pub use crate::error::{Error, Result};
    pub use crate::snapshot::{SnapshotMaker, SnapshotScope};
    pub use crate::tablet::{TabletEngine, TabletVersionSet, Version, VersionRange};
    pub use crate::transport::{HttpSnapshotSource, LocalSnapshotSource, SnapshotSource};
}
