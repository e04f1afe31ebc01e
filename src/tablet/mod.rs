//! Tablet Module
//!
//! Local tablet model: committed versions, rowset metadata, the durable
//! metadata store and the engine tying them to the data root.

pub mod engine;
pub mod meta;
pub mod store;
pub mod version;

pub use engine::{EnginePaths, RecoveryReport, TabletEngine};
pub use meta::{FileMeta, RowsetMeta, TabletInfo, TabletMeta};
pub use store::{SqliteMetaStore, TabletMetaStore};
pub use version::{TabletVersionSet, Version, VersionRange};

/// Tablet identifier
pub type TabletId = u64;

/// Hash of the tablet schema; a replica only accepts data for its own schema
pub type SchemaHash = u32;
