//! WolfClone Error Types

use thiserror::Error;

use crate::tablet::TabletId;

/// Result type alias for WolfClone operations
pub type Result<T> = std::result::Result<T, Error>;

/// Raw OS error code for "no space left on device"
const ENOSPC: i32 = 28;

/// WolfClone error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Clone errors
    #[error("Source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("Version unavailable on source: {0}")]
    VersionUnavailable(String),

    #[error("Unsupported snapshot format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Metadata commit failed: {0}")]
    MetadataCommitFailed(String),

    #[error("Version conflict on tablet {tablet_id}: {reason}")]
    VersionConflict { tablet_id: TabletId, reason: String },

    // Tablet errors
    #[error("Tablet not found: {0}")]
    TabletNotFound(TabletId),

    #[error("Tablet already exists: {0}")]
    TabletAlreadyExists(TabletId),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // State errors
    #[error("State error: {0}")]
    State(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Disk full: {0}")]
    DiskFull(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error is a transient network failure worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::Network(_)
        )
    }

    /// Classify an I/O error raised while writing into a staging directory
    pub fn from_staging_io(err: std::io::Error, context: &str) -> Self {
        if err.raw_os_error() == Some(ENOSPC) {
            Error::DiskFull(format!("{}: {}", context, err))
        } else {
            Error::Io(err)
        }
    }

    /// Short machine-readable code used by the HTTP service
    pub fn code(&self) -> &'static str {
        match self {
            Error::VersionUnavailable(_) => "version_unavailable",
            Error::TabletNotFound(_) => "not_found",
            Error::ValidationFailed(_) | Error::Config(_) => "bad_request",
            Error::DiskFull(_) => "disk_full",
            _ => "internal",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::ConnectionTimeout("a:1".into()).is_retryable());
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(!Error::VersionUnavailable("[3-4]".into()).is_retryable());
        assert!(!Error::SourceUnreachable("a:1".into()).is_retryable());
    }

    #[test]
    fn test_enospc_maps_to_disk_full() {
        let err = std::io::Error::from_raw_os_error(ENOSPC);
        assert!(matches!(Error::from_staging_io(err, "write"), Error::DiskFull(_)));

        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(Error::from_staging_io(err, "write"), Error::Io(_)));
    }
}
