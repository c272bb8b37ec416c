//! Error taxonomy for the delivery engine.
//!
//! Errors are cloneable so a single failure can be handed to every handle
//! attached to a provider.

use std::{io, path::PathBuf, sync::Arc};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    // Transient I/O
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("Request to {url} timed out")]
    Timeout { url: String },

    // Integrity
    #[error("Size mismatch for {file}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        file: String,
        expected: u64,
        actual: u64,
    },

    #[error("CRC mismatch for {file}: expected {expected:08x}, found {actual:08x}")]
    CrcMismatch {
        file: String,
        expected: u32,
        actual: u32,
    },

    #[error("Hash mismatch for {file}: expected {expected}, found {actual}")]
    HashMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    // Dependency / logic
    #[error("Asset not found in manifest: {0}")]
    AssetNotFound(String),

    #[error("Asset {path} not found in bundle {bundle}")]
    AssetNotInBundle { path: String, bundle: String },

    #[error("Bundle not found: {0}")]
    BundleNotFound(String),

    #[error("Bundle {0} is a raw file bundle, load it with the raw file API")]
    RawBundle(String),

    #[error("Bundle {0} is not a raw file bundle")]
    NotRawBundle(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("No active manifest, update the package manifest first")]
    ManifestMissing,

    #[error("Failed to decode bundle {bundle}: {message}")]
    Decode { bundle: String, message: String },

    #[error("Invalid settings: {0}")]
    Settings(String),

    // Host anomaly
    #[error("Bundle {0} was destroyed unexpectedly while still referenced")]
    BundleDestroyed(String),

    // Lifecycle
    #[error("Download of {file} failed: {reason}")]
    DownloadFailed { file: String, reason: Box<Error> },

    #[error("Operation cancelled by user")]
    UserCancelled,

    #[error("Operation group {0} was cleared")]
    GroupCleared(String),

    #[error("Handle {0} was already released")]
    HandleReleased(u64),

    #[error("Handle {0} does not belong to this provider")]
    UnknownHandle(u64),

    #[error("Bundle {0} released more often than referenced")]
    LoaderOverReleased(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// Transient failures are the only ones a file fetch retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io { .. } | Error::Http { .. } | Error::Timeout { .. }
        ) || self.is_integrity()
    }

    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Error::SizeMismatch { .. } | Error::CrcMismatch { .. } | Error::HashMismatch { .. }
        )
    }
}

/// Attach a path to an io error, the crate's counterpart of `anyhow::Context`.
pub trait IoContext<T> {
    fn at_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_failure_names_file() {
        let err = Error::DownloadFailed {
            file: "ui_common".to_string(),
            reason: Box::new(Error::Timeout {
                url: "https://cdn/ui_common".to_string(),
            }),
        };
        assert!(err.to_string().contains("ui_common"));
    }

    #[test]
    fn integrity_errors_are_retried_but_logic_errors_are_not() {
        let crc = Error::CrcMismatch {
            file: "a".to_string(),
            expected: 1,
            actual: 2,
        };
        assert!(crc.is_transient());
        assert!(!Error::AssetNotFound("a".to_string()).is_transient());
        assert!(!Error::UserCancelled.is_transient());
    }
}
