//! Error types for engine operations
//!
//! Every fallible engine call returns [`EngineError`], carrying enough
//! context (file path, byte offset) to locate the damaged region on disk.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

/// Engine error types with on-disk context
#[derive(Debug, Error)]
pub enum EngineError {
    /// I/O operation failed
    #[error("I/O error in {}: {message}", .path.display())]
    Io {
        /// The file or directory where the error occurred
        path: PathBuf,
        /// What the engine was doing at the time
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A segment holds bytes that do not decode as a frame
    #[error("segment {} corrupted at offset {offset}: {reason}", .path.display())]
    Corrupted {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    /// Checksum verification failed for a frame payload
    #[error(
        "checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}",
        .path.display()
    )]
    ChecksumMismatch {
        path: PathBuf,
        offset: u64,
        expected: u32,
        actual: u32,
    },

    /// Key or value exceeds the configured limit
    #[error("entry {component} too large: {size} bytes exceeds limit of {max} bytes")]
    OversizedEntry {
        /// `"key"` or `"value"`
        component: &'static str,
        size: u64,
        max: u64,
    },

    /// Configuration rejected by `EngineConfig::validate`
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl EngineError {
    /// Wrap an `std::io::Error` with the path it happened on.
    pub fn io(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        EngineError::Io {
            path: path.into(),
            message: message.into(),
            source,
        }
    }

    /// True for errors that indicate on-disk damage rather than an environment fault.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            EngineError::Corrupted { .. } | EngineError::ChecksumMismatch { .. }
        )
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
