//! Error types for record stores
//!
//! CRUD calls on an open store never fail. Errors surface from `open`,
//! `flush_now` and `close`, and background failures go to a [`FatalHandler`].

use std::sync::Arc;

use lodestore_core::EngineError;
use thiserror::Error;
use tracing::error;

use crate::config::ConfigError;

/// Record store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The durable engine failed
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// A stored value is not a valid record
    #[error("failed to decode record {key:?}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A record could not be serialized
    #[error("failed to encode record {key:?}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Configuration rejected by `StoreConfig::validate`
    #[error("invalid store configuration: {0}")]
    Config(#[from] ConfigError),

    /// A background thread could not be started
    #[error("failed to spawn {name} thread")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A background thread panicked before finishing its work
    #[error("{name} thread panicked")]
    Panicked { name: &'static str },
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Receives unrecoverable errors from background flush and load threads.
pub type FatalHandler = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// Log the error and terminate the process with exit code 1.
///
/// Write-behind durability has no caller to return a failed commit to, so
/// continuing would silently drop acknowledged writes.
pub fn exit_on_fatal() -> FatalHandler {
    Arc::new(|err: &StoreError| {
        error!(target: "lodestore::flush", error = %err, "Unrecoverable store error, exiting");
        std::process::exit(1);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_keeps_key_and_source() {
        let source = serde_json::from_slice::<serde_json::Value>(b"{not json").unwrap_err();
        let err = StoreError::Decode {
            key: "user:7".to_string(),
            source,
        };
        assert!(err.to_string().contains("user:7"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_engine_error_converts() {
        let engine_err = EngineError::OversizedEntry {
            component: "key",
            size: 2048,
            max: 1024,
        };
        let err: StoreError = engine_err.into();
        assert!(matches!(err, StoreError::Engine(EngineError::OversizedEntry { .. })));
        assert!(err.to_string().contains("2048"));
    }
}
