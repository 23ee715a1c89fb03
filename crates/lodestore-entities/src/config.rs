//! Store configuration
//!
//! Flush cadence, batch limits and the engine settings for the directory
//! behind each collection.

use std::fmt;
use std::time::Duration;

use lodestore_core::EngineConfig;
use thiserror::Error;

use crate::error::{exit_on_fatal, FatalHandler};

/// Record store configuration
#[derive(Clone)]
pub struct StoreConfig {
    /// Delay between background flush cycles
    pub flush_interval: Duration,
    /// Most dirty keys committed in one batch
    pub max_flush_batch: usize,
    /// Most records handed to the map per load chunk
    pub max_load_chunk: usize,
    /// Settings for the durable engine
    pub engine: EngineConfig,
    /// Called with errors no caller can receive
    pub fatal_handler: FatalHandler,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            max_flush_batch: 100_000,
            max_load_chunk: 100_000,
            engine: EngineConfig::default(),
            fatal_handler: exit_on_fatal(),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("flush_interval", &self.flush_interval)
            .field("max_flush_batch", &self.max_flush_batch)
            .field("max_load_chunk", &self.max_load_chunk)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl StoreConfig {
    /// Fast flushes and small engine segments, for tests.
    pub fn for_testing() -> Self {
        Self {
            flush_interval: Duration::from_millis(10),
            engine: EngineConfig::for_testing(),
            ..Self::default()
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_max_flush_batch(mut self, max: usize) -> Self {
        self.max_flush_batch = max;
        self
    }

    pub fn with_max_load_chunk(mut self, max: usize) -> Self {
        self.max_load_chunk = max;
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Replace the default exit-on-error behavior.
    pub fn with_fatal_handler(mut self, handler: FatalHandler) -> Self {
        self.fatal_handler = handler;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(ConfigError::FlushInterval);
        }
        if self.max_flush_batch == 0 {
            return Err(ConfigError::FlushBatch);
        }
        if self.max_load_chunk == 0 {
            return Err(ConfigError::LoadChunk);
        }
        self.engine.validate()?;
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("flush_interval must be non-zero")]
    FlushInterval,

    #[error("max_flush_batch must be at least 1")]
    FlushBatch,

    #[error("max_load_chunk must be at least 1")]
    LoadChunk,

    #[error(transparent)]
    Engine(#[from] lodestore_core::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.flush_interval, Duration::from_millis(100));
        assert_eq!(config.max_flush_batch, 100_000);
        assert_eq!(config.max_load_chunk, 100_000);
        assert!(config.validate().is_ok());
        assert!(StoreConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_limits() {
        let config = StoreConfig::default().with_max_flush_batch(0);
        assert_eq!(config.validate(), Err(ConfigError::FlushBatch));

        let config = StoreConfig::default().with_max_load_chunk(0);
        assert_eq!(config.validate(), Err(ConfigError::LoadChunk));

        let config = StoreConfig::default().with_flush_interval(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::FlushInterval));
    }

    #[test]
    fn test_engine_errors_surface() {
        let engine = EngineConfig::default().with_segment_size(1);
        let config = StoreConfig::default().with_engine(engine);
        assert!(matches!(config.validate(), Err(ConfigError::Engine(_))));
    }

    #[test]
    fn test_debug_omits_handler() {
        let text = format!("{:?}", StoreConfig::default());
        assert!(text.contains("flush_interval"));
        assert!(!text.contains("fatal_handler"));
    }
}
