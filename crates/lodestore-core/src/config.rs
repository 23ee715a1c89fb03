//! Engine configuration
//!
//! Segment sizing, compaction thresholds and entry size limits.

use thiserror::Error;

/// Largest key the frame format can describe (u16 length field).
pub const KEY_SIZE_CEILING: usize = u16::MAX as usize;

/// Largest value the engine accepts regardless of configuration.
pub const VALUE_SIZE_CEILING: usize = 128 * 1024 * 1024;

/// Durable engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Segment rotation threshold (bytes)
    pub segment_size_bytes: u64,
    /// Compact when dead bytes / total bytes exceeds this ratio
    pub compaction_trigger_ratio: f64,
    /// Never compact directories smaller than this (bytes)
    pub compaction_min_bytes: u64,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            segment_size_bytes: 128 * 1024 * 1024,
            compaction_trigger_ratio: 0.5,
            compaction_min_bytes: 16 * 1024 * 1024,
            max_key_size: 1024,
            max_value_size: 32 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Small segments and an eager compaction threshold, for tests.
    pub fn for_testing() -> Self {
        Self {
            segment_size_bytes: 64 * 1024,
            compaction_trigger_ratio: 0.5,
            compaction_min_bytes: 4 * 1024,
            ..Self::default()
        }
    }

    pub fn with_segment_size(mut self, bytes: u64) -> Self {
        self.segment_size_bytes = bytes;
        self
    }

    pub fn with_compaction(mut self, trigger_ratio: f64, min_bytes: u64) -> Self {
        self.compaction_trigger_ratio = trigger_ratio;
        self.compaction_min_bytes = min_bytes;
        self
    }

    pub fn with_max_key_size(mut self, bytes: usize) -> Self {
        self.max_key_size = bytes;
        self
    }

    pub fn with_max_value_size(mut self, bytes: usize) -> Self {
        self.max_value_size = bytes;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_size_bytes < 4 * 1024 {
            return Err(ConfigError::SegmentTooSmall(self.segment_size_bytes));
        }
        if !(self.compaction_trigger_ratio > 0.0 && self.compaction_trigger_ratio < 1.0) {
            return Err(ConfigError::CompactionRatio(self.compaction_trigger_ratio));
        }
        if self.max_key_size == 0 || self.max_key_size > KEY_SIZE_CEILING {
            return Err(ConfigError::KeySize(self.max_key_size));
        }
        if self.max_value_size == 0 || self.max_value_size > VALUE_SIZE_CEILING {
            return Err(ConfigError::ValueSize(self.max_value_size));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("segment_size_bytes must be >= 4KB, got {0}")]
    SegmentTooSmall(u64),

    #[error("compaction_trigger_ratio must be in (0.0, 1.0), got {0}")]
    CompactionRatio(f64),

    #[error("max_key_size must be in [1, 65535], got {0}")]
    KeySize(usize),

    #[error("max_value_size must be in [1, 128MB], got {0}")]
    ValueSize(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_valid() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(EngineConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_ratio() {
        let config = EngineConfig::default().with_compaction(1.0, 0);
        assert_eq!(config.validate(), Err(ConfigError::CompactionRatio(1.0)));
    }

    #[test]
    fn test_rejects_key_size_beyond_format() {
        let config = EngineConfig::default().with_max_key_size(KEY_SIZE_CEILING + 1);
        assert!(matches!(config.validate(), Err(ConfigError::KeySize(_))));
    }

    #[test]
    fn test_rejects_tiny_segments() {
        let config = EngineConfig::default().with_segment_size(100);
        assert_eq!(config.validate(), Err(ConfigError::SegmentTooSmall(100)));
    }
}
