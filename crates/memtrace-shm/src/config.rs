//! Configuration for shared tables and allocation tracking

use serde::{Deserialize, Serialize};

use crate::{Result, TableError};

/// Longest accepted segment prefix.
pub const MAX_PREFIX_LEN: usize = 24;

/// Largest ratio between two neighbouring capacity steps, rounded up.
///
/// A shrink threshold below `grow / RESIZE_RATIO_BOUND` guarantees that a
/// resize in one direction never lands past the opposite threshold.
const RESIZE_RATIO_BOUND: f32 = 2.2;

/// Configuration for a shared table.
///
/// The load factors are copied into the table header when the table is
/// created, so attached processes always follow the creator's settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableConfig {
    /// Prefix of every segment name the table creates
    pub segment_prefix: String,

    /// Grow once `length / capacity` exceeds this
    pub grow_load_factor: f32,

    /// Shrink once `length / capacity` falls below this
    pub shrink_load_factor: f32,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            segment_prefix: "memtrace".to_string(),
            grow_load_factor: 0.7,
            shrink_load_factor: 0.2,
        }
    }
}

impl TableConfig {
    /// Create a configuration with the given segment prefix
    pub fn new(segment_prefix: impl Into<String>) -> Self {
        Self {
            segment_prefix: segment_prefix.into(),
            ..Default::default()
        }
    }

    /// Set the segment prefix
    #[must_use]
    pub fn with_segment_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.segment_prefix = prefix.into();
        self
    }

    /// Set the grow threshold
    #[must_use]
    pub const fn with_grow_load_factor(mut self, factor: f32) -> Self {
        self.grow_load_factor = factor;
        self
    }

    /// Set the shrink threshold
    #[must_use]
    pub const fn with_shrink_load_factor(mut self, factor: f32) -> Self {
        self.shrink_load_factor = factor;
        self
    }

    /// Check that the configuration can be used to create a table.
    pub fn validate(&self) -> Result<()> {
        let prefix = &self.segment_prefix;
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN {
            return Err(TableError::Config(format!(
                "segment prefix must be 1..={MAX_PREFIX_LEN} characters: {prefix:?}"
            )));
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(TableError::Config(format!(
                "segment prefix may only contain [A-Za-z0-9_-]: {prefix:?}"
            )));
        }

        let (grow, shrink) = (self.grow_load_factor, self.shrink_load_factor);
        if !(grow > 0.0 && grow <= 0.95) {
            return Err(TableError::Config(format!(
                "grow load factor must be in (0, 0.95]: {grow}"
            )));
        }
        if !(shrink > 0.0 && shrink * RESIZE_RATIO_BOUND < grow) {
            return Err(TableError::Config(format!(
                "shrink load factor must be in (0, grow / {RESIZE_RATIO_BOUND}): {shrink}"
            )));
        }

        Ok(())
    }
}

/// Configuration for the allocation interception collaborator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Innermost frames to leave out of captured stack traces
    pub skip_frames: usize,

    /// Resolve symbol names while capturing (slow)
    pub symbolize: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            skip_frames: 3,
            symbolize: false,
        }
    }
}

impl TrackerConfig {
    /// Set the number of skipped frames
    #[must_use]
    pub const fn with_skip_frames(mut self, skip: usize) -> Self {
        self.skip_frames = skip;
        self
    }

    /// Enable or disable symbol resolution
    #[must_use]
    pub const fn with_symbolize(mut self, enable: bool) -> Self {
        self.symbolize = enable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = TableConfig::default();
        assert!(config.validate().is_ok());
        assert!((config.grow_load_factor - 0.7).abs() < f32::EPSILON);
        assert!((config.shrink_load_factor - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_prefix_validation() {
        assert!(TableConfig::new("leak-check_2").validate().is_ok());
        assert!(TableConfig::new("").validate().is_err());
        assert!(TableConfig::new("has/slash").validate().is_err());
        assert!(TableConfig::new("dot.ted").validate().is_err());
        assert!(TableConfig::new("x".repeat(MAX_PREFIX_LEN + 1)).validate().is_err());
    }

    #[test]
    fn test_threshold_validation() {
        let base = TableConfig::default();
        assert!(base.clone().with_grow_load_factor(0.0).validate().is_err());
        assert!(base.clone().with_grow_load_factor(1.0).validate().is_err());
        assert!(base.clone().with_shrink_load_factor(0.0).validate().is_err());
        // Shrinking at 0.4 could land right back above a 0.7 grow threshold
        assert!(base.clone().with_shrink_load_factor(0.4).validate().is_err());
        assert!(
            base.with_grow_load_factor(0.5)
                .with_shrink_load_factor(0.1)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_config_serde() {
        let config = TableConfig::new("trace").with_grow_load_factor(0.8);
        let json = serde_json::to_string(&config).unwrap_or_default();
        let back: TableConfig = serde_json::from_str(&json).unwrap_or_default();
        assert_eq!(back, config);
    }

    #[test]
    fn test_tracker_config_builder() {
        let config = TrackerConfig::default().with_skip_frames(1).with_symbolize(true);
        assert_eq!(config.skip_frames, 1);
        assert!(config.symbolize);
    }
}
