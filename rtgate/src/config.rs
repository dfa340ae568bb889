//! Engine configuration
//!
//! Every tunable the engine has lives here: the drain backoff of the
//! fire-event gate, the arena block sizing and the batch ceiling. Values can
//! be loaded from a JSON file and overridden from the command line.
//!
//! ```json
//! {
//!   "gate": { "spin_iterations": 1000, "initial_sleep_us": 10, "max_sleep_us": 1000 },
//!   "arena": { "block_size": 65536 },
//!   "batch": { "ceiling": 64512 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::domain::ConfigError;
use rtgate_common::{BLOCK_HEADER_SIZE, BULK_TYPE_HEADER_SIZE, DEFAULT_EVENT_CEILING};

/// Spin/sleep thresholds for the pause drain wait
///
/// The drain spins first, then escalates to doubling sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainBackoff {
    /// Busy-wait iterations before the first sleep
    pub spin_iterations: u32,

    /// First sleep duration, doubled after every sleep
    pub initial_sleep_us: u64,

    /// Upper bound of the doubling sleep
    pub max_sleep_us: u64,

    /// Log a warning once the drain has taken this long (doubles after each warning)
    pub warn_after_ms: u64,
}

impl Default for DrainBackoff {
    fn default() -> Self {
        Self { spin_iterations: 1000, initial_sleep_us: 10, max_sleep_us: 1000, warn_after_ms: 500 }
    }
}

impl DrainBackoff {
    #[must_use]
    pub fn initial_sleep(&self) -> Duration {
        Duration::from_micros(self.initial_sleep_us)
    }

    #[must_use]
    pub fn max_sleep(&self) -> Duration {
        Duration::from_micros(self.max_sleep_us)
    }

    #[must_use]
    pub fn warn_after(&self) -> Duration {
        Duration::from_millis(self.warn_after_ms)
    }
}

/// Arena block sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Default block mapping size; oversized requests round up to a multiple of it
    pub block_size: usize,

    /// Upper bound on bytes mapped at once (`None` = unlimited)
    pub max_bytes: Option<usize>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self { block_size: 64 * 1024, max_bytes: None }
    }
}

/// Batch encoder limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Largest event the transport accepts, batch header included
    pub ceiling: usize,

    /// Runtime instance id stamped into every batch header
    pub instance_id: u16,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { ceiling: DEFAULT_EVENT_CEILING, instance_id: 0 }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub gate: DrainBackoff,
    pub arena: ArenaConfig,
    pub batch: BatchConfig,
}

impl EngineConfig {
    /// Load and validate a configuration from a JSON file
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails validation
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the limits are internally consistent
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` describing the first violated limit
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arena.block_size <= BLOCK_HEADER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "arena.block_size must exceed the {BLOCK_HEADER_SIZE} byte block header (got {})",
                self.arena.block_size
            )));
        }
        if let Some(max) = self.arena.max_bytes {
            if max < self.arena.block_size {
                return Err(ConfigError::Invalid(format!(
                    "arena.max_bytes ({max}) is smaller than one block ({})",
                    self.arena.block_size
                )));
            }
        }
        if self.batch.ceiling <= BULK_TYPE_HEADER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "batch.ceiling must exceed the {BULK_TYPE_HEADER_SIZE} byte batch header (got {})",
                self.batch.ceiling
            )));
        }
        if self.gate.initial_sleep_us > self.gate.max_sleep_us {
            return Err(ConfigError::Invalid(format!(
                "gate.initial_sleep_us ({}) exceeds gate.max_sleep_us ({})",
                self.gate.initial_sleep_us, self.gate.max_sleep_us
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch.ceiling, 64_512);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "arena": {{ "block_size": 8192 }} }}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.arena.block_size, 8192);
        assert_eq!(config.arena.max_bytes, None);
        assert_eq!(config.gate, DrainBackoff::default());
    }

    #[test]
    fn test_rejects_tiny_block() {
        let mut config = EngineConfig::default();
        config.arena.block_size = 64;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_inverted_sleep_bounds() {
        let mut config = EngineConfig::default();
        config.gate.initial_sleep_us = 5000;
        config.gate.max_sleep_us = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = EngineConfig::from_file("/nonexistent/rtgate.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
