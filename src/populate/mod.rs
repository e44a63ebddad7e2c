//! Index Population Module
//!
//! Builds any number of indexes from one pass over the entity store while
//! live writes keep coming in.
//!
//! # Example
//! ```ignore
//! use sekejap_indexing::populate::PopulationConfig;
//!
//! let config = PopulationConfig::default().batch_size(5_000).queue_threshold(1_000);
//! let config = PopulationConfig::from_env()?;
//! ```

mod job;
mod multiple;
mod tracker;

pub use job::IndexPopulationJob;
pub use multiple::{IndexPopulation, MultipleIndexPopulator, PopulationStatus};
pub use tracker::{UpdatesSnapshot, UpdatesTracker};

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};

/// Cache of derived schema information, cleared whenever an index flips
pub trait SchemaState: Send + Sync {
    fn clear(&self);
}

/// Population tuning knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulationConfig {
    /// Queued concurrent updates that trigger a drain during the scan
    pub queue_threshold: usize,
    /// Entries handed to `IndexPopulator::add` per call
    pub batch_size: usize,
    /// Rough queued bytes that trigger a drain regardless of count
    pub batch_max_bytes: usize,
    /// Max wait for running population jobs on shutdown
    pub await_timeout_minutes: u64,
    /// Log every flushed batch
    pub print_debug: bool,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            queue_threshold: 20_000,
            batch_size: 10_000,
            batch_max_bytes: 10 * 1024 * 1024,
            await_timeout_minutes: 1,
            print_debug: false,
        }
    }
}

impl PopulationConfig {
    pub const ENV_QUEUE_THRESHOLD: &'static str = "SEKEJAP_INDEX_QUEUE_THRESHOLD";
    pub const ENV_BATCH_SIZE: &'static str = "SEKEJAP_INDEX_BATCH_SIZE";
    pub const ENV_BATCH_MAX_BYTES: &'static str = "SEKEJAP_INDEX_BATCH_MAX_BYTES";
    pub const ENV_AWAIT_TIMEOUT_MINUTES: &'static str = "SEKEJAP_INDEX_AWAIT_TIMEOUT_MINUTES";
    pub const ENV_PRINT_DEBUG: &'static str = "SEKEJAP_INDEX_PRINT_DEBUG";

    pub fn queue_threshold(mut self, threshold: usize) -> Self {
        self.queue_threshold = threshold;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn batch_max_bytes(mut self, bytes: usize) -> Self {
        self.batch_max_bytes = bytes;
        self
    }

    pub fn await_timeout_minutes(mut self, minutes: u64) -> Self {
        self.await_timeout_minutes = minutes;
        self
    }

    pub fn print_debug(mut self, enabled: bool) -> Self {
        self.print_debug = enabled;
        self
    }

    /// Defaults overridden by whichever `SEKEJAP_INDEX_*` variables are set
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an explicit variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = lookup(Self::ENV_QUEUE_THRESHOLD) {
            config.queue_threshold = parse_positive(Self::ENV_QUEUE_THRESHOLD, &v)? as usize;
        }
        if let Some(v) = lookup(Self::ENV_BATCH_SIZE) {
            config.batch_size = parse_positive(Self::ENV_BATCH_SIZE, &v)? as usize;
        }
        if let Some(v) = lookup(Self::ENV_BATCH_MAX_BYTES) {
            config.batch_max_bytes = parse_positive(Self::ENV_BATCH_MAX_BYTES, &v)? as usize;
        }
        if let Some(v) = lookup(Self::ENV_AWAIT_TIMEOUT_MINUTES) {
            config.await_timeout_minutes = parse_positive(Self::ENV_AWAIT_TIMEOUT_MINUTES, &v)?;
        }
        if let Some(v) = lookup(Self::ENV_PRINT_DEBUG) {
            config.print_debug = match v.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(IndexError::InvalidConfig(format!(
                        "{}: expected a boolean, got {v:?}",
                        Self::ENV_PRINT_DEBUG
                    )))
                }
            };
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(IndexError::InvalidConfig("batch_size must be positive".into()));
        }
        if self.queue_threshold == 0 {
            return Err(IndexError::InvalidConfig("queue_threshold must be positive".into()));
        }
        if self.batch_max_bytes == 0 {
            return Err(IndexError::InvalidConfig("batch_max_bytes must be positive".into()));
        }
        Ok(())
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u64> {
    match value.trim().parse::<u64>() {
        Ok(0) => Err(IndexError::InvalidConfig(format!("{key} must be positive"))),
        Ok(n) => Ok(n),
        Err(e) => Err(IndexError::InvalidConfig(format!("{key}: {e} ({value:?})"))),
    }
}
