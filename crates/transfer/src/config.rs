//! Engine configuration.
//!
//! Loaded from TOML; every field is optional and falls back to its default.
//! Out-of-range values are clamped rather than rejected.

use std::path::Path;
use std::time::Duration;

use chunkline_protocol::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT_TRANSFERS, DEFAULT_TICK_INTERVAL, clamp_chunk_size,
    clamp_max_concurrent,
};
use serde::{Deserialize, Serialize};

use crate::TransferError;
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::scheduler::AdmissionPolicy;
use crate::store::DEFAULT_FINISHED_HISTORY;

/// Smallest accepted scheduler period.
const MIN_TICK_INTERVAL_MS: u64 = 10;

/// Transfer engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunk size in bytes, clamped to 1 KiB..=1 MiB.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Maximum transfers holding an admission slot, clamped to 1..=10.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Scheduler period in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Capacity of the event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default)]
    pub admission_policy: AdmissionPolicy,

    /// Finished transfer ids remembered for late-chunk detection.
    #[serde(default = "default_finished_history")]
    pub finished_history: usize,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_TRANSFERS
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL.as_millis() as u64
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_finished_history() -> usize {
    DEFAULT_FINISHED_HISTORY
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_concurrent: default_max_concurrent(),
            tick_interval_ms: default_tick_interval_ms(),
            event_capacity: default_event_capacity(),
            admission_policy: AdmissionPolicy::default(),
            finished_history: default_finished_history(),
        }
    }
}

impl TransferConfig {
    /// Returns a copy with every field forced into its accepted range.
    pub fn clamped(mut self) -> Self {
        self.chunk_size = clamp_chunk_size(self.chunk_size);
        self.max_concurrent = clamp_max_concurrent(self.max_concurrent);
        self.tick_interval_ms = self.tick_interval_ms.max(MIN_TICK_INTERVAL_MS);
        self.event_capacity = self.event_capacity.max(1);
        self
    }

    /// Parses a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, TransferError> {
        let config: Self =
            toml::from_str(content).map_err(|e| TransferError::Config(e.to_string()))?;
        Ok(config.clamped())
    }

    /// Reads and parses a TOML file.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
