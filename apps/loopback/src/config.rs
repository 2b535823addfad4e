//! Loopback configuration, read from an optional TOML file.
//!
//! ```toml
//! loss_rate = 0.2
//! encrypt = true
//!
//! [transfer]
//! chunk_size = 4096
//! ```

use std::path::Path;

use chunkline_transfer::TransferConfig;
use serde::{Deserialize, Serialize};

/// Highest accepted loss or corruption rate.
const MAX_RATE: f64 = 0.9;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Probability that a chunk is lost in transit.
    #[serde(default = "default_loss_rate")]
    pub loss_rate: f64,

    /// Probability that a delivered chunk has a byte flipped.
    #[serde(default)]
    pub corrupt_rate: f64,

    /// Encrypt chunks with a freshly generated key.
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Retransmission rounds before giving up.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Engine settings shared by both endpoints.
    #[serde(default)]
    pub transfer: TransferConfig,
}

fn default_loss_rate() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_max_rounds() -> u32 {
    16
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loss_rate: default_loss_rate(),
            corrupt_rate: 0.0,
            encrypt: default_true(),
            max_rounds: default_max_rounds(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.transfer = config.transfer.clamped();
        config.loss_rate = config.loss_rate.clamp(0.0, MAX_RATE);
        config.corrupt_rate = config.corrupt_rate.clamp(0.0, MAX_RATE);
        config.max_rounds = config.max_rounds.max(1);
        tracing::debug!(path = %path.display(), "configuration read");
        Ok(config)
    }
}
