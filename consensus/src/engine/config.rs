// Engine configuration
//
// Everything the protocol needs from the operator: quorum fraction, view
// timing, epoch length, and where the WAL lives. Loaded from JSON; any
// missing field takes its default.

use crate::state::TimeoutPolicy;
use crate::types::QuorumFraction;
use crate::wal::DEFAULT_JOURNAL_LIMIT_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to install tracing subscriber: {0}")]
    Logging(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Epoch the node starts in
    pub epoch: u64,
    /// Committed blocks per epoch; the view counter restarts at each boundary
    pub epoch_length: u64,
    /// Blocks a leader may propose in one view
    pub blocks_per_view: u32,
    /// Pause between a leader's proposals
    pub block_interval_ms: u64,
    pub quorum: QuorumFraction,
    /// First view deadline, doubled after every failed view
    pub view_timeout_ms: u64,
    pub max_view_timeout_ms: u64,
    /// WAL directory; `None` keeps nothing on disk
    pub wal_dir: Option<PathBuf>,
    pub journal_limit_size: u64,
    pub protocol_version: u32,
    /// Capacity of the inbound message queue
    pub inbound_queue: usize,
    pub peer_report_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            epoch: 1,
            epoch_length: 250_000,
            blocks_per_view: 10,
            block_interval_ms: 500,
            quorum: QuorumFraction::default(),
            view_timeout_ms: 2_000,
            max_view_timeout_ms: 60_000,
            wal_dir: None,
            journal_limit_size: DEFAULT_JOURNAL_LIMIT_SIZE,
            protocol_version: crate::network::PROTOCOL_VERSION,
            inbound_queue: 1024,
            peer_report_interval_ms: 10_000,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.blocks_per_view == 0 {
            return Err(ConfigError::Invalid("blocks_per_view must be positive".into()));
        }
        if self.epoch_length == 0 {
            return Err(ConfigError::Invalid("epoch_length must be positive".into()));
        }
        let q = self.quorum;
        if q.denominator == 0 || q.numerator == 0 || q.numerator >= q.denominator {
            return Err(ConfigError::Invalid(format!(
                "quorum fraction {}/{} out of range",
                q.numerator, q.denominator
            )));
        }
        if self.view_timeout_ms == 0 || self.max_view_timeout_ms < self.view_timeout_ms {
            return Err(ConfigError::Invalid("view timeout bounds".into()));
        }
        Ok(())
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            base: Duration::from_millis(self.view_timeout_ms),
            max: Duration::from_millis(self.max_view_timeout_ms),
        }
    }
}

/// Install a global fmt subscriber filtered by `RUST_LOG`, or `default`
/// when the variable is unset
pub fn init_logging(default: &str) -> Result<(), ConfigError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))
}
