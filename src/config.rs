//! Configuration for a simulation.
//!
//! Supports declarative YAML/JSON configuration files as well as building
//! [`SimConfig`] directly in code.
//!
//! # Configuration File Structure
//!
//! ```yaml
//! partition_count: 2
//! sync_period: 4
//! stop_at: 1000
//! vortex_capacity: 1000000
//! log_level: info
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{LinkId, Rank, SimTime};

/// Errors detected at startup or configuration finalisation.
///
/// Every variant is reported with a diagnostic and ends the process with a
/// non-zero exit; none of them are recoverable at run time.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown file format: {0}")]
    UnknownFormat(String),

    #[error("partition_count must be at least 1 (got {0})")]
    BadPartitionCount(u32),

    #[error("sync_period is required when partition_count > 1")]
    MissingSyncPeriod,

    #[error("sync_period must be non-zero")]
    ZeroSyncPeriod,

    #[error(
        "sync_period {period} exceeds the minimum cross-partition link latency {min_latency}"
    )]
    SyncPeriodTooLong {
        period: SimTime,
        min_latency: SimTime,
    },

    #[error("cross-partition link {link_id} must have a non-zero latency")]
    ZeroLatencyRemoteLink { link_id: LinkId },

    #[error("link {link_id} is already registered")]
    DuplicateLink { link_id: LinkId },

    #[error(
        "link {link_id} cannot target rank {peer} (this rank is {rank}, {num_ranks} partitions configured)"
    )]
    BadPeerRank {
        link_id: LinkId,
        peer: Rank,
        rank: Rank,
        num_ranks: u32,
    },

    #[error("handler '{handler}' bound to link {link_id} was never registered")]
    UnboundHandler { link_id: LinkId, handler: String },

    #[error("a partitioned simulation requires a transport")]
    MissingTransport,

    #[error("transport spans {transport_ranks} ranks but partition_count is {partition_count}")]
    RankCountMismatch {
        transport_ranks: u32,
        partition_count: u32,
    },

    #[error("clock period must be non-zero")]
    ZeroClockPeriod,

    #[error("checkpoint recorded {expected} clock callbacks but {got} were re-registered")]
    ClockCountMismatch { expected: usize, got: usize },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Recognized simulation options.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimConfig {
    /// Number of partitions (simulation workers).
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,

    /// Cycles between barrier exchanges. Required when `partition_count`
    /// is greater than 1; must not exceed the minimum cross-partition link
    /// latency.
    #[serde(default)]
    pub sync_period: Option<SimTime>,

    /// Stop the run at this cycle. `None` runs until the vortex drains or
    /// an explicit stop action fires.
    #[serde(default)]
    pub stop_at: Option<SimTime>,

    /// Bound on pending activities per partition. Exceeding it is fatal;
    /// `None` is unbounded.
    #[serde(default)]
    pub vortex_capacity: Option<usize>,

    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_partition_count() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            partition_count: default_partition_count(),
            sync_period: None,
            stop_at: None,
            vortex_capacity: None,
            log_level: default_log_level(),
        }
    }
}

impl SimConfig {
    /// Configuration for a single-partition simulation.
    pub fn single() -> Self {
        Self::default()
    }

    /// Configuration for a partitioned simulation.
    pub fn partitioned(partition_count: u32, sync_period: SimTime) -> Self {
        Self {
            partition_count,
            sync_period: Some(sync_period),
            ..Self::default()
        }
    }

    /// Sets the stop cycle.
    pub fn with_stop_at(mut self, stop_at: SimTime) -> Self {
        self.stop_at = Some(stop_at);
        self
    }

    /// Bounds the vortex.
    pub fn with_vortex_capacity(mut self, capacity: usize) -> Self {
        self.vortex_capacity = Some(capacity);
        self
    }

    /// Loads a configuration file, dispatching on the extension
    /// (`.yaml`/`.yml` or `.json`).
    pub fn load_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let config: SimConfig = match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            other => return Err(ConfigError::UnknownFormat(other.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the option values that can be checked without a link
    /// table. The latency bound on `sync_period` is checked at finalise,
    /// once the links exist.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.partition_count == 0 {
            return Err(ConfigError::BadPartitionCount(self.partition_count));
        }
        if self.partition_count > 1 {
            match self.sync_period {
                None => return Err(ConfigError::MissingSyncPeriod),
                Some(0) => return Err(ConfigError::ZeroSyncPeriod),
                Some(_) => {}
            }
        } else if self.sync_period.is_some() {
            tracing::warn!("sync_period is ignored for a single-partition simulation");
        }
        Ok(())
    }
}
