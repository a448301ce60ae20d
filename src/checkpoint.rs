//! Checkpoint state.
//!
//! A checkpoint captures everything a partition needs to resume: the clock,
//! the sequence counter, the vortex contents in dispatch order, every link
//! (with its endpoint binding recorded by name), the per-peer send buffers
//! and the barrier schedule. Transport handles are deliberately absent;
//! they are rebuilt from configuration on restore.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::activity::{Activity, Event};
use crate::config::{ConfigError, ConfigResult};
use crate::link::LinkSpec;
use crate::types::{Rank, Seq, SimTime};

/// How a link's local endpoint was bound.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BindingState {
    /// Bound to the handler registered under this name.
    Handled { handler: String },
    /// Polled by the endpoint.
    Polled,
}

/// One link's checkpointed state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkState {
    /// The static description (id, latency, peer rank).
    pub spec: LinkSpec,
    /// The endpoint binding, by name.
    pub binding: BindingState,
    /// Undelivered activities in the polling queue, delivery order.
    #[serde(default)]
    pub pending: Vec<Activity>,
    /// Init data not yet exchanged.
    #[serde(default)]
    pub init_outbox: Vec<Event>,
    /// Init data received but not yet collected.
    #[serde(default)]
    pub init_inbox: Vec<Event>,
}

/// The barrier schedule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BarrierState {
    /// Cycles between exchanges.
    pub period: SimTime,
    /// The cycle of the next exchange.
    pub next_fire: SimTime,
    /// Exchanges completed so far.
    pub exchange_count: u64,
}

/// A partition's full checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointState {
    /// The partition clock at capture time.
    pub current_time: SimTime,
    /// The next sequence number to assign.
    pub next_seq: Seq,
    /// Vortex contents, dispatch order.
    pub vortex: Vec<Activity>,
    /// All links, by ascending id.
    pub links: Vec<LinkState>,
    /// Per-peer send buffers, sender order.
    pub sync_queues: Vec<(Rank, Vec<Activity>)>,
    /// The barrier schedule, absent for single-partition runs.
    pub barrier: Option<BarrierState>,
    /// Number of clock callbacks registered at capture time. Restore
    /// requires the same callbacks re-registered in the same order.
    pub clock_count: usize,
}

impl CheckpointState {
    /// Serialises the checkpoint to JSON bytes.
    pub fn to_json_vec(&self) -> ConfigResult<Vec<u8>> {
        Ok(serde_json::to_vec(self).map_err(ConfigError::Json)?)
    }

    /// Deserialises a checkpoint from JSON bytes.
    pub fn from_json_slice(bytes: &[u8]) -> ConfigResult<Self> {
        Ok(serde_json::from_slice(bytes).map_err(ConfigError::Json)?)
    }

    /// Writes the checkpoint to a file.
    pub fn write_file(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let bytes = self.to_json_vec()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Reads a checkpoint from a file.
    pub fn read_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_json_slice(&bytes)
    }
}
