//! Run statistics.
//!
//! Counters collected by the run loop and exported as JSON for analysis.

use serde::{Deserialize, Serialize};

use crate::types::SimTime;

/// Counters accumulated over a run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SimulationStats {
    /// Events popped from the vortex and dispatched to handlers.
    pub events_dispatched: u64,

    /// Events sent on links (local and cross-partition).
    pub events_sent: u64,

    /// Activities shipped to peer partitions across barriers.
    pub events_shipped: u64,

    /// Activities received from peer partitions across barriers.
    pub events_received: u64,

    /// Clock ticks executed.
    pub clock_ticks: u64,

    /// Barrier exchanges executed.
    pub barriers_executed: u64,

    /// High-water mark of the vortex.
    pub peak_vortex_len: usize,

    /// The clock when the run ended.
    pub final_time: SimTime,
}

/// What the run loop hands back on success.
#[derive(Clone, Debug)]
pub struct RunSummary {
    /// The clock when the run ended.
    pub final_time: SimTime,
    /// Events dispatched to handlers.
    pub events_dispatched: u64,
    /// Clock ticks executed.
    pub clock_ticks: u64,
    /// Barrier exchanges executed.
    pub barriers_executed: u64,
}

impl SimulationStats {
    /// Builds the summary returned by the run loop.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            final_time: self.final_time,
            events_dispatched: self.events_dispatched,
            clock_ticks: self.clock_ticks,
            barriers_executed: self.barriers_executed,
        }
    }
}
