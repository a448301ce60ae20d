//! Core type definitions for the simulation core.
//!
//! This module defines the fundamental types used throughout the scheduler.

/// Simulation time in cycles.
///
/// All activities, link latencies and barrier periods use the same `SimTime`
/// representation, giving every partition a unified timeline.
pub type SimTime = u64;

/// Unique identifier for a link.
///
/// A link id is shared by both endpoints of a link, including endpoints that
/// live on different partitions.
pub type LinkId = u64;

/// Identifier of a partition (one simulation worker process or thread).
pub type Rank = u32;

/// Dispatch priority of an activity. Lower values dispatch first among
/// activities scheduled for the same cycle.
pub type Priority = u8;

/// Monotonically assigned per-partition sequence number.
///
/// The tiebreaker that makes dispatch order total and therefore
/// deterministic: two activities never compare equal.
pub type Seq = u64;

/// Dispatch priorities of the built-in activity kinds.
///
/// At a given cycle the barrier exchange runs first, then clock ticks, then
/// event deliveries; a stop action runs only after all same-cycle work.
pub mod priority {
    use super::Priority;

    /// Partition barrier exchange.
    pub const SYNC: Priority = 25;
    /// Recurring clock ticks.
    pub const CLOCK: Priority = 40;
    /// Link event deliveries.
    pub const EVENT: Priority = 50;
    /// Stop actions.
    pub const STOP: Priority = 98;
}
