//! Runtime error taxonomy.
//!
//! Configuration problems are caught at startup and carried by
//! [`ConfigError`](crate::config::ConfigError); everything here is a run-time
//! failure. Protocol errors signal a bug between partitions and are fatal:
//! the run loop flushes its summary and returns the error, it never retries.

use thiserror::Error;

use crate::scheduler::Phase;
use crate::transport::TransportError;
use crate::types::{LinkId, Rank, SimTime};

/// Fatal simulation errors.
#[derive(Error, Debug)]
pub enum SimError {
    /// A configuration problem detected at startup or finalisation.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// An event referenced a link id with no local registration.
    #[error("no link with id {link_id} registered on rank {rank}")]
    UnknownLink { rank: Rank, link_id: LinkId },

    /// A barrier arrival carried a delivery time already in the past.
    #[error(
        "received event on link {link_id} with delivery time {delivery_time} behind the clock at {now}"
    )]
    StaleDelivery {
        link_id: LinkId,
        delivery_time: SimTime,
        now: SimTime,
    },

    /// Partitions disagreed on which barrier exchange is running.
    #[error(
        "barrier desync with rank {peer}: this rank is at exchange {expected}, peer sent {got} ({state})"
    )]
    BarrierDesync {
        peer: Rank,
        expected: u64,
        got: u64,
        state: &'static str,
    },

    /// A peer's barrier batch failed to decode.
    #[error("malformed barrier batch from rank {peer}: {message}")]
    MalformedBatch { peer: Rank, message: String },

    /// The vortex refused an insertion past its configured bound.
    #[error("time vortex exceeded its capacity limit of {capacity}")]
    VortexOverflow { capacity: usize },

    /// A user handler failed; the simulation cannot recover a consistent
    /// state and does not retry.
    #[error("handler for link {link_id} failed: {message}")]
    Handler { link_id: LinkId, message: String },

    /// A clock callback failed or went missing.
    #[error("clock callback {slot} failed: {message}")]
    ClockHandler { slot: usize, message: String },

    /// `recv` was called on a link bound to a handler.
    #[error("link {link_id} is not configured for polling")]
    NotPolled { link_id: LinkId },

    /// An activity would move the partition clock backwards.
    #[error("activity at {delivery_time} would move the clock backwards from {now}")]
    TimeRegress {
        delivery_time: SimTime,
        now: SimTime,
    },

    /// An init-phase activity surfaced in the run-phase queue.
    #[error("init-data activity for link {link_id} reached the run queue")]
    MisroutedInitData { link_id: LinkId },

    /// An operation was attempted in the wrong lifecycle phase.
    #[error("{op} is not allowed in the {phase:?} phase")]
    WrongPhase { op: &'static str, phase: Phase },

    /// The message-passing transport failed.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
}

/// Result alias used throughout the crate.
pub type SimResult<T> = Result<T, SimError>;
