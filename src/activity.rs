//! Activity and event definitions.
//!
//! An [`Activity`] is the unit of scheduling: anything that occupies a slot
//! in a time-ordered queue, whether a link event, a recurring action or the
//! partition barrier itself. Activities are totally ordered by
//! `(delivery_time, priority, seq)` so that dispatch order is deterministic
//! across runs on identical input.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::types::{priority, LinkId, Priority, Seq, SimTime};

/// An event travelling across a link.
///
/// Carries the destination link id and an opaque payload. Created by a
/// sender, owned by whichever queue it currently resides in, and consumed
/// exactly once at delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    /// The destination link.
    pub link_id: LinkId,
    /// Opaque payload carried to the receiving endpoint.
    pub payload: serde_json::Value,
}

impl Event {
    /// Creates a new event targeting the given link.
    pub fn new(link_id: LinkId, payload: serde_json::Value) -> Self {
        Self { link_id, payload }
    }
}

/// The kind of work an [`Activity`] performs when dispatched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ActivityKind {
    /// A link event delivered to the receiving endpoint.
    Event(Event),

    /// Link init data, exchanged once before the run phase begins.
    ///
    /// Never enters the run-phase queue; it rides the barrier machinery
    /// during the init phase only.
    InitData(Event),

    /// A recurring clock tick. `slot` indexes the partition's registered
    /// clock callbacks; the tick re-schedules itself every `period` cycles.
    Clock {
        /// Index into the partition's clock callback list.
        slot: usize,
        /// Cycles between ticks.
        period: SimTime,
    },

    /// The partition barrier: exchanges buffered cross-partition events and
    /// re-schedules itself every barrier period.
    Barrier,

    /// Ends the run loop.
    Stop,
}

/// A scheduled unit of work.
///
/// Ordering is the lexicographic total order over
/// `(delivery_time, priority, seq)`. Because `seq` is assigned monotonically
/// per partition, equal `(time, priority)` pairs dispatch in FIFO order and
/// no two activities ever compare equal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Activity {
    time: SimTime,
    priority: Priority,
    seq: Seq,
    kind: ActivityKind,
}

impl Activity {
    /// Creates an activity with an explicit priority.
    pub fn new(time: SimTime, priority: Priority, seq: Seq, kind: ActivityKind) -> Self {
        Self {
            time,
            priority,
            seq,
            kind,
        }
    }

    /// Creates a link-event activity at the standard event priority.
    pub fn event(time: SimTime, seq: Seq, event: Event) -> Self {
        Self::new(time, priority::EVENT, seq, ActivityKind::Event(event))
    }

    /// Creates an init-data activity.
    pub fn init_data(time: SimTime, seq: Seq, event: Event) -> Self {
        Self::new(time, priority::EVENT, seq, ActivityKind::InitData(event))
    }

    /// Creates a clock-tick activity.
    pub fn clock(time: SimTime, seq: Seq, slot: usize, period: SimTime) -> Self {
        Self::new(time, priority::CLOCK, seq, ActivityKind::Clock { slot, period })
    }

    /// Creates a barrier activity.
    pub fn barrier(time: SimTime, seq: Seq) -> Self {
        Self::new(time, priority::SYNC, seq, ActivityKind::Barrier)
    }

    /// Creates a stop activity.
    pub fn stop(time: SimTime, seq: Seq) -> Self {
        Self::new(time, priority::STOP, seq, ActivityKind::Stop)
    }

    /// The simulation time at which this activity dispatches.
    pub fn delivery_time(&self) -> SimTime {
        self.time
    }

    /// The dispatch priority (lower dispatches first within a cycle).
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The sequence tiebreaker.
    pub fn seq(&self) -> Seq {
        self.seq
    }

    /// The work performed at dispatch.
    pub fn kind(&self) -> &ActivityKind {
        &self.kind
    }

    /// Consumes the activity, returning its kind.
    pub fn into_kind(self) -> ActivityKind {
        self.kind
    }

    /// The destination link id, for event-carrying activities.
    pub fn link_id(&self) -> Option<LinkId> {
        match &self.kind {
            ActivityKind::Event(ev) | ActivityKind::InitData(ev) => Some(ev.link_id),
            _ => None,
        }
    }

    /// The full ordering key.
    pub fn key(&self) -> (SimTime, Priority, Seq) {
        (self.time, self.priority, self.seq)
    }
}

impl PartialEq for Activity {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Activity {}

impl PartialOrd for Activity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Activity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}
