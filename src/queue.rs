//! Activity queues.
//!
//! Every queue in the core implements [`ActivityQueue`]: the per-partition
//! [`TimeVortex`], the per-link [`PollingLinkQueue`] for polled receivers,
//! and the per-peer [`SyncQueue`] that buffers cross-partition events until
//! the next barrier.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};

use crate::activity::Activity;
use crate::error::{SimError, SimResult};
use crate::types::SimTime;

/// The interface implemented by every queue in the system.
///
/// `pop` removes and returns the minimum by the queue's ordering; `front`
/// returns it without removing. Both return `None` when the queue is empty.
/// `insert` accepts any delivery time including the current cycle
/// (same-cycle delivery is legal) and fails only on a capacity bound.
pub trait ActivityQueue {
    /// Returns true if no activities are pending.
    fn is_empty(&self) -> bool;

    /// Number of pending activities.
    fn len(&self) -> usize;

    /// Inserts an activity.
    fn insert(&mut self, activity: Activity) -> SimResult<()>;

    /// Removes and returns the minimum activity.
    fn pop(&mut self) -> Option<Activity>;

    /// Returns the minimum activity without removing it.
    fn front(&self) -> Option<&Activity>;
}

/// The primary per-partition priority queue.
///
/// Ordered by `(delivery_time, priority, seq)`; equal `(time, priority)`
/// keys dispatch FIFO because `seq` is assigned monotonically. Unbounded by
/// default; [`TimeVortex::with_capacity_limit`] installs a bound that makes
/// overflow fatal rather than dropping work.
#[derive(Debug, Default)]
pub struct TimeVortex {
    heap: BinaryHeap<Reverse<Activity>>,
    capacity: Option<usize>,
    peak: usize,
}

impl TimeVortex {
    /// Creates an unbounded vortex.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a vortex that refuses insertions past `capacity`.
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            capacity: Some(capacity),
            peak: 0,
        }
    }

    /// The high-water mark of the queue length.
    pub fn peak_len(&self) -> usize {
        self.peak
    }

    /// Returns the contents in dispatch order without draining the queue.
    pub fn snapshot(&self) -> Vec<Activity> {
        let mut items: Vec<Activity> = self.heap.iter().map(|r| r.0.clone()).collect();
        items.sort();
        items
    }
}

impl ActivityQueue for TimeVortex {
    fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    fn insert(&mut self, activity: Activity) -> SimResult<()> {
        if let Some(capacity) = self.capacity {
            if self.heap.len() >= capacity {
                return Err(SimError::VortexOverflow { capacity });
            }
        }
        self.heap.push(Reverse(activity));
        self.peak = self.peak.max(self.heap.len());
        Ok(())
    }

    fn pop(&mut self) -> Option<Activity> {
        self.heap.pop().map(|r| r.0)
    }

    fn front(&self) -> Option<&Activity> {
        self.heap.peek().map(|r| &r.0)
    }
}

/// Delivery-time-ordered queue for links whose receiver polls.
///
/// No priority tiebreak: the polling API hands items over at or after their
/// delivery time only, and same-tick items come back in insertion order.
#[derive(Debug, Default)]
pub struct PollingLinkQueue {
    slots: BTreeMap<SimTime, VecDeque<Activity>>,
    count: usize,
}

impl PollingLinkQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the contents in delivery order without draining the queue.
    pub fn snapshot(&self) -> Vec<Activity> {
        self.slots
            .values()
            .flat_map(|slot| slot.iter().cloned())
            .collect()
    }
}

impl ActivityQueue for PollingLinkQueue {
    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn len(&self) -> usize {
        self.count
    }

    fn insert(&mut self, activity: Activity) -> SimResult<()> {
        self.slots
            .entry(activity.delivery_time())
            .or_default()
            .push_back(activity);
        self.count += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<Activity> {
        let time = *self.slots.keys().next()?;
        let slot = self.slots.get_mut(&time)?;
        let activity = slot.pop_front()?;
        if slot.is_empty() {
            self.slots.remove(&time);
        }
        self.count -= 1;
        Some(activity)
    }

    fn front(&self) -> Option<&Activity> {
        self.slots.values().next().and_then(|slot| slot.front())
    }
}

/// Send-side buffer for one peer rank.
///
/// Appends are in sender order; the barrier drains the whole buffer
/// atomically after a successful exchange. Single producer (the local
/// worker), single consumer (the barrier).
#[derive(Debug, Default)]
pub struct SyncQueue {
    activities: VecDeque<Activity>,
}

impl SyncQueue {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// The buffered activities in sender order, for serialisation.
    pub fn activities(&self) -> &VecDeque<Activity> {
        &self.activities
    }

    /// Takes every buffered activity, leaving the buffer empty.
    pub fn take_all(&mut self) -> Vec<Activity> {
        self.activities.drain(..).collect()
    }

    /// Discards the buffered activities.
    pub fn clear(&mut self) {
        self.activities.clear();
    }
}

impl ActivityQueue for SyncQueue {
    fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    fn len(&self) -> usize {
        self.activities.len()
    }

    fn insert(&mut self, activity: Activity) -> SimResult<()> {
        self.activities.push_back(activity);
        Ok(())
    }

    fn pop(&mut self) -> Option<Activity> {
        self.activities.pop_front()
    }

    fn front(&self) -> Option<&Activity> {
        self.activities.front()
    }
}
