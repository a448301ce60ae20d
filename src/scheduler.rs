//! The per-partition scheduling context.
//!
//! A [`Scheduler`] owns everything one partition needs to make progress: the
//! clock, the time vortex, the link table, the per-peer sync queues and the
//! sequence counter. It is passed explicitly to handlers and to the barrier
//! instead of living behind a global accessor, which keeps multi-partition-
//! in-one-process configurations and tests straightforward.

use std::collections::BTreeMap;

use tracing::trace;

use crate::activity::{Activity, ActivityKind, Event};
use crate::config::ConfigError;
use crate::error::{SimError, SimResult};
use crate::link::{Link, LinkSpec, LinkTable};
use crate::queue::{ActivityQueue, SyncQueue, TimeVortex};
use crate::types::{LinkId, Rank, Seq, SimTime};

/// Lifecycle phase of a partition.
///
/// Links are created while configuring; init data flows during init; the
/// run phase creates no new links and allows no binding changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Links and bindings are being created.
    Config,
    /// Init data is exchanged; the topology is frozen.
    Init,
    /// The dispatch loop is running.
    Run,
    /// The run loop has ended.
    Complete,
}

/// Per-partition scheduling state: clock, vortex, links and send buffers.
pub struct Scheduler {
    rank: Rank,
    num_ranks: u32,
    current_time: SimTime,
    next_seq: Seq,
    vortex: TimeVortex,
    links: LinkTable,
    sync_queues: BTreeMap<Rank, SyncQueue>,
    phase: Phase,
    events_sent: u64,
}

impl Scheduler {
    /// Creates a scheduler for one partition.
    pub fn new(rank: Rank, num_ranks: u32, vortex_capacity: Option<usize>) -> Self {
        let vortex = match vortex_capacity {
            Some(capacity) => TimeVortex::with_capacity_limit(capacity),
            None => TimeVortex::new(),
        };
        Self {
            rank,
            num_ranks,
            current_time: 0,
            next_seq: 0,
            vortex,
            links: LinkTable::new(),
            sync_queues: BTreeMap::new(),
            phase: Phase::Config,
            events_sent: 0,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn num_ranks(&self) -> u32 {
        self.num_ranks
    }

    /// The partition clock.
    pub fn now(&self) -> SimTime {
        self.current_time
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Events sent on links so far.
    pub fn events_sent(&self) -> u64 {
        self.events_sent
    }

    /// High-water mark of the vortex.
    pub fn vortex_peak(&self) -> usize {
        self.vortex.peak_len()
    }

    /// Pending activities in the vortex.
    pub fn vortex_len(&self) -> usize {
        self.vortex.len()
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    /// Looks up a link by id.
    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id)
    }

    /// The peer ranks this partition exchanges with, ascending.
    pub fn remote_ranks(&self) -> Vec<Rank> {
        self.sync_queues.keys().copied().collect()
    }

    /// The minimum latency over cross-partition links (the lookahead).
    pub fn min_remote_latency(&self) -> Option<SimTime> {
        self.links.min_remote_latency()
    }

    fn take_seq(&mut self) -> Seq {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Fresh sequence number for an activity scheduled by the caller.
    pub fn next_seq(&mut self) -> Seq {
        self.take_seq()
    }

    fn unknown_link(&self, link_id: LinkId) -> SimError {
        SimError::UnknownLink {
            rank: self.rank,
            link_id,
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Registers a link on this partition.
    ///
    /// Cross-partition links must name a valid foreign rank and a non-zero
    /// latency; both are checked here, at configuration time.
    pub fn add_link(&mut self, spec: LinkSpec) -> SimResult<()> {
        if self.phase != Phase::Config {
            return Err(SimError::WrongPhase {
                op: "add_link",
                phase: self.phase,
            });
        }
        if let Some(peer) = spec.peer {
            if peer >= self.num_ranks || peer == self.rank {
                return Err(ConfigError::BadPeerRank {
                    link_id: spec.id,
                    peer,
                    rank: self.rank,
                    num_ranks: self.num_ranks,
                }
                .into());
            }
            if spec.latency == 0 {
                return Err(ConfigError::ZeroLatencyRemoteLink { link_id: spec.id }.into());
            }
            self.sync_queues.entry(peer).or_default();
        }
        let id = spec.id;
        if !self.links.insert(Link::new(spec)) {
            return Err(ConfigError::DuplicateLink { link_id: id }.into());
        }
        Ok(())
    }

    /// Binds a link's local endpoint to a named handler.
    pub fn bind_handler(&mut self, link_id: LinkId, handler: impl Into<String>) -> SimResult<()> {
        if self.phase != Phase::Config {
            return Err(SimError::WrongPhase {
                op: "bind_handler",
                phase: self.phase,
            });
        }
        let err = self.unknown_link(link_id);
        let link = self.links.get_mut(link_id).ok_or(err)?;
        link.bind_handler(handler);
        Ok(())
    }

    /// Binds a link's local endpoint to polling delivery.
    pub fn bind_polling(&mut self, link_id: LinkId) -> SimResult<()> {
        if self.phase != Phase::Config {
            return Err(SimError::WrongPhase {
                op: "bind_polling",
                phase: self.phase,
            });
        }
        let err = self.unknown_link(link_id);
        let link = self.links.get_mut(link_id).ok_or(err)?;
        link.bind_polling();
        Ok(())
    }

    /// Freezes the topology: Config → Init.
    pub(crate) fn finalize(&mut self) -> SimResult<()> {
        if self.phase != Phase::Config {
            return Err(SimError::WrongPhase {
                op: "finalize",
                phase: self.phase,
            });
        }
        self.phase = Phase::Init;
        Ok(())
    }

    /// Init → Run.
    pub(crate) fn begin_run(&mut self) -> SimResult<()> {
        if self.phase != Phase::Init {
            return Err(SimError::WrongPhase {
                op: "begin_run",
                phase: self.phase,
            });
        }
        self.phase = Phase::Run;
        Ok(())
    }

    pub(crate) fn complete(&mut self) {
        self.phase = Phase::Complete;
    }

    // ------------------------------------------------------------------
    // Sending and receiving
    // ------------------------------------------------------------------

    /// Sends an event on a link.
    ///
    /// The delivery time is `now + max(latency, delay)`: a delay below the
    /// link latency clamps silently to the latency. The event routes to the
    /// peer's sync queue when the far endpoint is remote, to the link's
    /// polling queue when the local far endpoint polls, and into the vortex
    /// otherwise. Sends issued before the run phase seed the initial
    /// activity of the simulation.
    pub fn send(
        &mut self,
        link_id: LinkId,
        delay: SimTime,
        payload: serde_json::Value,
    ) -> SimResult<()> {
        if self.phase == Phase::Complete {
            return Err(SimError::WrongPhase {
                op: "send",
                phase: self.phase,
            });
        }
        let (delivery_time, peer, polled) = {
            let err = self.unknown_link(link_id);
            let link = self.links.get(link_id).ok_or(err)?;
            (
                link.delivery_time(self.current_time, delay),
                link.peer(),
                link.is_polled(),
            )
        };
        let seq = self.take_seq();
        let activity = Activity::event(delivery_time, seq, Event::new(link_id, payload));
        self.events_sent += 1;
        trace!(
            rank = self.rank,
            link_id,
            delivery_time,
            seq,
            remote = peer.is_some(),
            "send"
        );

        match peer {
            Some(rank) => self
                .sync_queues
                .entry(rank)
                .or_default()
                .insert(activity),
            None if polled => {
                let err = self.unknown_link(link_id);
                let link = self.links.get_mut(link_id).ok_or(err)?;
                match link.polled_queue_mut() {
                    Some(queue) => queue.insert(activity),
                    None => Ok(()),
                }
            }
            None => self.vortex.insert(activity),
        }
    }

    /// Polls a link for a ready event.
    ///
    /// Valid only for polled links. Returns the front event iff its
    /// delivery time is at or before the partition clock.
    pub fn recv(&mut self, link_id: LinkId) -> SimResult<Option<Event>> {
        let now = self.current_time;
        let err = self.unknown_link(link_id);
        let link = self.links.get_mut(link_id).ok_or(err)?;
        let queue = link
            .polled_queue_mut()
            .ok_or(SimError::NotPolled { link_id })?;
        let ready = queue
            .front()
            .map(|a| a.delivery_time() <= now)
            .unwrap_or(false);
        if !ready {
            return Ok(None);
        }
        match queue.pop().map(Activity::into_kind) {
            Some(ActivityKind::Event(ev)) => Ok(Some(ev)),
            // Polling queues only ever hold events.
            _ => Ok(None),
        }
    }

    /// Queues init data on a link. Init phase only.
    ///
    /// For a remote peer the item is buffered until the init exchange; for
    /// a local link it is delivered to the link's inbox immediately.
    pub fn send_init_data(&mut self, link_id: LinkId, payload: serde_json::Value) -> SimResult<()> {
        if self.phase != Phase::Init {
            return Err(SimError::WrongPhase {
                op: "send_init_data",
                phase: self.phase,
            });
        }
        let err = self.unknown_link(link_id);
        let link = self.links.get_mut(link_id).ok_or(err)?;
        let event = Event::new(link_id, payload);
        if link.is_remote() {
            link.push_init_outbox(event);
        } else {
            link.push_init_inbox(event);
        }
        Ok(())
    }

    /// Collects one pending init-data item from a link, if any.
    pub fn recv_init_data(&mut self, link_id: LinkId) -> SimResult<Option<Event>> {
        let err = self.unknown_link(link_id);
        let link = self.links.get_mut(link_id).ok_or(err)?;
        Ok(link.pop_init_inbox())
    }

    // ------------------------------------------------------------------
    // Queue plumbing for the run loop and the barrier
    // ------------------------------------------------------------------

    /// Schedules an activity into the vortex.
    pub fn insert_activity(&mut self, activity: Activity) -> SimResult<()> {
        if activity.delivery_time() < self.current_time {
            return Err(SimError::TimeRegress {
                delivery_time: activity.delivery_time(),
                now: self.current_time,
            });
        }
        self.vortex.insert(activity)
    }

    pub(crate) fn pop_activity(&mut self) -> Option<Activity> {
        self.vortex.pop()
    }

    /// Advances the partition clock. Never regresses.
    pub(crate) fn advance_to(&mut self, time: SimTime) -> SimResult<()> {
        if time < self.current_time {
            return Err(SimError::TimeRegress {
                delivery_time: time,
                now: self.current_time,
            });
        }
        self.current_time = time;
        Ok(())
    }

    /// Delivers an event received from a peer partition.
    ///
    /// The delivery time must not be behind the local clock (guaranteed by
    /// the conservative barrier; a violation is a fatal protocol error).
    /// The event is re-stamped with a fresh local sequence number in
    /// arrival order, so cross-source ties at the same cycle and priority
    /// follow local insertion order.
    pub(crate) fn deliver_event(&mut self, delivery_time: SimTime, ev: Event) -> SimResult<()> {
        let link_id = ev.link_id;
        if !self.links.contains(link_id) {
            return Err(self.unknown_link(link_id));
        }
        if delivery_time < self.current_time {
            return Err(SimError::StaleDelivery {
                link_id,
                delivery_time,
                now: self.current_time,
            });
        }
        let seq = self.take_seq();
        let activity = Activity::event(delivery_time, seq, ev);
        let err = self.unknown_link(link_id);
        let link = self.links.get_mut(link_id).ok_or(err)?;
        match link.polled_queue_mut() {
            Some(queue) => queue.insert(activity),
            None => self.vortex.insert(activity),
        }
    }

    /// Delivers an init-data item received from a peer partition. The link
    /// id is re-stamped by the receiving link.
    pub(crate) fn deliver_init(&mut self, mut ev: Event) -> SimResult<()> {
        let link_id = ev.link_id;
        let err = self.unknown_link(link_id);
        let link = self.links.get_mut(link_id).ok_or(err)?;
        ev.link_id = link.id();
        link.push_init_inbox(ev);
        Ok(())
    }

    /// Drains every remote link's pending init data, grouped by peer rank
    /// and wrapped as activities for the wire.
    pub(crate) fn drain_init_outboxes(&mut self) -> BTreeMap<Rank, Vec<Activity>> {
        let mut drained: Vec<(Rank, Vec<Event>)> = Vec::new();
        for link in self.links.iter_mut() {
            if let Some(peer) = link.peer() {
                let events = link.drain_init_outbox();
                if !events.is_empty() {
                    drained.push((peer, events));
                }
            }
        }
        let now = self.current_time;
        let mut batches: BTreeMap<Rank, Vec<Activity>> = BTreeMap::new();
        for (peer, events) in drained {
            for ev in events {
                let seq = self.take_seq();
                batches
                    .entry(peer)
                    .or_default()
                    .push(Activity::init_data(now, seq, ev));
            }
        }
        batches
    }

    /// The send buffer for one peer, serialisable in place.
    pub(crate) fn sync_queue(&self, peer: Rank) -> Option<&SyncQueue> {
        self.sync_queues.get(&peer)
    }

    /// Clears every per-peer send buffer after a successful exchange.
    pub(crate) fn clear_sync_queues(&mut self) {
        for queue in self.sync_queues.values_mut() {
            queue.clear();
        }
    }

    // ------------------------------------------------------------------
    // Checkpoint support
    // ------------------------------------------------------------------

    pub(crate) fn vortex_snapshot(&self) -> Vec<Activity> {
        self.vortex.snapshot()
    }

    pub(crate) fn sync_queue_snapshot(&self) -> Vec<(Rank, Vec<Activity>)> {
        self.sync_queues
            .iter()
            .map(|(rank, queue)| (*rank, queue.activities().iter().cloned().collect()))
            .collect()
    }

    pub(crate) fn next_seq_value(&self) -> Seq {
        self.next_seq
    }

    pub(crate) fn links_mut(&mut self) -> &mut LinkTable {
        &mut self.links
    }

    /// Rebuilds a scheduler from checkpointed state, resuming in the run
    /// phase.
    pub(crate) fn restore(
        rank: Rank,
        num_ranks: u32,
        vortex_capacity: Option<usize>,
        current_time: SimTime,
        next_seq: Seq,
    ) -> Self {
        let mut scheduler = Self::new(rank, num_ranks, vortex_capacity);
        scheduler.current_time = current_time;
        scheduler.next_seq = next_seq;
        scheduler.phase = Phase::Run;
        scheduler
    }

    /// Installs a link during restore, bypassing phase checks.
    pub(crate) fn install_link(&mut self, link: Link) -> SimResult<()> {
        if let Some(peer) = link.peer() {
            self.sync_queues.entry(peer).or_default();
        }
        let id = link.id();
        if !self.links.insert(link) {
            return Err(ConfigError::DuplicateLink { link_id: id }.into());
        }
        Ok(())
    }

    /// Installs a buffered cross-partition activity during restore.
    pub(crate) fn install_sync_activity(&mut self, peer: Rank, activity: Activity) -> SimResult<()> {
        self.sync_queues.entry(peer).or_default().insert(activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> Scheduler {
        Scheduler::new(0, 1, None)
    }

    #[test]
    fn test_send_applies_latency_clamp() {
        let mut sched = scheduler();
        sched.add_link(LinkSpec::new(1, 3)).unwrap();
        sched.bind_polling(1).unwrap();

        sched.send(1, 0, serde_json::json!("x")).unwrap();
        // delivery at t=3; not ready at t=0
        assert!(sched.recv(1).unwrap().is_none());

        sched.advance_to(3).unwrap();
        let ev = sched.recv(1).unwrap().unwrap();
        assert_eq!(ev.link_id, 1);
    }

    #[test]
    fn test_send_unknown_link() {
        let mut sched = scheduler();
        let err = sched.send(9, 0, serde_json::json!(null)).unwrap_err();
        assert!(matches!(err, SimError::UnknownLink { link_id: 9, .. }));
    }

    #[test]
    fn test_recv_on_handled_link_rejected() {
        let mut sched = scheduler();
        sched.add_link(LinkSpec::new(1, 1)).unwrap();
        sched.bind_handler(1, "h").unwrap();

        let err = sched.recv(1).unwrap_err();
        assert!(matches!(err, SimError::NotPolled { link_id: 1 }));
    }

    #[test]
    fn test_add_link_rejected_after_config() {
        let mut sched = scheduler();
        sched.finalize().unwrap();

        let err = sched.add_link(LinkSpec::new(1, 1)).unwrap_err();
        assert!(matches!(err, SimError::WrongPhase { op: "add_link", .. }));
    }

    #[test]
    fn test_zero_latency_remote_link_rejected() {
        let mut sched = Scheduler::new(0, 2, None);
        let err = sched.add_link(LinkSpec::new(1, 0).with_peer(1)).unwrap_err();
        assert!(matches!(
            err,
            SimError::Config(ConfigError::ZeroLatencyRemoteLink { link_id: 1 })
        ));
    }

    #[test]
    fn test_bad_peer_rank_rejected() {
        let mut sched = Scheduler::new(0, 2, None);
        assert!(sched.add_link(LinkSpec::new(1, 1).with_peer(5)).is_err());
        // A link cannot target its own rank.
        assert!(sched.add_link(LinkSpec::new(2, 1).with_peer(0)).is_err());
    }

    #[test]
    fn test_remote_send_lands_in_sync_queue() {
        let mut sched = Scheduler::new(0, 2, None);
        sched.add_link(LinkSpec::new(1, 4).with_peer(1)).unwrap();

        sched.send(1, 4, serde_json::json!(1)).unwrap();
        let queue = sched.sync_queue(1).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.activities()[0].delivery_time(), 4);
        assert_eq!(sched.vortex_len(), 0);
    }

    #[test]
    fn test_deliver_event_stale_is_fatal() {
        let mut sched = scheduler();
        sched.add_link(LinkSpec::new(1, 1)).unwrap();
        sched.advance_to(10).unwrap();

        let err = sched
            .deliver_event(5, Event::new(1, serde_json::json!(null)))
            .unwrap_err();
        assert!(matches!(
            err,
            SimError::StaleDelivery {
                link_id: 1,
                delivery_time: 5,
                now: 10
            }
        ));
    }

    #[test]
    fn test_deliver_event_unknown_link_is_fatal() {
        let mut sched = scheduler();
        let err = sched
            .deliver_event(5, Event::new(3, serde_json::json!(null)))
            .unwrap_err();
        assert!(matches!(err, SimError::UnknownLink { link_id: 3, .. }));
    }

    #[test]
    fn test_clock_never_regresses() {
        let mut sched = scheduler();
        sched.advance_to(10).unwrap();
        assert!(matches!(
            sched.advance_to(5),
            Err(SimError::TimeRegress { .. })
        ));
    }

    #[test]
    fn test_same_cycle_insert_is_legal() {
        let mut sched = scheduler();
        sched.advance_to(10).unwrap();
        let seq = sched.next_seq();
        sched
            .insert_activity(Activity::stop(10, seq))
            .unwrap();
        assert_eq!(sched.pop_activity().unwrap().delivery_time(), 10);
    }

    #[test]
    fn test_init_data_local_loopback() {
        let mut sched = scheduler();
        sched.add_link(LinkSpec::new(1, 1)).unwrap();
        sched.finalize().unwrap();

        sched.send_init_data(1, serde_json::json!("boot")).unwrap();
        let ev = sched.recv_init_data(1).unwrap().unwrap();
        assert_eq!(ev.payload, serde_json::json!("boot"));
        assert!(sched.recv_init_data(1).unwrap().is_none());
    }

    #[test]
    fn test_init_data_outside_init_phase_rejected() {
        let mut sched = scheduler();
        sched.add_link(LinkSpec::new(1, 1)).unwrap();

        let err = sched.send_init_data(1, serde_json::json!(null)).unwrap_err();
        assert!(matches!(err, SimError::WrongPhase { .. }));
    }
}
