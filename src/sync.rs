//! The partition barrier.
//!
//! Every partition schedules a [`SyncBarrier`] activity with the same period.
//! When it fires, all partitions exchange their buffered cross-partition
//! events in lockstep, re-insert the arrivals locally, and re-schedule the
//! barrier one period ahead. Because the period never exceeds the minimum
//! cross-partition link latency, an arrival can never land behind the
//! receiving partition's clock: this is the conservative lookahead
//! discipline, and a violation is a fatal protocol error, not something to
//! recover from.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::activity::{Activity, ActivityKind};
use crate::error::{SimError, SimResult};
use crate::scheduler::Scheduler;
use crate::transport::{Completion, Transport, BARRIER_TAG, INIT_TAG};
use crate::types::{Rank, SimTime};

/// State machine of the barrier, traversed in lockstep by every partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Between exchanges.
    Idle,
    /// Posting sends/receives and waiting for them to complete.
    Exchanging,
    /// Re-inserting received activities locally.
    Dispatching,
}

impl SyncState {
    fn name(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Exchanging => "exchanging",
            SyncState::Dispatching => "dispatching",
        }
    }
}

/// One peer's worth of wire payload for an exchange.
///
/// The exchange index lets a partition detect a peer that is running a
/// different barrier than itself, which would otherwise corrupt time
/// silently.
#[derive(Serialize, Deserialize)]
struct SyncBatch {
    exchange: u64,
    activities: Vec<Activity>,
}

/// Counts from one barrier execution, folded into the run statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExchangeOutcome {
    /// Activities shipped to peers.
    pub sent: usize,
    /// Activities received and re-inserted locally.
    pub received: usize,
}

/// The periodic exchange action shared by all partitions.
pub struct SyncBarrier {
    period: SimTime,
    next_fire: SimTime,
    exchange_count: u64,
    state: SyncState,
}

impl SyncBarrier {
    /// Creates a barrier that first fires at `first_fire` and recurs every
    /// `period` cycles. The caller schedules the matching activity.
    pub fn new(period: SimTime, first_fire: SimTime) -> Self {
        Self {
            period,
            next_fire: first_fire,
            exchange_count: 0,
            state: SyncState::Idle,
        }
    }

    /// Rebuilds a barrier from checkpointed state.
    pub(crate) fn restore(period: SimTime, next_fire: SimTime, exchange_count: u64) -> Self {
        Self {
            period,
            next_fire,
            exchange_count,
            state: SyncState::Idle,
        }
    }

    pub fn period(&self) -> SimTime {
        self.period
    }

    /// The cycle at which the barrier fires next.
    pub fn next_fire(&self) -> SimTime {
        self.next_fire
    }

    /// Completed exchanges so far.
    pub fn exchange_count(&self) -> u64 {
        self.exchange_count
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    fn decode_batch(&self, peer: Rank, payload: &[u8]) -> SimResult<SyncBatch> {
        let batch: SyncBatch =
            serde_json::from_slice(payload).map_err(|e| SimError::MalformedBatch {
                peer,
                message: e.to_string(),
            })?;
        if batch.exchange != self.exchange_count {
            return Err(SimError::BarrierDesync {
                peer,
                expected: self.exchange_count,
                got: batch.exchange,
                state: self.state.name(),
            });
        }
        Ok(batch)
    }

    /// Runs one barrier exchange.
    ///
    /// Posts a send and a receive per peer, waits for all of them, clears
    /// the local send buffers, re-inserts every arrival through its link's
    /// local delivery queue and re-schedules the barrier.
    pub fn execute(
        &mut self,
        scheduler: &mut Scheduler,
        transport: &mut dyn Transport,
    ) -> SimResult<ExchangeOutcome> {
        self.state = SyncState::Exchanging;
        let peers = scheduler.remote_ranks();
        let mut outcome = ExchangeOutcome::default();

        let mut requests = Vec::with_capacity(peers.len() * 2);
        for &peer in &peers {
            let activities: Vec<Activity> = scheduler
                .sync_queue(peer)
                .map(|q| q.activities().iter().cloned().collect())
                .unwrap_or_default();
            outcome.sent += activities.len();
            let batch = SyncBatch {
                exchange: self.exchange_count,
                activities,
            };
            let payload = serde_json::to_vec(&batch).map_err(|e| SimError::MalformedBatch {
                peer,
                message: e.to_string(),
            })?;
            requests.push(transport.isend(peer, BARRIER_TAG, payload)?);
            requests.push(transport.irecv(peer, BARRIER_TAG)?);
        }

        let completions = transport.wait_all(requests)?;
        scheduler.clear_sync_queues();

        self.state = SyncState::Dispatching;
        for completion in completions {
            let (peer, payload) = match completion {
                Completion::Received { peer, payload, .. } => (peer, payload),
                Completion::Sent { .. } => continue,
            };
            let batch = self.decode_batch(peer, &payload)?;
            trace!(
                rank = scheduler.rank(),
                peer,
                arrivals = batch.activities.len(),
                "barrier arrivals"
            );
            for activity in batch.activities {
                let delivery_time = activity.delivery_time();
                match activity.into_kind() {
                    ActivityKind::Event(ev) => {
                        scheduler.deliver_event(delivery_time, ev)?;
                        outcome.received += 1;
                    }
                    other => {
                        return Err(SimError::MalformedBatch {
                            peer,
                            message: format!("unexpected activity kind {other:?} in barrier batch"),
                        });
                    }
                }
            }
        }

        self.exchange_count += 1;
        self.state = SyncState::Idle;
        self.next_fire = scheduler.now() + self.period;
        let seq = scheduler.next_seq();
        scheduler.insert_activity(Activity::barrier(self.next_fire, seq))?;

        debug!(
            rank = scheduler.rank(),
            exchange = self.exchange_count - 1,
            sent = outcome.sent,
            received = outcome.received,
            next_fire = self.next_fire,
            "barrier exchange complete"
        );
        Ok(outcome)
    }

    /// Runs the one-shot init-data exchange, before the run phase.
    ///
    /// Every remote link's pending init items travel to the peer on the
    /// init tag; arrivals are re-delivered through the receiving link with
    /// the link id re-stamped by the receiver.
    pub fn exchange_init_data(
        &mut self,
        scheduler: &mut Scheduler,
        transport: &mut dyn Transport,
    ) -> SimResult<usize> {
        self.state = SyncState::Exchanging;
        let peers = scheduler.remote_ranks();
        let mut batches = scheduler.drain_init_outboxes();

        let mut requests = Vec::with_capacity(peers.len() * 2);
        for &peer in &peers {
            let activities = batches.remove(&peer).unwrap_or_default();
            let batch = SyncBatch {
                exchange: self.exchange_count,
                activities,
            };
            let payload = serde_json::to_vec(&batch).map_err(|e| SimError::MalformedBatch {
                peer,
                message: e.to_string(),
            })?;
            requests.push(transport.isend(peer, INIT_TAG, payload)?);
            requests.push(transport.irecv(peer, INIT_TAG)?);
        }

        let completions = transport.wait_all(requests)?;

        self.state = SyncState::Dispatching;
        let mut received = 0;
        for completion in completions {
            let (peer, payload) = match completion {
                Completion::Received { peer, payload, .. } => (peer, payload),
                Completion::Sent { .. } => continue,
            };
            let batch = self.decode_batch(peer, &payload)?;
            for activity in batch.activities {
                match activity.into_kind() {
                    ActivityKind::InitData(ev) => {
                        scheduler.deliver_init(ev)?;
                        received += 1;
                    }
                    other => {
                        return Err(SimError::MalformedBatch {
                            peer,
                            message: format!("unexpected activity kind {other:?} in init batch"),
                        });
                    }
                }
            }
        }

        self.state = SyncState::Idle;
        debug!(rank = scheduler.rank(), received, "init exchange complete");
        Ok(received)
    }
}
