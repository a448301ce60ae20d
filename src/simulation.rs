//! The simulation worker.
//!
//! One [`Simulation`] drives one partition: it owns the scheduler, the
//! handler table, the clock callbacks, the barrier and the transport, and
//! runs the dispatch loop — pop the next activity, advance the clock,
//! execute. Within a partition execution is strictly single-threaded and
//! cooperative: a handler runs to completion before anything else
//! dispatches, and handlers communicate only by sending further events.

use std::collections::HashMap;

use tracing::{debug, error, info, trace};

use crate::activity::{Activity, ActivityKind, Event};
use crate::checkpoint::{BarrierState, BindingState, CheckpointState, LinkState};
use crate::config::{ConfigError, SimConfig};
use crate::error::{SimError, SimResult};
use crate::link::{Link, LinkSpec};
use crate::queue::ActivityQueue;
use crate::registry::HandlerRegistry;
use crate::scheduler::{Phase, Scheduler};
use crate::stats::{RunSummary, SimulationStats};
use crate::sync::SyncBarrier;
use crate::transport::Transport;
use crate::types::{LinkId, Rank, SimTime};

/// Callback invoked when an event reaches a handled link.
///
/// Handlers receive the scheduler so they can read the clock and send
/// further events; they must not block.
pub type LinkHandler = Box<dyn FnMut(&mut Scheduler, Event) -> SimResult<()> + Send>;

/// Callback invoked on each tick of a registered clock.
pub type ClockHandler = Box<dyn FnMut(&mut Scheduler, SimTime) -> SimResult<()> + Send>;

/// One partition's simulation worker.
pub struct Simulation {
    scheduler: Scheduler,
    handlers: HashMap<String, LinkHandler>,
    clocks: Vec<Option<ClockHandler>>,
    barrier: Option<SyncBarrier>,
    transport: Option<Box<dyn Transport>>,
    config: SimConfig,
    stats: SimulationStats,
    init_exchanged: bool,
}

impl Simulation {
    /// Creates a single-partition simulation.
    pub fn single(config: SimConfig) -> SimResult<Self> {
        config.validate()?;
        if config.partition_count != 1 {
            return Err(ConfigError::MissingTransport.into());
        }
        Ok(Self::build(config, 0, None))
    }

    /// Creates one partition of a partitioned simulation. The rank comes
    /// from the transport endpoint.
    pub fn partitioned(config: SimConfig, transport: Box<dyn Transport>) -> SimResult<Self> {
        config.validate()?;
        if transport.num_ranks() != config.partition_count {
            return Err(ConfigError::RankCountMismatch {
                transport_ranks: transport.num_ranks(),
                partition_count: config.partition_count,
            }
            .into());
        }
        let rank = transport.rank();
        Ok(Self::build(config, rank, Some(transport)))
    }

    fn build(config: SimConfig, rank: Rank, transport: Option<Box<dyn Transport>>) -> Self {
        let scheduler = Scheduler::new(rank, config.partition_count, config.vortex_capacity);
        Self {
            scheduler,
            handlers: HashMap::new(),
            clocks: Vec::new(),
            barrier: None,
            transport,
            config,
            stats: SimulationStats::default(),
            init_exchanged: false,
        }
    }

    pub fn rank(&self) -> Rank {
        self.scheduler.rank()
    }

    /// The partition clock.
    pub fn now(&self) -> SimTime {
        self.scheduler.now()
    }

    pub fn phase(&self) -> Phase {
        self.scheduler.phase()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Registers a link. Config phase only.
    pub fn add_link(&mut self, spec: LinkSpec) -> SimResult<()> {
        self.scheduler.add_link(spec)
    }

    /// Binds a link to a handler, registered under `name`. A link is
    /// either handled or polled; re-binding after finalise is an error.
    pub fn set_handler(
        &mut self,
        link_id: LinkId,
        name: impl Into<String>,
        handler: LinkHandler,
    ) -> SimResult<()> {
        let name = name.into();
        self.scheduler.bind_handler(link_id, name.clone())?;
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Binds a link to polling delivery (the default).
    pub fn set_polling(&mut self, link_id: LinkId) -> SimResult<()> {
        self.scheduler.bind_polling(link_id)
    }

    /// Registers a recurring clock. The first tick fires one period from
    /// the current cycle. Returns the clock's slot index.
    ///
    /// On restore, clocks must be re-registered in the same order they
    /// were registered originally; the slot index is what a checkpointed
    /// tick refers back to.
    pub fn add_clock(&mut self, period: SimTime, handler: ClockHandler) -> SimResult<usize> {
        if period == 0 {
            return Err(ConfigError::ZeroClockPeriod.into());
        }
        let slot = self.clocks.len();
        self.clocks.push(Some(handler));
        let seq = self.scheduler.next_seq();
        self.scheduler
            .insert_activity(Activity::clock(self.scheduler.now() + period, seq, slot, period))?;
        Ok(slot)
    }

    /// Schedules a stop action. The run loop ends once it dispatches,
    /// after all other work of the same cycle.
    pub fn schedule_stop(&mut self, at: SimTime) -> SimResult<()> {
        let seq = self.scheduler.next_seq();
        self.scheduler.insert_activity(Activity::stop(at, seq))
    }

    /// Freezes the configuration and validates it: every handled link has
    /// a registered handler, and for partitioned runs the barrier period
    /// respects the minimum cross-partition latency (the lookahead).
    pub fn finalize(&mut self) -> SimResult<()> {
        for link in self.scheduler.links().iter() {
            if let Some(name) = link.handler_name() {
                if !self.handlers.contains_key(name) {
                    return Err(ConfigError::UnboundHandler {
                        link_id: link.id(),
                        handler: name.to_string(),
                    }
                    .into());
                }
            }
        }

        if self.config.partition_count > 1 {
            let period = self.config.sync_period.ok_or(ConfigError::MissingSyncPeriod)?;
            if let Some(min_latency) = self.scheduler.min_remote_latency() {
                if period > min_latency {
                    return Err(ConfigError::SyncPeriodTooLong {
                        period,
                        min_latency,
                    }
                    .into());
                }
            }
            let first_fire = self.scheduler.now() + period;
            let seq = self.scheduler.next_seq();
            self.scheduler
                .insert_activity(Activity::barrier(first_fire, seq))?;
            self.barrier = Some(SyncBarrier::new(period, first_fire));
        }

        if let Some(stop_at) = self.config.stop_at {
            self.schedule_stop(stop_at)?;
        }

        self.scheduler.finalize()?;
        info!(
            rank = self.rank(),
            links = self.scheduler.links().len(),
            partitions = self.config.partition_count,
            "configuration finalised"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Init phase
    // ------------------------------------------------------------------

    /// Sends init data on a link. Init phase only; remote items are
    /// buffered until [`Simulation::exchange_init_data`].
    pub fn send_init_data(&mut self, link_id: LinkId, payload: serde_json::Value) -> SimResult<()> {
        self.scheduler.send_init_data(link_id, payload)
    }

    /// Collects one pending init-data item from a link.
    pub fn recv_init_data(&mut self, link_id: LinkId) -> SimResult<Option<Event>> {
        self.scheduler.recv_init_data(link_id)
    }

    /// Runs the one-shot init-data exchange with the peer partitions.
    ///
    /// All partitions must call this the same number of times; `run`
    /// performs it automatically if it has not happened yet.
    pub fn exchange_init_data(&mut self) -> SimResult<()> {
        if self.scheduler.phase() != Phase::Init {
            return Err(SimError::WrongPhase {
                op: "exchange_init_data",
                phase: self.scheduler.phase(),
            });
        }
        if let (Some(barrier), Some(transport)) =
            (self.barrier.as_mut(), self.transport.as_mut())
        {
            barrier.exchange_init_data(&mut self.scheduler, transport.as_mut())?;
        }
        self.init_exchanged = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sending and receiving
    // ------------------------------------------------------------------

    /// Sends an event on a link; see [`Scheduler::send`]. Sends issued
    /// before `run` seed the initial activity.
    pub fn send(&mut self, link_id: LinkId, delay: SimTime, payload: serde_json::Value) -> SimResult<()> {
        self.scheduler.send(link_id, delay, payload)
    }

    /// Polls a link for a ready event; see [`Scheduler::recv`].
    pub fn recv(&mut self, link_id: LinkId) -> SimResult<Option<Event>> {
        self.scheduler.recv(link_id)
    }

    // ------------------------------------------------------------------
    // The run loop
    // ------------------------------------------------------------------

    /// Runs the partition until the vortex drains or a stop action fires.
    ///
    /// Fatal errors (protocol violations, handler failures, vortex
    /// overflow) flush the run summary before propagating; there is no
    /// retry.
    pub fn run(&mut self) -> SimResult<RunSummary> {
        match self.scheduler.phase() {
            Phase::Init => {
                if !self.init_exchanged {
                    self.exchange_init_data()?;
                }
                self.scheduler.begin_run()?;
                info!(rank = self.rank(), "run phase started");
            }
            Phase::Run => {}
            phase => {
                return Err(SimError::WrongPhase { op: "run", phase });
            }
        }

        let result = self.run_loop();
        self.stats.final_time = self.scheduler.now();
        self.stats.events_sent = self.scheduler.events_sent();
        self.stats.peak_vortex_len = self.scheduler.vortex_peak();

        match result {
            Ok(()) => {
                self.scheduler.complete();
                info!(
                    rank = self.rank(),
                    final_time = self.stats.final_time,
                    events = self.stats.events_dispatched,
                    ticks = self.stats.clock_ticks,
                    barriers = self.stats.barriers_executed,
                    "run complete"
                );
                Ok(self.stats.summary())
            }
            Err(e) => {
                error!(
                    rank = self.rank(),
                    final_time = self.stats.final_time,
                    events = self.stats.events_dispatched,
                    error = %e,
                    "run aborted"
                );
                Err(e)
            }
        }
    }

    fn run_loop(&mut self) -> SimResult<()> {
        while let Some(activity) = self.scheduler.pop_activity() {
            let time = activity.delivery_time();
            self.scheduler.advance_to(time)?;
            match activity.into_kind() {
                ActivityKind::Event(ev) => self.dispatch_event(ev)?,
                ActivityKind::InitData(ev) => {
                    return Err(SimError::MisroutedInitData { link_id: ev.link_id });
                }
                ActivityKind::Clock { slot, period } => self.dispatch_clock(slot, period)?,
                ActivityKind::Barrier => {
                    self.stats.barriers_executed += 1;
                    if let (Some(barrier), Some(transport)) =
                        (self.barrier.as_mut(), self.transport.as_mut())
                    {
                        let outcome = barrier.execute(&mut self.scheduler, transport.as_mut())?;
                        self.stats.events_shipped += outcome.sent as u64;
                        self.stats.events_received += outcome.received as u64;
                    }
                }
                ActivityKind::Stop => {
                    debug!(rank = self.rank(), time, "stop action fired");
                    break;
                }
            }
        }
        Ok(())
    }

    fn dispatch_event(&mut self, ev: Event) -> SimResult<()> {
        self.stats.events_dispatched += 1;
        let link_id = ev.link_id;
        let handler_name = {
            let link = self.scheduler.link(link_id).ok_or(SimError::UnknownLink {
                rank: self.scheduler.rank(),
                link_id,
            })?;
            match link.handler_name() {
                Some(name) => name.to_string(),
                None => {
                    // Locally sent events to a polled link never enter the
                    // vortex, so this indicates corrupted state.
                    return Err(SimError::Handler {
                        link_id,
                        message: "event dispatched to a polled link".to_string(),
                    });
                }
            }
        };
        let mut handler =
            self.handlers
                .remove(&handler_name)
                .ok_or_else(|| SimError::Handler {
                    link_id,
                    message: format!("no handler registered under '{handler_name}'"),
                })?;
        trace!(
            rank = self.scheduler.rank(),
            link_id,
            time = self.scheduler.now(),
            "dispatch event"
        );
        let result = handler(&mut self.scheduler, ev);
        self.handlers.insert(handler_name, handler);
        result
    }

    fn dispatch_clock(&mut self, slot: usize, period: SimTime) -> SimResult<()> {
        self.stats.clock_ticks += 1;
        let mut handler = self
            .clocks
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or_else(|| SimError::ClockHandler {
                slot,
                message: "no callback registered for this slot".to_string(),
            })?;
        let now = self.scheduler.now();
        let result = handler(&mut self.scheduler, now);
        self.clocks[slot] = Some(handler);
        result?;

        let seq = self.scheduler.next_seq();
        self.scheduler
            .insert_activity(Activity::clock(now + period, seq, slot, period))
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    /// The counters accumulated so far.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// Exports statistics as JSON.
    pub fn export_stats(&self) -> serde_json::Value {
        let mut stats = self.stats.clone();
        stats.events_sent = self.scheduler.events_sent();
        stats.peak_vortex_len = self.scheduler.vortex_peak();
        serde_json::json!({
            "rank": self.rank(),
            "partitions": self.scheduler.num_ranks(),
            "phase": format!("{:?}", self.scheduler.phase()),
            "current_time": self.scheduler.now(),
            "pending_activities": self.scheduler.vortex_len(),
            "stats": stats,
        })
    }

    // ------------------------------------------------------------------
    // Checkpointing
    // ------------------------------------------------------------------

    /// Captures the partition state. Valid once the run phase has begun
    /// (including after the run has completed, the usual capture point).
    pub fn checkpoint(&self) -> SimResult<CheckpointState> {
        match self.scheduler.phase() {
            Phase::Run | Phase::Complete => {}
            phase => return Err(SimError::WrongPhase { op: "checkpoint", phase }),
        }

        let links = self
            .scheduler
            .links()
            .iter()
            .map(|link| LinkState {
                spec: link.spec().clone(),
                binding: match link.handler_name() {
                    Some(name) => BindingState::Handled {
                        handler: name.to_string(),
                    },
                    None => BindingState::Polled,
                },
                pending: link
                    .polled_queue()
                    .map(|q| q.snapshot())
                    .unwrap_or_default(),
                init_outbox: link.init_outbox().to_vec(),
                init_inbox: link.init_inbox().to_vec(),
            })
            .collect();

        Ok(CheckpointState {
            current_time: self.scheduler.now(),
            next_seq: self.scheduler.next_seq_value(),
            vortex: self.scheduler.vortex_snapshot(),
            links,
            sync_queues: self.scheduler.sync_queue_snapshot(),
            barrier: self.barrier.as_ref().map(|b| BarrierState {
                period: b.period(),
                next_fire: b.next_fire(),
                exchange_count: b.exchange_count(),
            }),
            clock_count: self.clocks.len(),
        })
    }

    /// Rebuilds a partition from a checkpoint, resuming in the run phase.
    ///
    /// Handlers re-bind by registry name; clock callbacks must arrive in
    /// their original registration order. The transport is rebuilt from
    /// configuration, never restored. A `stop_at` in the new configuration
    /// is scheduled if it is still ahead of the restored clock.
    pub fn restore(
        config: SimConfig,
        state: CheckpointState,
        registry: &HandlerRegistry,
        clocks: Vec<ClockHandler>,
        transport: Option<Box<dyn Transport>>,
    ) -> SimResult<Self> {
        config.validate()?;
        if config.partition_count > 1 && transport.is_none() {
            return Err(ConfigError::MissingTransport.into());
        }
        if let Some(transport) = transport.as_ref() {
            if transport.num_ranks() != config.partition_count {
                return Err(ConfigError::RankCountMismatch {
                    transport_ranks: transport.num_ranks(),
                    partition_count: config.partition_count,
                }
                .into());
            }
        }
        if clocks.len() != state.clock_count {
            return Err(ConfigError::ClockCountMismatch {
                expected: state.clock_count,
                got: clocks.len(),
            }
            .into());
        }

        let rank = transport.as_ref().map(|t| t.rank()).unwrap_or(0);
        let mut scheduler = Scheduler::restore(
            rank,
            config.partition_count,
            config.vortex_capacity,
            state.current_time,
            state.next_seq,
        );

        let mut handlers: HashMap<String, LinkHandler> = HashMap::new();
        for link_state in state.links {
            let mut link = Link::new(link_state.spec);
            match link_state.binding {
                BindingState::Handled { handler } => {
                    if !handlers.contains_key(&handler) {
                        let instance =
                            registry
                                .create(&handler)
                                .ok_or_else(|| ConfigError::UnboundHandler {
                                    link_id: link.id(),
                                    handler: handler.clone(),
                                })?;
                        handlers.insert(handler.clone(), instance);
                    }
                    link.bind_handler(handler);
                }
                BindingState::Polled => {}
            }
            link.restore_init_buffers(link_state.init_outbox, link_state.init_inbox);
            let id = link.id();
            scheduler.install_link(link)?;
            if !link_state.pending.is_empty() {
                if let Some(queue) = scheduler
                    .links_mut()
                    .get_mut(id)
                    .and_then(|l| l.polled_queue_mut())
                {
                    for activity in link_state.pending {
                        queue.insert(activity)?;
                    }
                }
            }
        }

        for activity in state.vortex {
            scheduler.insert_activity(activity)?;
        }
        for (peer, activities) in state.sync_queues {
            for activity in activities {
                scheduler.install_sync_activity(peer, activity)?;
            }
        }

        let barrier = state
            .barrier
            .map(|b| SyncBarrier::restore(b.period, b.next_fire, b.exchange_count));

        let mut sim = Self {
            scheduler,
            handlers,
            clocks: clocks.into_iter().map(Some).collect(),
            barrier,
            transport,
            config,
            stats: SimulationStats::default(),
            init_exchanged: true,
        };

        if let Some(stop_at) = sim.config.stop_at {
            if stop_at >= sim.scheduler.now() {
                sim.schedule_stop(stop_at)?;
            }
        }
        info!(rank = sim.rank(), time = sim.now(), "restored from checkpoint");
        Ok(sim)
    }
}
