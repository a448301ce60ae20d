//! Multi-partition-in-one-process execution.
//!
//! Spawns one worker thread per partition over a shared [`MemoryTransport`]
//! hub. Every worker blocks inside the barrier exchange, so each partition
//! gets a dedicated thread for the whole run rather than a slot in a work-
//! stealing pool.

use std::thread;

use parking_lot::Mutex;
use tracing::info;

use crate::config::SimConfig;
use crate::error::{SimError, SimResult};
use crate::simulation::Simulation;
use crate::stats::RunSummary;
use crate::transport::{MemoryTransport, Transport};

/// Builds, finalises and runs every partition of a simulation, in parallel.
///
/// `setup` is called once per partition with a freshly created
/// [`Simulation`]; it registers that rank's links, handlers and clocks
/// (dispatching on `sim.rank()`), and may seed initial events. The runner
/// then finalises each partition, performs the init exchange and runs to
/// completion.
///
/// Returns one [`RunSummary`] per rank. If any partition fails, the first
/// failure by rank is returned; peers of a failed partition surface as
/// transport disconnections rather than hanging at the barrier.
///
/// # Example
///
/// ```no_run
/// use lockstep::config::SimConfig;
/// use lockstep::runner::run_partitioned;
///
/// let config = SimConfig::partitioned(2, 4).with_stop_at(100);
/// let summaries = run_partitioned(config, |sim| {
///     // register links and handlers for sim.rank()
///     Ok(())
/// })
/// .unwrap();
/// assert_eq!(summaries.len(), 2);
/// ```
pub fn run_partitioned<F>(config: SimConfig, setup: F) -> SimResult<Vec<RunSummary>>
where
    F: Fn(&mut Simulation) -> SimResult<()> + Send + Sync,
{
    config.validate()?;
    let num_ranks = config.partition_count;
    info!(partitions = num_ranks, "starting partitioned run");

    let endpoints = MemoryTransport::hub(num_ranks);
    let results: Mutex<Vec<Option<SimResult<RunSummary>>>> =
        Mutex::new((0..num_ranks).map(|_| None).collect());

    thread::scope(|scope| {
        for transport in endpoints {
            let rank = transport.rank() as usize;
            let config = config.clone();
            let setup = &setup;
            let results = &results;
            scope.spawn(move || {
                let outcome = (|| {
                    let mut sim = Simulation::partitioned(config, Box::new(transport))?;
                    setup(&mut sim)?;
                    sim.finalize()?;
                    sim.run()
                })();
                results.lock()[rank] = Some(outcome);
            });
        }
    });

    let mut summaries = Vec::with_capacity(num_ranks as usize);
    let mut first_error: Option<SimError> = None;
    for (rank, slot) in results.into_inner().into_iter().enumerate() {
        match slot {
            Some(Ok(summary)) => summaries.push(summary),
            Some(Err(e)) => {
                // Prefer the root cause over downstream disconnections.
                let is_disconnect = matches!(e, SimError::Transport(_));
                match &first_error {
                    None => first_error = Some(e),
                    Some(existing) if matches!(existing, SimError::Transport(_)) && !is_disconnect => {
                        first_error = Some(e);
                    }
                    Some(_) => {}
                }
            }
            None => {
                first_error.get_or_insert(SimError::Handler {
                    link_id: 0,
                    message: format!("partition {rank} worker terminated without a result"),
                });
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(summaries),
    }
}
