//! Two-partition scenarios over the in-process transport:
//! - Same-tick delivery immediately after a barrier exchange
//! - Cross-partition ping-pong over several barriers
//! - Init-data exchange with re-stamped link ids
//! - Lookahead validation at finalise
//! - Partitioned determinism

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use lockstep::{
    run_partitioned, ConfigError, LinkSpec, MemoryTransport, Rank, SimConfig, SimError, SimTime,
    Simulation, Transport,
};

type RankTraces = Arc<Mutex<HashMap<Rank, Vec<(SimTime, serde_json::Value)>>>>;

// ============================================================================
// Barrier delivery
// ============================================================================

#[test]
fn test_event_crosses_at_barrier_and_dispatches_same_tick() {
    let traces: RankTraces = Arc::new(Mutex::new(HashMap::new()));

    let config = SimConfig::partitioned(2, 4).with_stop_at(8);
    let setup_traces = Arc::clone(&traces);
    let summaries = run_partitioned(config, move |sim| {
        let rank = sim.rank();
        let peer = 1 - rank;
        sim.add_link(LinkSpec::new(1, 4).with_peer(peer))?;

        let sink = Arc::clone(&setup_traces);
        sim.set_handler(
            1,
            "sink",
            Box::new(move |scheduler, ev| {
                sink.lock()
                    .entry(scheduler.rank())
                    .or_default()
                    .push((scheduler.now(), ev.payload));
                Ok(())
            }),
        )?;

        if rank == 0 {
            // Sent at t=0 with delay 4: transfers at the t=4 barrier and
            // dispatches on rank 1 at t=4.
            sim.send(1, 4, serde_json::json!("e"))?;
        }
        Ok(())
    })
    .unwrap();

    let traces = traces.lock();
    assert_eq!(traces.get(&1).unwrap(), &vec![(4, serde_json::json!("e"))]);
    assert!(traces.get(&0).is_none());
    // Barriers at t=4 and t=8 on both ranks.
    for summary in &summaries {
        assert_eq!(summary.barriers_executed, 2);
        assert_eq!(summary.final_time, 8);
    }
}

#[test]
fn test_cross_partition_ping_pong() {
    let traces: RankTraces = Arc::new(Mutex::new(HashMap::new()));

    let config = SimConfig::partitioned(2, 4).with_stop_at(24);
    let setup_traces = Arc::clone(&traces);
    let summaries = run_partitioned(config, move |sim| {
        let rank = sim.rank();
        let peer = 1 - rank;
        // Link 1 carries rank 0 -> rank 1, link 2 the reverse; each side
        // registers both ids with its own view of the peer.
        sim.add_link(LinkSpec::new(1, 4).with_peer(peer))?;
        sim.add_link(LinkSpec::new(2, 4).with_peer(peer))?;

        let reply_on = if rank == 0 { 1 } else { 2 };
        let listen_on = if rank == 0 { 2 } else { 1 };
        let sink = Arc::clone(&setup_traces);
        sim.set_handler(
            listen_on,
            "bouncer",
            Box::new(move |scheduler, ev| {
                sink.lock()
                    .entry(scheduler.rank())
                    .or_default()
                    .push((scheduler.now(), ev.payload.clone()));
                let hop = ev.payload.as_i64().unwrap_or(0);
                scheduler.send(reply_on, 4, serde_json::json!(hop + 1))
            }),
        )?;

        if rank == 0 {
            sim.send(1, 4, serde_json::json!(0))?;
        }
        Ok(())
    })
    .unwrap();

    let traces = traces.lock();
    // Rank 1 hears hops 0, 2, 4 at t=4, 12, 20. Rank 0 hears 1, 3 at 8, 16,
    // plus hop 5 at t=24: the barrier and the delivered event both precede
    // the same-cycle stop.
    assert_eq!(
        traces.get(&1).unwrap(),
        &vec![
            (4, serde_json::json!(0)),
            (12, serde_json::json!(2)),
            (20, serde_json::json!(4)),
        ]
    );
    assert_eq!(
        traces.get(&0).unwrap(),
        &vec![
            (8, serde_json::json!(1)),
            (16, serde_json::json!(3)),
            (24, serde_json::json!(5)),
        ]
    );
    for summary in &summaries {
        assert_eq!(summary.final_time, 24);
        assert_eq!(summary.barriers_executed, 6);
    }
}

// ============================================================================
// Init-data exchange
// ============================================================================

#[test]
fn test_init_data_exchanges_and_restamps_link_ids() {
    let endpoints = MemoryTransport::hub(2);
    let config = SimConfig::partitioned(2, 4);

    let workers: Vec<_> = endpoints
        .into_iter()
        .map(|transport| {
            let config = config.clone();
            thread::spawn(move || {
                let rank = transport.rank();
                let peer = 1 - rank;
                let mut sim = Simulation::partitioned(config, Box::new(transport)).unwrap();
                sim.add_link(LinkSpec::new(1, 4).with_peer(peer)).unwrap();
                sim.finalize().unwrap();

                sim.send_init_data(1, serde_json::json!({ "from": rank })).unwrap();
                sim.exchange_init_data().unwrap();

                let ev = sim.recv_init_data(1).unwrap().expect("one init item");
                assert_eq!(ev.link_id, 1);
                assert_eq!(ev.payload, serde_json::json!({ "from": peer }));
                assert!(sim.recv_init_data(1).unwrap().is_none());
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
}

// ============================================================================
// Lookahead validation
// ============================================================================

#[test]
fn test_sync_period_longer_than_lookahead_rejected() {
    let mut endpoints = MemoryTransport::hub(2);
    let transport = endpoints.remove(0);
    // Period 4, but the only cross-partition link has latency 2.
    let config = SimConfig::partitioned(2, 4);
    let mut sim = Simulation::partitioned(config, Box::new(transport)).unwrap();
    sim.add_link(LinkSpec::new(1, 2).with_peer(1)).unwrap();

    let err = sim.finalize().unwrap_err();
    assert!(matches!(
        err,
        SimError::Config(ConfigError::SyncPeriodTooLong {
            period: 4,
            min_latency: 2
        })
    ));
}

// ============================================================================
// Partitioned determinism
// ============================================================================

fn partitioned_trace() -> HashMap<Rank, Vec<(SimTime, serde_json::Value)>> {
    let traces: RankTraces = Arc::new(Mutex::new(HashMap::new()));
    let config = SimConfig::partitioned(2, 4).with_stop_at(40);

    let setup_traces = Arc::clone(&traces);
    run_partitioned(config, move |sim| {
        let rank = sim.rank();
        let peer = 1 - rank;
        sim.add_link(LinkSpec::new(1, 4).with_peer(peer))?;
        sim.add_link(LinkSpec::new(2, 5).with_peer(peer))?;

        let listen_on = if rank == 0 { 2 } else { 1 };
        let reply_on = if rank == 0 { 1 } else { 2 };
        let sink = Arc::clone(&setup_traces);
        sim.set_handler(
            listen_on,
            "bouncer",
            Box::new(move |scheduler, ev| {
                sink.lock()
                    .entry(scheduler.rank())
                    .or_default()
                    .push((scheduler.now(), ev.payload.clone()));
                let hop = ev.payload.as_i64().unwrap_or(0);
                if hop < 20 {
                    scheduler.send(reply_on, 4, serde_json::json!(hop + 1))?;
                }
                Ok(())
            }),
        )?;

        if rank == 0 {
            sim.send(1, 4, serde_json::json!(0))?;
            sim.send(1, 6, serde_json::json!(100))?;
        }
        Ok(())
    })
    .unwrap();

    Arc::try_unwrap(traces).unwrap().into_inner()
}

#[test]
fn test_partitioned_runs_are_deterministic() {
    let first = partitioned_trace();
    let second = partitioned_trace();
    assert!(!first.is_empty());
    assert_eq!(first, second);
}
