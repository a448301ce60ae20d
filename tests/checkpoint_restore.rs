//! Checkpoint round-trip: serialising mid-run, restoring, and continuing
//! must reproduce the same event trace as a run that was never interrupted.

use std::sync::Arc;

use parking_lot::Mutex;

use lockstep::{
    CheckpointState, HandlerRegistry, LinkSpec, SimConfig, SimTime, Simulation,
};

type Trace = Arc<Mutex<Vec<(SimTime, String, i64)>>>;

/// A self-perpetuating event chain on link 1 plus a recurring clock, enough
/// traffic that a divergence after restore would show.
fn chain_handler(trace: Trace) -> lockstep::LinkHandler {
    Box::new(move |scheduler, ev| {
        let value = ev.payload.as_i64().unwrap_or(0);
        trace.lock().push((scheduler.now(), "event".to_string(), value));
        if scheduler.now() < 95 {
            scheduler.send(1, 3, serde_json::json!(value + 1))?;
        }
        Ok(())
    })
}

fn tick_handler(trace: Trace) -> lockstep::ClockHandler {
    Box::new(move |_scheduler, now| {
        trace.lock().push((now, "tick".to_string(), 0));
        Ok(())
    })
}

fn configure(sim: &mut Simulation, trace: &Trace) {
    sim.add_link(LinkSpec::new(1, 2)).unwrap();
    sim.set_handler(1, "chain", chain_handler(Arc::clone(trace))).unwrap();
    sim.add_clock(7, tick_handler(Arc::clone(trace))).unwrap();
}

fn uninterrupted_run() -> Vec<(SimTime, String, i64)> {
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    let mut sim = Simulation::single(SimConfig::single().with_stop_at(100)).unwrap();
    configure(&mut sim, &trace);
    sim.finalize().unwrap();
    sim.send(1, 2, serde_json::json!(0)).unwrap();
    sim.run().unwrap();

    let result = trace.lock().clone();
    result
}

fn interrupted_run() -> Vec<(SimTime, String, i64)> {
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));

    // First leg: run to t=50 and capture.
    let mut sim = Simulation::single(SimConfig::single().with_stop_at(50)).unwrap();
    configure(&mut sim, &trace);
    sim.finalize().unwrap();
    sim.send(1, 2, serde_json::json!(0)).unwrap();
    let summary = sim.run().unwrap();
    assert_eq!(summary.final_time, 50);

    let state = sim.checkpoint().unwrap();
    drop(sim);

    // Second leg: rebuild from the serialised bytes and continue to t=100.
    let bytes = state.to_json_vec().unwrap();
    let state = CheckpointState::from_json_slice(&bytes).unwrap();

    let mut registry = HandlerRegistry::new();
    let restored_trace = Arc::clone(&trace);
    registry.register("chain", move || chain_handler(Arc::clone(&restored_trace)));

    let mut sim = Simulation::restore(
        SimConfig::single().with_stop_at(100),
        state,
        &registry,
        vec![tick_handler(Arc::clone(&trace))],
        None,
    )
    .unwrap();
    assert_eq!(sim.now(), 50);
    let summary = sim.run().unwrap();
    assert_eq!(summary.final_time, 100);

    let result = trace.lock().clone();
    result
}

#[test]
fn test_restored_run_matches_uninterrupted_trace() {
    let reference = uninterrupted_run();
    let restored = interrupted_run();

    assert!(!reference.is_empty());
    assert_eq!(reference, restored);
}

#[test]
fn test_checkpoint_preserves_polled_backlog() {
    let mut sim = Simulation::single(SimConfig::single().with_stop_at(5)).unwrap();
    sim.add_link(LinkSpec::new(1, 10)).unwrap();
    sim.finalize().unwrap();
    // Delivered at t=10, after the stop: still pending at capture time.
    sim.send(1, 10, serde_json::json!("backlog")).unwrap();
    sim.run().unwrap();

    let state = sim.checkpoint().unwrap();
    assert_eq!(state.links.len(), 1);
    assert_eq!(state.links[0].pending.len(), 1);

    let registry = HandlerRegistry::new();
    let mut sim = Simulation::restore(
        SimConfig::single().with_stop_at(20),
        state,
        &registry,
        Vec::new(),
        None,
    )
    .unwrap();
    sim.run().unwrap();

    // The restored clock reached t=20 via the stop action, so the t=10
    // backlog item is ready to poll.
    let ev = sim.scheduler_mut().recv(1).unwrap().expect("backlog item");
    assert_eq!(ev.payload, serde_json::json!("backlog"));
}
