//! Coordination loop tests
//!
//! Nodes are wired to an in-process broker and stepped by hand, so every
//! tick boundary is under the test's control.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use v2x_highway::coordination::{
    encode, AlertFlag, CoordinationConfig, CoordinationError, Decision, HeadlightMode,
    InMemoryBroker, Lane, Role, SharedFatigueFlag, VehicleId, VehicleNode, VehicleState,
};

const DT: f32 = 0.1;

fn node_on(broker: &InMemoryBroker, id: &str, lane: Lane, position: f32, speed: f32) -> VehicleNode {
    let state = VehicleState::new(VehicleId::new(id), lane, position, speed, Role::Normal);
    VehicleNode::new(state, CoordinationConfig::default(), Box::new(broker.connect()))
}

fn peer_message(id: &str, lane: Lane, position: f32, speed: f32, timestamp_ms: u64) -> Vec<u8> {
    let mut state = VehicleState::new(VehicleId::new(id), lane, position, speed, Role::Normal);
    state.timestamp_ms = timestamp_ms;
    encode(&state)
}

#[test]
fn test_node_ignores_its_own_broadcasts() {
    let broker = InMemoryBroker::new();
    let mut node = node_on(&broker, "V1", Lane::CRUISE, 100.0, 20.0);

    node.tick(DT);
    let report = node.tick(DT);

    assert_eq!(report.received, 1);
    assert_eq!(report.ignored, 1);
    assert!(node.registry().is_empty());
}

#[test]
fn test_nodes_learn_about_each_other() {
    let broker = InMemoryBroker::new();
    let mut a = node_on(&broker, "A", Lane::CRUISE, 100.0, 20.0);
    let mut b = node_on(&broker, "B", Lane::FAST, 600.0, 25.0);

    a.tick(DT);
    let report = b.tick(DT);
    assert_eq!(report.accepted, 1);
    a.tick(DT);

    let seen_by_a = a.registry().get(&VehicleId::new("B")).expect("A should know B");
    assert_eq!(seen_by_a.state.lane, Lane::FAST);
    let seen_by_b = b.registry().get(&VehicleId::new("A")).expect("B should know A");
    assert_eq!(seen_by_b.state.lane, Lane::CRUISE);
}

#[test]
fn test_state_advances_and_is_timestamped() {
    let broker = InMemoryBroker::new();
    let mut node = node_on(&broker, "V1", Lane::CRUISE, 1999.0, 20.0);

    node.tick(DT);

    let state = node.state();
    assert_eq!(state.timestamp_ms, 100);
    assert_eq!(node.clock_ms(), 100);
    // Accelerating towards the cruise speed, wrapped past the end of the loop
    assert!(state.speed > 20.0);
    assert!(state.position < 10.0);
}

#[test]
fn test_malformed_payload_is_dropped_and_tick_continues() {
    let broker = InMemoryBroker::new();
    let mut node = node_on(&broker, "V1", Lane::CRUISE, 100.0, 20.0);

    let inbound = node.inbound();
    inbound.push(b"{not telemetry".to_vec());
    inbound.push(peer_message("V2", Lane::FAST, 900.0, 20.0, 5));

    let report = node.tick(DT);

    assert_eq!(report.received, 2);
    assert_eq!(report.malformed, 1);
    assert_eq!(report.accepted, 1);
    assert!(node.registry().contains(&VehicleId::new("V2")));
}

#[test]
fn test_close_leader_slows_the_node_down() {
    let broker = InMemoryBroker::new();
    let mut node = node_on(&broker, "ME", Lane::CRUISE, 80.0, 20.0);
    node.inbound().push(peer_message("LEAD", Lane::CRUISE, 100.0, 10.0, 1));

    node.tick(DT);

    assert!(node.decision().braking);
    assert!(node.decision().target_speed < 20.0);
    assert!(node.state().speed < 20.0);
    assert!(node.state().alerts.contains(AlertFlag::Braking));
}

#[test]
fn test_requested_lane_change_is_applied() {
    let broker = InMemoryBroker::new();
    let mut node = node_on(&broker, "ME", Lane::CRUISE, 500.0, 20.0);

    node.control().request_lane_change(Lane::OPPOSITE);
    let report = node.tick(DT);

    assert!(report.deferred.is_none());
    assert_eq!(node.decision().target_lane, Lane::OPPOSITE);
    assert_eq!(node.state().lane, Lane::OPPOSITE);
}

#[test]
fn test_unsafe_lane_request_is_deferred_not_queued() {
    let broker = InMemoryBroker::new();
    let mut node = node_on(&broker, "ME", Lane::CRUISE, 500.0, 20.0);
    node.inbound().push(peer_message("BLOCK", Lane::FAST, 505.0, 20.0, 1));

    node.control().request_lane_change(Lane::FAST);
    let report = node.tick(DT);

    assert!(matches!(report.deferred, Some(CoordinationError::NoSafeLane { .. })));
    assert_eq!(node.state().lane, Lane::CRUISE);

    // Not retried on the following tick
    let report = node.tick(DT);
    assert!(report.deferred.is_none());
    assert_eq!(node.state().lane, Lane::CRUISE);
}

#[test]
fn test_lane_changes_respect_cooldown() {
    let broker = InMemoryBroker::new();
    let mut node = node_on(&broker, "ME", Lane::CRUISE, 500.0, 20.0);

    node.control().request_lane_change(Lane::FAST);
    node.tick(DT);
    assert_eq!(node.state().lane, Lane::FAST);

    node.control().request_lane_change(Lane::CRUISE);
    let report = node.tick(DT);
    assert_eq!(node.state().lane, Lane::FAST);
    assert!(matches!(
        report.deferred,
        Some(CoordinationError::LaneChangeCooldown {
            current: Lane::FAST,
            requested: Lane::CRUISE,
        })
    ));

    // The blocked request is dropped, not replayed once the cooldown ends
    for _ in 0..20 {
        assert!(node.tick(DT).deferred.is_none());
    }
    assert_eq!(node.state().lane, Lane::FAST);
}

#[test]
fn test_speed_delta_changes_cruise_speed_within_limits() {
    let broker = InMemoryBroker::new();
    let mut node = node_on(&broker, "ME", Lane::CRUISE, 500.0, 20.0);
    let control = node.control();

    control.request_speed_delta(5.0);
    control.request_speed_delta(5.0);
    node.tick(DT);
    assert_eq!(node.cruise_speed(), 35.0);

    control.request_speed_delta(-1000.0);
    node.tick(DT);
    assert_eq!(node.cruise_speed(), 0.0);

    control.request_speed_delta(1000.0);
    node.tick(DT);
    assert_eq!(node.cruise_speed(), node.config().max_speed);
}

#[test]
fn test_fatigue_forces_the_service_lane() {
    let broker = InMemoryBroker::new();
    let fatigue = SharedFatigueFlag::new();
    let mut node = node_on(&broker, "ME", Lane::CRUISE, 500.0, 25.0)
        .with_fatigue(Box::new(fatigue.clone()));

    fatigue.set(true);
    node.control().request_lane_change(Lane::FAST);
    node.tick(DT);

    assert!(node.is_drowsy());
    assert!(node.state().is_drowsy());
    assert_eq!(node.decision().target_lane, Lane::SERVICE);
    assert_eq!(node.state().lane, Lane::OPPOSITE);

    for _ in 0..60 {
        node.tick(DT);
        assert_eq!(node.decision().target_lane, Lane::SERVICE);
    }

    assert_eq!(node.state().lane, Lane::SERVICE);
    assert_eq!(node.state().speed, 0.0);
    assert!(node.decision().braking);

    fatigue.set(false);
    node.tick(DT);
    assert!(!node.is_drowsy());
    assert!(!node.state().is_drowsy());
}

#[test]
fn test_manual_drowsy_toggle() {
    let broker = InMemoryBroker::new();
    let mut node = node_on(&broker, "ME", Lane::CRUISE, 500.0, 25.0);

    node.control().toggle_drowsy();
    node.tick(DT);
    assert!(node.is_drowsy());
    assert_eq!(node.decision().target_lane, Lane::SERVICE);

    node.control().toggle_drowsy();
    node.tick(DT);
    assert!(!node.is_drowsy());
}

#[test]
fn test_peers_see_the_drowsy_flag() {
    let broker = InMemoryBroker::new();
    let mut sleepy = node_on(&broker, "SLEEPY", Lane::CRUISE, 500.0, 25.0);
    let mut other = node_on(&broker, "OTHER", Lane::FAST, 100.0, 25.0);

    sleepy.control().toggle_drowsy();
    sleepy.tick(DT);
    other.tick(DT);

    let record = other
        .registry()
        .get(&VehicleId::new("SLEEPY"))
        .expect("peer should be known");
    assert!(record.state.is_drowsy());
}

#[test]
fn test_silent_peer_is_evicted() {
    let broker = InMemoryBroker::new();
    let mut a = node_on(&broker, "A", Lane::CRUISE, 100.0, 20.0);
    let mut b = node_on(&broker, "B", Lane::FAST, 900.0, 20.0);

    b.tick(DT);
    a.tick(DT);
    assert!(a.registry().contains(&VehicleId::new("B")));

    let mut evicted = Vec::new();
    for _ in 0..35 {
        evicted.extend(a.tick(DT).evicted);
    }

    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].id, VehicleId::new("B"));
    assert!(!a.registry().contains(&VehicleId::new("B")));
}

#[test]
fn test_lost_transport_degrades_to_safe_stop() {
    let broker = InMemoryBroker::new();
    let mut node = node_on(&broker, "ME", Lane::CRUISE, 500.0, 20.0);

    broker.set_online(false);

    let report = node.tick(DT);
    assert!(matches!(
        report.transport_error,
        Some(CoordinationError::TransportUnavailable(_))
    ));
    assert!(!report.degraded);

    let mut last = report;
    for _ in 0..60 {
        last = node.tick(DT);
    }
    assert!(last.degraded);
    assert!(node.dashboard().degraded);
    assert_eq!(*node.decision(), Decision::safe_stop(Lane::CRUISE));
    assert_eq!(node.state().speed, 0.0);
    assert_eq!(node.state().lane, Lane::CRUISE);

    broker.set_online(true);
    let recovering = node.tick(DT);
    assert!(recovering.transport_error.is_none());

    let recovered = node.tick(DT);
    assert!(!recovered.degraded);
    assert!(!node.dashboard().degraded);
}

#[test]
fn test_failed_subscription_degrades_even_while_publishing() {
    let broker = InMemoryBroker::new();
    let config = CoordinationConfig {
        topic_prefix: "v2x/+x".to_string(),
        ..CoordinationConfig::default()
    };
    let state = VehicleState::new(VehicleId::new("ME"), Lane::CRUISE, 500.0, 25.0, Role::Normal);
    let mut node = VehicleNode::new(state, config.clone(), Box::new(broker.connect()));
    let stopped = VehicleState::new(VehicleId::new("P"), Lane::CRUISE, 510.0, 0.0, Role::Normal);
    let mut peer = VehicleNode::new(stopped, config, Box::new(broker.connect()));

    let mut last = node.tick(DT);
    assert!(matches!(
        last.transport_error,
        Some(CoordinationError::TransportUnavailable(_))
    ));

    for _ in 0..100 {
        peer.tick(DT);
        last = node.tick(DT);
    }

    assert!(node.registry().is_empty());
    assert!(last.degraded);
    assert_eq!(*node.decision(), Decision::safe_stop(Lane::CRUISE));
    assert_eq!(node.state().speed, 0.0);
    assert_eq!(node.state().lane, Lane::CRUISE);
}

#[test]
fn test_node_started_offline_subscribes_later() {
    let broker = InMemoryBroker::new();
    broker.set_online(false);
    let mut node = node_on(&broker, "ME", Lane::CRUISE, 500.0, 20.0);
    let mut peer = node_on(&broker, "PEER", Lane::FAST, 100.0, 20.0);

    broker.set_online(true);
    node.tick(DT);
    peer.tick(DT);
    node.tick(DT);

    assert!(node.registry().contains(&VehicleId::new("PEER")));
}

#[test]
fn test_spawned_emergency_vehicle_is_broadcast_and_stood_down() {
    let broker = InMemoryBroker::new();
    let mut owner = node_on(&broker, "A", Lane::CRUISE, 500.0, 20.0);
    let mut other = node_on(&broker, "B", Lane::CRUISE, 1500.0, 20.0);

    owner.control().spawn_emergency();
    owner.tick(DT);

    let ev = owner.owned_emergency().expect("emergency vehicle should exist").clone();
    assert_eq!(ev.id, VehicleId::new("AMB-A"));
    assert_eq!(ev.role, Role::Emergency);
    assert_eq!(ev.lane, Lane::FAST);
    assert!(ev.is_active_emergency());

    other.tick(DT);
    let seen = other.registry().get(&ev.id).expect("B should see the ambulance");
    assert!(seen.state.is_active_emergency());

    // The owner never tracks its own ambulance as a peer
    owner.tick(DT);
    assert!(!owner.registry().contains(&ev.id));

    owner.control().clear_emergency();
    owner.tick(DT);
    assert!(owner.owned_emergency().is_none());

    other.tick(DT);
    let seen = other.registry().get(&ev.id).expect("B keeps the last broadcast");
    assert!(!seen.state.is_active_emergency());
}

#[test]
fn test_vehicle_yields_to_emergency_from_behind() {
    let broker = InMemoryBroker::new();
    let ambulance = VehicleState::new(VehicleId::new("AMB"), Lane::CRUISE, 420.0, 30.0, Role::Emergency);
    let mut ev = VehicleNode::new(ambulance, CoordinationConfig::default(), Box::new(broker.connect()));
    let mut car = node_on(&broker, "CAR", Lane::CRUISE, 500.0, 20.0);

    ev.tick(DT);
    car.tick(DT);

    let view = car.dashboard();
    assert_eq!(view.yielding_to, Some(VehicleId::new("AMB")));
    assert_eq!(view.state.lane, Lane::FAST);
}

#[test]
fn test_dashboard_mirrors_accessors() {
    let broker = InMemoryBroker::new();
    let mut node = node_on(&broker, "ME", Lane::CRUISE, 500.0, 20.0);
    node.inbound().push(peer_message("ONCOMING", Lane::OPPOSITE, 600.0, 20.0, 1));

    node.tick(DT);
    let view = node.dashboard();

    assert_eq!(&view.state, node.state());
    assert_eq!(&view.decision, node.decision());
    assert_eq!(view.headlight, HeadlightMode::Low);
    assert_eq!(view.headlight, node.headlight());
    assert_eq!(view.decision.headlight, HeadlightMode::Low);
    assert_eq!(view.active_street_lights, node.active_street_lights());
    assert_eq!(view.peer_count, 1);
    assert!(view.owned_emergency.is_none());
}

#[test]
fn test_run_stops_after_max_ticks() {
    let broker = InMemoryBroker::new();
    let mut node = node_on(&broker, "ME", Lane::CRUISE, 500.0, 20.0);
    let stop = AtomicBool::new(false);

    let ticks = node.run(&stop, Duration::from_millis(1), Some(5));
    assert_eq!(ticks, 5);
    assert_eq!(node.clock_ms(), 5);
}

#[test]
fn test_run_honours_stop_signal() {
    let broker = InMemoryBroker::new();
    let mut node = node_on(&broker, "ME", Lane::CRUISE, 500.0, 20.0);

    let stop = AtomicBool::new(true);
    assert_eq!(node.run(&stop, Duration::from_millis(1), None), 0);

    let stop = std::sync::Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let handle = std::thread::spawn(move || node.run(&flag, Duration::from_millis(2), None));

    std::thread::sleep(Duration::from_millis(50));
    stop.store(true, Ordering::Relaxed);

    let ticks = handle.join().expect("node thread should finish");
    assert!(ticks > 0);
}
