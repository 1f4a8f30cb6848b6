//! Multi-node highway tests

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use v2x_highway::coordination::{
    CoordinationConfig, FaultProfile, Highway, Lane, Role, VehicleId,
};

#[test]
fn test_random_traffic_is_placed_on_the_track() {
    let mut highway = Highway::new_with_seed(CoordinationConfig::default(), 7);
    highway.spawn_random_traffic(5).unwrap();

    assert_eq!(highway.nodes().len(), 5);
    for node in highway.nodes() {
        let state = node.state();
        assert!((0.0..1500.0).contains(&state.position));
        assert!((20.0..30.0).contains(&state.speed));
        assert_eq!(state.role, Role::Normal);
    }
    assert!(highway.node("V1").is_some());
    assert!(highway.node("V5").is_some());
}

#[test]
fn test_duplicate_vehicle_id_is_rejected() {
    let mut highway = Highway::new(CoordinationConfig::default());
    highway.add_vehicle("V1", Lane::CRUISE, 0.0, 20.0, Role::Normal).unwrap();

    assert!(highway.add_vehicle("V1", Lane::FAST, 100.0, 20.0, Role::Normal).is_err());
    assert!(highway.add_vehicle("", Lane::FAST, 100.0, 20.0, Role::Normal).is_err());
}

#[test]
fn test_every_node_tracks_every_peer() {
    let mut highway = Highway::new_with_seed(CoordinationConfig::default(), 11);
    highway.spawn_random_traffic(5).unwrap();

    for _ in 0..50 {
        highway.tick(0.1);
    }

    assert_eq!(highway.stats.ticks, 50);
    assert_eq!(highway.stats.messages_malformed, 0);
    for node in highway.nodes() {
        assert_eq!(node.registry().len(), 4, "{} is missing peers", node.id());
        assert!(node.state().speed >= 0.0);
        assert!(node.state().lane.index() <= 3);
    }
}

#[test]
fn test_seeded_runs_are_reproducible() {
    let run = |seed: u64| {
        let mut highway = Highway::new_with_seed(CoordinationConfig::default(), seed);
        highway.spawn_random_traffic(6).unwrap();
        for _ in 0..100 {
            highway.tick(0.1);
        }
        highway
            .nodes()
            .iter()
            .map(|node| node.state().clone())
            .collect::<Vec<_>>()
    };

    assert_eq!(run(3), run(3));
}

#[test]
fn test_registries_never_go_back_in_time_under_faults() {
    let faults = FaultProfile {
        duplicate_rate: 0.3,
        delay_rate: 0.3,
        drop_rate: 0.1,
    };
    let mut highway = Highway::new_with_seed(CoordinationConfig::default(), 5).with_faults(faults);
    highway.spawn_random_traffic(4).unwrap();

    let mut latest: HashMap<(VehicleId, VehicleId), u64> = HashMap::new();
    for _ in 0..80 {
        highway.tick(0.1);

        for node in highway.nodes() {
            for record in node.registry().snapshot().iter() {
                let key = (node.id().clone(), record.state.id.clone());
                let previous = latest.insert(key, record.state.timestamp_ms).unwrap_or(0);
                assert!(
                    record.state.timestamp_ms >= previous,
                    "{} regressed its view of {}",
                    node.id(),
                    record.state.id
                );
            }
        }
    }
}

#[test]
fn test_ambulance_reaches_every_vehicle() {
    let mut highway = Highway::new_with_seed(CoordinationConfig::default(), 9);
    highway.spawn_random_traffic(3).unwrap();
    highway.node("V1").unwrap().control().spawn_emergency();

    highway.tick(0.1);
    highway.tick(0.1);

    let ambulance = VehicleId::new("AMB-V1");
    for node in highway.nodes().iter().filter(|node| node.id().as_str() != "V1") {
        let record = node.registry().get(&ambulance).expect("ambulance should be known");
        assert!(record.state.is_active_emergency());
    }
}

#[test]
fn test_threaded_run_steps_every_node() {
    let mut highway = Highway::new_with_seed(CoordinationConfig::default(), 1);
    highway.spawn_random_traffic(3).unwrap();

    let stop = AtomicBool::new(false);
    let counts = highway
        .run_threaded(Duration::from_millis(2), 20, &stop)
        .unwrap();

    assert_eq!(counts, vec![20, 20, 20]);
    assert_eq!(highway.stats.ticks, 20);
    for node in highway.nodes() {
        assert_eq!(node.clock_ms(), 40);
    }
}
