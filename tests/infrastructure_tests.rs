//! Infrastructure reactor tests: adaptive headlights and street lighting

use v2x_highway::coordination::{
    CoordinationConfig, HeadlightMode, InfrastructureReactor, Lane, PeerRegistry, Role, SegmentId,
    VehicleId, VehicleState,
};

fn vehicle(id: &str, lane: Lane, position: f32) -> VehicleState {
    VehicleState::new(VehicleId::new(id), lane, position, 20.0, Role::Normal)
}

struct Road {
    reactor: InfrastructureReactor,
    registry: PeerRegistry,
    clock: u64,
}

impl Road {
    fn new() -> Self {
        Self {
            reactor: InfrastructureReactor::new(&CoordinationConfig::default()),
            registry: PeerRegistry::default(),
            clock: 0,
        }
    }

    fn place(&mut self, mut peer: VehicleState) {
        self.clock += 1;
        peer.timestamp_ms = self.clock;
        self.registry.upsert(peer, self.clock);
    }

    fn clear(&mut self) {
        self.clock += 1;
        self.registry.evict_stale(self.clock + 1, 0);
    }

    fn update(&mut self, local: &VehicleState) -> HeadlightMode {
        let snapshot = self.registry.snapshot();
        self.reactor.update(local, &snapshot)
    }
}

#[test]
fn test_headlights_start_high() {
    let road = Road::new();
    assert_eq!(road.reactor.headlight(), HeadlightMode::High);
}

#[test]
fn test_oncoming_vehicle_dips_headlights() {
    let mut road = Road::new();
    let local = vehicle("ME", Lane::CRUISE, 500.0);

    assert_eq!(road.update(&local), HeadlightMode::High);

    road.place(vehicle("ONCOMING", Lane::OPPOSITE, 700.0));
    assert_eq!(road.update(&local), HeadlightMode::Low);

    // Once it has passed us the high beams come back
    road.place(vehicle("ONCOMING", Lane::OPPOSITE, 450.0));
    assert_eq!(road.update(&local), HeadlightMode::High);
}

#[test]
fn test_same_direction_traffic_keeps_high_beams() {
    let mut road = Road::new();
    let local = vehicle("ME", Lane::CRUISE, 500.0);

    road.place(vehicle("AHEAD", Lane::FAST, 550.0));
    assert_eq!(road.update(&local), HeadlightMode::High);
}

#[test]
fn test_headlights_do_not_flicker_at_the_boundary() {
    let mut road = Road::new();
    let local = vehicle("ME", Lane::CRUISE, 500.0);

    road.place(vehicle("ONCOMING", Lane::OPPOSITE, 810.0));
    assert_eq!(road.update(&local), HeadlightMode::High);

    road.place(vehicle("ONCOMING", Lane::OPPOSITE, 790.0));
    assert_eq!(road.update(&local), HeadlightMode::Low);

    // Just outside the visibility distance but inside the band
    road.place(vehicle("ONCOMING", Lane::OPPOSITE, 815.0));
    assert_eq!(road.update(&local), HeadlightMode::Low);

    road.place(vehicle("ONCOMING", Lane::OPPOSITE, 830.0));
    assert_eq!(road.update(&local), HeadlightMode::High);
}

#[test]
fn test_headlights_return_high_when_peer_disappears() {
    let mut road = Road::new();
    let local = vehicle("ME", Lane::CRUISE, 500.0);

    road.place(vehicle("ONCOMING", Lane::OPPOSITE, 600.0));
    assert_eq!(road.update(&local), HeadlightMode::Low);

    road.clear();
    assert!(road.registry.is_empty());
    assert_eq!(road.update(&local), HeadlightMode::High);
}

#[test]
fn test_segments_are_laid_along_the_track() {
    let road = Road::new();
    let segments = road.reactor.segments();
    assert_eq!(segments.len(), 10);
    assert_eq!(segments[3].id, SegmentId(3));
    assert_eq!(segments[3].position, 600.0);
}

#[test]
fn test_street_light_follows_the_vehicle() {
    let mut road = Road::new();

    // 50m before segment 1
    road.update(&vehicle("ME", Lane::CRUISE, 150.0));
    assert_eq!(road.reactor.active_segments(), vec![SegmentId(1)]);

    // Passing under it
    road.update(&vehicle("ME", Lane::CRUISE, 215.0));
    assert!(road.reactor.is_lit(SegmentId(1)));

    // Past the segment but within the trailing distance
    road.update(&vehicle("ME", Lane::CRUISE, 260.0));
    assert!(road.reactor.is_lit(SegmentId(1)));

    // Lead distance of the next segment reached, trailing distance left
    road.update(&vehicle("ME", Lane::CRUISE, 300.0));
    assert_eq!(road.reactor.active_segments(), vec![SegmentId(2)]);
}

#[test]
fn test_street_light_needs_a_vehicle_inside_the_activation_zone() {
    let mut road = Road::new();

    // Already 50m past segment 1 without having lit it
    road.update(&vehicle("ME", Lane::CRUISE, 250.0));
    assert!(!road.reactor.is_lit(SegmentId(1)));
}

#[test]
fn test_peers_light_segments_too() {
    let mut road = Road::new();
    road.place(vehicle("PEER", Lane::FAST, 1150.0));
    // Reverse heading: approaching segment 8 from above
    road.place(vehicle("ONCOMING", Lane::OPPOSITE, 1650.0));

    road.update(&vehicle("ME", Lane::CRUISE, 550.0));
    assert_eq!(
        road.reactor.active_segments(),
        vec![SegmentId(3), SegmentId(6), SegmentId(8)]
    );
}
