//! The coordination loop of one vehicle node
//!
//! Every tick runs the same fixed sequence:
//! 1. drain inbound telemetry into the peer registry
//! 2. evict stale peers
//! 3. read staged control input and the fatigue signal
//! 4. arbiter -> emergency override -> infrastructure reactor
//! 5. apply the decision to the local vehicle
//! 6. publish the local state
//!
//! Nothing in a tick blocks on the network, and no error aborts a tick.

use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::arbiter::{Arbiter, LaneChangeIntent};
use super::codec;
use super::config::{secs_to_ms, CoordinationConfig};
use super::control::{ControlHandle, FatigueSignal, NoFatigue, StagedControl};
use super::emergency::EmergencyResolver;
use super::error::{CoordinationError, StalePeer, TransportError};
use super::infrastructure::{InfrastructureReactor, SegmentId};
use super::registry::{PeerRegistry, UpsertOutcome};
use super::topology::Track;
use super::transport::{InboundQueue, Transport};
use super::types::{AlertFlag, Decision, HeadlightMode, Lane, Role, VehicleId, VehicleState};

/// What happened during one tick
#[derive(Debug, Default)]
pub struct TickReport {
    /// Payloads taken off the inbound queue
    pub received: usize,
    /// Payloads accepted into the registry as new or newer state
    pub accepted: usize,
    /// Payloads ignored as duplicates, out of order, or our own echo
    pub ignored: usize,
    pub malformed: usize,
    pub evicted: Vec<StalePeer>,
    /// Lane change that could not be carried out this tick
    pub deferred: Option<CoordinationError>,
    /// Publish or subscribe failure this tick
    pub transport_error: Option<CoordinationError>,
    /// True when the node fell back to a safe stop for lack of peer data
    pub degraded: bool,
}

/// Read-only view for a dashboard or any other presentation layer
#[derive(Debug, Clone, PartialEq)]
pub struct Dashboard {
    pub state: VehicleState,
    pub decision: Decision,
    pub headlight: HeadlightMode,
    pub active_street_lights: Vec<SegmentId>,
    pub peer_count: usize,
    pub cruise_speed: f32,
    pub drowsy: bool,
    /// Emergency vehicle we are currently making way for
    pub yielding_to: Option<VehicleId>,
    /// Emergency vehicle dispatched by this node
    pub owned_emergency: Option<VehicleState>,
    pub degraded: bool,
}

/// An emergency vehicle spawned and driven by this node
struct OwnedEmergency {
    state: VehicleState,
    /// The ambulance's own view of the road, including the owning vehicle
    registry: PeerRegistry,
    lane_cooldown: f32,
    /// Publish once more with the emergency flag cleared, then drop
    standing_down: bool,
}

pub struct VehicleNode {
    config: CoordinationConfig,
    track: Track,

    /// The local vehicle; mutated only by the tick
    state: VehicleState,
    cruise_speed: f32,
    decision: Decision,
    lane_cooldown: f32,

    registry: PeerRegistry,
    arbiter: Arbiter,
    resolver: EmergencyResolver,
    reactor: InfrastructureReactor,

    transport: Box<dyn Transport>,
    inbound: InboundQueue,
    subscribed: bool,
    transport_down_since: Option<u64>,

    control: ControlHandle,
    fatigue: Box<dyn FatigueSignal>,
    manual_drowsy: bool,
    drowsy: bool,
    yielding_to: Option<VehicleId>,
    degraded: bool,

    emergency: Option<OwnedEmergency>,

    /// Local simulation clock in milliseconds
    clock_ms: u64,
}

impl VehicleNode {
    /// Create a node for `initial` and subscribe to every vehicle topic
    pub fn new(initial: VehicleState, config: CoordinationConfig, transport: Box<dyn Transport>) -> Self {
        let track = config.track();
        let mut state = initial;
        state.position = track.wrap(state.position);
        state.speed = state.speed.max(0.0);
        if state.role == Role::Emergency {
            state.alerts.insert(AlertFlag::EmergencyActive);
        }

        let cruise_speed = match state.role {
            Role::Normal => config.cruise_speed,
            Role::Emergency => config.emergency_cruise_speed,
        };

        let mut node = Self {
            track,
            decision: Decision::hold(&state),
            cruise_speed,
            lane_cooldown: 0.0,
            registry: PeerRegistry::new(track),
            arbiter: Arbiter::new(&config),
            resolver: EmergencyResolver::new(&config),
            reactor: InfrastructureReactor::new(&config),
            inbound: InboundQueue::new(config.inbound_queue_capacity),
            transport,
            subscribed: false,
            transport_down_since: None,
            control: ControlHandle::new(),
            fatigue: Box::new(NoFatigue),
            manual_drowsy: false,
            drowsy: false,
            yielding_to: None,
            degraded: false,
            emergency: None,
            clock_ms: 0,
            state,
            config,
        };

        if let Err(e) = node.ensure_subscribed() {
            warn!("{}: {}", node.state.id, e);
            node.transport_down_since = Some(0);
        }

        node
    }

    /// Replace the fatigue detector polled each tick
    pub fn with_fatigue(mut self, fatigue: Box<dyn FatigueSignal>) -> Self {
        self.fatigue = fatigue;
        self
    }

    pub fn id(&self) -> &VehicleId {
        &self.state.id
    }

    pub fn state(&self) -> &VehicleState {
        &self.state
    }

    pub fn decision(&self) -> &Decision {
        &self.decision
    }

    pub fn headlight(&self) -> HeadlightMode {
        self.reactor.headlight()
    }

    pub fn active_street_lights(&self) -> Vec<SegmentId> {
        self.reactor.active_segments()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &EmergencyResolver {
        &self.resolver
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Handle for staging control input from another component
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    /// The queue transport delivery writes into
    pub fn inbound(&self) -> InboundQueue {
        self.inbound.clone()
    }

    pub fn cruise_speed(&self) -> f32 {
        self.cruise_speed
    }

    pub fn is_drowsy(&self) -> bool {
        self.drowsy
    }

    pub fn owned_emergency(&self) -> Option<&VehicleState> {
        self.emergency.as_ref().map(|ev| &ev.state)
    }

    pub fn clock_ms(&self) -> u64 {
        self.clock_ms
    }

    pub fn dashboard(&self) -> Dashboard {
        Dashboard {
            state: self.state.clone(),
            decision: self.decision,
            headlight: self.reactor.headlight(),
            active_street_lights: self.reactor.active_segments(),
            peer_count: self.registry.len(),
            cruise_speed: self.cruise_speed,
            drowsy: self.drowsy,
            yielding_to: self.yielding_to.clone(),
            owned_emergency: self.owned_emergency().cloned(),
            degraded: self.degraded,
        }
    }

    fn ensure_subscribed(&mut self) -> Result<(), TransportError> {
        if self.subscribed {
            return Ok(());
        }
        self.transport
            .subscribe(&self.config.wildcard_topic(), self.inbound.clone())?;
        self.subscribed = true;
        debug!("{}: subscribed to {}", self.state.id, self.config.wildcard_topic());
        Ok(())
    }

    /// Our own vehicle or the ambulance we drive
    fn is_local(&self, id: &VehicleId) -> bool {
        *id == self.state.id
            || self
                .emergency
                .as_ref()
                .is_some_and(|ev| ev.state.id == *id)
    }

    /// Run one full coordination tick of `delta_secs`
    pub fn tick(&mut self, delta_secs: f32) -> TickReport {
        let delta_secs = if delta_secs.is_finite() { delta_secs.max(0.0) } else { 0.0 };
        self.clock_ms += secs_to_ms(delta_secs).max(1);
        let now = self.clock_ms;

        let mut report = TickReport::default();

        if let Err(e) = self.ensure_subscribed() {
            self.note_transport_failure(e, now, &mut report);
        }

        // (a) inbound telemetry
        self.drain_inbound(now, &mut report);

        // (b) staleness
        report.evicted = self
            .registry
            .evict_stale(now, self.config.peer_timeout_ms());

        // (c) external input
        let staged = self.control.take();
        self.apply_control(&staged);
        let fatigued = self.fatigue.is_fatigued();
        self.set_drowsy(fatigued || self.manual_drowsy);

        // (d) decision
        let decision = self.decide(staged.lane_request, now, &mut report);

        // (e) apply
        self.apply(decision, delta_secs, &mut report);
        self.drive_emergency(now, delta_secs);

        // (f) publish
        self.publish(now, &mut report);

        if let Some(err) = &report.deferred {
            debug!("{}: {}", self.state.id, err);
        }

        report
    }

    fn drain_inbound(&mut self, now: u64, report: &mut TickReport) {
        for payload in self.inbound.drain() {
            report.received += 1;

            let peer = match codec::decode(&payload) {
                Ok(peer) => peer,
                Err(e) => {
                    report.malformed += 1;
                    warn!("{}: dropping message: {}", self.state.id, CoordinationError::from(e));
                    continue;
                }
            };

            if self.is_local(&peer.id) {
                trace!("{}: ignoring own echo from {}", self.state.id, peer.id);
                report.ignored += 1;
                continue;
            }

            if let Some(ev) = self.emergency.as_mut() {
                ev.registry.upsert(peer.clone(), now);
            }

            match self.registry.upsert(peer, now) {
                UpsertOutcome::Inserted | UpsertOutcome::Updated => report.accepted += 1,
                UpsertOutcome::Discarded => report.ignored += 1,
            }
        }
    }

    fn apply_control(&mut self, staged: &StagedControl) {
        if staged.is_empty() {
            return;
        }

        if staged.speed_delta != 0.0 {
            self.cruise_speed = (self.cruise_speed + staged.speed_delta).clamp(0.0, self.max_speed());
            debug!("{}: cruise speed now {:.1} m/s", self.state.id, self.cruise_speed);
        }

        if staged.drowsy_toggles % 2 == 1 {
            self.manual_drowsy = !self.manual_drowsy;
            info!(
                "{}: manual drowsy mode {}",
                self.state.id,
                if self.manual_drowsy { "on" } else { "off" }
            );
        }

        if staged.spawn_emergency {
            self.spawn_emergency();
        }

        if staged.clear_emergency {
            if let Some(ev) = self.emergency.as_mut() {
                info!("{}: emergency vehicle {} standing down", self.state.id, ev.state.id);
                ev.state.alerts.remove(AlertFlag::EmergencyActive);
                ev.standing_down = true;
            }
        }
    }

    fn set_drowsy(&mut self, drowsy: bool) {
        if drowsy != self.drowsy {
            if drowsy {
                info!("{}: driver drowsy, heading for the service lane", self.state.id);
            } else {
                info!("{}: driver alert again", self.state.id);
            }
        }
        self.drowsy = drowsy;
        self.state.alerts.set(AlertFlag::Drowsy, drowsy);
    }

    fn spawn_emergency(&mut self) {
        if self.emergency.is_some() || self.state.role == Role::Emergency {
            return;
        }

        let id = VehicleId::new(format!("AMB-{}", self.state.id));
        let state = VehicleState::new(
            id,
            Lane::FAST,
            0.0,
            self.config.emergency_cruise_speed,
            Role::Emergency,
        );
        info!("{}: emergency vehicle {} dispatched", self.state.id, state.id);

        // The ambulance starts from everything we already know
        let mut registry = PeerRegistry::new(self.track);
        for record in self.registry.snapshot().iter() {
            registry.upsert(record.state.clone(), record.received_at_ms);
        }

        self.emergency = Some(OwnedEmergency {
            state,
            registry,
            lane_cooldown: 0.0,
            standing_down: false,
        });
    }

    fn max_speed(&self) -> f32 {
        match self.state.role {
            Role::Normal => self.config.max_speed,
            Role::Emergency => self.config.emergency_cruise_speed.max(self.config.max_speed),
        }
    }

    /// No reliable peer data once the transport has been down for longer
    /// than a peer would survive in the registry
    fn is_degraded(&self, now: u64) -> bool {
        self.transport_down_since
            .is_some_and(|since| now.saturating_sub(since) > self.config.peer_timeout_ms())
    }

    fn decide(&mut self, lane_request: Option<Lane>, now: u64, report: &mut TickReport) -> Decision {
        let degraded = self.is_degraded(now);
        if degraded && !self.degraded {
            warn!("{}: no peer data, holding lane and stopping", self.state.id);
        }
        self.degraded = degraded;
        report.degraded = degraded;

        let snapshot = self.registry.snapshot();

        let mut decision = if degraded {
            self.yielding_to = None;
            Decision::safe_stop(self.state.lane)
        } else {
            let output = self
                .arbiter
                .arbitrate(&self.state, self.cruise_speed, lane_request, &snapshot);
            report.deferred = output.deferred;

            let resolution = self
                .resolver
                .resolve(&self.state, &snapshot, &self.arbiter, &output.decision);
            self.yielding_to = resolution.active.map(|active| active.id);
            resolution.decision
        };

        if self.drowsy {
            decision.target_lane = Lane::SERVICE;
            if self.state.lane == Lane::SERVICE {
                decision.target_speed = 0.0;
                decision.braking = true;
            }
        }

        decision.headlight = self.reactor.update(&self.state, &snapshot);
        decision
    }

    fn apply(&mut self, decision: Decision, delta_secs: f32, report: &mut TickReport) {
        self.lane_cooldown = (self.lane_cooldown - delta_secs).max(0.0);

        if decision.target_lane != self.state.lane {
            let current = self.state.lane;
            let hop = current.toward(decision.target_lane);

            if self.lane_cooldown > 0.0 {
                report.deferred = Some(CoordinationError::LaneChangeCooldown {
                    current,
                    requested: decision.target_lane,
                });
            } else {
                // Forced parking skips the arbiter, so check each hop here
                let parked_hop = if self.drowsy {
                    self.arbiter
                        .check_lane_change(&self.state, hop, &self.registry.snapshot(), LaneChangeIntent::Park)
                        .err()
                } else {
                    None
                };

                match parked_hop {
                    Some(err) => report.deferred = Some(err),
                    None => {
                        debug!("{}: lane {} -> {}", self.state.id, current, hop);
                        self.state.lane = hop;
                        self.lane_cooldown = self.config.lane_change_cooldown_secs;
                    }
                }
            }
        }

        let max_speed = self.max_speed();
        self.state.speed = step_speed(
            self.state.speed,
            decision.target_speed.min(max_speed),
            &self.config,
            delta_secs,
        )
        .clamp(0.0, max_speed);

        self.state.position = self
            .track
            .advance(self.state.position, self.state.speed * delta_secs, self.state.heading());
        self.state.alerts.set(AlertFlag::Braking, decision.braking);
        self.decision = decision;
    }

    fn drive_emergency(&mut self, now: u64, delta_secs: f32) {
        let Some(ev) = self.emergency.as_mut() else {
            return;
        };

        let mut owner = self.state.clone();
        owner.timestamp_ms = now;
        ev.registry.upsert(owner, now);
        ev.registry.evict_stale(now, self.config.peer_timeout_ms());

        let snapshot = ev.registry.snapshot();
        let output = self
            .arbiter
            .arbitrate(&ev.state, self.config.emergency_cruise_speed, None, &snapshot);
        drop(snapshot);

        ev.lane_cooldown = (ev.lane_cooldown - delta_secs).max(0.0);
        if output.decision.target_lane != ev.state.lane && ev.lane_cooldown <= 0.0 {
            ev.state.lane = ev.state.lane.toward(output.decision.target_lane);
            ev.lane_cooldown = self.config.lane_change_cooldown_secs;
        }

        let max_speed = self.config.emergency_cruise_speed.max(self.config.max_speed);
        ev.state.speed = step_speed(
            ev.state.speed,
            output.decision.target_speed.min(max_speed),
            &self.config,
            delta_secs,
        )
        .clamp(0.0, max_speed);
        ev.state.position = self
            .track
            .advance(ev.state.position, ev.state.speed * delta_secs, ev.state.heading());
        ev.state.alerts.set(AlertFlag::Braking, output.decision.braking);
    }

    fn publish(&mut self, now: u64, report: &mut TickReport) {
        self.state.timestamp_ms = now;
        let topic = self.config.vehicle_topic(self.state.id.as_str());
        let mut result = self.transport.publish(&topic, &codec::encode(&self.state));

        let mut retire = false;
        if let Some(ev) = self.emergency.as_mut() {
            ev.state.timestamp_ms = now;
            let ev_topic = self.config.vehicle_topic(ev.state.id.as_str());
            let ev_result = self.transport.publish(&ev_topic, &codec::encode(&ev.state));
            result = result.and(ev_result);
            retire = ev.standing_down;
        }
        if retire {
            self.emergency = None;
        }

        match result {
            // Publishing alone is no peer data
            Ok(()) if self.subscribed => {
                if self.transport_down_since.take().is_some() {
                    info!("{}: transport available again", self.state.id);
                }
            }
            Ok(()) => {}
            Err(e) => self.note_transport_failure(e, now, report),
        }
    }

    fn note_transport_failure(&mut self, error: TransportError, now: u64, report: &mut TickReport) {
        let error = CoordinationError::from(error);
        if self.transport_down_since.is_none() {
            warn!("{}: {}", self.state.id, error);
            self.transport_down_since = Some(now);
        } else {
            trace!("{}: {}", self.state.id, error);
        }
        report.transport_error = Some(error);
    }

    /// Tick at a fixed rate until `stop` is raised or `max_ticks` have run.
    /// Returns the number of ticks executed.
    pub fn run(&mut self, stop: &AtomicBool, tick_interval: Duration, max_ticks: Option<u64>) -> u64 {
        let delta_secs = tick_interval.as_secs_f32();
        let mut ticks = 0;

        while !stop.load(Ordering::Relaxed) {
            if max_ticks.is_some_and(|max| ticks >= max) {
                break;
            }

            let started = Instant::now();
            self.tick(delta_secs);
            ticks += 1;

            if let Some(rest) = tick_interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }

        info!("{}: stopped after {} ticks", self.state.id, ticks);
        ticks
    }
}

/// Move `speed` towards `target` within the acceleration and brake limits
fn step_speed(speed: f32, target: f32, config: &CoordinationConfig, delta_secs: f32) -> f32 {
    let target = target.max(0.0);
    if speed < target {
        (speed + config.accel * delta_secs).min(target)
    } else {
        (speed - config.brake * delta_secs).max(target)
    }
}

