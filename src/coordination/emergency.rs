//! Emergency priority resolver
//!
//! Tracks every emergency vehicle seen in the registry through
//! absent -> approaching -> adjacent -> departed and, while one is adjacent,
//! overrides the arbiter's lane and speed so the local vehicle makes way.

use log::info;
use std::collections::HashMap;

use super::arbiter::{Arbiter, LaneChangeIntent};
use super::config::CoordinationConfig;
use super::registry::PeerSnapshot;
use super::types::{Decision, Lane, Role, VehicleId, VehicleState};

/// Where an emergency vehicle stands relative to us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyPhase {
    Absent,
    Approaching,
    Adjacent,
    Departed,
}

/// The emergency vehicle currently forcing an override
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveEmergency {
    pub id: VehicleId,
    pub lane: Lane,
    /// How far we are ahead of it along its heading (m)
    pub offset: f32,
}

/// Decision after emergency priority has been applied
#[derive(Debug, Clone)]
pub struct Resolution {
    pub decision: Decision,
    /// Present when the override was in force this tick
    pub active: Option<ActiveEmergency>,
}

#[derive(Debug, Clone)]
pub struct EmergencyResolver {
    phases: HashMap<VehicleId, EmergencyPhase>,
    detection_distance: f32,
    yield_trigger_distance: f32,
    departure_margin: f32,
    yield_speed_factor: f32,
}

impl EmergencyResolver {
    pub fn new(config: &CoordinationConfig) -> Self {
        Self {
            phases: HashMap::new(),
            detection_distance: config.emergency_detection_distance,
            yield_trigger_distance: config.yield_trigger_distance,
            departure_margin: config.departure_margin,
            yield_speed_factor: config.yield_speed_factor,
        }
    }

    pub fn phase(&self, id: &VehicleId) -> EmergencyPhase {
        self.phases
            .get(id)
            .copied()
            .unwrap_or(EmergencyPhase::Absent)
    }

    fn transition(&mut self, id: &VehicleId, next: EmergencyPhase) {
        let current = self.phase(id);
        if current == next {
            return;
        }

        info!("Emergency vehicle {}: {:?} -> {:?}", id, current, next);
        if next == EmergencyPhase::Absent {
            self.phases.remove(id);
        } else {
            self.phases.insert(id.clone(), next);
        }
    }

    /// Advance the state machine of every emergency vehicle in view
    pub fn observe(&mut self, local: &VehicleState, snapshot: &PeerSnapshot<'_>, arbiter: &Arbiter) {
        // Departed lasts one tick
        let departed: Vec<VehicleId> = self
            .phases
            .iter()
            .filter(|(_, phase)| **phase == EmergencyPhase::Departed)
            .map(|(id, _)| id.clone())
            .collect();
        for id in departed {
            self.transition(&id, EmergencyPhase::Absent);
        }

        // Evicted or no longer an emergency vehicle
        let vanished: Vec<VehicleId> = self
            .phases
            .keys()
            .filter(|id| {
                snapshot
                    .get(id)
                    .map_or(true, |record| record.state.role != Role::Emergency)
            })
            .cloned()
            .collect();
        for id in vanished {
            let next = match self.phase(&id) {
                EmergencyPhase::Adjacent => EmergencyPhase::Departed,
                _ => EmergencyPhase::Absent,
            };
            self.transition(&id, next);
        }

        let track = snapshot.track();
        for record in snapshot.iter().filter(|r| r.state.role == Role::Emergency) {
            let ev = &record.state;
            let offset = track.signed_offset(ev.position, local.position, ev.heading());
            let active = ev.is_active_emergency();
            let nearby_lane = arbiter.topology().is_same_or_adjacent(local.lane, ev.lane);
            let in_window = (0.0..=self.detection_distance).contains(&offset);

            let mut phase = self.phase(&ev.id);

            if phase == EmergencyPhase::Absent && active && nearby_lane && in_window {
                phase = EmergencyPhase::Approaching;
                self.transition(&ev.id, phase);
            }

            match phase {
                EmergencyPhase::Approaching => {
                    if !active || !nearby_lane || !in_window {
                        self.transition(&ev.id, EmergencyPhase::Absent);
                    } else if offset < self.yield_trigger_distance {
                        self.transition(&ev.id, EmergencyPhase::Adjacent);
                    }
                }
                EmergencyPhase::Adjacent => {
                    let passed = offset < -self.departure_margin;
                    let fell_back = offset > self.detection_distance;
                    if !active || passed || fell_back {
                        self.transition(&ev.id, EmergencyPhase::Departed);
                    }
                }
                EmergencyPhase::Absent | EmergencyPhase::Departed => {}
            }
        }
    }

    /// Closest emergency vehicle in the adjacent phase
    fn closest_adjacent(&self, local: &VehicleState, snapshot: &PeerSnapshot<'_>) -> Option<ActiveEmergency> {
        let track = snapshot.track();
        self.phases
            .iter()
            .filter(|(_, phase)| **phase == EmergencyPhase::Adjacent)
            .filter_map(|(id, _)| snapshot.get(id))
            .map(|record| ActiveEmergency {
                id: record.state.id.clone(),
                lane: record.state.lane,
                offset: track.signed_offset(
                    record.state.position,
                    local.position,
                    record.state.heading(),
                ),
            })
            .min_by(|a, b| a.offset.abs().total_cmp(&b.offset.abs()))
    }

    /// Apply emergency priority on top of the arbiter's `raw` decision
    pub fn resolve(
        &mut self,
        local: &VehicleState,
        snapshot: &PeerSnapshot<'_>,
        arbiter: &Arbiter,
        raw: &Decision,
    ) -> Resolution {
        if local.role == Role::Emergency {
            return Resolution {
                decision: *raw,
                active: None,
            };
        }

        self.observe(local, snapshot, arbiter);

        let Some(emergency) = self.closest_adjacent(local, snapshot) else {
            return Resolution {
                decision: *raw,
                active: None,
            };
        };

        let mut decision = *raw;

        if local.lane == emergency.lane {
            let candidates: Vec<Lane> = arbiter
                .topology()
                .adjacent(local.lane)
                .into_iter()
                .filter(|lane| *lane != emergency.lane)
                .collect();

            match arbiter.choose_lane(local, &candidates, None, snapshot, LaneChangeIntent::Yield) {
                Some((lane, _)) => {
                    decision.target_lane = lane;
                    decision.target_speed = raw.target_speed;
                }
                None => {
                    decision.target_lane = local.lane;
                    decision.target_speed = raw
                        .target_speed
                        .min(local.speed * self.yield_speed_factor)
                        .max(0.0);
                    decision.braking = true;
                }
            }
        } else if raw.target_lane == emergency.lane {
            decision.target_lane = local.lane;
        }

        decision.braking = decision.braking || raw.braking;

        Resolution {
            decision,
            active: Some(emergency),
        }
    }
}
