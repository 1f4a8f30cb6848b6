//! Collision & lane arbiter
//!
//! Keeps the local vehicle at a safe following distance and only allows a
//! lane change when both gaps in the target lane are large enough. Every
//! decision is computed fresh from the current snapshot; nothing is queued
//! between ticks.

use log::debug;

use super::config::CoordinationConfig;
use super::error::CoordinationError;
use super::registry::{Neighbor, PeerSnapshot};
use super::topology::LaneTopology;
use super::types::{Decision, HeadlightMode, Lane, LaneKind, VehicleState};

/// Why a lane change is being considered. Eligibility rules depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneChangeIntent {
    /// Asked for by the external control input
    Requested,
    /// Chosen by the arbiter to get past a slower leader
    Overtake,
    /// Making way for an emergency vehicle; uses the relaxed window
    Yield,
    /// Heading for the service lane to park; uses the relaxed window
    Park,
}

/// Result of one arbitration pass
#[derive(Debug)]
pub struct ArbiterOutput {
    pub decision: Decision,
    /// Gap to the leader in the current lane, if there is one
    pub leader_gap: Option<f32>,
    /// Set when a requested lane change had to be deferred
    pub deferred: Option<CoordinationError>,
}

#[derive(Debug, Clone)]
pub struct Arbiter {
    topology: LaneTopology,
    standstill_gap: f32,
    comfort_decel: f32,
    yield_gap_factor: f32,
    auto_overtake: bool,
    opposite_lane_overtaking: bool,
}

impl Arbiter {
    pub fn new(config: &CoordinationConfig) -> Self {
        Self {
            topology: LaneTopology::standard(),
            standstill_gap: config.standstill_gap,
            comfort_decel: config.comfort_decel,
            yield_gap_factor: config.yield_gap_factor,
            auto_overtake: config.auto_overtake,
            opposite_lane_overtaking: config.opposite_lane_overtaking,
        }
    }

    pub fn topology(&self) -> &LaneTopology {
        &self.topology
    }

    /// Gap a follower needs behind a leader: the standstill buffer plus the
    /// difference in braking distance, never below the buffer.
    pub fn required_gap(&self, follower_speed: f32, leader_speed: f32) -> f32 {
        let follower_speed = follower_speed.max(0.0);
        let leader_speed = leader_speed.max(0.0);
        let braking_term =
            (follower_speed * follower_speed - leader_speed * leader_speed) / (2.0 * self.comfort_decel);
        self.standstill_gap + braking_term.max(0.0)
    }

    /// Follower and leader speeds as seen by the gap model. A drowsy peer is
    /// a static obstacle.
    fn closing_speeds(local: &VehicleState, peer: &VehicleState) -> (f32, f32) {
        if peer.is_drowsy() {
            (local.speed, 0.0)
        } else {
            (local.speed, peer.speed)
        }
    }

    /// Nearest peer ahead in the local lane
    pub fn leader<'a>(&self, local: &VehicleState, snapshot: &PeerSnapshot<'a>) -> Option<Neighbor<'a>> {
        snapshot.nearest_ahead(local.lane, local.position, local.heading())
    }

    /// Target speed and braking flag from the leader in the current lane.
    /// Returns `(target_speed, braking, leader_gap)`.
    pub fn follow_speed(
        &self,
        local: &VehicleState,
        cruise_speed: f32,
        snapshot: &PeerSnapshot<'_>,
    ) -> (f32, bool, Option<f32>) {
        let cruise_speed = cruise_speed.max(0.0);

        let Some(leader) = self.leader(local, snapshot) else {
            return (cruise_speed, false, None);
        };

        let (follower_speed, leader_speed) = Self::closing_speeds(local, &leader.record.state);
        let required = self.required_gap(follower_speed, leader_speed);

        if leader.gap >= required {
            return (cruise_speed, false, Some(leader.gap));
        }

        // Scale speed down in proportion to the missing gap
        let scaled = local.speed * (leader.gap / required);
        let target = scaled.min(cruise_speed).max(0.0);
        (target, true, Some(leader.gap))
    }

    /// Minimum gap on both sides of us in `target` for a lane change
    pub fn lane_window(
        &self,
        local: &VehicleState,
        target: Lane,
        snapshot: &PeerSnapshot<'_>,
        intent: LaneChangeIntent,
    ) -> f32 {
        let prevailing = snapshot.prevailing_speed(target).unwrap_or(local.speed);
        let window = self.required_gap(prevailing, 0.0);
        match intent {
            LaneChangeIntent::Yield | LaneChangeIntent::Park => {
                (window * self.yield_gap_factor).max(self.standstill_gap)
            }
            LaneChangeIntent::Requested | LaneChangeIntent::Overtake => window,
        }
    }

    fn lane_allowed(&self, local: &VehicleState, target: Lane, intent: LaneChangeIntent) -> bool {
        if !self.topology.are_adjacent(local.lane, target) {
            return false;
        }

        if target.kind() == LaneKind::Service {
            return matches!(intent, LaneChangeIntent::Park | LaneChangeIntent::Yield);
        }

        if target.heading() != local.heading() {
            return match intent {
                LaneChangeIntent::Park => true,
                LaneChangeIntent::Requested => self.opposite_lane_overtaking,
                LaneChangeIntent::Overtake | LaneChangeIntent::Yield => false,
            };
        }

        true
    }

    /// Check one lane hop. On success returns the forward gap in the target
    /// lane (infinite when the lane is empty).
    pub fn check_lane_change(
        &self,
        local: &VehicleState,
        target: Lane,
        snapshot: &PeerSnapshot<'_>,
        intent: LaneChangeIntent,
    ) -> Result<f32, CoordinationError> {
        let no_safe_lane = CoordinationError::NoSafeLane {
            current: local.lane,
            requested: target,
        };

        if !self.lane_allowed(local, target, intent) {
            return Err(no_safe_lane);
        }

        // Gaps are measured the way we will travel once in the target lane
        let heading = target.heading();
        let window = self.lane_window(local, target, snapshot, intent);

        let forward_gap = snapshot
            .nearest_ahead(target, local.position, heading)
            .map_or(f32::INFINITY, |n| n.gap);
        let rear_gap = snapshot
            .nearest_behind(target, local.position, heading)
            .map_or(f32::INFINITY, |n| n.gap);

        if forward_gap > window && rear_gap > window {
            Ok(forward_gap)
        } else {
            Err(no_safe_lane)
        }
    }

    /// Pick among candidate lanes: `preferred` if it is eligible, otherwise
    /// the eligible lane with the largest forward gap.
    pub fn choose_lane(
        &self,
        local: &VehicleState,
        candidates: &[Lane],
        preferred: Option<Lane>,
        snapshot: &PeerSnapshot<'_>,
        intent: LaneChangeIntent,
    ) -> Option<(Lane, f32)> {
        let eligible: Vec<(Lane, f32)> = candidates
            .iter()
            .filter_map(|lane| {
                self.check_lane_change(local, *lane, snapshot, intent)
                    .ok()
                    .map(|gap| (*lane, gap))
            })
            .collect();

        if let Some(preferred) = preferred {
            if let Some(found) = eligible.iter().find(|(lane, _)| *lane == preferred) {
                return Some(*found);
            }
        }

        eligible
            .into_iter()
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
    }

    /// Compute this tick's decision for `local`
    pub fn arbitrate(
        &self,
        local: &VehicleState,
        cruise_speed: f32,
        requested_lane: Option<Lane>,
        snapshot: &PeerSnapshot<'_>,
    ) -> ArbiterOutput {
        let (target_speed, braking, leader_gap) = self.follow_speed(local, cruise_speed, snapshot);

        let mut target_lane = local.lane;
        let mut deferred = None;

        if let Some(requested) = requested_lane.filter(|lane| *lane != local.lane) {
            let hop = local.lane.toward(requested);
            match self.check_lane_change(local, hop, snapshot, LaneChangeIntent::Requested) {
                Ok(_) => target_lane = hop,
                Err(_) => {
                    debug!(
                        "{}: lane change {} -> {} deferred, no safe gap",
                        local.id, local.lane, requested
                    );
                    deferred = Some(CoordinationError::NoSafeLane {
                        current: local.lane,
                        requested,
                    });
                }
            }
        }

        if target_lane == local.lane && braking && self.auto_overtake {
            if let Some(current_gap) = leader_gap {
                let candidates: Vec<Lane> = self
                    .topology
                    .adjacent(local.lane)
                    .into_iter()
                    .filter(|lane| self.topology.carries(*lane, local.heading()))
                    .collect();

                if let Some((lane, gap)) =
                    self.choose_lane(local, &candidates, None, snapshot, LaneChangeIntent::Overtake)
                {
                    if gap > current_gap {
                        debug!("{}: overtaking into lane {} ({:.0}m clear)", local.id, lane, gap);
                        target_lane = lane;
                    }
                }
            }
        }

        ArbiterOutput {
            decision: Decision {
                target_lane,
                target_speed: target_speed.max(0.0),
                headlight: HeadlightMode::High,
                braking,
            },
            leader_gap,
            deferred,
        }
    }
}
