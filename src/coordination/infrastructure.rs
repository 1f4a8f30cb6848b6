//! Infrastructure reactor: adaptive headlights and street lighting
//!
//! Both signals are derived from the local state and the peer snapshot each
//! tick. Each uses asymmetric on/off bounds so a vehicle sitting right on a
//! threshold does not make the output flicker.

use log::debug;
use sorted_vec::SortedSet;

use super::config::CoordinationConfig;
use super::registry::PeerSnapshot;
use super::topology::Track;
use super::types::{HeadlightMode, VehicleState};

/// Identifier of a street-light segment; segment `n` sits at `n * spacing`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub u32);

/// A lit stretch of road centred on `position`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreetLightSegment {
    pub id: SegmentId,
    pub position: f32,
}

pub struct InfrastructureReactor {
    track: Track,
    headlight: HeadlightMode,
    visibility_distance: f32,
    headlight_hysteresis: f32,
    segments: Vec<StreetLightSegment>,
    half_segment: f32,
    lead: f32,
    trailing: f32,
    active: SortedSet<SegmentId>,
}

impl InfrastructureReactor {
    pub fn new(config: &CoordinationConfig) -> Self {
        let track = config.track();
        let count = (track.length() / config.streetlight_spacing).floor().max(1.0) as u32;
        let segments = (0..count)
            .map(|n| StreetLightSegment {
                id: SegmentId(n),
                position: n as f32 * config.streetlight_spacing,
            })
            .collect();

        Self {
            track,
            headlight: HeadlightMode::High,
            visibility_distance: config.visibility_distance,
            headlight_hysteresis: config.headlight_hysteresis,
            segments,
            half_segment: config.streetlight_segment_length / 2.0,
            lead: config.streetlight_lead,
            trailing: config.streetlight_trailing,
            active: SortedSet::new(),
        }
    }

    pub fn headlight(&self) -> HeadlightMode {
        self.headlight
    }

    pub fn segments(&self) -> &[StreetLightSegment] {
        &self.segments
    }

    /// Currently lit segments, ascending
    pub fn active_segments(&self) -> Vec<SegmentId> {
        self.active.iter().copied().collect()
    }

    pub fn is_lit(&self, id: SegmentId) -> bool {
        self.active.binary_search(&id).is_ok()
    }

    /// Recompute both signals for this tick
    pub fn update(&mut self, local: &VehicleState, snapshot: &PeerSnapshot<'_>) -> HeadlightMode {
        self.update_headlight(local, snapshot);
        self.update_street_lights(local, snapshot);
        self.headlight
    }

    fn update_headlight(&mut self, local: &VehicleState, snapshot: &PeerSnapshot<'_>) {
        let heading = local.heading();

        // Low beams need the oncoming vehicle to clear a wider band first
        let range = match self.headlight {
            HeadlightMode::High => self.visibility_distance,
            HeadlightMode::Low => self.visibility_distance + self.headlight_hysteresis,
        };

        let oncoming = snapshot.iter().any(|record| {
            record.state.heading() != heading
                && self.track.gap_ahead(local.position, record.state.position, heading) <= range
        });

        let next = if oncoming {
            HeadlightMode::Low
        } else {
            HeadlightMode::High
        };

        if next != self.headlight {
            debug!("{}: headlights {:?} -> {:?}", local.id, self.headlight, next);
            self.headlight = next;
        }
    }

    /// Distance before reaching the segment and distance past it, along the
    /// vehicle's own heading
    fn approach(&self, vehicle: &VehicleState, segment: &StreetLightSegment) -> (f32, f32) {
        let heading = vehicle.heading();
        let before = self.track.gap_ahead(vehicle.position, segment.position, heading);
        let past = self.track.gap_ahead(segment.position, vehicle.position, heading);
        (before, past)
    }

    fn update_street_lights(&mut self, local: &VehicleState, snapshot: &PeerSnapshot<'_>) {
        let vehicles: Vec<&VehicleState> = std::iter::once(local)
            .chain(snapshot.iter().map(|record| &record.state))
            .collect();

        for segment in &self.segments {
            let lit = self.active.binary_search(&segment.id).is_ok();

            let keep_past = if lit {
                self.half_segment + self.trailing
            } else {
                self.half_segment
            };

            let occupied = vehicles.iter().any(|vehicle| {
                let (before, past) = self.approach(vehicle, segment);
                before <= self.lead || past <= keep_past
            });

            if occupied && !lit {
                self.active.push(segment.id);
            } else if !occupied && lit {
                self.active.remove_item(&segment.id);
            }
        }
    }
}
