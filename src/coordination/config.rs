//! Tunable constants for the coordination core
//!
//! Every threshold the arbiter, resolver and reactor use lives here so a run
//! can be tuned from a JSON file without recompiling. Missing keys fall back
//! to the defaults below.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::topology::{Track, DEFAULT_TRACK_LENGTH};
use super::types::KMH_TO_MS;

/// Top speed of a normal vehicle in km/h
pub const MAX_SPEED_KMH: f32 = 250.0;

/// Cruise speed a driver starts with (m/s)
pub const DEFAULT_CRUISE_SPEED: f32 = 25.0;

/// Seconds without a refresh before a peer is evicted
pub const PEER_TIMEOUT_SECS: f32 = 3.0;

/// Topic prefix; each vehicle publishes on `<prefix>/<id>`
pub const DEFAULT_TOPIC_PREFIX: &str = "v2x/highway/vehicles";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Length of the looped track in meters
    pub track_length: f32,
    /// Top speed of a normal vehicle (m/s)
    pub max_speed: f32,
    /// Acceleration towards a higher target speed (m/s²)
    pub accel: f32,
    /// Deceleration towards a lower target speed (m/s²)
    pub brake: f32,
    /// Cruise speed a node starts with (m/s)
    pub cruise_speed: f32,
    /// Cruise speed of an emergency vehicle (m/s)
    pub emergency_cruise_speed: f32,
    /// Size of a speed-delta request step used by controllers (m/s)
    pub speed_step: f32,

    /// Gap kept at standstill (m)
    pub standstill_gap: f32,
    /// Deceleration assumed by the braking-distance model (m/s²)
    pub comfort_decel: f32,
    /// Seconds to wait between two lane hops
    pub lane_change_cooldown_secs: f32,
    /// Change lanes on our own when stuck behind a slower leader
    pub auto_overtake: bool,
    /// Honor an explicit request into the opposite lane when it is clear
    pub opposite_lane_overtaking: bool,

    /// Peers without a refresh for this long are evicted (s)
    pub peer_timeout_secs: f32,

    /// Distance behind us at which an emergency vehicle is tracked (m)
    pub emergency_detection_distance: f32,
    /// Distance at which we start yielding (m)
    pub yield_trigger_distance: f32,
    /// How far an emergency vehicle must pass us before it has departed (m)
    pub departure_margin: f32,
    /// Fraction of the normal lane-change window required when yielding
    pub yield_gap_factor: f32,
    /// Fraction of current speed kept when yielding without a free lane
    pub yield_speed_factor: f32,

    /// Range at which oncoming traffic dips the headlights (m)
    pub visibility_distance: f32,
    /// Extra range an oncoming vehicle must clear before high beams return (m)
    pub headlight_hysteresis: f32,

    /// Distance between street-light segments (m)
    pub streetlight_spacing: f32,
    /// Length of road lit by one segment (m)
    pub streetlight_segment_length: f32,
    /// A segment switches on this far before a vehicle reaches it (m)
    pub streetlight_lead: f32,
    /// A segment stays on until the last vehicle is this far past it (m)
    pub streetlight_trailing: f32,

    /// Bound of the inbound queue between transport and tick loop
    pub inbound_queue_capacity: usize,
    pub topic_prefix: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        let max_speed = MAX_SPEED_KMH * KMH_TO_MS;
        Self {
            track_length: DEFAULT_TRACK_LENGTH,
            max_speed,
            accel: 10.0,
            brake: 25.0,
            cruise_speed: DEFAULT_CRUISE_SPEED,
            emergency_cruise_speed: max_speed * 1.2,
            speed_step: 5.0,
            standstill_gap: 10.0,
            comfort_decel: 6.0,
            lane_change_cooldown_secs: 1.0,
            auto_overtake: true,
            opposite_lane_overtaking: true,
            peer_timeout_secs: PEER_TIMEOUT_SECS,
            emergency_detection_distance: 400.0,
            yield_trigger_distance: 150.0,
            departure_margin: 20.0,
            yield_gap_factor: 0.5,
            yield_speed_factor: 0.5,
            visibility_distance: 300.0,
            headlight_hysteresis: 25.0,
            streetlight_spacing: 200.0,
            streetlight_segment_length: 40.0,
            streetlight_lead: 100.0,
            streetlight_trailing: 50.0,
            inbound_queue_capacity: 256,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
        }
    }
}

impl CoordinationConfig {
    /// Load a (possibly partial) JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: CoordinationConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break the arbiter's arithmetic
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("track_length", self.track_length),
            ("max_speed", self.max_speed),
            ("accel", self.accel),
            ("brake", self.brake),
            ("comfort_decel", self.comfort_decel),
            ("peer_timeout_secs", self.peer_timeout_secs),
            ("streetlight_spacing", self.streetlight_spacing),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                anyhow::bail!("{} must be a positive number, got {}", name, value);
            }
        }

        let non_negative = [
            ("cruise_speed", self.cruise_speed),
            ("emergency_cruise_speed", self.emergency_cruise_speed),
            ("standstill_gap", self.standstill_gap),
            ("lane_change_cooldown_secs", self.lane_change_cooldown_secs),
            ("emergency_detection_distance", self.emergency_detection_distance),
            ("yield_trigger_distance", self.yield_trigger_distance),
            ("departure_margin", self.departure_margin),
            ("visibility_distance", self.visibility_distance),
            ("headlight_hysteresis", self.headlight_hysteresis),
            ("streetlight_segment_length", self.streetlight_segment_length),
            ("streetlight_lead", self.streetlight_lead),
            ("streetlight_trailing", self.streetlight_trailing),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                anyhow::bail!("{} must be zero or positive, got {}", name, value);
            }
        }

        for (name, value) in [
            ("yield_gap_factor", self.yield_gap_factor),
            ("yield_speed_factor", self.yield_speed_factor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be within [0, 1], got {}", name, value);
            }
        }

        if self.yield_trigger_distance > self.emergency_detection_distance {
            anyhow::bail!("yield_trigger_distance cannot exceed emergency_detection_distance");
        }

        if self.inbound_queue_capacity == 0 {
            anyhow::bail!("inbound_queue_capacity must be at least 1");
        }

        // The prefix is used inside a subscription filter
        if self.topic_prefix.is_empty() || self.topic_prefix.contains(['+', '#']) {
            anyhow::bail!(
                "topic_prefix must be non-empty and free of wildcards, got {:?}",
                self.topic_prefix
            );
        }

        Ok(())
    }

    pub fn track(&self) -> Track {
        Track::new(self.track_length)
    }

    pub fn peer_timeout_ms(&self) -> u64 {
        secs_to_ms(self.peer_timeout_secs)
    }

    /// Topic this vehicle publishes on
    pub fn vehicle_topic(&self, id: &str) -> String {
        format!("{}/{}", self.topic_prefix, id)
    }

    /// Wildcard filter matching every vehicle topic
    pub fn wildcard_topic(&self) -> String {
        format!("{}/+", self.topic_prefix)
    }
}

pub fn secs_to_ms(secs: f32) -> u64 {
    (secs.max(0.0) * 1000.0).round() as u64
}
