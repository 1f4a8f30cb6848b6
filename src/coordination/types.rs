//! Core types for the coordination core
//!
//! Vehicle state, lanes, roles and the per-tick decision. None of these depend
//! on the transport or on any presentation layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of lanes on the highway (3 carriageway lanes + 1 service lane)
pub const LANE_COUNT: u8 = 4;

/// Conversion factor from km/h to m/s
pub const KMH_TO_MS: f32 = 1.0 / 3.6;

/// Unique identifier of a vehicle node, as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(pub String);

impl VehicleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a lane is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneKind {
    /// Regular lane in the forward direction
    Forward,
    /// Lane carrying traffic in the opposite direction
    Opposite,
    /// Service lane for stopped or parked vehicles
    Service,
}

/// Direction of travel along the track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heading {
    /// Position increases over time
    Forward,
    /// Position decreases over time
    Reverse,
}

impl Heading {
    pub fn sign(self) -> f32 {
        match self {
            Heading::Forward => 1.0,
            Heading::Reverse => -1.0,
        }
    }

    pub fn opposite(self) -> Heading {
        match self {
            Heading::Forward => Heading::Reverse,
            Heading::Reverse => Heading::Forward,
        }
    }
}

/// A lane index, always in `0..LANE_COUNT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lane(u8);

impl Lane {
    pub const FAST: Lane = Lane(0);
    pub const CRUISE: Lane = Lane(1);
    pub const OPPOSITE: Lane = Lane(2);
    pub const SERVICE: Lane = Lane(3);

    /// Returns `None` when the index is outside the highway
    pub fn new(index: u8) -> Option<Lane> {
        (index < LANE_COUNT).then_some(Lane(index))
    }

    /// Same as [`Lane::new`] for wider integers, e.g. decoded wire values
    pub fn from_index(index: i64) -> Option<Lane> {
        u8::try_from(index).ok().and_then(Lane::new)
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn kind(self) -> LaneKind {
        match self.0 {
            2 => LaneKind::Opposite,
            3 => LaneKind::Service,
            _ => LaneKind::Forward,
        }
    }

    /// Direction of travel in this lane
    pub fn heading(self) -> Heading {
        match self.kind() {
            LaneKind::Opposite => Heading::Reverse,
            LaneKind::Forward | LaneKind::Service => Heading::Forward,
        }
    }

    /// Next lane one hop from `self` towards `target`
    pub fn toward(self, target: Lane) -> Lane {
        match self.0.cmp(&target.0) {
            std::cmp::Ordering::Less => Lane(self.0 + 1),
            std::cmp::Ordering::Greater => Lane(self.0 - 1),
            std::cmp::Ordering::Equal => self,
        }
    }

    pub fn all() -> impl Iterator<Item = Lane> {
        (0..LANE_COUNT).map(Lane)
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a vehicle. All logic branches on this tag explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Normal,
    Emergency,
}

/// A single alert flag carried in telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertFlag {
    Drowsy,
    Braking,
    EmergencyActive,
}

/// The set of alert flags raised by a vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlertFlags {
    drowsy: bool,
    braking: bool,
    emergency_active: bool,
}

impl AlertFlags {
    pub fn empty() -> Self {
        Self::default()
    }

    fn slot(&mut self, flag: AlertFlag) -> &mut bool {
        match flag {
            AlertFlag::Drowsy => &mut self.drowsy,
            AlertFlag::Braking => &mut self.braking,
            AlertFlag::EmergencyActive => &mut self.emergency_active,
        }
    }

    pub fn contains(&self, flag: AlertFlag) -> bool {
        match flag {
            AlertFlag::Drowsy => self.drowsy,
            AlertFlag::Braking => self.braking,
            AlertFlag::EmergencyActive => self.emergency_active,
        }
    }

    pub fn insert(&mut self, flag: AlertFlag) {
        *self.slot(flag) = true;
    }

    pub fn remove(&mut self, flag: AlertFlag) {
        *self.slot(flag) = false;
    }

    pub fn set(&mut self, flag: AlertFlag, raised: bool) {
        *self.slot(flag) = raised;
    }

    /// Raised flags in a stable order
    pub fn iter(&self) -> impl Iterator<Item = AlertFlag> + '_ {
        [AlertFlag::Drowsy, AlertFlag::Braking, AlertFlag::EmergencyActive]
            .into_iter()
            .filter(|flag| self.contains(*flag))
    }
}

impl FromIterator<AlertFlag> for AlertFlags {
    fn from_iter<I: IntoIterator<Item = AlertFlag>>(iter: I) -> Self {
        let mut flags = AlertFlags::empty();
        for flag in iter {
            flags.insert(flag);
        }
        flags
    }
}

/// Self-reported state of a vehicle
///
/// The lane is always valid by construction (`Lane`), and every path that
/// writes `speed` clamps it to be non-negative.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleState {
    pub id: VehicleId,
    pub lane: Lane,
    /// Meters along the track
    pub position: f32,
    /// Meters per second, never negative
    pub speed: f32,
    pub role: Role,
    pub alerts: AlertFlags,
    /// Sender clock in milliseconds at the time of the update
    pub timestamp_ms: u64,
}

impl VehicleState {
    pub fn new(id: VehicleId, lane: Lane, position: f32, speed: f32, role: Role) -> Self {
        let mut alerts = AlertFlags::empty();
        if role == Role::Emergency {
            alerts.insert(AlertFlag::EmergencyActive);
        }
        Self {
            id,
            lane,
            position,
            speed: speed.max(0.0),
            role,
            alerts,
            timestamp_ms: 0,
        }
    }

    /// Heading is a property of the lane
    pub fn heading(&self) -> Heading {
        self.lane.heading()
    }

    /// True when this vehicle is broadcasting an active emergency
    pub fn is_active_emergency(&self) -> bool {
        self.role == Role::Emergency && self.alerts.contains(AlertFlag::EmergencyActive)
    }

    pub fn is_drowsy(&self) -> bool {
        self.alerts.contains(AlertFlag::Drowsy)
    }
}

/// Adaptive headlight mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeadlightMode {
    #[default]
    High,
    Low,
}

/// The output of one tick of arbitration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub target_lane: Lane,
    /// Meters per second, never negative
    pub target_speed: f32,
    pub headlight: HeadlightMode,
    pub braking: bool,
}

impl Decision {
    /// Keep the current lane and speed
    pub fn hold(state: &VehicleState) -> Self {
        Self {
            target_lane: state.lane,
            target_speed: state.speed,
            headlight: HeadlightMode::High,
            braking: false,
        }
    }

    /// Maintain lane and bring the vehicle to a stop
    pub fn safe_stop(lane: Lane) -> Self {
        Self {
            target_lane: lane,
            target_speed: 0.0,
            headlight: HeadlightMode::High,
            braking: true,
        }
    }
}
