//! Vehicle coordination core
//!
//! Everything a single vehicle node needs to take part in the cooperative
//! highway: telemetry codec, peer registry, lane arbitration, emergency
//! priority, infrastructure reactions and the tick loop tying them together.
//! Runs without any presentation layer.

mod arbiter;
mod codec;
mod config;
mod control;
mod emergency;
mod error;
mod highway;
mod infrastructure;
mod node;
mod registry;
mod topology;
mod transport;
mod types;

// Re-export public types for external use
// These may not be used within this crate but are part of the public API
#[allow(unused_imports)]
pub use arbiter::{Arbiter, ArbiterOutput, LaneChangeIntent};
#[allow(unused_imports)]
pub use codec::{decode, encode};
#[allow(unused_imports)]
pub use config::{
    secs_to_ms, CoordinationConfig, DEFAULT_CRUISE_SPEED, DEFAULT_TOPIC_PREFIX, MAX_SPEED_KMH,
    PEER_TIMEOUT_SECS,
};
#[allow(unused_imports)]
pub use control::{ControlHandle, FatigueSignal, NoFatigue, SharedFatigueFlag, StagedControl};
#[allow(unused_imports)]
pub use emergency::{ActiveEmergency, EmergencyPhase, EmergencyResolver, Resolution};
#[allow(unused_imports)]
pub use error::{CoordinationError, DecodeError, StalePeer, TransportError};
#[allow(unused_imports)]
pub use highway::{Highway, HighwayStats};
#[allow(unused_imports)]
pub use infrastructure::{InfrastructureReactor, SegmentId, StreetLightSegment};
#[allow(unused_imports)]
pub use node::{Dashboard, TickReport, VehicleNode};
#[allow(unused_imports)]
pub use registry::{Neighbor, PeerRecord, PeerRegistry, PeerSnapshot, UpsertOutcome};
#[allow(unused_imports)]
pub use topology::{LaneTopology, Track, DEFAULT_TRACK_LENGTH};
#[allow(unused_imports)]
pub use transport::{
    topic_matches, BrokerTransport, FaultProfile, InMemoryBroker, InboundQueue, Transport,
};
#[allow(unused_imports)]
pub use types::{
    AlertFlag, AlertFlags, Decision, HeadlightMode, Heading, Lane, LaneKind, Role, VehicleId,
    VehicleState, KMH_TO_MS, LANE_COUNT,
};
