//! Error taxonomy of the coordination core
//!
//! Nothing here is fatal to a tick. Decode failures drop the message, a
//! missing safe lane defers the lane change and transport failures degrade
//! the node to local-only decisions.

use thiserror::Error;

use super::types::{Lane, VehicleId};

/// Why a wire payload was rejected
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is not valid telemetry: {0}")]
    Syntax(#[from] serde_json::Error),

    #[error("field `{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: String },

    #[error("empty vehicle identifier")]
    EmptyId,
}

/// Failures of the publish/subscribe transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("invalid topic `{0}`")]
    InvalidTopic(String),
}

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] DecodeError),

    #[error("no safe lane towards {requested} from lane {current}")]
    NoSafeLane { current: Lane, requested: Lane },

    #[error("lane change towards {requested} from lane {current} held by cooldown")]
    LaneChangeCooldown { current: Lane, requested: Lane },

    #[error("{0}")]
    TransportUnavailable(#[from] TransportError),
}

/// A peer dropped from the registry for lack of updates.
///
/// A lifecycle event rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalePeer {
    pub id: VehicleId,
    /// Time since the last accepted update
    pub silent_for_ms: u64,
}
