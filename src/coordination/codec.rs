//! Telemetry codec
//!
//! Vehicle state travels as a self-describing JSON object. Unknown fields are
//! ignored for forward compatibility; missing or out-of-range fields reject
//! the whole message.

use serde::{Deserialize, Serialize};

use super::error::DecodeError;
use super::types::{AlertFlag, AlertFlags, Lane, Role, VehicleId, VehicleState};

/// On-the-wire shape of a telemetry message
#[derive(Debug, Serialize, Deserialize)]
struct WireTelemetry {
    id: String,
    lane: i64,
    position: f64,
    speed: f64,
    role: Role,
    alerts: Vec<AlertFlag>,
    timestamp_ms: u64,
}

/// Serialize a vehicle state for publishing
pub fn encode(state: &VehicleState) -> Vec<u8> {
    let wire = WireTelemetry {
        id: state.id.0.clone(),
        lane: i64::from(state.lane.index()),
        position: f64::from(state.position),
        speed: f64::from(state.speed.max(0.0)),
        role: state.role,
        alerts: state.alerts.iter().collect(),
        timestamp_ms: state.timestamp_ms,
    };

    // Serializing a struct of plain fields into a Vec cannot fail
    serde_json::to_vec(&wire).unwrap_or_default()
}

/// Parse and validate a telemetry payload
pub fn decode(payload: &[u8]) -> Result<VehicleState, DecodeError> {
    let wire: WireTelemetry = serde_json::from_slice(payload)?;

    if wire.id.trim().is_empty() {
        return Err(DecodeError::EmptyId);
    }

    let lane = Lane::from_index(wire.lane).ok_or_else(|| DecodeError::OutOfRange {
        field: "lane",
        value: wire.lane.to_string(),
    })?;

    if !wire.position.is_finite() {
        return Err(DecodeError::OutOfRange {
            field: "position",
            value: wire.position.to_string(),
        });
    }

    if !(wire.speed.is_finite() && wire.speed >= 0.0) {
        return Err(DecodeError::OutOfRange {
            field: "speed",
            value: wire.speed.to_string(),
        });
    }

    Ok(VehicleState {
        id: VehicleId(wire.id),
        lane,
        position: wire.position as f32,
        speed: wire.speed as f32,
        role: wire.role,
        alerts: wire.alerts.into_iter().collect::<AlertFlags>(),
        timestamp_ms: wire.timestamp_ms,
    })
}
