// Copyright (c) 2026 fleetwatch
// Licensed under the MIT License. See LICENSE file in the project root.

//! Telemetry wire format and decoder
//!
//! Records arrive over the transport as JSON with a `header` section
//! (transport metadata) and a `body` section (the vehicle report). Decoding
//! is pure: a payload either becomes an immutable [`TelemetryRecord`] or a
//! [`DecodeError`], and a bad payload never reaches the rule engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decode failure for an incoming transport payload.
///
/// These are logged and dropped by the caller; one bad message must not stop
/// the stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty telemetry payload")]
    Empty,

    #[error("malformed telemetry payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// GNSS position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub longitude: f64,
    pub latitude: f64,
}

/// Engine status, present only when the reporting unit exposes the CAN bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Engine speed in rpm.
    pub speed: i64,
    /// Engine torque in raw CAN units.
    pub torque: i64,
}

/// Brake status, present only when the reporting unit exposes the CAN bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrakeStatus {
    /// Whether the brake pedal is reported as applied.
    pub flag: bool,
    /// Pedal position in raw CAN units.
    pub position: i64,
    /// Line pressure in raw CAN units.
    pub pressure: i64,
}

/// One vehicle's periodic sensor/position report. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub vehicle_id: String,
    /// Header timestamp stamped by the reporting unit, UTC milliseconds.
    pub device_timestamp: i64,
    /// Timestamp of the GNSS fix, UTC milliseconds.
    pub gnss_timestamp: i64,
    pub position: Position,
    /// GNSS-derived speed, raw units (scaled by the speed rule).
    pub speed: f64,
    /// Steering wheel angle in raw CAN units.
    pub steering_angle: i64,
    pub engine: Option<EngineStatus>,
    pub brake: Option<BrakeStatus>,
}

/// Wire envelope: `{"header": {...}, "body": {...}}`.
///
/// Unknown fields are ignored; every field listed here without a default is
/// required and its absence is a decode failure.
#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    header: WireHeader,
    body: WireBody,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireHeader {
    timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireBody {
    #[serde(rename = "vehicleId")]
    vehicle_id: String,
    #[serde(rename = "timestampGNSS")]
    timestamp_gnss: i64,
    #[serde(rename = "velocityGNSS")]
    velocity_gnss: f64,
    #[serde(rename = "steeringAngle")]
    steering_angle: i64,
    position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    engine: Option<EngineStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    brake: Option<BrakeStatus>,
}

/// Parse a raw transport payload into a [`TelemetryRecord`].
pub fn decode(payload: &[u8]) -> Result<TelemetryRecord, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }

    let wire: WireMessage = serde_json::from_slice(payload)?;

    Ok(TelemetryRecord {
        vehicle_id: wire.body.vehicle_id,
        device_timestamp: wire.header.timestamp,
        gnss_timestamp: wire.body.timestamp_gnss,
        position: wire.body.position,
        speed: wire.body.velocity_gnss,
        steering_angle: wire.body.steering_angle,
        engine: wire.body.engine,
        brake: wire.body.brake,
    })
}

/// Serialize a record back to its wire JSON form.
///
/// Used by the simulator and by tests; `decode(encode_wire(r))` yields `r`.
pub fn encode_wire(record: &TelemetryRecord) -> serde_json::Result<Vec<u8>> {
    let wire = WireMessage {
        header: WireHeader {
            timestamp: record.device_timestamp,
        },
        body: WireBody {
            vehicle_id: record.vehicle_id.clone(),
            timestamp_gnss: record.gnss_timestamp,
            velocity_gnss: record.speed,
            steering_angle: record.steering_angle,
            position: record.position,
            engine: record.engine,
            brake: record.brake,
        },
    };
    serde_json::to_vec(&wire)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> &'static [u8] {
        br#"{
            "header": { "timestamp": 1714000000123 },
            "body": {
                "vehicleId": "veh-001",
                "timestampGNSS": 1714000000150,
                "velocityGNSS": 312.5,
                "steeringAngle": -4200,
                "position": { "longitude": 106.55, "latitude": 29.56 }
            }
        }"#
    }

    #[test]
    fn decodes_required_fields() {
        let record = decode(sample_payload()).unwrap();
        assert_eq!(record.vehicle_id, "veh-001");
        assert_eq!(record.device_timestamp, 1714000000123);
        assert_eq!(record.gnss_timestamp, 1714000000150);
        assert_eq!(record.speed, 312.5);
        assert_eq!(record.steering_angle, -4200);
        assert_eq!(record.position.longitude, 106.55);
        assert!(record.engine.is_none());
        assert!(record.brake.is_none());
    }

    #[test]
    fn ignores_unknown_fields() {
        let payload = br#"{
            "header": { "timestamp": 1, "dataCategory": 2, "ver": 1 },
            "body": {
                "vehicleId": "veh-002",
                "timestampGNSS": 2,
                "velocityGNSS": 0.0,
                "steeringAngle": 0,
                "position": { "longitude": 0.0, "latitude": 0.0, "elevation": 210 },
                "heading": 182.4,
                "messageId": 77
            }
        }"#;
        assert!(decode(payload).is_ok());
    }

    #[test]
    fn missing_required_field_is_an_error() {
        // No vehicleId in the body.
        let payload = br#"{
            "header": { "timestamp": 1 },
            "body": {
                "timestampGNSS": 2,
                "velocityGNSS": 0.0,
                "steeringAngle": 0,
                "position": { "longitude": 0.0, "latitude": 0.0 }
            }
        }"#;
        assert!(matches!(decode(payload), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn wrong_type_is_an_error() {
        let payload = br#"{
            "header": { "timestamp": "yesterday" },
            "body": {
                "vehicleId": "veh-003",
                "timestampGNSS": 2,
                "velocityGNSS": 0.0,
                "steeringAngle": 0,
                "position": { "longitude": 0.0, "latitude": 0.0 }
            }
        }"#;
        assert!(matches!(decode(payload), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn empty_payload_is_an_error() {
        assert!(matches!(decode(b""), Err(DecodeError::Empty)));
    }

    #[test]
    fn wire_round_trip_preserves_record() {
        let record = TelemetryRecord {
            vehicle_id: "veh-042".to_string(),
            device_timestamp: 1714000000123,
            gnss_timestamp: 1714000000150,
            position: Position {
                longitude: 106.551234,
                latitude: 29.563456,
            },
            speed: 1047.25,
            steering_angle: 9_999_999,
            engine: Some(EngineStatus {
                speed: 2100,
                torque: 340,
            }),
            brake: Some(BrakeStatus {
                flag: true,
                position: 60,
                pressure: 8000,
            }),
        };

        let encoded = encode_wire(&record).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, record);
    }
}
