//! Detection module - per-record anomaly rules and vehicle state
//!
//! Rules come in two flavors: stateless checks on the record alone (speed,
//! steering, timestamp, engine, brake) and the stateful geo check, which
//! compares against the vehicle's cached baseline record. Evaluation is pure
//! given `(record, prior)` and independent of rule ordering.

mod state;
mod window;

pub use state::{VehicleState, VehicleStateCache};
pub use window::WindowAggregator;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::broadcast::Channel;
use crate::config::DetectionConfig;
use crate::telemetry::{BrakeStatus, EngineStatus, Position, TelemetryRecord};

/// Rule family an anomaly event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyKind {
    Speed,
    Steering,
    Timestamp,
    Geo,
    Ml,
    Engine,
    Brake,
}

impl AnomalyKind {
    /// Broadcast channel carrying this kind's live updates.
    pub fn channel(self) -> Channel {
        match self {
            AnomalyKind::Speed => Channel::Speed,
            AnomalyKind::Steering => Channel::Steering,
            AnomalyKind::Timestamp => Channel::Timestamp,
            AnomalyKind::Geo => Channel::Geo,
            AnomalyKind::Ml => Channel::Ml,
            AnomalyKind::Engine => Channel::Engine,
            AnomalyKind::Brake => Channel::Brake,
        }
    }

    /// Flag key used in push payloads, e.g. `{"vehicleId":…,"speedExp":true}`.
    pub fn flag_key(self) -> &'static str {
        match self {
            AnomalyKind::Speed => "speedExp",
            AnomalyKind::Steering => "steeringExp",
            AnomalyKind::Timestamp => "timestampExp",
            AnomalyKind::Geo => "geoLocationExp",
            AnomalyKind::Ml => "mlExp",
            AnomalyKind::Engine => "engineExp",
            AnomalyKind::Brake => "brakeExp",
        }
    }
}

/// Kind-specific magnitude captured when a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnomalyDetails {
    Speed { speed: f64 },
    Steering { steering_angle: i64 },
    Timestamp { gnss_timestamp: i64, device_timestamp: i64 },
    Geo { longitude: f64, latitude: f64 },
    Ml { score: f64 },
    Engine { speed: i64, torque: i64 },
    Brake { flag: bool, position: i64, pressure: i64 },
}

/// One firing of one rule for one vehicle. Persisted once, broadcast once,
/// never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub vehicle_id: String,
    /// Event time, UTC milliseconds (the record's header timestamp).
    pub timestamp: i64,
    pub details: AnomalyDetails,
}

impl AnomalyEvent {
    pub fn kind(&self) -> AnomalyKind {
        match self.details {
            AnomalyDetails::Speed { .. } => AnomalyKind::Speed,
            AnomalyDetails::Steering { .. } => AnomalyKind::Steering,
            AnomalyDetails::Timestamp { .. } => AnomalyKind::Timestamp,
            AnomalyDetails::Geo { .. } => AnomalyKind::Geo,
            AnomalyDetails::Ml { .. } => AnomalyKind::Ml,
            AnomalyDetails::Engine { .. } => AnomalyKind::Engine,
            AnomalyDetails::Brake { .. } => AnomalyKind::Brake,
        }
    }

    /// Live-dashboard payload for this event's channel.
    pub fn push_payload(&self) -> String {
        let mut payload = serde_json::Map::new();
        payload.insert("vehicleId".into(), self.vehicle_id.clone().into());
        payload.insert(self.kind().flag_key().into(), serde_json::Value::Bool(true));
        serde_json::Value::Object(payload).to_string()
    }
}

/// Applies every configured rule to each incoming record.
pub struct RuleEngine {
    config: DetectionConfig,
    cache: Arc<VehicleStateCache>,
}

impl RuleEngine {
    pub fn new(config: DetectionConfig, cache: Arc<VehicleStateCache>) -> Self {
        Self { config, cache }
    }

    /// Evaluate all rules for one record, returning every event that fired.
    ///
    /// The geo check only runs when a cached baseline exists and the GNSS
    /// timestamp has advanced past the gate; running it replaces the
    /// baseline with the current record. No other rule touches the cache.
    pub fn evaluate(&self, record: &TelemetryRecord) -> Vec<AnomalyEvent> {
        let cfg = &self.config;
        let mut events = Vec::new();

        let mut fire = |details: AnomalyDetails| {
            events.push(AnomalyEvent {
                vehicle_id: record.vehicle_id.clone(),
                timestamp: record.device_timestamp,
                details,
            });
        };

        if is_speed_anomaly(cfg, record.speed) {
            fire(AnomalyDetails::Speed { speed: record.speed });
        }

        if is_steering_anomaly(cfg, record.steering_angle) {
            fire(AnomalyDetails::Steering {
                steering_angle: record.steering_angle,
            });
        }

        if is_timestamp_anomaly(cfg, record.gnss_timestamp, record.device_timestamp) {
            fire(AnomalyDetails::Timestamp {
                gnss_timestamp: record.gnss_timestamp,
                device_timestamp: record.device_timestamp,
            });
        }

        if cfg.engine_rule_enabled {
            if let Some(engine) = &record.engine {
                if is_engine_anomaly(engine) {
                    fire(AnomalyDetails::Engine {
                        speed: engine.speed,
                        torque: engine.torque,
                    });
                }
            }
        }

        if cfg.brake_rule_enabled {
            if let Some(brake) = &record.brake {
                if is_brake_anomaly(brake) {
                    fire(AnomalyDetails::Brake {
                        flag: brake.flag,
                        position: brake.position,
                        pressure: brake.pressure,
                    });
                }
            }
        }

        // Stateful: gate on the GNSS timestamp gap to the cached baseline.
        // Passing the gate replaces the baseline whether or not the rule
        // fires; the eviction clock refreshes on every record regardless.
        let gate_ms = cfg.geo_gate_ms;
        let prior = self.cache.observe(record, |prior| {
            (record.gnss_timestamp - prior.gnss_timestamp).abs() > gate_ms
        });

        if let Some(prior) = prior {
            if is_geo_anomaly(cfg, &record.position, &prior.position) {
                fire(AnomalyDetails::Geo {
                    longitude: record.position.longitude,
                    latitude: record.position.latitude,
                });
            }
        }

        events
    }
}

fn is_speed_anomaly(cfg: &DetectionConfig, speed: f64) -> bool {
    speed * cfg.speed_scale > cfg.speed_threshold
}

fn is_steering_anomaly(cfg: &DetectionConfig, steering_angle: i64) -> bool {
    steering_angle.abs() > cfg.steering_threshold
}

fn is_timestamp_anomaly(cfg: &DetectionConfig, gnss_timestamp: i64, device_timestamp: i64) -> bool {
    (gnss_timestamp - device_timestamp).abs() > cfg.timestamp_threshold_ms
}

/// Longitude deltas are wrapped: two points straddling the antimeridian are
/// close, not 359.9° apart.
fn wrapped_longitude_delta(a: f64, b: f64) -> f64 {
    let delta = (a - b).abs();
    if delta > 180.0 {
        360.0 - delta
    } else {
        delta
    }
}

fn is_geo_anomaly(cfg: &DetectionConfig, current: &Position, prior: &Position) -> bool {
    wrapped_longitude_delta(current.longitude, prior.longitude) > cfg.longitude_threshold_deg
        || (current.latitude - prior.latitude).abs() > cfg.latitude_threshold_deg
}

// Engine/brake plausibility bounds are fixed CAN-level constants rather than
// tunable thresholds.
const ENGINE_SPEED_FLOOR: i64 = 50;
const ENGINE_TORQUE_CEILING: i64 = 50_000;
const BRAKE_POSITION_FLOOR: i64 = 50;
const BRAKE_PRESSURE_FLOOR: i64 = 5_000;

fn is_engine_anomaly(engine: &EngineStatus) -> bool {
    engine.speed < ENGINE_SPEED_FLOOR && engine.torque >= ENGINE_TORQUE_CEILING
}

fn is_brake_anomaly(brake: &BrakeStatus) -> bool {
    if brake.flag {
        brake.position < BRAKE_POSITION_FLOOR && brake.pressure < BRAKE_PRESSURE_FLOOR
    } else {
        brake.position != 0 || brake.pressure != 0
    }
}
