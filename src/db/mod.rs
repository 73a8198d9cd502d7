// Copyright (c) 2026 fleetwatch
// Licensed under the MIT License. See LICENSE file in the project root.

//! Anomaly persistence sink
//!
//! Append-only storage for anomaly events, one table per rule family. The
//! sink is deliberately opaque to the rest of the pipeline: events go in
//! once, write failures are logged and the event is lost for storage only
//! (it still reaches the live dashboards).

use anyhow::Result;
use chrono::DateTime;
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::detection::{AnomalyDetails, AnomalyEvent, AnomalyKind};

/// SQLite-backed anomaly sink.
pub struct PersistenceSink {
    conn: Arc<Mutex<Connection>>,
}

impl PersistenceSink {
    /// Open or create the sink database.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&config.path)?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        let sink = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        sink.create_tables()?;

        info!("Anomaly sink opened at {:?}", config.path);
        Ok(sink)
    }

    /// In-memory sink for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let sink = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        sink.create_tables()?;
        Ok(sink)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS speed_anomalies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vehicle_id TEXT NOT NULL,
                speed REAL NOT NULL,
                timestamp TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS steering_anomalies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vehicle_id TEXT NOT NULL,
                steering_angle INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS timestamp_anomalies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vehicle_id TEXT NOT NULL,
                gnss_timestamp INTEGER NOT NULL,
                device_timestamp INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS geo_anomalies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vehicle_id TEXT NOT NULL,
                longitude REAL NOT NULL,
                latitude REAL NOT NULL,
                timestamp TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS ml_anomalies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vehicle_id TEXT NOT NULL,
                score REAL NOT NULL,
                timestamp TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS engine_anomalies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vehicle_id TEXT NOT NULL,
                engine_speed INTEGER NOT NULL,
                engine_torque INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS brake_anomalies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vehicle_id TEXT NOT NULL,
                brake_flag INTEGER NOT NULL,
                brake_position INTEGER NOT NULL,
                brake_pressure INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_speed_vehicle ON speed_anomalies(vehicle_id);
            CREATE INDEX IF NOT EXISTS idx_steering_vehicle ON steering_anomalies(vehicle_id);
            CREATE INDEX IF NOT EXISTS idx_timestamp_vehicle ON timestamp_anomalies(vehicle_id);
            CREATE INDEX IF NOT EXISTS idx_geo_vehicle ON geo_anomalies(vehicle_id);
            CREATE INDEX IF NOT EXISTS idx_ml_vehicle ON ml_anomalies(vehicle_id);
        "#,
        )?;

        Ok(())
    }

    /// Append one anomaly event. Each event is written at most once; the
    /// caller does not retry failures.
    pub fn insert_anomaly(&self, event: &AnomalyEvent) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let timestamp = rfc3339(event.timestamp);

        match &event.details {
            AnomalyDetails::Speed { speed } => {
                conn.execute(
                    "INSERT INTO speed_anomalies (vehicle_id, speed, timestamp) VALUES (?1, ?2, ?3)",
                    params![event.vehicle_id, speed, timestamp],
                )?;
            }
            AnomalyDetails::Steering { steering_angle } => {
                conn.execute(
                    "INSERT INTO steering_anomalies (vehicle_id, steering_angle, timestamp) VALUES (?1, ?2, ?3)",
                    params![event.vehicle_id, steering_angle, timestamp],
                )?;
            }
            AnomalyDetails::Timestamp {
                gnss_timestamp,
                device_timestamp,
            } => {
                conn.execute(
                    "INSERT INTO timestamp_anomalies (vehicle_id, gnss_timestamp, device_timestamp, timestamp) VALUES (?1, ?2, ?3, ?4)",
                    params![event.vehicle_id, gnss_timestamp, device_timestamp, timestamp],
                )?;
            }
            AnomalyDetails::Geo {
                longitude,
                latitude,
            } => {
                conn.execute(
                    "INSERT INTO geo_anomalies (vehicle_id, longitude, latitude, timestamp) VALUES (?1, ?2, ?3, ?4)",
                    params![event.vehicle_id, longitude, latitude, timestamp],
                )?;
            }
            AnomalyDetails::Ml { score } => {
                conn.execute(
                    "INSERT INTO ml_anomalies (vehicle_id, score, timestamp) VALUES (?1, ?2, ?3)",
                    params![event.vehicle_id, score, timestamp],
                )?;
            }
            AnomalyDetails::Engine { speed, torque } => {
                conn.execute(
                    "INSERT INTO engine_anomalies (vehicle_id, engine_speed, engine_torque, timestamp) VALUES (?1, ?2, ?3, ?4)",
                    params![event.vehicle_id, speed, torque, timestamp],
                )?;
            }
            AnomalyDetails::Brake {
                flag,
                position,
                pressure,
            } => {
                conn.execute(
                    "INSERT INTO brake_anomalies (vehicle_id, brake_flag, brake_position, brake_pressure, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![event.vehicle_id, flag, position, pressure, timestamp],
                )?;
            }
        }

        Ok(())
    }

    /// Rows stored for one rule family, used by operators and tests.
    pub fn count_anomalies(&self, kind: AnomalyKind) -> Result<u64> {
        let table = match kind {
            AnomalyKind::Speed => "speed_anomalies",
            AnomalyKind::Steering => "steering_anomalies",
            AnomalyKind::Timestamp => "timestamp_anomalies",
            AnomalyKind::Geo => "geo_anomalies",
            AnomalyKind::Ml => "ml_anomalies",
            AnomalyKind::Engine => "engine_anomalies",
            AnomalyKind::Brake => "brake_anomalies",
        };

        let conn = self.conn.lock().unwrap();
        let count: u64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }
}

fn rfc3339(timestamp_ms: i64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(details: AnomalyDetails) -> AnomalyEvent {
        AnomalyEvent {
            vehicle_id: "v1".to_string(),
            timestamp: 1_714_000_000_000,
            details,
        }
    }

    #[test]
    fn each_kind_lands_in_its_own_table() {
        let sink = PersistenceSink::open_in_memory().unwrap();

        sink.insert_anomaly(&event(AnomalyDetails::Speed { speed: 2000.0 })).unwrap();
        sink.insert_anomaly(&event(AnomalyDetails::Steering { steering_angle: 20_000_001 })).unwrap();
        sink.insert_anomaly(&event(AnomalyDetails::Timestamp {
            gnss_timestamp: 200,
            device_timestamp: 0,
        }))
        .unwrap();
        sink.insert_anomaly(&event(AnomalyDetails::Geo {
            longitude: 106.5,
            latitude: 29.5,
        }))
        .unwrap();
        sink.insert_anomaly(&event(AnomalyDetails::Ml { score: 0.42 })).unwrap();

        assert_eq!(sink.count_anomalies(AnomalyKind::Speed).unwrap(), 1);
        assert_eq!(sink.count_anomalies(AnomalyKind::Steering).unwrap(), 1);
        assert_eq!(sink.count_anomalies(AnomalyKind::Timestamp).unwrap(), 1);
        assert_eq!(sink.count_anomalies(AnomalyKind::Geo).unwrap(), 1);
        assert_eq!(sink.count_anomalies(AnomalyKind::Ml).unwrap(), 1);
        assert_eq!(sink.count_anomalies(AnomalyKind::Engine).unwrap(), 0);
    }

    #[test]
    fn repeated_inserts_append() {
        let sink = PersistenceSink::open_in_memory().unwrap();
        for _ in 0..3 {
            sink.insert_anomaly(&event(AnomalyDetails::Speed { speed: 1500.0 })).unwrap();
        }
        assert_eq!(sink.count_anomalies(AnomalyKind::Speed).unwrap(), 3);
    }

    #[test]
    fn timestamps_are_stored_as_rfc3339() {
        assert_eq!(rfc3339(0), "1970-01-01T00:00:00+00:00");
        assert!(rfc3339(1_714_000_000_000).starts_with("2024-04-24T"));
    }
}
