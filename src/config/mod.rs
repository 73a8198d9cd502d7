// Copyright (c) 2026 fleetwatch
// Licensed under the MIT License. See LICENSE file in the project root.

//! Configuration module

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application name
    pub app_name: String,

    /// Application version
    pub version: String,

    /// Data directory
    pub data_dir: PathBuf,

    /// Log level
    pub log_level: String,

    /// Transport (MQTT) configuration
    pub transport: TransportConfig,

    /// Detection rule configuration
    pub detection: DetectionConfig,

    /// Window aggregation configuration
    pub window: WindowConfig,

    /// ML scoring configuration
    pub ml: MlConfig,

    /// Broadcast/push-stream configuration
    pub broadcast: BroadcastConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Telemetry simulator configuration
    pub sim: SimConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: "fleetwatch".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            transport: TransportConfig::default(),
            detection: DetectionConfig::default(),
            window: WindowConfig::default(),
            ml: MlConfig::default(),
            broadcast: BroadcastConfig::default(),
            database: DatabaseConfig::default(),
            sim: SimConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Load or create default configuration
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            config.save(path)?;
            Ok(config)
        }
    }

    /// Get configuration directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("fleetwatch"))
            .unwrap_or_else(|| PathBuf::from("./config"))
    }

    /// Get default configuration path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

/// Transport (MQTT) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Broker URL, `tcp://host:port`
    pub broker_url: String,

    /// Client identifier presented to the broker
    pub client_id: String,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Topics subscribed on every (re)connect
    pub topics: Vec<String>,

    /// Keep-alive interval in seconds
    pub keep_alive_secs: u64,

    /// Consecutive failures tolerated before the client gives up
    pub connect_retry_limit: u32,

    /// Delay between reconnect attempts in milliseconds
    pub connect_retry_delay_ms: u64,

    /// Capacity of the decoded-record work queue
    pub queue_capacity: usize,

    /// Worker tasks draining the work queue
    pub worker_count: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            broker_url: "tcp://localhost:1883".to_string(),
            client_id: "fleetwatch-ingest".to_string(),
            username: None,
            password: None,
            topics: vec!["text/vehicle/".to_string()],
            keep_alive_secs: 30,
            connect_retry_limit: 5,
            connect_retry_delay_ms: 5000,
            queue_capacity: 1000,
            worker_count: 4,
        }
    }
}

/// Detection rule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Factor applied to the raw GNSS speed before thresholding
    pub speed_scale: f64,

    /// Scaled speed above which the speed rule fires (units/s)
    pub speed_threshold: f64,

    /// Absolute steering angle above which the steering rule fires
    pub steering_threshold: i64,

    /// GNSS/header clock skew above which the timestamp rule fires (ms)
    pub timestamp_threshold_ms: i64,

    /// GNSS timestamp gap that arms the geo check (ms)
    pub geo_gate_ms: i64,

    /// Wrapped longitude delta above which the geo rule fires (degrees)
    pub longitude_threshold_deg: f64,

    /// Latitude delta above which the geo rule fires (degrees)
    pub latitude_threshold_deg: f64,

    /// Evaluate the engine plausibility rule when CAN data is present
    pub engine_rule_enabled: bool,

    /// Evaluate the brake plausibility rule when CAN data is present
    pub brake_rule_enabled: bool,

    /// Vehicle inactivity after which cached state is evicted (seconds)
    pub idle_ttl_secs: u64,

    /// Eviction sweep cadence (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            speed_scale: 0.01,
            speed_threshold: 10.0,
            steering_threshold: 10_000_000,
            timestamp_threshold_ms: 100,
            geo_gate_ms: 10_000,
            longitude_threshold_deg: 0.005,
            latitude_threshold_deg: 0.004,
            engine_rule_enabled: false,
            brake_rule_enabled: false,
            idle_ttl_secs: 10,
            sweep_interval_secs: 1,
        }
    }
}

/// Window aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Flush cadence of the anomaly-count window (seconds)
    pub flush_interval_secs: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 10,
        }
    }
}

/// ML scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlConfig {
    pub enabled: bool,

    /// Scoring endpoint URL
    pub endpoint: String,

    /// Forward every Nth record to the scorer
    pub sample_every: u64,

    /// Reconstruction error above which a record is anomalous
    pub score_threshold: f64,

    /// Request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://127.0.0.1:8081/detect-anomaly/".to_string(),
            sample_every: 5,
            score_threshold: 0.1,
            request_timeout_ms: 2000,
        }
    }
}

/// Broadcast/push-stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// WebSocket push-stream port
    pub websocket_port: u16,

    /// Push tick cadence in milliseconds
    pub tick_interval_ms: u64,

    /// Per-subscriber fan-out buffer; laggards skip past overflow
    pub fanout_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            websocket_port: 8765,
            tick_interval_ms: 1000,
            fanout_capacity: 1000,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Enable the anomaly sink
    pub enabled: bool,

    /// Database path
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("./data/fleetwatch.db"),
        }
    }
}

/// Telemetry simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Publish synthetic telemetry instead of waiting for a real fleet
    pub enabled: bool,

    /// Simulated fleet size
    pub vehicle_count: usize,

    /// Publish cadence per vehicle (ms)
    pub publish_interval_ms: u64,

    /// Probability that a generated record carries an injected anomaly
    pub anomaly_probability: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            vehicle_count: 3,
            publish_interval_ms: 200,
            anomaly_probability: 0.02,
        }
    }
}
