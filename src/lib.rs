// Copyright (c) 2026 fleetwatch
// Licensed under the MIT License. See LICENSE file in the project root.

//! fleetwatch - Vehicle Telemetry Anomaly Detection Pipeline
//!
//! A single-process streaming pipeline:
//! - MQTT ingest with bounded-retry reconnect and resubscribe
//! - Per-vehicle rule evaluation against cached last-known state
//! - Sampled scoring through an external ML endpoint
//! - Fixed-window anomaly counting
//! - Live fan-out to dashboard clients over WebSocket push streams
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     fleetwatch Pipeline                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌─────────┐   ┌───────────┐  ┌───────────┐  │
//! │  │ Transport │ → │ Decoder │ → │ Detection │→ │ Broadcast │  │
//! │  │  (MQTT)   │   │         │   │  Engine   │  │    Hub    │  │
//! │  └───────────┘   └─────────┘   └───────────┘  └───────────┘  │
//! │                       │             │   │           ↓        │
//! │                  ┌─────────┐  ┌────────┐ │    ┌───────────┐  │
//! │                  │   ML    │  │ Window │ │    │ WebSocket │  │
//! │                  │ Scoring │  │ Counts │ │    │  Streams  │  │
//! │                  └─────────┘  └────────┘ │    └───────────┘  │
//! │                                     ┌────────┐               │
//! │                                     │  Sink  │               │
//! │                                     └────────┘               │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod broadcast;
pub mod config;
pub mod core;
pub mod db;
pub mod detection;
pub mod ml;
pub mod sim;
pub mod telemetry;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastHub, Channel};
pub use config::Config;
pub use crate::core::Pipeline;
pub use db::PersistenceSink;
pub use detection::{AnomalyEvent, AnomalyKind, RuleEngine, VehicleStateCache, WindowAggregator};
pub use ml::MlScoringClient;
pub use telemetry::{decode, TelemetryRecord};
pub use transport::{ConnectionState, TransportClient};

/// fleetwatch version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// fleetwatch name
pub const NAME: &str = "fleetwatch";
