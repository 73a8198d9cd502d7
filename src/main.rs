// Copyright (c) 2026 fleetwatch
// Licensed under the MIT License. See LICENSE file in the project root.

//! fleetwatch - Vehicle Telemetry Anomaly Detection Pipeline
//!
//! Ingests vehicle telemetry over MQTT, evaluates per-vehicle anomaly rules
//! against each vehicle's last known state, aggregates anomaly counts into
//! fixed windows, and pushes live results to dashboard clients over
//! WebSocket streams.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use fleetwatch::{Config, Pipeline, VERSION};

/// fleetwatch - Vehicle Telemetry Anomaly Detection Pipeline
#[derive(Parser, Debug)]
#[command(name = "fleetwatch")]
#[command(author = "fleetwatch project")]
#[command(version = VERSION)]
#[command(about = "Streaming anomaly detection for vehicle telemetry")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable trace-level logging
    #[arg(long)]
    trace: bool,

    /// Publish simulated telemetry alongside ingestion
    #[arg(long)]
    sim: bool,

    /// MQTT broker URL (tcp://host:port)
    #[arg(long)]
    broker: Option<String>,

    /// WebSocket push-stream port
    #[arg(long)]
    ws_port: Option<u16>,

    /// Data output directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.trace {
        Level::TRACE
    } else if args.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(args.debug)
        .with_line_number(args.debug)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("fleetwatch v{} - Vehicle Telemetry Anomaly Detection Pipeline", VERSION);

    // Load or create configuration
    let config_path = args.config.unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_create(&config_path)?;

    // Override with command line args
    if args.sim {
        config.sim.enabled = true;
    }
    if let Some(broker) = args.broker {
        config.transport.broker_url = broker;
    }
    if let Some(port) = args.ws_port {
        config.broadcast.websocket_port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.database.path = data_dir.join("fleetwatch.db");
        config.data_dir = data_dir;
    }

    info!("Configuration loaded from {:?}", config_path);
    info!("Broker: {}", config.transport.broker_url);
    info!("Simulator: {}", config.sim.enabled);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let pipeline = Pipeline::new(config)?;
        pipeline.run().await
    })?;

    info!("fleetwatch shutdown complete");

    Ok(())
}
