// Copyright (c) 2026 fleetwatch
// Licensed under the MIT License. See LICENSE file in the project root.

//! Telemetry simulator for demo/testing
//!
//! Publishes plausible synthetic records to the configured ingest topic so
//! the whole pipeline, broker included, can be exercised without a real
//! fleet. Vehicles drift around a baseline with Gaussian noise; a small
//! fraction of records carries an injected anomaly.

use anyhow::Result;
use chrono::Utc;
use rand::prelude::*;
use rand_distr::Normal;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{SimConfig, TransportConfig};
use crate::telemetry::{encode_wire, Position, TelemetryRecord};
use crate::transport::parse_broker_url;

struct SimVehicle {
    id: String,
    longitude: f64,
    latitude: f64,
}

/// Drive the simulator until shutdown.
pub async fn run(
    config: SimConfig,
    transport: TransportConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let (host, port) = parse_broker_url(&transport.broker_url)?;
    let client_id = format!("{}-sim", transport.client_id);
    let topic = transport
        .topics
        .first()
        .cloned()
        .unwrap_or_else(|| "text/vehicle/".to_string());

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(Duration::from_secs(transport.keep_alive_secs));
    if let (Some(username), Some(password)) = (&transport.username, &transport.password) {
        options.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(options, 10);

    // Keep the client's event loop turning; the simulator is best-effort and
    // just waits out broker outages.
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                debug!("Simulator MQTT error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    let mut rng = StdRng::from_entropy();
    let mut vehicles: Vec<SimVehicle> = (0..config.vehicle_count)
        .map(|i| SimVehicle {
            id: format!("sim-{:03}", i),
            longitude: 106.50 + rng.gen_range(-0.05..0.05),
            latitude: 29.55 + rng.gen_range(-0.05..0.05),
        })
        .collect();

    info!(
        "Simulator publishing {} vehicle(s) to {} every {} ms",
        config.vehicle_count, topic, config.publish_interval_ms
    );

    let mut interval = tokio::time::interval(Duration::from_millis(config.publish_interval_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for vehicle in &mut vehicles {
                    let record = next_record(vehicle, config.anomaly_probability, &mut rng);
                    match encode_wire(&record) {
                        Ok(payload) => {
                            if let Err(e) = client.publish(&topic, QoS::AtMostOnce, false, payload).await {
                                warn!("Simulator publish failed: {}", e);
                            }
                        }
                        Err(e) => warn!("Simulator could not encode record: {}", e),
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Simulator shutting down");
                let _ = client.disconnect().await;
                return Ok(());
            }
        }
    }
}

fn next_record(vehicle: &mut SimVehicle, anomaly_probability: f64, rng: &mut StdRng) -> TelemetryRecord {
    let noise: Normal<f64> = Normal::new(0.0, 1.0).expect("valid distribution");

    // Ordinary driving: a gentle random walk well inside every threshold.
    vehicle.longitude += rng.gen_range(-0.00004..0.00004);
    vehicle.latitude += rng.gen_range(-0.00003..0.00003);

    let device_timestamp = Utc::now().timestamp_millis();
    let mut record = TelemetryRecord {
        vehicle_id: vehicle.id.clone(),
        device_timestamp,
        gnss_timestamp: device_timestamp + (noise.sample(rng) * 20.0).clamp(-80.0, 80.0) as i64,
        position: Position {
            longitude: vehicle.longitude,
            latitude: vehicle.latitude,
        },
        speed: (300.0 + noise.sample(rng) * 80.0).max(0.0),
        steering_angle: (noise.sample(rng) * 100_000.0) as i64,
        engine: None,
        brake: None,
    };

    if rng.gen::<f64>() < anomaly_probability {
        match rng.gen_range(0..4) {
            0 => record.speed = rng.gen_range(1_100.0..3_000.0),
            1 => record.steering_angle = 10_000_001 + rng.gen_range(0..10_000_000),
            2 => record.gnss_timestamp = record.device_timestamp + rng.gen_range(101..2_000),
            _ => record.position.longitude += rng.gen_range(0.006..0.05),
        }
    }

    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_records_stay_inside_the_thresholds() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut vehicle = SimVehicle {
            id: "sim-000".to_string(),
            longitude: 106.5,
            latitude: 29.5,
        };

        for _ in 0..200 {
            let record = next_record(&mut vehicle, 0.0, &mut rng);
            assert!(record.speed * 0.01 <= 10.0);
            assert!(record.steering_angle.abs() <= 10_000_000);
            assert!((record.gnss_timestamp - record.device_timestamp).abs() <= 100);
        }
    }

    #[test]
    fn injected_anomalies_break_at_least_one_rule() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut vehicle = SimVehicle {
            id: "sim-000".to_string(),
            longitude: 106.5,
            latitude: 29.5,
        };

        let mut anomalous = 0;
        for _ in 0..200 {
            let before = vehicle.longitude;
            let record = next_record(&mut vehicle, 1.0, &mut rng);
            let jumped = (record.position.longitude - before).abs() > 0.005;
            if record.speed * 0.01 > 10.0
                || record.steering_angle.abs() > 10_000_000
                || (record.gnss_timestamp - record.device_timestamp).abs() > 100
                || jumped
            {
                anomalous += 1;
            }
        }
        assert_eq!(anomalous, 200);
    }
}
