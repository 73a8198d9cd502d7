// Copyright (c) 2026 fleetwatch
// Licensed under the MIT License. See LICENSE file in the project root.

//! ML scoring client
//!
//! Forwards a sampled subset of records to the external scoring service and
//! interprets its reconstruction error. Scoring is advisory: any failure is
//! logged and the record simply goes unclassified, the ingestion path never
//! waits on it beyond the request itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::MlConfig;
use crate::telemetry::{self, TelemetryRecord};

/// Scoring service response body.
#[derive(Debug, Deserialize)]
struct ScoreResponse {
    vehicle_id: String,
    mse: f64,
}

/// Outcome of one scored record. `anomalous == false` is still broadcast so
/// dashboards can show a healthy state instead of silence.
#[derive(Debug, Clone, PartialEq)]
pub struct MlVerdict {
    pub vehicle_id: String,
    pub score: f64,
    pub anomalous: bool,
}

impl MlVerdict {
    /// Live-dashboard payload for the ML channel.
    pub fn push_payload(&self) -> String {
        serde_json::json!({
            "vehicleId": self.vehicle_id,
            "mlExp": self.anomalous,
        })
        .to_string()
    }
}

/// Client for the external anomaly scoring endpoint.
pub struct MlScoringClient {
    http: reqwest::Client,
    config: MlConfig,
    // Global sample counter; every Nth record overall goes to the scorer.
    counter: AtomicU64,
}

impl MlScoringClient {
    pub fn new(config: MlConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::default()
            });

        Self {
            http,
            config,
            counter: AtomicU64::new(0),
        }
    }

    /// Classify one record, returning `None` for records outside the sample
    /// or when the scorer is unavailable.
    pub async fn classify(&self, record: &TelemetryRecord) -> Option<MlVerdict> {
        if !self.config.enabled || !self.sample(record) {
            return None;
        }

        let payload = match telemetry::encode_wire(record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not serialize record for scoring: {}", e);
                return None;
            }
        };

        let response = match self
            .http
            .post(&self.config.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Scoring endpoint unreachable, skipping ML classification: {}", e);
                return None;
            }
        };

        let score: ScoreResponse = match response.error_for_status() {
            Ok(response) => match response.json().await {
                Ok(score) => score,
                Err(e) => {
                    warn!("Malformed scoring response, skipping ML classification: {}", e);
                    return None;
                }
            },
            Err(e) => {
                warn!("Scoring endpoint returned an error, skipping ML classification: {}", e);
                return None;
            }
        };

        debug!("ML score for {}: {}", score.vehicle_id, score.mse);
        Some(self.verdict(score))
    }

    fn sample(&self, record: &TelemetryRecord) -> bool {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let sampled = self.config.sample_every > 0 && n % self.config.sample_every == 0;
        if !sampled {
            debug!("Record from {} outside the ML sample", record.vehicle_id);
        }
        sampled
    }

    fn verdict(&self, score: ScoreResponse) -> MlVerdict {
        MlVerdict {
            anomalous: score.mse > self.config.score_threshold,
            vehicle_id: score.vehicle_id,
            score: score.mse,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Position;

    fn record() -> TelemetryRecord {
        TelemetryRecord {
            vehicle_id: "v1".to_string(),
            device_timestamp: 1,
            gnss_timestamp: 1,
            position: Position {
                longitude: 0.0,
                latitude: 0.0,
            },
            speed: 0.0,
            steering_angle: 0,
            engine: None,
            brake: None,
        }
    }

    #[test]
    fn only_every_nth_record_is_sampled() {
        let client = MlScoringClient::new(MlConfig::default());
        let rec = record();

        let sampled: Vec<bool> = (0..10).map(|_| client.sample(&rec)).collect();
        assert_eq!(
            sampled,
            vec![false, false, false, false, true, false, false, false, false, true]
        );
    }

    #[test]
    fn verdict_threshold_is_exclusive() {
        let client = MlScoringClient::new(MlConfig::default());

        let normal = client.verdict(ScoreResponse {
            vehicle_id: "v1".to_string(),
            mse: 0.1,
        });
        assert!(!normal.anomalous);

        let anomalous = client.verdict(ScoreResponse {
            vehicle_id: "v1".to_string(),
            mse: 0.100001,
        });
        assert!(anomalous.anomalous);
    }

    #[test]
    fn healthy_verdict_is_still_broadcast_as_green() {
        let verdict = MlVerdict {
            vehicle_id: "v2".to_string(),
            score: 0.01,
            anomalous: false,
        };
        let payload: serde_json::Value = serde_json::from_str(&verdict.push_payload()).unwrap();
        assert_eq!(payload["vehicleId"], "v2");
        assert_eq!(payload["mlExp"], false);
    }

    #[tokio::test]
    async fn disabled_client_never_classifies() {
        let config = MlConfig {
            enabled: false,
            ..MlConfig::default()
        };
        let client = MlScoringClient::new(config);
        assert!(client.classify(&record()).await.is_none());
    }

    #[tokio::test]
    async fn unsampled_records_skip_the_network_entirely() {
        // Endpoint is unroutable; the first four records must not touch it.
        let config = MlConfig {
            endpoint: "http://127.0.0.1:1/detect-anomaly/".to_string(),
            ..MlConfig::default()
        };
        let client = MlScoringClient::new(config);
        for _ in 0..4 {
            assert!(client.classify(&record()).await.is_none());
        }
    }
}
