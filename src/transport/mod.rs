// Copyright (c) 2026 fleetwatch
// Licensed under the MIT License. See LICENSE file in the project root.

//! MQTT transport client
//!
//! Owns the broker connection and its event loop. Incoming publishes are
//! decoded and handed to the pipeline through a bounded work queue, so rule
//! evaluation never runs on the transport path. Connection loss is retried a
//! bounded number of times with a fixed delay; exhausting the budget reports
//! a terminal failure without touching the rest of the process.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::TransportConfig;
use crate::telemetry::{self, TelemetryRecord};

const DEFAULT_QOS: QoS = QoS::AtMostOnce;

/// Transport-level failure surfaced to the control plane.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid broker url `{0}`: expected tcp://host:port")]
    InvalidBrokerUrl(String),
}

/// Connection lifecycle as observed by the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    /// Retry budget exhausted; the client stopped polling.
    Failed,
}

/// One decoded record as delivered to the pipeline workers.
#[derive(Debug, Clone)]
pub struct IngestMessage {
    pub topic: String,
    pub record: TelemetryRecord,
}

/// Bounded reconnect: a fixed delay between attempts, terminal failure once
/// the consecutive-failure budget is spent.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    limit: u32,
    delay: Duration,
}

#[derive(Debug, PartialEq, Eq)]
enum RetryAction {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    fn next_action(&self, consecutive_failures: u32) -> RetryAction {
        if consecutive_failures >= self.limit {
            RetryAction::GiveUp
        } else {
            RetryAction::RetryAfter(self.delay)
        }
    }
}

struct ActiveConnection {
    client: AsyncClient,
    task: tokio::task::JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

/// MQTT client wrapper feeding the ingest queue.
pub struct TransportClient {
    settings: parking_lot::Mutex<TransportConfig>,
    // Held across teardown+rebuild so a delivery loop can never observe a
    // half-rebuilt client.
    active: tokio::sync::Mutex<Option<ActiveConnection>>,
    state: Arc<parking_lot::Mutex<ConnectionState>>,
    ingest_tx: mpsc::Sender<IngestMessage>,
}

impl TransportClient {
    pub fn new(settings: TransportConfig, ingest_tx: mpsc::Sender<IngestMessage>) -> Self {
        Self {
            settings: parking_lot::Mutex::new(settings),
            active: tokio::sync::Mutex::new(None),
            state: Arc::new(parking_lot::Mutex::new(ConnectionState::Disconnected)),
            ingest_tx,
        }
    }

    /// Start the client and its event loop. No-op when already running.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut active = self.active.lock().await;
        if active.is_none() {
            *active = Some(self.start_connection()?);
        }
        Ok(())
    }

    /// Stop the client. Outstanding event-loop work is given a grace period
    /// before the task is aborted.
    pub async fn disconnect(&self) {
        let mut active = self.active.lock().await;
        if let Some(conn) = active.take() {
            teardown(conn).await;
        }
        *self.state.lock() = ConnectionState::Disconnected;
    }

    /// Tear down any existing connection and rebuild it with new parameters.
    ///
    /// Safe to call while messages are being delivered: the old event loop
    /// is fully stopped before the new settings take effect.
    pub async fn reinitialize(
        &self,
        broker_url: String,
        client_id: String,
        username: Option<String>,
        password: Option<String>,
        topics: Vec<String>,
    ) -> Result<(), TransportError> {
        let mut active = self.active.lock().await;
        if let Some(conn) = active.take() {
            teardown(conn).await;
        }

        {
            let mut settings = self.settings.lock();
            settings.broker_url = broker_url;
            settings.client_id = client_id;
            settings.username = username;
            settings.password = password;
            settings.topics = topics;
        }

        *active = Some(self.start_connection()?);
        info!("Transport reinitialized");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Subscribed
        )
    }

    fn start_connection(&self) -> Result<ActiveConnection, TransportError> {
        let settings = self.settings.lock().clone();
        let (host, port) = parse_broker_url(&settings.broker_url)?;

        let mut options = MqttOptions::new(&settings.client_id, host, port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, 100);
        let (stop_tx, stop_rx) = watch::channel(false);

        *self.state.lock() = ConnectionState::Connecting;

        let policy = RetryPolicy {
            limit: settings.connect_retry_limit,
            delay: Duration::from_millis(settings.connect_retry_delay_ms),
        };
        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            settings,
            policy,
            self.ingest_tx.clone(),
            Arc::clone(&self.state),
            stop_rx,
        ));

        Ok(ActiveConnection {
            client,
            task,
            stop_tx,
        })
    }
}

async fn teardown(mut conn: ActiveConnection) {
    if let Err(e) = conn.client.disconnect().await {
        warn!("MQTT disconnect request failed: {}", e);
    }
    let _ = conn.stop_tx.send(true);

    match tokio::time::timeout(Duration::from_secs(2), &mut conn.task).await {
        Ok(_) => info!("Transport event loop stopped"),
        Err(_) => {
            conn.task.abort();
            warn!("Transport event loop aborted with operations possibly outstanding");
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    settings: TransportConfig,
    policy: RetryPolicy,
    ingest_tx: mpsc::Sender<IngestMessage>,
    state: Arc<parking_lot::Mutex<ConnectionState>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut consecutive_failures = 0u32;

    loop {
        let event = tokio::select! {
            _ = stop_rx.changed() => return,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                consecutive_failures = 0;
                *state.lock() = ConnectionState::Connected;
                info!("MQTT connected to {}", settings.broker_url);

                // Subscription state does not survive a reconnect; always
                // subscribe the full configured set.
                let mut subscribed = true;
                for topic in &settings.topics {
                    match client.subscribe(topic, DEFAULT_QOS).await {
                        Ok(()) => info!("Subscribed to topic: {}", topic),
                        Err(e) => {
                            warn!("Subscribe failed for {}: {}", topic, e);
                            subscribed = false;
                        }
                    }
                }
                if subscribed {
                    *state.lock() = ConnectionState::Subscribed;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match telemetry::decode(&publish.payload) {
                    Ok(record) => {
                        let message = IngestMessage {
                            topic: publish.topic.clone(),
                            record,
                        };
                        match ingest_tx.try_send(message) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                warn!("Ingest queue full, dropping record from {}", publish.topic);
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                info!("Ingest queue closed, stopping transport event loop");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Dropping undecodable message on {}: {}", publish.topic, e);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                consecutive_failures += 1;
                *state.lock() = ConnectionState::Connecting;

                match policy.next_action(consecutive_failures) {
                    RetryAction::RetryAfter(delay) => {
                        warn!(
                            "MQTT error ({}/{}): {}; retrying in {:?}",
                            consecutive_failures, policy.limit, e, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    RetryAction::GiveUp => {
                        error!(
                            "MQTT connection failed {} consecutive times, giving up: {}",
                            consecutive_failures, e
                        );
                        *state.lock() = ConnectionState::Failed;
                        return;
                    }
                }
            }
        }
    }
}

pub(crate) fn parse_broker_url(url: &str) -> Result<(String, u16), TransportError> {
    let rest = url
        .strip_prefix("tcp://")
        .ok_or_else(|| TransportError::InvalidBrokerUrl(url.to_string()))?;

    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidBrokerUrl(url.to_string()))?;

    let port: u16 = port
        .parse()
        .map_err(|_| TransportError::InvalidBrokerUrl(url.to_string()))?;

    if host.is_empty() {
        return Err(TransportError::InvalidBrokerUrl(url.to_string()));
    }

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_url_parsing() {
        assert_eq!(
            parse_broker_url("tcp://broker.example.com:1883").unwrap(),
            ("broker.example.com".to_string(), 1883)
        );
        assert!(parse_broker_url("mqtt://broker:1883").is_err());
        assert!(parse_broker_url("tcp://broker").is_err());
        assert!(parse_broker_url("tcp://broker:notaport").is_err());
        assert!(parse_broker_url("tcp://:1883").is_err());
    }

    #[test]
    fn retry_policy_gives_up_at_the_limit() {
        let policy = RetryPolicy {
            limit: 3,
            delay: Duration::from_millis(100),
        };
        assert_eq!(
            policy.next_action(1),
            RetryAction::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            policy.next_action(2),
            RetryAction::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(policy.next_action(3), RetryAction::GiveUp);
        assert_eq!(policy.next_action(4), RetryAction::GiveUp);
    }

    #[tokio::test]
    async fn bounded_retries_end_in_terminal_failure() {
        let settings = TransportConfig {
            // Nothing listens on port 1; every attempt is refused.
            broker_url: "tcp://127.0.0.1:1".to_string(),
            connect_retry_limit: 2,
            connect_retry_delay_ms: 10,
            ..TransportConfig::default()
        };
        let (ingest_tx, _ingest_rx) = mpsc::channel(8);
        let client = TransportClient::new(settings, ingest_tx);

        client.connect().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while client.state() != ConnectionState::Failed {
            assert!(
                tokio::time::Instant::now() < deadline,
                "transport never reached terminal failure"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_a_no_op() {
        let (ingest_tx, _ingest_rx) = mpsc::channel(8);
        let client = TransportClient::new(TransportConfig::default(), ingest_tx);
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
