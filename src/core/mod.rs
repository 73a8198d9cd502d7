//! Core pipeline - wires transport, detection, scoring, storage and fan-out
//!
//! One [`Pipeline`] per process. Transport I/O is decoupled from rule
//! evaluation by a bounded work queue drained by a small worker pool; the
//! control surface (connect/disconnect/reinitialize, push streams, manual
//! channel writes) is a set of methods consumed by whatever CLI or HTTP
//! layer hosts the pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::broadcast::{serve_push_streams, BroadcastHub, Channel, Subscriber};
use crate::config::Config;
use crate::db::PersistenceSink;
use crate::detection::{AnomalyDetails, AnomalyEvent, RuleEngine, VehicleStateCache, WindowAggregator};
use crate::ml::MlScoringClient;
use crate::transport::{ConnectionState, IngestMessage, TransportClient};

/// Everything a worker touches while handling one record. Shared across the
/// pool behind one `Arc`.
struct Stages {
    hub: Arc<BroadcastHub>,
    window: Arc<WindowAggregator>,
    rules: RuleEngine,
    ml: MlScoringClient,
    sink: Option<PersistenceSink>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Stages {
    /// Handle one decoded record end to end.
    async fn process(&self, message: IngestMessage) {
        let record = message.record;

        // The first record arms the window flush timer.
        self.window.clone().start(self.shutdown_tx.subscribe());

        // Raw position goes to the dashboards, anomalous or not.
        let position = serde_json::json!({
            "vehicleId": record.vehicle_id,
            "longitude": record.position.longitude,
            "latitude": record.position.latitude,
        });
        self.hub.set_channel(Channel::Position, position.to_string());

        for event in self.rules.evaluate(&record) {
            self.persist(&event);
            self.hub.set_channel(event.kind().channel(), event.push_payload());
            self.window.record_anomaly();
        }

        if let Some(verdict) = self.ml.classify(&record).await {
            self.hub.set_channel(Channel::Ml, verdict.push_payload());
            if verdict.anomalous {
                let event = AnomalyEvent {
                    vehicle_id: verdict.vehicle_id.clone(),
                    timestamp: record.device_timestamp,
                    details: AnomalyDetails::Ml { score: verdict.score },
                };
                self.persist(&event);
                self.window.record_anomaly();
            }
        }
    }

    /// Write an event to the sink. At most one attempt: a failed write is
    /// logged and the event is lost for storage but already broadcast.
    fn persist(&self, event: &AnomalyEvent) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.insert_anomaly(event) {
                warn!(
                    "Anomaly write failed for {} ({:?}): {}",
                    event.vehicle_id,
                    event.kind(),
                    e
                );
            }
        }
    }
}

/// The assembled anomaly-detection pipeline.
pub struct Pipeline {
    config: Config,
    stages: Arc<Stages>,
    cache: Arc<VehicleStateCache>,
    transport: TransportClient,
    ingest_rx: parking_lot::Mutex<Option<mpsc::Receiver<IngestMessage>>>,
    shutdown_tx: broadcast::Sender<()>,
    started: AtomicBool,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self> {
        let hub = Arc::new(BroadcastHub::new(
            Duration::from_millis(config.broadcast.tick_interval_ms),
            config.broadcast.fanout_capacity,
        ));

        let cache = Arc::new(VehicleStateCache::new(Duration::from_secs(
            config.detection.idle_ttl_secs,
        )));

        let window = Arc::new(WindowAggregator::new(
            Duration::from_secs(config.window.flush_interval_secs),
            Arc::clone(&hub),
        ));

        let sink = if config.database.enabled {
            Some(PersistenceSink::open(&config.database)?)
        } else {
            None
        };

        let (ingest_tx, ingest_rx) = mpsc::channel(config.transport.queue_capacity);
        let transport = TransportClient::new(config.transport.clone(), ingest_tx);

        let (shutdown_tx, _) = broadcast::channel(8);

        let stages = Arc::new(Stages {
            hub,
            window,
            rules: RuleEngine::new(config.detection.clone(), Arc::clone(&cache)),
            ml: MlScoringClient::new(config.ml.clone()),
            sink,
            shutdown_tx: shutdown_tx.clone(),
        });

        Ok(Self {
            config,
            stages,
            cache,
            transport,
            ingest_rx: parking_lot::Mutex::new(Some(ingest_rx)),
            shutdown_tx,
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the worker pool and the cache sweeper. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cache.clone().spawn_sweeper(
            Duration::from_secs(self.config.detection.sweep_interval_secs),
            self.shutdown_tx.subscribe(),
        );

        let Some(ingest_rx) = self.ingest_rx.lock().take() else {
            return;
        };
        let ingest_rx = Arc::new(tokio::sync::Mutex::new(ingest_rx));

        let workers = self.config.transport.worker_count.max(1);
        for worker in 0..workers {
            let stages = Arc::clone(&self.stages);
            let ingest_rx = Arc::clone(&ingest_rx);
            let mut shutdown = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        message = async { ingest_rx.lock().await.recv().await } => message,
                        _ = shutdown.recv() => return,
                    };

                    match message {
                        Some(message) => stages.process(message).await,
                        None => {
                            info!("Ingest queue closed, worker {} exiting", worker);
                            return;
                        }
                    }
                }
            });
        }

        info!("Pipeline started with {} worker(s)", workers);
    }

    /// Start the transport client (and the pipeline itself if needed).
    pub async fn connect(&self) -> Result<()> {
        self.start();
        self.transport.connect().await?;
        Ok(())
    }

    /// Stop the transport client; the rest of the pipeline stays up.
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// Rebuild the transport connection with new parameters.
    pub async fn reinitialize(
        &self,
        broker_url: String,
        client_id: String,
        username: Option<String>,
        password: Option<String>,
        topics: Vec<String>,
    ) -> Result<()> {
        self.start();
        self.transport
            .reinitialize(broker_url, client_id, username, password, topics)
            .await?;
        Ok(())
    }

    /// Connection state as observed by the operator.
    pub fn transport_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Register a new push-stream subscriber.
    pub fn open_push_stream(&self) -> Subscriber {
        self.stages.hub.clone().open_subscriber()
    }

    /// Manual override/test hook, equivalent to an internally generated
    /// channel update. Unknown channel ids are a caller error.
    pub fn set_channel_content(&self, channel_id: u8, payload: String) -> Result<()> {
        let channel = Channel::from_id(channel_id)
            .ok_or_else(|| anyhow!("unknown channel id {}", channel_id))?;
        self.stages.hub.set_channel(channel, payload);
        Ok(())
    }

    /// Run the full service: ingest, push streams, optional simulator,
    /// until ctrl-c.
    pub async fn run(&self) -> Result<()> {
        self.connect().await?;

        let hub = Arc::clone(&self.stages.hub);
        let port = self.config.broadcast.websocket_port;
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = serve_push_streams(hub, port, shutdown_rx).await {
                error!("Push-stream server failed: {}", e);
            }
        });

        if self.config.sim.enabled {
            let sim_config = self.config.sim.clone();
            let transport_config = self.config.transport.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = crate::sim::run(sim_config, transport_config, shutdown_rx).await {
                    error!("Simulator failed: {}", e);
                }
            });
        }

        info!("fleetwatch running, press ctrl-c to shut down");
        tokio::signal::ctrl_c().await?;

        info!("Shutdown signal received, cleaning up...");
        let _ = self.shutdown_tx.send(());
        self.disconnect().await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{Position, TelemetryRecord};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.database.enabled = false;
        config.ml.enabled = false;
        config.sim.enabled = false;
        config
    }

    fn record(vehicle_id: &str, speed: f64) -> TelemetryRecord {
        TelemetryRecord {
            vehicle_id: vehicle_id.to_string(),
            device_timestamp: 1_714_000_000_000,
            gnss_timestamp: 1_714_000_000_000,
            position: Position {
                longitude: 106.5,
                latitude: 29.5,
            },
            speed,
            steering_angle: 0,
            engine: None,
            brake: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn record_processing_feeds_position_and_anomaly_channels() {
        let pipeline = Pipeline::new(test_config()).unwrap();
        let mut sub = pipeline.open_push_stream();

        pipeline
            .stages
            .process(IngestMessage {
                topic: "text/vehicle/".to_string(),
                record: record("v1", 2_000.0),
            })
            .await;

        let mut channels = Vec::new();
        for _ in 0..2 {
            channels.push(sub.next_update().await.unwrap().channel);
        }
        assert!(channels.contains(&Channel::Position));
        assert!(channels.contains(&Channel::Speed));
    }

    #[tokio::test(start_paused = true)]
    async fn normal_record_only_reports_position() {
        let pipeline = Pipeline::new(test_config()).unwrap();
        let mut sub = pipeline.open_push_stream();

        pipeline
            .stages
            .process(IngestMessage {
                topic: "text/vehicle/".to_string(),
                record: record("v1", 100.0),
            })
            .await;

        assert_eq!(sub.next_update().await.unwrap().channel, Channel::Position);
        // The only other traffic is the window flush, which reports zero.
        let update = sub.next_update().await.unwrap();
        assert_eq!(update.channel, Channel::WindowCount);
        assert!(update.payload.contains("\"numOfExp\":0"));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_channel_override_reaches_subscribers() {
        let pipeline = Pipeline::new(test_config()).unwrap();
        let mut sub = pipeline.open_push_stream();

        pipeline
            .set_channel_content(6, r#"{"vehicleId":"manual","speedExp":true}"#.to_string())
            .unwrap();

        let update = sub.next_update().await.unwrap();
        assert_eq!(update.channel, Channel::Speed);
        assert!(update.payload.contains("manual"));
    }

    #[tokio::test]
    async fn unknown_channel_id_is_rejected() {
        let pipeline = Pipeline::new(test_config()).unwrap();
        assert!(pipeline.set_channel_content(99, "{}".to_string()).is_err());
    }
}
