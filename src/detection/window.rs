// Copyright (c) 2026 fleetwatch
// Licensed under the MIT License. See LICENSE file in the project root.

//! Fixed-window anomaly counting
//!
//! One active bucket at a time: anomaly events increment it, a periodic tick
//! captures and resets the count and publishes it to the window-count
//! channel. Non-overlapping fixed windows, not sliding ones.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::broadcast::{BroadcastHub, Channel};

/// Counts anomaly events into fixed time buckets and flushes them on a
/// timer. The timer is armed by the first record's arrival (see
/// [`WindowAggregator::start`]), not aligned to the wall clock.
pub struct WindowAggregator {
    count: AtomicU64,
    window_start_ms: AtomicI64,
    started: AtomicBool,
    flush_interval: Duration,
    hub: Arc<BroadcastHub>,
}

impl WindowAggregator {
    pub fn new(flush_interval: Duration, hub: Arc<BroadcastHub>) -> Self {
        Self {
            count: AtomicU64::new(0),
            window_start_ms: AtomicI64::new(0),
            started: AtomicBool::new(false),
            flush_interval,
            hub,
        }
    }

    /// Count one anomaly event into the active bucket.
    pub fn record_anomaly(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Arm the flush timer. Idempotent; the first call wins, so the first
    /// window starts relative to the first message's arrival. Every tick
    /// flushes, a zero count included.
    pub fn start(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.window_start_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval's first tick completes immediately; the first flush
            // belongs one full window later.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => self.flush(),
                    _ = shutdown.recv() => return,
                }
            }
        });
    }

    /// Capture-and-reset: the swap guarantees no event lands in two buckets
    /// and none is dropped between the capture and the reset.
    fn flush(&self) {
        let count = self.count.swap(0, Ordering::SeqCst);
        let window_start = self
            .window_start_ms
            .swap(Utc::now().timestamp_millis(), Ordering::SeqCst);

        debug!("Window flush: {} anomalies since {}", count, window_start);

        let payload = serde_json::json!({
            "numOfExp": count,
            "windowStart": window_start,
        });
        self.hub.set_channel(Channel::WindowCount, payload.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<BroadcastHub>, Arc<WindowAggregator>) {
        let hub = Arc::new(BroadcastHub::new(Duration::from_secs(1), 64));
        let aggregator = Arc::new(WindowAggregator::new(Duration::from_secs(10), hub.clone()));
        (hub, aggregator)
    }

    fn count_of(payload: &str) -> u64 {
        let value: serde_json::Value = serde_json::from_str(payload).unwrap();
        value["numOfExp"].as_u64().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn events_in_one_window_flush_as_one_count() {
        let (hub, aggregator) = setup();
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let mut sub = hub.clone().open_subscriber();

        aggregator.clone().start(shutdown_tx.subscribe());
        for _ in 0..7 {
            aggregator.record_anomaly();
        }

        let update = sub.next_update().await.unwrap();
        assert_eq!(update.channel, Channel::WindowCount);
        assert_eq!(count_of(&update.payload), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_window_still_flushes_zero() {
        let (hub, aggregator) = setup();
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let mut sub = hub.clone().open_subscriber();

        aggregator.clone().start(shutdown_tx.subscribe());
        aggregator.record_anomaly();

        assert_eq!(count_of(&sub.next_update().await.unwrap().payload), 1);
        // Next window saw nothing; a zero flush still arrives.
        assert_eq!(count_of(&sub.next_update().await.unwrap().payload), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let (hub, aggregator) = setup();
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let mut sub = hub.clone().open_subscriber();

        aggregator.clone().start(shutdown_tx.subscribe());
        aggregator.clone().start(shutdown_tx.subscribe());
        aggregator.record_anomaly();

        assert_eq!(count_of(&sub.next_update().await.unwrap().payload), 1);
        // A second timer would have produced a duplicate flush for the same
        // window; the next update must be the following window's zero.
        assert_eq!(count_of(&sub.next_update().await.unwrap().payload), 0);
    }
}
