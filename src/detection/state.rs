// Copyright (c) 2026 fleetwatch
// Licensed under the MIT License. See LICENSE file in the project root.

//! Per-vehicle state cache with idle eviction
//!
//! Holds the last record each vehicle was *compared against*, not simply the
//! last record received: the rule engine decides on replacement, so the
//! stateful geo check always runs against a stable baseline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::telemetry::TelemetryRecord;

/// Cached state for one vehicle.
#[derive(Debug, Clone)]
pub struct VehicleState {
    pub last_record: TelemetryRecord,
    pub last_seen_at: Instant,
}

/// Keyed store of each vehicle's last compared record.
///
/// All mutation happens under one lock so a concurrent
/// read-evaluate-replace for the same vehicle can never interleave into a
/// lost update. Idle entries are removed by a periodic sweep instead of a
/// timer per key.
pub struct VehicleStateCache {
    entries: Mutex<HashMap<String, VehicleState>>,
    idle_ttl: Duration,
}

impl VehicleStateCache {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            idle_ttl,
        }
    }

    /// Last record compared against for this vehicle, if still cached.
    pub fn get(&self, vehicle_id: &str) -> Option<TelemetryRecord> {
        self.entries
            .lock()
            .get(vehicle_id)
            .map(|state| state.last_record.clone())
    }

    /// Atomically observe one incoming record.
    ///
    /// Refreshes the entry's idle clock, creating the entry on first sight.
    /// For a known vehicle, `replace` is called with the cached prior
    /// record; returning `true` swaps the cached record for the current one.
    /// The prior record is handed back whenever the swap happened, so the
    /// caller can evaluate stateful rules against the baseline it displaced.
    pub fn observe<F>(&self, record: &TelemetryRecord, replace: F) -> Option<TelemetryRecord>
    where
        F: FnOnce(&TelemetryRecord) -> bool,
    {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        match entries.get_mut(&record.vehicle_id) {
            None => {
                entries.insert(
                    record.vehicle_id.clone(),
                    VehicleState {
                        last_record: record.clone(),
                        last_seen_at: now,
                    },
                );
                None
            }
            Some(state) => {
                state.last_seen_at = now;
                if replace(&state.last_record) {
                    let prior = std::mem::replace(&mut state.last_record, record.clone());
                    Some(prior)
                } else {
                    None
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// One sweep pass: drop every entry idle for longer than the TTL.
    pub fn evict_idle(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let ttl = self.idle_ttl;
        entries.retain(|_, state| state.last_seen_at.elapsed() <= ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("Evicted {} idle vehicle(s), {} remain", evicted, entries.len());
        }
        evicted
    }

    /// Run the eviction sweep until shutdown.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        sweep_interval: Duration,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        cache.evict_idle();
                    }
                    _ = shutdown.recv() => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Position;

    fn record(vehicle_id: &str, gnss_timestamp: i64) -> TelemetryRecord {
        TelemetryRecord {
            vehicle_id: vehicle_id.to_string(),
            device_timestamp: gnss_timestamp,
            gnss_timestamp,
            position: Position {
                longitude: 106.5,
                latitude: 29.5,
            },
            speed: 100.0,
            steering_angle: 0,
            engine: None,
            brake: None,
        }
    }

    #[test]
    fn first_record_creates_entry_without_prior() {
        let cache = VehicleStateCache::new(Duration::from_secs(10));
        let prior = cache.observe(&record("v1", 1), |_| true);
        assert!(prior.is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn replace_only_when_caller_decides() {
        let cache = VehicleStateCache::new(Duration::from_secs(10));
        cache.observe(&record("v1", 1), |_| false);

        // Declined: the baseline stays at the first record.
        let prior = cache.observe(&record("v1", 2), |_| false);
        assert!(prior.is_none());
        assert_eq!(cache.get("v1").unwrap().gnss_timestamp, 1);

        // Accepted: the displaced baseline comes back to the caller.
        let prior = cache.observe(&record("v1", 3), |_| true).unwrap();
        assert_eq!(prior.gnss_timestamp, 1);
        assert_eq!(cache.get("v1").unwrap().gnss_timestamp, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entries_are_evicted_after_ttl() {
        let cache = VehicleStateCache::new(Duration::from_secs(10));
        cache.observe(&record("idle", 1), |_| false);
        cache.observe(&record("busy", 1), |_| false);

        // Just inside the TTL: both survive.
        tokio::time::advance(Duration::from_millis(9_900)).await;
        cache.observe(&record("busy", 2), |_| false);
        assert_eq!(cache.evict_idle(), 0);

        // Past the TTL for the idle one only.
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(cache.evict_idle(), 1);
        assert!(cache.get("idle").is_none());
        assert!(cache.get("busy").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_rearms_the_idle_clock() {
        let cache = VehicleStateCache::new(Duration::from_secs(10));
        cache.observe(&record("v1", 1), |_| false);

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(8)).await;
            cache.observe(&record("v1", 2), |_| false);
            assert_eq!(cache.evict_idle(), 0);
        }

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.evict_idle(), 1);
        assert!(cache.is_empty());
    }
}
