// Copyright (c) 2026 fleetwatch
// Licensed under the MIT License. See LICENSE file in the project root.

//! Broadcast hub - latest-payload channels fanned out to push subscribers
//!
//! The hub keeps one payload slot per logical channel (last-write-wins, no
//! queue). A periodic tick pushes every channel updated since the previous
//! tick to all open subscribers. Writers never block on subscriber I/O; a
//! slow or dead subscriber only loses its own updates.

mod push;

pub use push::serve_push_streams;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// Logical broadcast channel, identified on the wire by a small integer id.
///
/// The numbering is part of the dashboard contract and follows the ids the
/// frontend already consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Channel {
    /// Per-window anomaly counts.
    WindowCount = 3,
    /// Raw vehicle positions, anomalous or not.
    Position = 4,
    Engine = 5,
    Speed = 6,
    Ml = 7,
    Steering = 8,
    Timestamp = 9,
    Geo = 10,
    Brake = 11,
}

impl Channel {
    /// Wire id of this channel.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Resolve a wire id back to a channel, for the control surface.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            3 => Some(Channel::WindowCount),
            4 => Some(Channel::Position),
            5 => Some(Channel::Engine),
            6 => Some(Channel::Speed),
            7 => Some(Channel::Ml),
            8 => Some(Channel::Steering),
            9 => Some(Channel::Timestamp),
            10 => Some(Channel::Geo),
            11 => Some(Channel::Brake),
            _ => None,
        }
    }
}

/// One channel's payload as delivered to subscribers at a tick boundary.
#[derive(Debug, Clone)]
pub struct ChannelUpdate {
    pub channel: Channel,
    pub payload: String,
}

struct Slots {
    latest: HashMap<Channel, String>,
    dirty: HashSet<Channel>,
}

/// Central fan-out point for live dashboard data.
pub struct BroadcastHub {
    slots: Mutex<Slots>,
    update_tx: broadcast::Sender<ChannelUpdate>,
    subscriber_count: AtomicUsize,
    ticker_running: Mutex<bool>,
    tick_interval: Duration,
}

impl BroadcastHub {
    pub fn new(tick_interval: Duration, capacity: usize) -> Self {
        let (update_tx, _) = broadcast::channel(capacity);

        Self {
            slots: Mutex::new(Slots {
                latest: HashMap::new(),
                dirty: HashSet::new(),
            }),
            update_tx,
            subscriber_count: AtomicUsize::new(0),
            ticker_running: Mutex::new(false),
            tick_interval,
        }
    }

    /// Overwrite a channel's payload slot. The new value reaches subscribers
    /// at the next tick boundary; intermediate values set before then are
    /// superseded.
    pub fn set_channel(&self, channel: Channel, payload: String) {
        let mut slots = self.slots.lock();
        slots.latest.insert(channel, payload);
        slots.dirty.insert(channel);
    }

    /// Register a new push subscriber with unbounded lifetime.
    ///
    /// The tick loop is started lazily with the first subscriber and torn
    /// down once no subscribers remain.
    pub fn open_subscriber(self: Arc<Self>) -> Subscriber {
        let rx = self.update_tx.subscribe();
        let count = self.subscriber_count.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Push subscriber opened, {} active", count);

        {
            let mut running = self.ticker_running.lock();
            if !*running {
                *running = true;
                let hub = Arc::clone(&self);
                tokio::spawn(async move { hub.run_ticker().await });
            }
        }

        Subscriber {
            id: Uuid::new_v4(),
            rx,
            hub: self,
        }
    }

    /// Number of currently open subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::SeqCst)
    }

    async fn run_ticker(self: Arc<Self>) {
        debug!("Broadcast ticker started");
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The interval fires immediately once; skip that so the first real
        // push happens one full tick after the subscriber connected.
        interval.tick().await;

        loop {
            interval.tick().await;

            if self.subscriber_count.load(Ordering::SeqCst) == 0 {
                let mut running = self.ticker_running.lock();
                *running = false;
                debug!("Broadcast ticker stopped, no subscribers remain");
                return;
            }

            for update in self.drain_dirty() {
                let _ = self.update_tx.send(update);
            }
        }
    }

    fn drain_dirty(&self) -> Vec<ChannelUpdate> {
        let mut slots = self.slots.lock();
        let dirty: Vec<Channel> = slots.dirty.drain().collect();
        dirty
            .into_iter()
            .filter_map(|channel| {
                slots.latest.get(&channel).map(|payload| ChannelUpdate {
                    channel,
                    payload: payload.clone(),
                })
            })
            .collect()
    }
}

/// Handle for one open push connection.
///
/// Dropping the handle closes the subscription; the hub ticker shuts down
/// when the last one goes.
pub struct Subscriber {
    pub id: Uuid,
    rx: broadcast::Receiver<ChannelUpdate>,
    hub: Arc<BroadcastHub>,
}

impl Subscriber {
    /// Wait for the next channel update.
    ///
    /// Returns `None` once the hub is gone. A subscriber that lags behind
    /// the fan-out capacity skips the missed updates and resumes with
    /// current ones (broadcast-latest, not broadcast-all).
    pub async fn next_update(&mut self) -> Option<ChannelUpdate> {
        loop {
            match self.rx.recv().await {
                Ok(update) => return Some(update),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!("Push subscriber {} lagged, skipped {} updates", self.id, missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let remaining = self.hub.subscriber_count.fetch_sub(1, Ordering::SeqCst) - 1;
        info!("Push subscriber {} closed, {} active", self.id, remaining);
    }
}
