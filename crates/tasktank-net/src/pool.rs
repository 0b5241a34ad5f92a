//! Fan-out over many relays.
//!
//! The pool owns one connection per relay URL, opened lazily the first time
//! a publish or subscription names it. Publishing goes to every named relay
//! independently; one relay failing never affects the others.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use tasktank_shared::record::{Record, RecordFilter};
use tasktank_shared::types::SyncStatus;

use crate::relay::{RelayConnection, RelayConnector, RelayEvent};
use crate::seen::SeenCache;

pub type SubscriptionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    Connecting,
    Connected,
    Disconnected,
}

struct Subscription {
    filters: Vec<RecordFilter>,
    relays: HashSet<String>,
}

pub struct RelayPool {
    connector: Arc<dyn RelayConnector>,
    events_tx: mpsc::UnboundedSender<RelayEvent>,
    relays: HashMap<String, (Arc<dyn RelayConnection>, RelayState)>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    seen: SeenCache,
}

impl RelayPool {
    /// Events from every relay in the pool are delivered on `events_tx`.
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        events_tx: mpsc::UnboundedSender<RelayEvent>,
    ) -> Self {
        Self {
            connector,
            events_tx,
            relays: HashMap::new(),
            subscriptions: HashMap::new(),
            seen: SeenCache::default(),
        }
    }

    /// Open connections to any of `urls` not already in the pool.
    pub fn ensure(&mut self, urls: &[String]) {
        for url in urls {
            if self.relays.contains_key(url) {
                continue;
            }
            info!(relay = %url, "adding relay to pool");
            let conn = self.connector.connect(url, self.events_tx.clone());
            self.relays
                .insert(url.clone(), (conn, RelayState::Connecting));
        }
    }

    /// Send to every relay in `urls`. Returns how many were connected.
    pub fn publish(&mut self, record: &Record, urls: &[String]) -> usize {
        self.ensure(urls);
        let mut connected = 0;
        for url in urls {
            if let Some((conn, _)) = self.relays.get(url) {
                if conn.is_connected() {
                    connected += 1;
                }
                conn.publish(record.clone());
            }
        }
        debug!(id = %record.id, kind = record.kind, relays = urls.len(), connected, "published record");
        connected
    }

    pub fn subscribe(&mut self, sub_id: &str, filters: Vec<RecordFilter>, urls: &[String]) {
        self.ensure(urls);
        if let Some(previous) = self.subscriptions.get(sub_id) {
            for url in previous.relays.iter().filter(|u| !urls.contains(*u)) {
                if let Some((conn, _)) = self.relays.get(url) {
                    conn.unsubscribe(sub_id);
                }
            }
        }
        for url in urls {
            if let Some((conn, _)) = self.relays.get(url) {
                conn.subscribe(sub_id, filters.clone());
            }
        }
        self.subscriptions.insert(
            sub_id.to_string(),
            Subscription {
                filters,
                relays: urls.iter().cloned().collect(),
            },
        );
    }

    pub fn unsubscribe(&mut self, sub_id: &str) {
        let Some(sub) = self.subscriptions.remove(sub_id) else {
            return;
        };
        for url in &sub.relays {
            if let Some((conn, _)) = self.relays.get(url) {
                conn.unsubscribe(sub_id);
            }
        }
    }

    pub fn is_subscribed(&self, sub_id: &str) -> bool {
        self.subscriptions.contains_key(sub_id)
    }

    pub fn subscription_filters(&self, sub_id: &str) -> Option<&[RecordFilter]> {
        self.subscriptions.get(sub_id).map(|s| s.filters.as_slice())
    }

    /// Track a relay status event. Returns `true` if the aggregate status
    /// changed from not connected to connected.
    pub fn on_status(&mut self, relay: &str, connected: bool) -> bool {
        let was_connected = self.status() == SyncStatus::Connected;
        if let Some((_, state)) = self.relays.get_mut(relay) {
            *state = if connected {
                RelayState::Connected
            } else {
                RelayState::Disconnected
            };
        }
        !was_connected && self.status() == SyncStatus::Connected
    }

    /// First time a record id is seen across all relays.
    pub fn first_sighting(&mut self, record_id: &str) -> bool {
        self.seen.first_sighting(record_id)
    }

    /// Aggregate status: connected when at least one relay is reachable.
    pub fn status(&self) -> SyncStatus {
        if self.relays.is_empty() {
            return SyncStatus::Off;
        }
        let states: Vec<RelayState> = self.relays.values().map(|(_, s)| *s).collect();
        if states.contains(&RelayState::Connected) {
            SyncStatus::Connected
        } else if states.contains(&RelayState::Connecting) {
            SyncStatus::Connecting
        } else {
            SyncStatus::Disconnected
        }
    }

    pub fn connected_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|(_, (_, s))| *s == RelayState::Connected)
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub fn close_all(&mut self) {
        for (url, (conn, _)) in self.relays.drain() {
            debug!(relay = %url, "closing relay");
            conn.close();
        }
        self.subscriptions.clear();
    }
}
