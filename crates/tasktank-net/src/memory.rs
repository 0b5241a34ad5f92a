//! In-process relays.
//!
//! A [`MemoryRelayNetwork`] hosts any number of named relays with the same
//! retention rules as the relay server. Relays can be taken offline and
//! brought back to exercise reconnect paths without sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::debug;

use tasktank_shared::record::{Record, RecordFilter};

use crate::relay::{RelayConnection, RelayConnector, RelayError, RelayEvent};
use crate::store::RecordStore;

struct Subscriber {
    events: mpsc::UnboundedSender<RelayEvent>,
    subs: HashMap<String, Vec<RecordFilter>>,
}

struct MemoryRelay {
    store: RecordStore,
    online: bool,
    latency: Duration,
    received: usize,
    subscribers: HashMap<u64, Subscriber>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self {
            store: RecordStore::new(),
            online: true,
            latency: Duration::from_millis(50),
            received: 0,
            subscribers: HashMap::new(),
        }
    }
}

impl MemoryRelay {
    fn replay(&self, url: &str, sub: &Subscriber, sub_id: &str, filters: &[RecordFilter]) {
        for record in self.store.query(filters) {
            let _ = sub.events.send(RelayEvent::Record {
                relay: url.to_string(),
                sub_id: sub_id.to_string(),
                record,
            });
        }
        let _ = sub.events.send(RelayEvent::Eose {
            relay: url.to_string(),
            sub_id: sub_id.to_string(),
        });
    }
}

#[derive(Default)]
struct NetworkState {
    relays: HashMap<String, MemoryRelay>,
}

/// A set of in-process relays shared by every simulated device.
#[derive(Clone, Default)]
pub struct MemoryRelayNetwork {
    state: Arc<Mutex<NetworkState>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryRelayNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryRelayConnector {
        MemoryRelayConnector {
            network: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a relay down or bring it back. Subscribers see a status change,
    /// and on recovery their subscriptions are replayed like a reconnect.
    pub fn set_online(&self, url: &str, online: bool) {
        let mut state = self.lock();
        let relay = state.relays.entry(url.to_string()).or_default();
        if relay.online == online {
            return;
        }
        relay.online = online;
        debug!(relay = url, online, "memory relay status changed");

        for sub in relay.subscribers.values() {
            let _ = sub.events.send(RelayEvent::Status {
                relay: url.to_string(),
                connected: online,
            });
            if online {
                for (sub_id, filters) in &sub.subs {
                    relay.replay(url, sub, sub_id, filters);
                }
            }
        }
    }

    pub fn set_latency(&self, url: &str, latency: Duration) {
        self.lock().relays.entry(url.to_string()).or_default().latency = latency;
    }

    /// Records currently retained by a relay.
    pub fn stored_count(&self, url: &str) -> usize {
        self.lock().relays.get(url).map(|r| r.store.len()).unwrap_or(0)
    }

    /// Records ever published to a relay, retained or not.
    pub fn received_count(&self, url: &str) -> usize {
        self.lock().relays.get(url).map(|r| r.received).unwrap_or(0)
    }

    fn publish(&self, url: &str, from: u64, record: Record) {
        let mut state = self.lock();
        let relay = state.relays.entry(url.to_string()).or_default();
        if !relay.online {
            debug!(relay = url, id = %record.id, "relay offline, dropping publish");
            return;
        }

        let (accepted, message, broadcast) = match record.verify() {
            Ok(()) => {
                relay.received += 1;
                let outcome = relay.store.accept(record.clone());
                (true, String::new(), outcome.should_broadcast())
            }
            Err(e) => (false, format!("invalid: {e}"), false),
        };

        if let Some(publisher) = relay.subscribers.get(&from) {
            let _ = publisher.events.send(RelayEvent::PublishResult {
                relay: url.to_string(),
                id: record.id.clone(),
                accepted,
                message,
            });
        }

        if !broadcast {
            return;
        }
        for sub in relay.subscribers.values() {
            for (sub_id, filters) in &sub.subs {
                if filters.iter().any(|f| f.matches(&record)) {
                    let _ = sub.events.send(RelayEvent::Record {
                        relay: url.to_string(),
                        sub_id: sub_id.clone(),
                        record: record.clone(),
                    });
                }
            }
        }
    }
}

/// Opens connections to relays on a [`MemoryRelayNetwork`].
#[derive(Clone)]
pub struct MemoryRelayConnector {
    network: MemoryRelayNetwork,
}

impl RelayConnector for MemoryRelayConnector {
    fn connect(
        &self,
        url: &str,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Arc<dyn RelayConnection> {
        let id = self.network.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.network.lock();
            let relay = state.relays.entry(url.to_string()).or_default();
            if relay.online {
                let _ = events.send(RelayEvent::Status {
                    relay: url.to_string(),
                    connected: true,
                });
            }
            relay.subscribers.insert(
                id,
                Subscriber {
                    events,
                    subs: HashMap::new(),
                },
            );
        }
        Arc::new(MemoryRelayConnection {
            network: self.network.clone(),
            url: url.to_string(),
            id,
        })
    }

    fn probe(&self, url: &str, timeout: Duration) -> BoxFuture<'static, Result<Duration, RelayError>> {
        let result = {
            let mut state = self.network.lock();
            let relay = state.relays.entry(url.to_string()).or_default();
            if !relay.online {
                Err(RelayError::Offline(url.to_string()))
            } else if relay.latency > timeout {
                Err(RelayError::Timeout(url.to_string()))
            } else {
                Ok(relay.latency)
            }
        };
        Box::pin(async move { result })
    }
}

struct MemoryRelayConnection {
    network: MemoryRelayNetwork,
    url: String,
    id: u64,
}

impl RelayConnection for MemoryRelayConnection {
    fn url(&self) -> &str {
        &self.url
    }

    fn publish(&self, record: Record) {
        self.network.publish(&self.url, self.id, record);
    }

    fn subscribe(&self, sub_id: &str, filters: Vec<RecordFilter>) {
        let mut state = self.network.lock();
        let Some(relay) = state.relays.get_mut(&self.url) else {
            return;
        };
        let online = relay.online;
        if let Some(sub) = relay.subscribers.get_mut(&self.id) {
            sub.subs.insert(sub_id.to_string(), filters.clone());
        }
        if online {
            if let Some(sub) = relay.subscribers.get(&self.id) {
                relay.replay(&self.url, sub, sub_id, &filters);
            }
        }
    }

    fn unsubscribe(&self, sub_id: &str) {
        let mut state = self.network.lock();
        if let Some(sub) = state
            .relays
            .get_mut(&self.url)
            .and_then(|r| r.subscribers.get_mut(&self.id))
        {
            sub.subs.remove(sub_id);
        }
    }

    fn is_connected(&self) -> bool {
        self.network
            .lock()
            .relays
            .get(&self.url)
            .map(|r| r.online)
            .unwrap_or(false)
    }

    fn close(&self) {
        let mut state = self.network.lock();
        if let Some(relay) = state.relays.get_mut(&self.url) {
            relay.subscribers.remove(&self.id);
        }
    }
}

impl Drop for MemoryRelayConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasktank_shared::constants::{KIND_EPHEMERAL, KIND_REPLACEABLE};
    use tasktank_shared::crypto::EncKey;
    use tasktank_shared::identity::AuthorIdentity;

    const URL: &str = "mem://relay-a";

    fn author() -> AuthorIdentity {
        AuthorIdentity::derive(&EncKey::from_bytes([2u8; 32]))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RelayEvent>) -> Vec<RelayEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn records(events: &[RelayEvent]) -> Vec<Record> {
        events
            .iter()
            .filter_map(|e| match e {
                RelayEvent::Record { record, .. } => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn stored_records_replay_on_subscribe() {
        let network = MemoryRelayNetwork::new();
        let connector = network.connector();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let a = connector.connect(URL, tx_a);
        a.publish(Record::replaceable(&author(), "s:m", "meta".into()));

        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let b = connector.connect(URL, tx_b);
        b.subscribe("sub", vec![RecordFilter::author(author().pubkey())]);

        let events = drain(&mut rx_b);
        assert_eq!(records(&events).len(), 1);
        assert!(matches!(events.last(), Some(RelayEvent::Eose { .. })));
    }

    #[test]
    fn live_records_fan_out() {
        let network = MemoryRelayNetwork::new();
        let connector = network.connector();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let b = connector.connect(URL, tx_b);
        b.subscribe("sub", vec![RecordFilter::default().kind(KIND_EPHEMERAL)]);
        drain(&mut rx_b);

        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let a = connector.connect(URL, tx_a);
        a.publish(Record::ephemeral(&author(), "hello".into()));
        a.publish(Record::replaceable(&author(), "s:m", "ignored".into()));

        let got = records(&drain(&mut rx_b));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, KIND_EPHEMERAL);
        assert_eq!(network.stored_count(URL), 1);
    }

    #[test]
    fn offline_relay_drops_and_recovers() {
        let network = MemoryRelayNetwork::new();
        let connector = network.connector();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = connector.connect(URL, tx);
        conn.subscribe("sub", vec![RecordFilter::default().kind(KIND_REPLACEABLE)]);
        drain(&mut rx);

        network.set_online(URL, false);
        assert!(!conn.is_connected());
        conn.publish(Record::replaceable(&author(), "s:m", "lost".into()));
        assert_eq!(network.stored_count(URL), 0);

        network.set_online(URL, true);
        conn.publish(Record::replaceable(&author(), "s:m", "kept".into()));
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, RelayEvent::Status { connected: false, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, RelayEvent::Status { connected: true, .. })));
        assert_eq!(records(&events).len(), 1);
    }

    #[test]
    fn forged_record_rejected() {
        let network = MemoryRelayNetwork::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = network.connector().connect(URL, tx);
        let mut record = Record::replaceable(&author(), "s:m", "x".into());
        record.content = "tampered".into();
        conn.publish(record);

        assert_eq!(network.stored_count(URL), 0);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, RelayEvent::PublishResult { accepted: false, .. })));
    }
}
