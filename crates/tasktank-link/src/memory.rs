//! In-process links.
//!
//! Negotiation completes once both ends have exchanged an offer and an
//! answer; then both sides see `Connected` and an open channel. Pairs can
//! be blocked (negotiation fails) or severed (a live link drops), and the
//! per-message delivery delay simulates a slow-draining channel.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::debug;

use tasktank_shared::constants::FILE_CHUNK_SIZE;
use tasktank_shared::types::DeviceId;

use crate::channel::{OutboundQueue, OutboundReceiver};
use crate::link::{Emitter, LinkEvent, LinkEventKind, LinkFactory, LinkState, PeerLink, SdpKind};
use crate::signaling::IceCandidate;

type Interceptor = Arc<dyn Fn(&DeviceId, String) -> String + Send + Sync>;

struct Endpoint {
    emitter: Emitter,
    queue: OutboundQueue,
    local_description: bool,
    remote_description: bool,
    connected: bool,
    early_candidates: usize,
}

#[derive(Default)]
struct LinkNetState {
    /// Keyed by (local, remote).
    endpoints: HashMap<(DeviceId, DeviceId), Endpoint>,
    blocked: HashSet<(DeviceId, DeviceId)>,
    delay: Duration,
    interceptor: Option<Interceptor>,
    offers: usize,
}

fn pair(a: &DeviceId, b: &DeviceId) -> (DeviceId, DeviceId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[derive(Clone, Default)]
pub struct MemoryLinkNetwork {
    state: Arc<Mutex<LinkNetState>>,
}

impl MemoryLinkNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LinkNetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make negotiation between `a` and `b` fail until unblocked.
    pub fn set_blocked(&self, a: &DeviceId, b: &DeviceId, blocked: bool) {
        let mut state = self.lock();
        if blocked {
            state.blocked.insert(pair(a, b));
        } else {
            state.blocked.remove(&pair(a, b));
        }
    }

    /// Drop a live link between `a` and `b`, as a network change would.
    pub fn sever(&self, a: &DeviceId, b: &DeviceId) {
        let mut state = self.lock();
        for key in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            if let Some(end) = state.endpoints.get_mut(&key) {
                if end.connected {
                    end.connected = false;
                    end.queue.set_open(false);
                    end.emitter.emit(LinkEventKind::ChannelClosed);
                    end.emitter.emit(LinkEventKind::State(LinkState::Disconnected));
                }
            }
        }
        debug!(a = %a.short(), b = %b.short(), "memory link severed");
    }

    /// Delay applied to every delivered message.
    pub fn set_delivery_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    /// Rewrite messages in flight; the callback gets the sender.
    pub fn set_interceptor<F>(&self, f: F)
    where
        F: Fn(&DeviceId, String) -> String + Send + Sync + 'static,
    {
        self.lock().interceptor = Some(Arc::new(f));
    }

    pub fn is_connected(&self, a: &DeviceId, b: &DeviceId) -> bool {
        self.lock()
            .endpoints
            .get(&(a.clone(), b.clone()))
            .map(|e| e.connected)
            .unwrap_or(false)
    }

    /// Candidates `local` was handed before its remote description.
    pub fn early_candidates(&self, local: &DeviceId, remote: &DeviceId) -> usize {
        self.lock()
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .map(|e| e.early_candidates)
            .unwrap_or(0)
    }

    /// Offers created across the whole network.
    pub fn offers_created(&self) -> usize {
        self.lock().offers
    }

    fn with_endpoint<R>(
        &self,
        link: &MemoryLink,
        f: impl FnOnce(&mut LinkNetState, &mut Endpoint) -> R,
    ) -> Option<R> {
        let mut state = self.lock();
        let key = (link.local.clone(), link.remote.clone());
        let mut end = state.endpoints.remove(&key)?;
        if end.emitter.generation != link.generation {
            state.endpoints.insert(key, end);
            return None;
        }
        let out = f(&mut state, &mut end);
        state.endpoints.insert(key, end);
        Some(out)
    }

    fn describe(&self, link: &MemoryLink, kind: SdpKind) {
        self.with_endpoint(link, |state, end| {
            if kind == SdpKind::Offer {
                state.offers += 1;
            } else {
                end.remote_description = true;
            }
            end.local_description = true;
            end.emitter.emit(LinkEventKind::State(LinkState::Connecting));
            end.emitter.emit(LinkEventKind::LocalDescription {
                kind,
                sdp: format!("memory-{kind:?}-{}", link.local).to_lowercase(),
            });
            end.emitter.emit(LinkEventKind::LocalCandidate(IceCandidate {
                candidate: format!("candidate:memory {}", link.local),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }));
        });
    }

    fn answer_received(&self, link: &MemoryLink) {
        let ready = self
            .with_endpoint(link, |_, end| {
                end.remote_description = true;
                end.local_description
            })
            .unwrap_or(false);
        if ready {
            self.try_connect(&link.local, &link.remote);
        }
    }

    fn try_connect(&self, a: &DeviceId, b: &DeviceId) {
        let mut state = self.lock();
        let blocked = state.blocked.contains(&pair(a, b));
        let ab = (a.clone(), b.clone());
        let ba = (b.clone(), a.clone());
        let ready = |e: Option<&Endpoint>| {
            e.map(|e| e.local_description && e.remote_description)
                .unwrap_or(false)
        };
        if !ready(state.endpoints.get(&ab)) || !ready(state.endpoints.get(&ba)) {
            return;
        }
        for key in [ab, ba] {
            if let Some(end) = state.endpoints.get_mut(&key) {
                if blocked {
                    end.emitter.emit(LinkEventKind::State(LinkState::Failed));
                    continue;
                }
                end.connected = true;
                end.queue.set_open(true);
                end.emitter.emit(LinkEventKind::State(LinkState::Connected));
                end.emitter.emit(LinkEventKind::ChannelOpen);
            }
        }
        debug!(a = %a.short(), b = %b.short(), blocked, "memory link negotiated");
    }

    fn deliver(&self, from: &DeviceId, to: &DeviceId, text: String) {
        let state = self.lock();
        let text = match &state.interceptor {
            Some(f) => f(from, text),
            None => text,
        };
        if let Some(end) = state.endpoints.get(&(to.clone(), from.clone())) {
            if end.connected {
                end.emitter.emit(LinkEventKind::ChannelMessage(text));
            }
        }
    }

    fn delay(&self) -> Duration {
        self.lock().delay
    }

    fn close(&self, link: &MemoryLink) {
        let mut state = self.lock();
        let key = (link.local.clone(), link.remote.clone());
        let Some(end) = state.endpoints.get(&key) else {
            return;
        };
        if end.emitter.generation != link.generation {
            return;
        }
        let was_connected = end.connected;
        end.queue.set_open(false);
        state.endpoints.remove(&key);

        if was_connected {
            if let Some(other) = state.endpoints.get_mut(&(link.remote.clone(), link.local.clone())) {
                other.connected = false;
                other.queue.set_open(false);
                other.emitter.emit(LinkEventKind::ChannelClosed);
                other.emitter.emit(LinkEventKind::State(LinkState::Disconnected));
            }
        }
    }
}

impl LinkFactory for MemoryLinkNetwork {
    fn create(
        &self,
        local: &DeviceId,
        remote: &DeviceId,
        generation: u64,
        _initiator: bool,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Arc<dyn PeerLink> {
        let (queue, outbound) = OutboundQueue::new(FILE_CHUNK_SIZE);
        let emitter = Emitter {
            remote: remote.clone(),
            generation,
            events,
        };
        {
            let mut state = self.lock();
            if let Some(old) = state.endpoints.insert(
                (local.clone(), remote.clone()),
                Endpoint {
                    emitter,
                    queue: queue.clone(),
                    local_description: false,
                    remote_description: false,
                    connected: false,
                    early_candidates: 0,
                },
            ) {
                old.queue.set_open(false);
            }
            // A fresh session on one side ends the other side's old one.
            if let Some(other) = state.endpoints.get_mut(&(remote.clone(), local.clone())) {
                if other.connected {
                    other.connected = false;
                    other.local_description = false;
                    other.remote_description = false;
                    other.queue.set_open(false);
                    other.emitter.emit(LinkEventKind::ChannelClosed);
                    other.emitter.emit(LinkEventKind::State(LinkState::Disconnected));
                }
            }
        }

        tokio::spawn(delivery_loop(
            self.clone(),
            local.clone(),
            remote.clone(),
            outbound,
        ));

        Arc::new(MemoryLink {
            network: self.clone(),
            local: local.clone(),
            remote: remote.clone(),
            generation,
            queue,
        })
    }
}

async fn delivery_loop(
    network: MemoryLinkNetwork,
    from: DeviceId,
    to: DeviceId,
    mut outbound: OutboundReceiver,
) {
    while let Some(text) = outbound.next().await {
        let delay = network.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let len = text.len();
        network.deliver(&from, &to, text);
        outbound.sent(len);
    }
}

struct MemoryLink {
    network: MemoryLinkNetwork,
    local: DeviceId,
    remote: DeviceId,
    generation: u64,
    queue: OutboundQueue,
}

impl PeerLink for MemoryLink {
    fn create_offer(&self) {
        self.network.describe(self, SdpKind::Offer);
    }

    fn accept_offer(&self, _sdp: String) {
        self.network.describe(self, SdpKind::Answer);
        self.network.try_connect(&self.local, &self.remote);
    }

    fn accept_answer(&self, _sdp: String) {
        self.network.answer_received(self);
    }

    fn add_ice_candidate(&self, _candidate: IceCandidate) {
        self.network.with_endpoint(self, |_, end| {
            if !end.remote_description {
                end.early_candidates += 1;
            }
        });
    }

    fn send(&self, text: String) -> bool {
        self.queue.push(text)
    }

    fn buffered_amount(&self) -> usize {
        self.queue.buffered_amount()
    }

    fn drained(&self) -> Arc<Notify> {
        self.queue.drained()
    }

    fn is_open(&self) -> bool {
        self.queue.is_open()
    }

    fn close(&self) {
        self.network.close(self);
    }
}
