//! Direct-link lifecycle for every remote device.
//!
//! The manager is owned by the sync engine task and driven by two inputs:
//! decrypted signals ([`PeerManager::handle_signal`]) and link events
//! ([`PeerManager::handle_event`]). Both return [`PeerUpdate`]s for the
//! engine to act on: signals to publish, connection changes, and
//! messages that arrived on a data channel.
//!
//! The device with the smaller id always initiates, and only the
//! initiator schedules reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use tasktank_shared::crypto::EncKey;
use tasktank_shared::protocol::{FileMessage, LinkFrame, SyncMessage, TankChange};
use tasktank_shared::types::{DeviceId, TankId};

use crate::backoff::Backoff;
use crate::link::{LinkEvent, LinkEventKind, LinkFactory, LinkState, PeerLink, SdpKind};
use crate::signaling::{now_millis, IceCandidate, SignalPayload};

/// Where to publish signals for a peer: the group key and its relays.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalRoute {
    pub key: EncKey,
    pub relays: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum PeerUpdate {
    /// Publish `payload` as an ephemeral record under `route`.
    Signal {
        route: SignalRoute,
        payload: SignalPayload,
    },
    /// The usable state of the link to `remote` changed.
    Connection { remote: DeviceId, state: LinkState },
    Sync {
        remote: DeviceId,
        message: SyncMessage,
    },
    File {
        remote: DeviceId,
        message: FileMessage,
    },
}

struct PeerEntry {
    link: Arc<dyn PeerLink>,
    generation: u64,
    state: LinkState,
    route: SignalRoute,
    remote_description: bool,
    pending_candidates: Vec<IceCandidate>,
    channel_open: bool,
    reported: Option<LinkState>,
}

impl PeerEntry {
    fn usable(&self) -> bool {
        self.state == LinkState::Connected && self.channel_open
    }
}

pub struct PeerManager {
    local: DeviceId,
    factory: Arc<dyn LinkFactory>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    peers: HashMap<DeviceId, PeerEntry>,
    backoff: HashMap<DeviceId, Backoff>,
    retry_timers: HashMap<DeviceId, JoinHandle<()>>,
    backoff_floor: Duration,
    backoff_ceiling: Duration,
    next_generation: u64,
}

impl PeerManager {
    pub fn new(
        local: DeviceId,
        factory: Arc<dyn LinkFactory>,
        events_tx: mpsc::UnboundedSender<LinkEvent>,
        backoff_floor: Duration,
        backoff_ceiling: Duration,
    ) -> Self {
        Self {
            local,
            factory,
            events_tx,
            peers: HashMap::new(),
            backoff: HashMap::new(),
            retry_timers: HashMap::new(),
            backoff_floor,
            backoff_ceiling,
            next_generation: 1,
        }
    }

    pub fn local(&self) -> &DeviceId {
        &self.local
    }

    fn initiates_with(&self, remote: &DeviceId) -> bool {
        self.local.initiates_with(remote)
    }

    // -----------------------------------------------------------------------
    // Connection setup
    // -----------------------------------------------------------------------

    fn create_entry(&mut self, remote: &DeviceId, route: SignalRoute) -> &mut PeerEntry {
        let generation = self.next_generation;
        self.next_generation += 1;
        let initiator = self.initiates_with(remote);
        let link = self.factory.create(
            &self.local,
            remote,
            generation,
            initiator,
            self.events_tx.clone(),
        );
        if let Some(old) = self.peers.remove(remote) {
            old.link.close();
        }
        debug!(peer = %remote.short(), generation, initiator, "created link");
        self.peers.entry(remote.clone()).or_insert(PeerEntry {
            link,
            generation,
            state: LinkState::New,
            route,
            remote_description: false,
            pending_candidates: Vec::new(),
            channel_open: false,
            reported: None,
        })
    }

    /// Start (or nudge) a connection to a device seen via heartbeat. Only
    /// the initiator acts; the other side waits for the offer.
    pub fn connect(&mut self, remote: &DeviceId, route: SignalRoute) {
        if remote == &self.local || !self.initiates_with(remote) {
            return;
        }
        if self.retry_timers.contains_key(remote) {
            // A backoff timer owns the next attempt.
            return;
        }
        let reuse = self
            .peers
            .get(remote)
            .map(|e| e.state.is_live())
            .unwrap_or(false);
        let entry = if reuse {
            match self.peers.get_mut(remote) {
                Some(entry) => entry,
                None => return,
            }
        } else {
            self.create_entry(remote, route)
        };
        if entry.usable() || entry.remote_description {
            return;
        }
        // No answer yet: the previous offer may have been lost.
        entry.link.create_offer();
    }

    // -----------------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------------

    /// Apply an offer, answer or candidate addressed to this device.
    /// Heartbeats are the engine's business and are ignored here.
    pub fn handle_signal(&mut self, payload: SignalPayload, route: SignalRoute) {
        match payload {
            SignalPayload::Offer { from, sdp, .. } => {
                if self.initiates_with(&from) {
                    debug!(peer = %from.short(), "ignoring offer from a device we initiate to");
                    return;
                }
                let fresh = self
                    .peers
                    .get(&from)
                    .map(|e| e.remote_description || !e.state.is_live())
                    .unwrap_or(true);
                let entry = if fresh {
                    self.create_entry(&from, route)
                } else {
                    match self.peers.get_mut(&from) {
                        Some(entry) => entry,
                        None => return,
                    }
                };
                entry.link.accept_offer(sdp);
                entry.remote_description = true;
                flush_candidates(entry);
            }
            SignalPayload::Answer { from, sdp, .. } => {
                let Some(entry) = self.peers.get_mut(&from) else {
                    trace!(peer = %from.short(), "answer for unknown link");
                    return;
                };
                if entry.remote_description {
                    trace!(peer = %from.short(), "duplicate answer ignored");
                    return;
                }
                entry.link.accept_answer(sdp);
                entry.remote_description = true;
                flush_candidates(entry);
            }
            ice @ SignalPayload::Ice { .. } => {
                let from = ice.sender().clone();
                let Some(candidate) = ice.candidate() else {
                    return;
                };
                let Some(entry) = self.peers.get_mut(&from) else {
                    trace!(peer = %from.short(), "candidate for unknown link");
                    return;
                };
                if entry.remote_description {
                    entry.link.add_ice_candidate(candidate);
                } else {
                    entry.pending_candidates.push(candidate);
                }
            }
            SignalPayload::Heartbeat { .. } => {}
        }
    }

    // -----------------------------------------------------------------------
    // Link events
    // -----------------------------------------------------------------------

    pub fn handle_event(&mut self, event: LinkEvent) -> Vec<PeerUpdate> {
        let LinkEvent {
            remote,
            generation,
            kind,
        } = event;

        if matches!(kind, LinkEventKind::ReconnectDue) {
            return self.reconnect_due(&remote);
        }

        let local = self.local.clone();
        let Some(entry) = self.peers.get_mut(&remote) else {
            return Vec::new();
        };
        if entry.generation != generation {
            trace!(peer = %remote.short(), generation, "event from replaced link");
            return Vec::new();
        }

        let mut updates = Vec::new();
        match kind {
            LinkEventKind::LocalDescription { kind, sdp } => {
                let ts = now_millis();
                let payload = match kind {
                    SdpKind::Offer => SignalPayload::Offer {
                        from: local,
                        to: remote.clone(),
                        sdp,
                        ts,
                    },
                    SdpKind::Answer => SignalPayload::Answer {
                        from: local,
                        to: remote.clone(),
                        sdp,
                        ts,
                    },
                };
                updates.push(PeerUpdate::Signal {
                    route: entry.route.clone(),
                    payload,
                });
            }
            LinkEventKind::LocalCandidate(candidate) => {
                updates.push(PeerUpdate::Signal {
                    route: entry.route.clone(),
                    payload: SignalPayload::ice(local, remote.clone(), candidate),
                });
            }
            LinkEventKind::State(state) => {
                entry.state = state;
                self.on_state_change(&remote, &mut updates);
            }
            LinkEventKind::ChannelOpen => {
                entry.channel_open = true;
                self.on_state_change(&remote, &mut updates);
            }
            LinkEventKind::ChannelClosed => {
                entry.channel_open = false;
                if entry.state == LinkState::Connected {
                    entry.state = LinkState::Disconnected;
                }
                self.on_state_change(&remote, &mut updates);
            }
            LinkEventKind::ChannelMessage(text) => match LinkFrame::from_text(&text) {
                Some(LinkFrame::Sync(message)) => {
                    updates.push(PeerUpdate::Sync { remote, message })
                }
                Some(LinkFrame::File(message)) => {
                    updates.push(PeerUpdate::File { remote, message })
                }
                None => trace!(peer = %remote.short(), "ignoring unknown data channel message"),
            },
            LinkEventKind::Failed(reason) => {
                warn!(peer = %remote.short(), reason = %reason, "link negotiation failed");
                entry.state = LinkState::Failed;
                self.on_state_change(&remote, &mut updates);
            }
            LinkEventKind::ReconnectDue => {}
        }
        updates
    }

    /// Report the usable state when it changes and react to drops.
    fn on_state_change(&mut self, remote: &DeviceId, updates: &mut Vec<PeerUpdate>) {
        let Some(entry) = self.peers.get_mut(remote) else {
            return;
        };
        let effective = if entry.usable() {
            LinkState::Connected
        } else if entry.state == LinkState::Connected {
            // Transport up, channel not yet open.
            LinkState::Connecting
        } else {
            entry.state
        };
        if entry.reported == Some(effective) {
            return;
        }
        entry.reported = Some(effective);

        match effective {
            LinkState::Connected => {
                info!(peer = %remote.short(), "direct link connected");
                let (floor, ceiling) = (self.backoff_floor, self.backoff_ceiling);
                self.backoff
                    .entry(remote.clone())
                    .or_insert_with(|| Backoff::new(floor, ceiling))
                    .reset();
                if let Some(timer) = self.retry_timers.remove(remote) {
                    timer.abort();
                }
            }
            LinkState::Disconnected | LinkState::Failed => {
                info!(peer = %remote.short(), state = %effective, "direct link lost");
                if self.initiates_with(remote) {
                    self.schedule_reconnect(remote);
                }
            }
            _ => {}
        }
        updates.push(PeerUpdate::Connection {
            remote: remote.clone(),
            state: effective,
        });
    }

    fn schedule_reconnect(&mut self, remote: &DeviceId) {
        if self.retry_timers.contains_key(remote) {
            return;
        }
        let (floor, ceiling) = (self.backoff_floor, self.backoff_ceiling);
        let delay = self
            .backoff
            .entry(remote.clone())
            .or_insert_with(|| Backoff::new(floor, ceiling))
            .next_delay();
        debug!(peer = %remote.short(), delay_ms = delay.as_millis() as u64, "scheduling reconnect");

        let events = self.events_tx.clone();
        let remote_id = remote.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(LinkEvent {
                remote: remote_id,
                generation: 0,
                kind: LinkEventKind::ReconnectDue,
            });
        });
        self.retry_timers.insert(remote.clone(), timer);
    }

    fn reconnect_due(&mut self, remote: &DeviceId) -> Vec<PeerUpdate> {
        self.retry_timers.remove(remote);
        let Some(route) = self
            .peers
            .get(remote)
            .filter(|e| !e.usable() && e.state != LinkState::Closed)
            .map(|e| e.route.clone())
        else {
            return Vec::new();
        };
        info!(peer = %remote.short(), "reconnecting direct link");
        self.create_entry(remote, route).link.create_offer();
        Vec::new()
    }

    /// Foregrounding: retry every dropped link we initiate right away,
    /// regardless of pending backoff timers.
    pub fn set_visible(&mut self, visible: bool) {
        if !visible {
            return;
        }
        let stale: Vec<(DeviceId, SignalRoute)> = self
            .peers
            .iter()
            .filter(|(id, e)| {
                matches!(
                    e.state,
                    LinkState::Failed | LinkState::Disconnected | LinkState::Closed
                ) && self.initiates_with(id)
            })
            .map(|(id, e)| (id.clone(), e.route.clone()))
            .collect();
        for (remote, route) in stale {
            if let Some(timer) = self.retry_timers.remove(&remote) {
                timer.abort();
            }
            info!(peer = %remote.short(), "visibility regained, reconnecting");
            self.create_entry(&remote, route).link.create_offer();
        }
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    pub fn is_connected(&self, remote: &DeviceId) -> bool {
        self.peers
            .get(remote)
            .map(|e| e.usable() && e.link.is_open())
            .unwrap_or(false)
    }

    /// Send a tank change. `false` if there is no open channel; delivery is
    /// never confirmed.
    pub fn send_message(&self, remote: &DeviceId, tank_id: &TankId, change: TankChange) -> bool {
        let frame = LinkFrame::Sync(SyncMessage {
            tank_id: tank_id.clone(),
            change,
            ts: now_millis(),
            device_id: self.local.clone(),
        });
        self.send_frame(remote, &frame)
    }

    pub fn send_file_message(&self, remote: &DeviceId, message: FileMessage) -> bool {
        self.send_frame(remote, &LinkFrame::File(message))
    }

    fn send_frame(&self, remote: &DeviceId, frame: &LinkFrame) -> bool {
        match frame.to_text() {
            Ok(text) => self.send_raw(remote, text),
            Err(e) => {
                warn!(peer = %remote.short(), error = %e, "failed to encode link frame");
                false
            }
        }
    }

    pub fn send_raw(&self, remote: &DeviceId, text: String) -> bool {
        match self.peers.get(remote) {
            Some(entry) if entry.usable() => entry.link.send(text),
            _ => false,
        }
    }

    /// The live link, for callers that need its buffered amount.
    pub fn link(&self, remote: &DeviceId) -> Option<Arc<dyn PeerLink>> {
        self.peers.get(remote).map(|e| e.link.clone())
    }

    pub fn connected_peers(&self) -> Vec<DeviceId> {
        self.peers
            .iter()
            .filter(|(_, e)| e.usable())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn peer_states(&self) -> HashMap<DeviceId, LinkState> {
        self.peers
            .iter()
            .filter_map(|(id, e)| e.reported.map(|s| (id.clone(), s)))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Explicit teardown. No reconnect follows.
    pub fn close_peer(&mut self, remote: &DeviceId) -> Option<PeerUpdate> {
        if let Some(timer) = self.retry_timers.remove(remote) {
            timer.abort();
        }
        let entry = self.peers.remove(remote)?;
        entry.link.close();
        info!(peer = %remote.short(), "closed direct link");
        Some(PeerUpdate::Connection {
            remote: remote.clone(),
            state: LinkState::Closed,
        })
    }

    pub fn close_all(&mut self) -> Vec<PeerUpdate> {
        let remotes: Vec<DeviceId> = self.peers.keys().cloned().collect();
        remotes
            .iter()
            .filter_map(|remote| self.close_peer(remote))
            .collect()
    }

    /// Peers reached through `key`, used when a group key is torn down.
    pub fn peers_routed_by(&self, key: &EncKey) -> Vec<DeviceId> {
        self.peers
            .iter()
            .filter(|(_, e)| &e.route.key == key)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        for (_, timer) in self.retry_timers.drain() {
            timer.abort();
        }
    }
}

fn flush_candidates(entry: &mut PeerEntry) {
    for candidate in entry.pending_candidates.drain(..) {
        entry.link.add_ice_candidate(candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLinkNetwork;
    use tasktank_shared::models::Fish;

    struct Side {
        manager: PeerManager,
        events: mpsc::UnboundedReceiver<LinkEvent>,
    }

    fn side(net: &MemoryLinkNetwork, id: &str) -> Side {
        let (tx, rx) = mpsc::unbounded_channel();
        Side {
            manager: PeerManager::new(
                DeviceId::from(id),
                Arc::new(net.clone()),
                tx,
                Duration::from_secs(2),
                Duration::from_secs(60),
            ),
            events: rx,
        }
    }

    fn route() -> SignalRoute {
        SignalRoute {
            key: EncKey::from_bytes([9u8; 32]),
            relays: vec!["mem://r".into()],
        }
    }

    /// Pump link events on both sides, handing signals across, until quiet.
    /// Returns every non-signal update per side.
    fn pump(a: &mut Side, b: &mut Side) -> (Vec<PeerUpdate>, Vec<PeerUpdate>) {
        let mut out_a = Vec::new();
        let mut out_b = Vec::new();
        loop {
            let mut progressed = false;
            while let Ok(event) = a.events.try_recv() {
                progressed = true;
                for update in a.manager.handle_event(event) {
                    match update {
                        PeerUpdate::Signal { payload, route } => {
                            b.manager.handle_signal(payload, route)
                        }
                        other => out_a.push(other),
                    }
                }
            }
            while let Ok(event) = b.events.try_recv() {
                progressed = true;
                for update in b.manager.handle_event(event) {
                    match update {
                        PeerUpdate::Signal { payload, route } => {
                            a.manager.handle_signal(payload, route)
                        }
                        other => out_b.push(other),
                    }
                }
            }
            if !progressed {
                return (out_a, out_b);
            }
        }
    }

    fn connected(updates: &[PeerUpdate]) -> bool {
        updates.iter().any(|u| {
            matches!(
                u,
                PeerUpdate::Connection {
                    state: LinkState::Connected,
                    ..
                }
            )
        })
    }

    #[tokio::test]
    async fn smaller_id_initiates() {
        let net = MemoryLinkNetwork::new();
        let mut a = side(&net, "aaa");
        let mut b = side(&net, "bbb");

        // The larger id never offers.
        b.manager.connect(&DeviceId::from("aaa"), route());
        assert_eq!(net.offers_created(), 0);

        a.manager.connect(&DeviceId::from("bbb"), route());
        let (ua, ub) = pump(&mut a, &mut b);
        assert_eq!(net.offers_created(), 1);
        assert!(connected(&ua) && connected(&ub));
        assert!(a.manager.is_connected(&DeviceId::from("bbb")));
        assert_eq!(b.manager.connected_peers(), vec![DeviceId::from("aaa")]);
    }

    #[tokio::test]
    async fn candidates_wait_for_remote_description() {
        let net = MemoryLinkNetwork::new();
        let mut a = side(&net, "aaa");
        let mut b = side(&net, "bbb");
        let (dev_a, dev_b) = (DeviceId::from("aaa"), DeviceId::from("bbb"));

        a.manager.connect(&dev_b, route());
        while let Ok(event) = a.events.try_recv() {
            for update in a.manager.handle_event(event) {
                if let PeerUpdate::Signal { payload, route } = update {
                    b.manager.handle_signal(payload, route);
                }
            }
        }

        // b's candidate overtakes its answer on the way back.
        let mut answer = None;
        while let Ok(event) = b.events.try_recv() {
            for update in b.manager.handle_event(event) {
                if let PeerUpdate::Signal { payload, route } = update {
                    match payload {
                        SignalPayload::Answer { .. } => answer = Some((payload, route)),
                        other => a.manager.handle_signal(other, route),
                    }
                }
            }
        }
        assert_eq!(net.early_candidates(&dev_a, &dev_b), 0);

        let (answer, answer_route) = answer.unwrap();
        a.manager.handle_signal(answer, answer_route);
        pump(&mut a, &mut b);

        assert!(a.manager.is_connected(&dev_b));
        assert_eq!(net.early_candidates(&dev_a, &dev_b), 0);
    }

    #[tokio::test]
    async fn messages_are_routed_by_kind() {
        let net = MemoryLinkNetwork::new();
        let mut a = side(&net, "aaa");
        let mut b = side(&net, "bbb");
        let dev_b = DeviceId::from("bbb");
        a.manager.connect(&dev_b, route());
        pump(&mut a, &mut b);

        let fish = Fish::new("urgent fix");
        let change = TankChange::FishUpsert {
            fish_id: fish.id.clone(),
            data: fish,
        };
        assert!(a.manager.send_message(&dev_b, &TankId::from("t1"), change.clone()));
        assert!(a.manager.send_file_message(
            &dev_b,
            FileMessage::Error {
                transfer_id: "ft-1".into(),
                error: "File not found".into(),
            }
        ));

        let mut got = Vec::new();
        while got.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(1), b.events.recv())
                .await
                .unwrap()
                .unwrap();
            got.extend(b.manager.handle_event(event));
        }
        match &got[0] {
            PeerUpdate::Sync { message, .. } => {
                assert_eq!(message.change, change);
                assert_eq!(message.device_id, DeviceId::from("aaa"));
            }
            other => panic!("expected sync, got {other:?}"),
        }
        assert!(matches!(got[1], PeerUpdate::File { .. }));
    }

    #[tokio::test]
    async fn send_without_link_reports_false() {
        let net = MemoryLinkNetwork::new();
        let a = side(&net, "aaa");
        let change = TankChange::FishDelete {
            fish_id: "f1".into(),
        };
        assert!(!a.manager.send_message(&DeviceId::from("bbb"), &TankId::from("t"), change));
    }

    #[tokio::test(start_paused = true)]
    async fn initiator_retries_with_backoff() {
        let net = MemoryLinkNetwork::new();
        let mut a = side(&net, "aaa");
        let mut b = side(&net, "bbb");
        let (dev_a, dev_b) = (DeviceId::from("aaa"), DeviceId::from("bbb"));
        net.set_blocked(&dev_a, &dev_b, true);

        a.manager.connect(&dev_b, route());
        pump(&mut a, &mut b);
        assert_eq!(net.offers_created(), 1);

        // First retry after 2s, second 4s later.
        tokio::time::sleep(Duration::from_millis(1_900)).await;
        pump(&mut a, &mut b);
        assert_eq!(net.offers_created(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        pump(&mut a, &mut b);
        assert_eq!(net.offers_created(), 2);

        tokio::time::sleep(Duration::from_millis(3_900)).await;
        pump(&mut a, &mut b);
        assert_eq!(net.offers_created(), 2);

        net.set_blocked(&dev_a, &dev_b, false);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let (ua, _) = pump(&mut a, &mut b);
        assert_eq!(net.offers_created(), 3);
        assert!(connected(&ua));

        // A drop after success starts again from the floor.
        net.sever(&dev_a, &dev_b);
        pump(&mut a, &mut b);
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        let (ua, _) = pump(&mut a, &mut b);
        assert_eq!(net.offers_created(), 4);
        assert!(connected(&ua));
    }

    #[tokio::test(start_paused = true)]
    async fn responder_never_schedules_reconnect() {
        let net = MemoryLinkNetwork::new();
        let mut a = side(&net, "aaa");
        let mut b = side(&net, "bbb");
        let (dev_a, dev_b) = (DeviceId::from("aaa"), DeviceId::from("bbb"));
        a.manager.connect(&dev_b, route());
        pump(&mut a, &mut b);

        net.sever(&dev_a, &dev_b);
        // Drop a's events so only b reacts.
        while a.events.try_recv().is_ok() {}
        while let Ok(event) = b.events.try_recv() {
            b.manager.handle_event(event);
        }
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(b.events.try_recv().is_err());
        assert_eq!(net.offers_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_regain_skips_backoff() {
        let net = MemoryLinkNetwork::new();
        let mut a = side(&net, "aaa");
        let mut b = side(&net, "bbb");
        let (dev_a, dev_b) = (DeviceId::from("aaa"), DeviceId::from("bbb"));
        a.manager.connect(&dev_b, route());
        pump(&mut a, &mut b);

        net.sever(&dev_a, &dev_b);
        pump(&mut a, &mut b);
        assert!(!a.manager.is_connected(&dev_b));

        a.manager.set_visible(true);
        let (ua, _) = pump(&mut a, &mut b);
        assert!(connected(&ua));
        assert_eq!(net.offers_created(), 2);
    }

    #[tokio::test]
    async fn close_peer_is_terminal() {
        let net = MemoryLinkNetwork::new();
        let mut a = side(&net, "aaa");
        let mut b = side(&net, "bbb");
        let dev_b = DeviceId::from("bbb");
        a.manager.connect(&dev_b, route());
        pump(&mut a, &mut b);

        let update = a.manager.close_peer(&dev_b).unwrap();
        assert!(matches!(
            update,
            PeerUpdate::Connection {
                state: LinkState::Closed,
                ..
            }
        ));
        assert!(!a.manager.is_connected(&dev_b));
        assert!(a.manager.connected_peers().is_empty());
    }
}
