//! Presence heartbeats, signaling and everything that arrives over a
//! direct link.

use std::collections::HashSet;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use tasktank_link::{signaling_filter, LinkState, PeerUpdate, SignalPayload, SignalRoute};
use tasktank_shared::crypto::EncKey;
use tasktank_shared::identity::AuthorIdentity;
use tasktank_shared::protocol::FileMessage;
use tasktank_shared::record::{now_secs, Record};
use tasktank_shared::types::{DeviceId, SyncKey, TankId};

use crate::detector::Touched;
use crate::error::TransferError;
use crate::merge::mark_file_present;
use crate::status::PeerStatus;
use crate::transfer::local_offers;

use super::{Signaling, SyncEngine, SIGNAL_SUB_PREFIX};

impl SyncEngine {
    // -----------------------------------------------------------------------
    // Signaling subscriptions
    // -----------------------------------------------------------------------

    /// Tanks synced under `enc_key`.
    fn tanks_for_key(&self, enc_key: &EncKey) -> Vec<TankId> {
        let mut tanks: Vec<TankId> = self
            .keys
            .iter()
            .filter(|(_, k)| &k.enc_key == enc_key)
            .map(|(id, _)| id.clone())
            .collect();
        tanks.sort();
        tanks
    }

    /// A key stays off direct links only if every tank using it does.
    fn key_is_relay_only(&self, enc_key: &EncKey) -> bool {
        let mut using = self.keys.values().filter(|k| &k.enc_key == enc_key).peekable();
        using.peek().is_some() && using.all(|k| k.relay_only)
    }

    pub(super) fn ensure_signaling(&mut self, key: &SyncKey) {
        let relay_only = self.key_is_relay_only(&key.enc_key);
        let relays = self.relays_for(key);
        if let Some(entry) = self.signaling.get_mut(&key.enc_key) {
            entry.relay_only = relay_only;
            return;
        }

        let author = AuthorIdentity::derive(&key.enc_key);
        let sub_id = format!("{SIGNAL_SUB_PREFIX}{}", key.enc_key.fingerprint());
        self.pool
            .subscribe(&sub_id, vec![signaling_filter(author.pubkey(), now_secs())], &relays);
        debug!(sub = %sub_id, relay_only, "signaling up");
        self.signaling.insert(
            key.enc_key.clone(),
            Signaling {
                author,
                relays,
                relay_only,
                sub_id,
            },
        );
        self.send_heartbeat(&key.enc_key);
    }

    /// Drop signaling for `enc_key` once no tank uses it, closing the links
    /// it routed.
    pub(super) fn release_signaling(&mut self, enc_key: &EncKey) {
        if !self.tanks_for_key(enc_key).is_empty() {
            let relay_only = self.key_is_relay_only(enc_key);
            if let Some(entry) = self.signaling.get_mut(enc_key) {
                entry.relay_only = relay_only;
            }
            return;
        }
        let Some(entry) = self.signaling.remove(enc_key) else {
            return;
        };
        self.pool.unsubscribe(&entry.sub_id);
        debug!(sub = %entry.sub_id, "signaling down");

        let updates: Vec<PeerUpdate> = self
            .peers
            .peers_routed_by(enc_key)
            .iter()
            .filter_map(|remote| self.peers.close_peer(remote))
            .collect();
        self.on_peer_updates(updates);
    }

    fn route_for(&self, enc_key: &EncKey) -> Option<SignalRoute> {
        self.signaling.get(enc_key).map(|entry| SignalRoute {
            key: enc_key.clone(),
            relays: entry.relays.clone(),
        })
    }

    // -----------------------------------------------------------------------
    // Heartbeats
    // -----------------------------------------------------------------------

    fn send_heartbeat(&mut self, enc_key: &EncKey) {
        let tanks = self.tanks_for_key(enc_key);
        if tanks.is_empty() {
            return;
        }
        let Some(entry) = self.signaling.get(enc_key) else {
            return;
        };
        let payload = SignalPayload::heartbeat(self.local.clone(), tanks);
        match payload.seal(enc_key, &entry.author) {
            Ok(record) => {
                let relays = entry.relays.clone();
                self.pool.publish(&record, &relays);
            }
            Err(e) => warn!(error = %e, "failed to seal heartbeat"),
        }
    }

    pub(super) fn send_heartbeats(&mut self) {
        let keys: Vec<EncKey> = self.signaling.keys().cloned().collect();
        for enc_key in keys {
            self.send_heartbeat(&enc_key);
        }
    }

    pub(super) fn expire_presence(&mut self) {
        for device in self.presence.expire(Instant::now()) {
            if !self.peers.is_connected(&device) {
                debug!(peer = %device.short(), "peer went quiet");
                self.board.set_peer(&device, None);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Incoming signals
    // -----------------------------------------------------------------------

    pub(super) fn on_signal_record(&mut self, sub_id: &str, record: &Record) {
        let Some((enc_key, relay_only)) = self
            .signaling
            .iter()
            .find(|(_, entry)| entry.sub_id == sub_id)
            .map(|(key, entry)| (key.clone(), entry.relay_only))
        else {
            return;
        };
        let Some(payload) = SignalPayload::open(record, &enc_key, &self.local) else {
            return;
        };
        let Some(route) = self.route_for(&enc_key) else {
            return;
        };

        match payload {
            SignalPayload::Heartbeat { from, tanks, .. } => {
                self.on_heartbeat(from, tanks, route, relay_only);
            }
            signal if relay_only => {
                trace!(from = %signal.sender().short(), "relay-only key, ignoring link signal");
            }
            signal => self.peers.handle_signal(signal, route),
        }
    }

    fn on_heartbeat(&mut self, from: DeviceId, tanks: Vec<TankId>, route: SignalRoute, relay_only: bool) {
        let ours: HashSet<TankId> = tanks
            .into_iter()
            .filter(|id| self.keys.get(id).is_some_and(|k| k.enc_key == route.key))
            .collect();
        let held = self.holders.entry(from.clone()).or_default();
        held.retain(|id| {
            self.keys
                .get(id)
                .map(|k| k.enc_key != route.key)
                .unwrap_or(false)
        });
        held.extend(ours);

        if self.presence.observe(&from, Instant::now()) {
            info!(peer = %from.short(), "peer present");
            // Let the newcomer know about us without waiting a full interval.
            self.send_heartbeat(&route.key);
        }

        if self.peers.is_connected(&from) {
            return;
        }
        self.board.set_peer(&from, Some(PeerStatus::Relay));
        if !relay_only {
            self.peers.connect(&from, route);
        }
    }

    // -----------------------------------------------------------------------
    // Link updates
    // -----------------------------------------------------------------------

    pub(super) fn on_peer_updates(&mut self, updates: Vec<PeerUpdate>) {
        for update in updates {
            match update {
                PeerUpdate::Signal { route, payload } => self.publish_signal(route, payload),
                PeerUpdate::Connection { remote, state } => self.on_connection(remote, state),
                PeerUpdate::Sync { remote, message } => {
                    if !self.is_holder(&remote, &message.tank_id) {
                        debug!(peer = %remote.short(), tank = %message.tank_id.short(), "change from a non-member, dropped");
                        continue;
                    }
                    trace!(peer = %remote.short(), change = message.change.kind(), "direct change");
                    self.apply_remote(&message.tank_id, message.change);
                }
                PeerUpdate::File { remote, message } => self.on_file_message(remote, message),
            }
        }
    }

    fn publish_signal(&mut self, route: SignalRoute, payload: SignalPayload) {
        let author = match self.signaling.get(&route.key) {
            Some(entry) => entry.author.clone(),
            None => AuthorIdentity::derive(&route.key),
        };
        match payload.seal(&route.key, &author) {
            Ok(record) => {
                self.pool.publish(&record, &route.relays);
            }
            Err(e) => warn!(error = %e, "failed to seal signal"),
        }
    }

    fn on_connection(&mut self, remote: DeviceId, state: LinkState) {
        match state {
            LinkState::Connected => {
                info!(peer = %remote.short(), "direct link up");
                self.board.set_peer(&remote, Some(PeerStatus::Connected));
                let offers: Vec<_> = self
                    .tanks
                    .iter()
                    .filter(|t| self.is_holder(&remote, &t.id))
                    .flat_map(local_offers)
                    .collect();
                self.transfers.offer_files(&remote, offers, &self.peers);
            }
            LinkState::Disconnected | LinkState::Failed | LinkState::Closed => {
                debug!(peer = %remote.short(), state = ?state, "direct link down");
                self.transfers.cleanup_peer(&remote);
                self.publish_transfers();
                let status = self
                    .presence
                    .is_present(&remote, Instant::now())
                    .then_some(PeerStatus::Relay);
                self.board.set_peer(&remote, status);
            }
            LinkState::New | LinkState::Connecting => {}
        }
    }

    fn on_file_message(&mut self, remote: DeviceId, message: FileMessage) {
        let tank_id = match &message {
            FileMessage::Offer { tank_id, .. } => Some(tank_id.clone()),
            FileMessage::Request { file_id, .. } => self
                .tanks
                .iter()
                .find(|t| {
                    t.fishes
                        .iter()
                        .any(|f| f.attachment_by_file(file_id).is_some())
                })
                .map(|t| t.id.clone()),
            _ => None,
        };
        let allowed = tank_id
            .as_ref()
            .map(|tank_id| self.is_holder(&remote, tank_id));
        match (&message, allowed) {
            (FileMessage::Request { file_id, transfer_id }, allowed) if allowed != Some(true) => {
                // Only attachments of a tank the peer holds are ever served.
                debug!(peer = %remote.short(), file = %file_id.short(), "refusing file request");
                self.transfers
                    .refuse(&remote, transfer_id.clone(), TransferError::NotFound, &self.peers);
                return;
            }
            (_, Some(false)) => {
                debug!(peer = %remote.short(), "file message from a non-member, dropped");
                return;
            }
            _ => {}
        }

        let received = self
            .transfers
            .handle_message(&remote, message, &self.db, &self.peers);
        self.publish_transfers();

        let Some(file) = received else {
            return;
        };
        let flipped = self
            .tanks
            .iter_mut()
            .find(|t| t.id == file.tank_id)
            .map(|tank| mark_file_present(tank, &file.fish_id, &file.file_id))
            .unwrap_or(false);
        if flipped {
            self.remote_window.mark(
                Touched::Fish(file.tank_id.clone(), file.fish_id.clone()),
                Instant::now(),
            );
            self.publish_tanks();
        }
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Devices that announced `tank_id` and have an open link, sorted.
    pub(super) fn connected_holders(&self, tank_id: &TankId) -> Vec<DeviceId> {
        let mut remotes: Vec<DeviceId> = self
            .holders
            .iter()
            .filter(|(remote, held)| held.contains(tank_id) && self.peers.is_connected(remote))
            .map(|(remote, _)| remote.clone())
            .collect();
        remotes.sort();
        remotes
    }

    pub(super) fn is_holder(&self, remote: &DeviceId, tank_id: &TankId) -> bool {
        self.holders
            .get(remote)
            .map(|held| held.contains(tank_id))
            .unwrap_or(false)
    }
}
