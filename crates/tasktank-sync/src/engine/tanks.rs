//! Tank sync: sharing, joining, the relay record stream and the
//! dual-path pusher.

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use tasktank_shared::crypto::checksum;
use tasktank_shared::models::{Attachment, Peer, PeerInfo, Tank};
use tasktank_shared::pairing::ShareCode;
use tasktank_shared::protocol::TankChange;
use tasktank_shared::record::{now_secs, Record};
use tasktank_shared::types::{uid, DeviceId, FileId, FishId, Permission, SyncKey, TankId};
use tasktank_store::FileBlob;

use crate::config::union_relays;
use crate::detector::{carry_blob_flags, diff_tank, diff_tanks, Touched};
use crate::error::{Result, SyncError};
use crate::merge::{apply_change, Applied};
use crate::tank_store::TankChannel;
use crate::transfer::FileOffer;

use super::{SyncEngine, TimerEvent, Unsent};

/// Where a change lands among a tank's records, for coalescing.
fn change_slot(change: &TankChange) -> String {
    match change {
        TankChange::Meta { .. } => "m".to_string(),
        TankChange::FishUpsert { fish_id, .. } | TankChange::FishDelete { fish_id } => {
            format!("f:{fish_id}")
        }
        TankChange::Peer { peer_id, .. } => format!("p:{peer_id}"),
    }
}

impl SyncEngine {
    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Subscribe to a keyed tank's records and bring up its signaling.
    pub(super) fn activate_tank(&mut self, tank_id: &TankId) {
        let Some(key) = self.keys.get(tank_id).cloned() else {
            return;
        };
        let channel = TankChannel::new(tank_id.clone(), key.clone());
        let relays = self.relays_for(&key);
        self.pool
            .subscribe(&channel.sub_id(), vec![channel.filter()], &relays);
        self.channels.insert(tank_id.clone(), channel);
        self.ensure_signaling(&key);
        debug!(tank = %tank_id.short(), sync_id = %key.sync_id, "subscribed to tank");
        self.publish_synced();
        self.refresh_status();
    }

    /// Stop syncing `tank_id`: say goodbye, drop the subscription and, when
    /// no other tank uses the key, its signaling. The local copy stays.
    pub(super) fn stop_sync(&mut self, tank_id: &TankId, announce: bool) -> bool {
        let Some(key) = self.keys.get(tank_id).cloned() else {
            return false;
        };
        if let Some(pending) = self.pending.remove(tank_id) {
            self.publish_changes(tank_id, pending.changes.into_values());
        }
        self.publish_changes(
            tank_id,
            [TankChange::Peer {
                peer_id: self.local.clone(),
                data: PeerInfo::left(),
            }],
        );
        self.outbox.remove(tank_id);
        if let Some(channel) = self.channels.remove(tank_id) {
            self.pool.unsubscribe(&channel.sub_id());
        }
        self.keys.remove(tank_id);
        self.save_keys();
        self.tombstones.forget_tank(tank_id);
        for held in self.holders.values_mut() {
            held.remove(tank_id);
        }
        self.release_signaling(&key.enc_key);
        if announce {
            self.announce_tank_removed(tank_id);
        }
        info!(tank = %tank_id.short(), "stopped syncing tank");
        self.publish_synced();
        self.refresh_status();
        true
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    pub(super) fn share_tank(&mut self, tank_id: &TankId) -> Result<SyncKey> {
        if let Some(key) = self.keys.get(tank_id) {
            return Ok(key.clone());
        }
        let local = self.local.clone();
        let tank = self
            .tank_mut(tank_id)
            .ok_or_else(|| SyncError::UnknownTank(tank_id.clone()))?;
        if tank.owner_id.is_none() {
            tank.owner_id = Some(local);
        }

        let key = SyncKey::generate(self.preferred_relays.clone())?;
        self.keys.insert(tank_id.clone(), key.clone());
        self.save_keys();
        info!(tank = %tank_id.short(), sync_id = %key.sync_id, "sharing tank");

        self.activate_tank(tank_id);
        self.push_full_tank(tank_id);
        self.announce_tank_added(tank_id);
        self.publish_tanks();
        Ok(key)
    }

    /// Start syncing a tank that already exists locally under `key`.
    pub(super) fn join_tank(&mut self, tank_id: &TankId, key: SyncKey, device_name: Option<String>) -> Result<()> {
        if self.tank(tank_id).is_none() {
            return Err(SyncError::UnknownTank(tank_id.clone()));
        }
        if self.keys.get(tank_id).is_some_and(|k| k != &key) {
            self.stop_sync(tank_id, false);
        }
        self.keys.insert(tank_id.clone(), key.clone());
        self.save_keys();
        info!(tank = %tank_id.short(), sync_id = %key.sync_id, "joining tank");

        self.activate_tank(tank_id);
        self.publish_own_peer_info(tank_id, device_name, Some(Self::now_rfc3339()));
        Ok(())
    }

    pub(super) fn accept_pair(&mut self, code: &str) -> Result<TankId> {
        let share = ShareCode::parse(code, &self.local, now_secs())?;
        let sharer = Peer {
            device_id: share.device_id.clone(),
            device_name: share.device_name.clone(),
            permission: Permission::Shared,
            paired_at: Some(Self::now_rfc3339()),
            last_sync_at: None,
        };

        match self.tank_mut(&share.tank_id) {
            Some(tank) => {
                tank.my_permission = Some(share.permission);
                match tank.peers.iter_mut().find(|p| p.device_id == sharer.device_id) {
                    Some(slot) => slot.device_name = sharer.device_name,
                    None => tank.peers.push(sharer),
                }
            }
            None => {
                let tank = Tank {
                    id: share.tank_id.clone(),
                    peers: vec![sharer],
                    my_permission: Some(share.permission),
                    ..Tank::new(share.tank_name.clone(), &share.device_id)
                };
                self.tanks.push(tank);
            }
        }

        let key = SyncKey {
            sync_id: share.sync_id.clone(),
            enc_key: share.enc_key.clone(),
            relays: union_relays(&share.relays, &self.preferred_relays),
            relay_only: share.relay_only,
        };
        info!(
            tank = %share.tank_id.short(),
            from = %share.device_id.short(),
            permission = share.permission.code(),
            "accepted share code"
        );
        self.join_tank(&share.tank_id, key, share.recipient_name.clone())?;
        self.announce_tank_added(&share.tank_id);
        self.publish_tanks();
        Ok(share.tank_id)
    }

    pub(super) fn unsync_tank(&mut self, tank_id: &TankId) -> Result<()> {
        if !self.stop_sync(tank_id, true) {
            return Err(SyncError::NotSynced(tank_id.clone()));
        }
        Ok(())
    }

    pub(super) fn update_peer(&mut self, tank_id: &TankId, device_id: DeviceId, info: PeerInfo) -> Result<()> {
        if !self.keys.contains_key(tank_id) {
            return Err(SyncError::NotSynced(tank_id.clone()));
        }
        let now = Self::now_rfc3339();
        let change = TankChange::Peer {
            peer_id: device_id,
            data: info,
        };
        let local = self.local.clone();
        let tank = self
            .tanks
            .iter_mut()
            .find(|t| &t.id == tank_id)
            .ok_or_else(|| SyncError::UnknownTank(tank_id.clone()))?;
        apply_change(tank, &change, &local, &mut self.tombstones, &now);
        self.dispatch(tank_id, vec![change]);
        self.publish_tanks();
        Ok(())
    }

    pub(super) fn generate_share_code(
        &mut self,
        tank_id: &TankId,
        permission: Permission,
        recipient_name: Option<String>,
        relay_only: bool,
    ) -> Result<String> {
        let mut key = self.share_tank(tank_id)?;
        if relay_only && !key.relay_only {
            // Both ends of a relay-only pairing stay off direct links.
            key.relay_only = true;
            self.keys.insert(tank_id.clone(), key.clone());
            self.save_keys();
            self.ensure_signaling(&key);
        }
        let tank = self
            .tank(tank_id)
            .ok_or_else(|| SyncError::UnknownTank(tank_id.clone()))?;

        let mut code = ShareCode::new(
            self.local.clone(),
            self.config.device_name.clone(),
            tank_id.clone(),
            tank.name.clone(),
            tank.fishes.len(),
            permission,
            key.sync_id.clone(),
            key.enc_key.clone(),
            self.relays_for(&key),
            now_secs(),
        );
        code.recipient_name = recipient_name.filter(|n| !n.trim().is_empty());
        code.relay_only = relay_only;
        debug!(tank = %tank_id.short(), permission = permission.code(), relay_only, "generated share code");
        Ok(code.encode())
    }

    pub(super) fn attach_file(
        &mut self,
        tank_id: &TankId,
        fish_id: &FishId,
        name: String,
        mime_type: Option<String>,
        data: Vec<u8>,
    ) -> Result<Attachment> {
        let size = data.len() as u64;
        if size > self.config.max_file_size {
            return Err(SyncError::FileTooLarge {
                size,
                limit: self.config.max_file_size,
            });
        }
        let tank = self
            .tank(tank_id)
            .ok_or_else(|| SyncError::UnknownTank(tank_id.clone()))?;
        if tank.fish(fish_id).is_none() {
            return Err(SyncError::UnknownFish(fish_id.clone()));
        }

        let file_id = FileId::generate();
        let sum = checksum(&data);
        self.db.store_file(&FileBlob {
            file_id: file_id.clone(),
            name: name.clone(),
            mime_type: mime_type.clone(),
            size,
            checksum: Some(sum.clone()),
            data,
            tank_id: tank_id.clone(),
            fish_id: fish_id.clone(),
            created_at: Utc::now(),
        })?;

        let attachment = Attachment {
            id: uid(),
            name,
            url: None,
            file_id: Some(file_id.clone()),
            mime_type,
            size: Some(size),
            checksum: Some(sum),
            has_local_blob: true,
        };
        let changes = match self.tank_mut(tank_id) {
            Some(tank) => {
                let before = tank.clone();
                if let Some(fish) = tank.fish_mut(fish_id) {
                    fish.attachments.push(attachment.clone());
                }
                diff_tank(&before, tank)
            }
            None => Vec::new(),
        };
        info!(tank = %tank_id.short(), fish = %fish_id.short(), file = %file_id.short(), size, "attached file");

        let writable = self
            .tank(tank_id)
            .map(|t| !t.is_readonly_for(&self.local))
            .unwrap_or(false);
        if self.keys.contains_key(tank_id) && writable {
            self.dispatch(tank_id, changes);
            let offer = FileOffer {
                file_id,
                name: attachment.name.clone(),
                size,
                mime_type: attachment.mime_type.clone(),
                checksum: attachment.checksum.clone(),
                fish_id: fish_id.clone(),
                tank_id: tank_id.clone(),
            };
            for remote in self.connected_holders(tank_id) {
                self.transfers
                    .offer_files(&remote, [offer.clone()], &self.peers);
            }
        }
        self.publish_tanks();
        Ok(attachment)
    }

    pub(super) fn request_file(&mut self, tank_id: &TankId, fish_id: &FishId, file_id: &FileId) -> Result<bool> {
        let tank = self
            .tank(tank_id)
            .ok_or_else(|| SyncError::UnknownTank(tank_id.clone()))?;
        let fish = tank
            .fish(fish_id)
            .ok_or_else(|| SyncError::UnknownFish(fish_id.clone()))?;
        let Some(attachment) = fish.attachment_by_file(file_id) else {
            debug!(file = %file_id.short(), "no attachment for requested file");
            return Ok(false);
        };
        let offer = FileOffer {
            file_id: file_id.clone(),
            name: attachment.name.clone(),
            size: attachment.size.unwrap_or(0),
            mime_type: attachment.mime_type.clone(),
            checksum: attachment.checksum.clone(),
            fish_id: fish_id.clone(),
            tank_id: tank_id.clone(),
        };
        let Some(remote) = self.connected_holders(tank_id).into_iter().next() else {
            debug!(file = %file_id.short(), "no connected peer to fetch file from");
            return Ok(false);
        };
        let requested = self.transfers.request(&remote, offer, &self.db, &self.peers);
        self.publish_transfers();
        Ok(requested)
    }

    // -----------------------------------------------------------------------
    // Local changes
    // -----------------------------------------------------------------------

    pub(super) fn update_tanks(&mut self, mut next: Vec<Tank>) {
        let now = Instant::now();
        self.remote_window.prune(now);
        self.remote_window.pin(&self.tanks, &mut next, now);
        carry_blob_flags(&self.tanks, &mut next);
        // A deleted fish id never comes back, not even from a stale snapshot.
        for tank in next.iter_mut() {
            let tombstones = &self.tombstones;
            let before = tank.fishes.len();
            tank.fishes.retain(|f| !tombstones.contains(&tank.id, &f.id));
            if tank.fishes.len() != before {
                debug!(tank = %tank.id.short(), dropped = before - tank.fishes.len(), "ignoring deleted fish");
            }
        }

        let diffs = diff_tanks(&self.tanks, &next, |id| self.keys.contains_key(id), &self.local);
        let added: Vec<TankId> = next
            .iter()
            .filter(|t| self.tank(&t.id).is_none())
            .map(|t| t.id.clone())
            .collect();
        let removed: Vec<TankId> = self
            .tanks
            .iter()
            .filter(|t| !next.iter().any(|n| n.id == t.id))
            .map(|t| t.id.clone())
            .collect();
        self.tanks = next;

        for (tank_id, changes) in diffs {
            for change in &changes {
                if let TankChange::FishDelete { fish_id } = change {
                    self.tombstones.insert(&tank_id, fish_id.clone());
                    if let Err(e) = self.db.delete_files_for_fish(fish_id) {
                        warn!(fish = %fish_id.short(), error = %e, "failed to delete fish files");
                    }
                }
            }
            debug!(tank = %tank_id.short(), changes = changes.len(), "local changes");
            self.dispatch(&tank_id, changes);
        }

        for tank_id in removed {
            if let Err(e) = self.db.delete_files_for_tank(&tank_id) {
                warn!(tank = %tank_id.short(), error = %e, "failed to delete tank files");
            }
            self.stop_sync(&tank_id, true);
        }

        if self.group.is_some() {
            for tank_id in added {
                let owned = self
                    .tank(&tank_id)
                    .map(|t| t.is_owned_by(&self.local))
                    .unwrap_or(false);
                if owned && !self.keys.contains_key(&tank_id) {
                    if let Err(e) = self.share_tank(&tank_id) {
                        warn!(tank = %tank_id.short(), error = %e, "failed to share new tank into group");
                    }
                }
            }
        }
        self.publish_tanks();
    }

    /// Send changes to every connected holder now and queue them for the
    /// relays.
    pub(super) fn dispatch(&mut self, tank_id: &TankId, changes: Vec<TankChange>) {
        if changes.is_empty() {
            return;
        }
        for remote in self.connected_holders(tank_id) {
            let sent = changes
                .iter()
                .filter(|c| self.peers.send_message(&remote, tank_id, (*c).clone()))
                .count();
            trace!(peer = %remote.short(), tank = %tank_id.short(), sent, "direct send");
        }

        let edited_at = now_secs();
        let pending = self.pending.entry(tank_id.clone()).or_default();
        for change in changes {
            let slot = change_slot(&change);
            pending.edited_at.insert(slot.clone(), edited_at);
            pending.changes.insert(slot, change);
        }
        self.schedule_push(tank_id);
    }

    fn schedule_push(&mut self, tank_id: &TankId) {
        let delay = if self.all_peers_direct(tank_id) {
            self.config.debounce_slow
        } else {
            self.config.debounce_fast
        };
        self.next_generation += 1;
        let generation = self.next_generation;
        if let Some(pending) = self.pending.get_mut(tank_id) {
            pending.generation = generation;
        }
        trace!(tank = %tank_id.short(), delay_ms = delay.as_millis() as u64, "relay push scheduled");
        self.spawn_timer(
            delay,
            TimerEvent::PushDue {
                tank_id: tank_id.clone(),
                generation,
            },
        );
    }

    /// True when the tank has peers and every one of them has an open link.
    fn all_peers_direct(&self, tank_id: &TankId) -> bool {
        let Some(tank) = self.tank(tank_id) else {
            return false;
        };
        let mut devices: Vec<&DeviceId> = tank.peers.iter().map(|p| &p.device_id).collect();
        for (device, held) in &self.holders {
            if held.contains(tank_id) && !devices.contains(&device) {
                devices.push(device);
            }
        }
        devices.retain(|d| *d != &self.local);
        !devices.is_empty() && devices.iter().all(|d| self.peers.is_connected(d))
    }

    pub(super) fn flush_push(&mut self, tank_id: &TankId, generation: u64) {
        if self.pending.get(tank_id).map(|p| p.generation) != Some(generation) {
            return;
        }
        if let Some(pending) = self.pending.remove(tank_id) {
            self.publish_changes(tank_id, pending.changes.into_values());
        }
    }

    pub(super) fn publish_changes(&mut self, tank_id: &TankId, changes: impl IntoIterator<Item = TankChange>) {
        let Some(channel) = self.channels.get(tank_id) else {
            debug!(tank = %tank_id.short(), "tank no longer synced, dropping push");
            return;
        };
        let relays = self.relays_for(channel.key());
        let slots = self.outbox.entry(tank_id.clone()).or_default();
        let (mut records, mut reached, mut held) = (0, 0, 0);
        for change in changes {
            let record = match channel.change_record(&mut self.clock, &change) {
                Ok(record) => record,
                Err(e) => {
                    warn!(tank = %tank_id.short(), error = %e, "failed to seal change");
                    continue;
                }
            };
            records += 1;
            let slot = change_slot(&change);
            let took = self.pool.publish(&record, &relays);
            reached = reached.max(took);
            if took > 0 {
                slots.remove(&slot);
            } else {
                held += 1;
                slots.insert(
                    slot,
                    Unsent {
                        change,
                        stamped: record.created_at,
                        resent: false,
                    },
                );
            }
        }
        if slots.is_empty() {
            self.outbox.remove(tank_id);
        }
        if held > 0 {
            info!(tank = %tank_id.short(), held, "no relay reachable, keeping changes until one is");
        }
        debug!(tank = %tank_id.short(), records, relays = reached, "pushed to relays");
    }

    /// Publish again whatever no relay took earlier. Slots that a relay now
    /// has stay marked until the next resync so a stale replay cannot win.
    pub(super) fn flush_outbox(&mut self) {
        let tanks: Vec<TankId> = self.outbox.keys().cloned().collect();
        for tank_id in tanks {
            let Some(channel) = self.channels.get(&tank_id) else {
                self.outbox.remove(&tank_id);
                continue;
            };
            let relays = self.relays_for(channel.key());
            let Some(slots) = self.outbox.get_mut(&tank_id) else {
                continue;
            };
            let mut resent = 0;
            for unsent in slots.values_mut().filter(|u| !u.resent) {
                let record = match channel.change_record(&mut self.clock, &unsent.change) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(tank = %tank_id.short(), error = %e, "failed to seal change");
                        continue;
                    }
                };
                unsent.stamped = record.created_at;
                if self.pool.publish(&record, &relays) > 0 {
                    unsent.resent = true;
                    resent += 1;
                }
            }
            if resent > 0 {
                info!(tank = %tank_id.short(), resent, "sent changes held while relays were unreachable");
            }
        }
    }

    /// A local edit to `slot` that is newer than a record stamped
    /// `created_at` and may not have reached a relay yet.
    fn newer_local_edit(&self, tank_id: &TankId, slot: &str, created_at: i64) -> bool {
        let unsent = self
            .outbox
            .get(tank_id)
            .and_then(|slots| slots.get(slot))
            .is_some_and(|u| u.stamped > created_at);
        let pending = self
            .pending
            .get(tank_id)
            .and_then(|p| p.edited_at.get(slot))
            .is_some_and(|&at| at >= created_at);
        unsent || pending
    }

    /// Metadata and every fish, published straight away.
    pub(super) fn push_full_tank(&mut self, tank_id: &TankId) {
        let (Some(channel), Some(tank)) = (
            self.channels.get(tank_id),
            self.tanks.iter().find(|t| &t.id == tank_id),
        ) else {
            return;
        };
        let relays = self.relays_for(channel.key());
        match channel.full_tank_records(&mut self.clock, tank) {
            Ok(records) => {
                for record in &records {
                    self.pool.publish(record, &relays);
                }
                debug!(tank = %tank_id.short(), records = records.len(), "pushed full tank");
            }
            Err(e) => warn!(tank = %tank_id.short(), error = %e, "failed to seal tank"),
        }
    }

    /// Publish this device's membership record for a tank.
    pub(super) fn publish_own_peer_info(
        &mut self,
        tank_id: &TankId,
        device_name: Option<String>,
        joined_at: Option<String>,
    ) {
        let Some(tank) = self.tank(tank_id) else {
            return;
        };
        let info = PeerInfo {
            device_name: Some(device_name.unwrap_or_else(|| self.config.device_name.clone())),
            permission: tank.my_permission,
            joined_at,
            left: false,
        };
        self.publish_changes(
            tank_id,
            [TankChange::Peer {
                peer_id: self.local.clone(),
                data: info,
            }],
        );
    }

    // -----------------------------------------------------------------------
    // Remote changes
    // -----------------------------------------------------------------------

    pub(super) fn on_tank_record(&mut self, tank_id: &TankId, record: &Record) {
        let Some(change) = self.channels.get(tank_id).and_then(|c| c.decode(record)) else {
            trace!(tank = %tank_id.short(), id = %record.id, "ignoring undecodable tank record");
            return;
        };
        let slot = change_slot(&change);
        if self.newer_local_edit(tank_id, &slot, record.created_at) {
            debug!(tank = %tank_id.short(), slot = %slot, "keeping newer local edit over relay record");
            return;
        }
        self.apply_remote(tank_id, change);
    }

    /// Merge a change from a relay or a direct link.
    pub(super) fn apply_remote(&mut self, tank_id: &TankId, change: TankChange) {
        if !self.keys.contains_key(tank_id) {
            trace!(tank = %tank_id.short(), "late change for unsynced tank");
            return;
        }
        let now = Self::now_rfc3339();
        let Some(tank) = self.tanks.iter_mut().find(|t| &t.id == tank_id) else {
            return;
        };
        let applied = apply_change(tank, &change, &self.local, &mut self.tombstones, &now);

        let at = Instant::now();
        match &applied {
            Applied::Unchanged => return,
            Applied::MetaChanged => self.remote_window.mark(Touched::Meta(tank_id.clone()), at),
            Applied::FishChanged(fish_id) => {
                self.remote_window
                    .mark(Touched::Fish(tank_id.clone(), fish_id.clone()), at);
            }
            Applied::FishRemoved(fish_id) => {
                self.remote_window
                    .mark(Touched::Fish(tank_id.clone(), fish_id.clone()), at);
                if let Err(e) = self.db.delete_files_for_fish(fish_id) {
                    warn!(fish = %fish_id.short(), error = %e, "failed to delete fish files");
                }
            }
            Applied::PeersChanged => {}
        }
        debug!(tank = %tank_id.short(), change = change.kind(), "applied remote change");
        self.publish_tanks();
    }
}
