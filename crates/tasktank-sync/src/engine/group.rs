//! The device group: one person's devices sharing every tank they own.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use tasktank_shared::crypto::generate_key;
use tasktank_shared::models::{DeviceGroup, GroupDevice, Tank};
use tasktank_shared::pairing::DevicePairCode;
use tasktank_shared::record::{now_secs, Record};
use tasktank_shared::types::{SyncId, TankId};

use crate::device_group::{
    add_device, remove_device, GroupChannel, GroupSignal, GroupUpdate, KeyInfo, KeySnapshot,
    KEYS_SUB_ID, SIGNALS_SUB_ID,
};
use crate::error::{Result, SyncError};

use super::SyncEngine;

pub(super) struct GroupState {
    group: DeviceGroup,
    channel: GroupChannel,
}

impl GroupState {
    pub(super) fn new(group: DeviceGroup) -> Self {
        let channel = GroupChannel::new(&group);
        Self { group, channel }
    }
}

pub(super) fn is_group_sub(sub_id: &str) -> bool {
    sub_id == KEYS_SUB_ID || sub_id == SIGNALS_SUB_ID
}

impl SyncEngine {
    fn group_relays(&self) -> Vec<String> {
        match &self.group {
            Some(state) if !state.group.relays.is_empty() => state.group.relays.clone(),
            _ => self.preferred_relays.clone(),
        }
    }

    pub(super) fn activate_group(&mut self) {
        let relays = self.group_relays();
        let Some(state) = &self.group else {
            return;
        };
        let snapshot = state.channel.snapshot_filter();
        let signals = state.channel.signal_filter(now_secs());
        let group_id = state.group.group_id.clone();
        self.pool.subscribe(KEYS_SUB_ID, vec![snapshot], &relays);
        self.pool.subscribe(SIGNALS_SUB_ID, vec![signals], &relays);
        info!(group = %group_id, devices = self.group.as_ref().map(|s| s.group.devices.len()).unwrap_or(0), "device group active");
    }

    fn set_group(&mut self, group: DeviceGroup) {
        if let Err(e) = self.db.save_device_group(&group) {
            warn!(error = %e, "failed to persist device group");
        }
        self.board.device_group.send_replace(Some(group.clone()));
        self.group = Some(GroupState::new(group));
    }

    /// Persist and publish the group after an in-place change.
    fn group_changed(&self) {
        let Some(state) = &self.group else {
            return;
        };
        if let Err(e) = self.db.save_device_group(&state.group) {
            warn!(error = %e, "failed to persist device group");
        }
        self.board.device_group.send_replace(Some(state.group.clone()));
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    pub(super) fn pair_device(&mut self, device_name: Option<String>) -> Result<String> {
        let name = device_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| self.config.device_name.clone());

        if self.group.is_none() {
            let now = Self::now_rfc3339();
            let group = DeviceGroup {
                group_id: SyncId::generate(),
                group_key: generate_key()?,
                device_name: name.clone(),
                created_at: now.clone(),
                devices: vec![GroupDevice {
                    device_id: self.local.clone(),
                    device_name: name.clone(),
                    paired_at: now.clone(),
                    last_seen_at: now,
                }],
                relays: self.preferred_relays.clone(),
            };
            info!(group = %group.group_id, "created device group");
            self.set_group(group);
            self.activate_group();
            self.refresh_status();
        }

        let unshared: Vec<TankId> = self
            .tanks
            .iter()
            .filter(|t| t.is_owned_by(&self.local) && !self.keys.contains_key(&t.id))
            .map(|t| t.id.clone())
            .collect();
        for tank_id in unshared {
            if let Err(e) = self.share_tank(&tank_id) {
                warn!(tank = %tank_id.short(), error = %e, "failed to share tank into group");
            }
        }
        self.publish_group_snapshot();

        let relays = self.group_relays();
        let state = self.group.as_ref().ok_or(SyncError::NoDeviceGroup)?;
        let code = DevicePairCode::new(
            state.group.group_id.clone(),
            state.group.group_key.clone(),
            relays,
            self.local.clone(),
            name,
            now_secs(),
        );
        Ok(code.encode())
    }

    pub(super) fn accept_device_pair(&mut self, code: &str) -> Result<()> {
        let pair = DevicePairCode::parse(code, &self.local, now_secs(), &self.preferred_relays)?;
        if let Some(state) = &self.group {
            if state.group.group_id == pair.group_id {
                debug!(group = %pair.group_id, "already in this device group");
                return Ok(());
            }
            info!(group = %state.group.group_id, "leaving current device group");
            self.unpair_device()?;
        }

        let now = Self::now_rfc3339();
        let name = self.config.device_name.clone();
        let group = DeviceGroup {
            group_id: pair.group_id.clone(),
            group_key: pair.group_key.clone(),
            device_name: name.clone(),
            created_at: now.clone(),
            devices: vec![
                GroupDevice {
                    device_id: pair.device_id.clone(),
                    device_name: pair.device_name.clone(),
                    paired_at: now.clone(),
                    last_seen_at: now.clone(),
                },
                GroupDevice {
                    device_id: self.local.clone(),
                    device_name: name.clone(),
                    paired_at: now.clone(),
                    last_seen_at: now,
                },
            ],
            relays: pair.relays.clone(),
        };
        info!(group = %group.group_id, with = %pair.device_id.short(), "joined device group");
        self.set_group(group);
        self.activate_group();
        self.publish_group_signal(GroupSignal::DeviceJoin {
            device_name: Some(name),
        });
        self.refresh_status();
        Ok(())
    }

    /// Leave the group. Tanks already synced stay synced.
    pub(super) fn unpair_device(&mut self) -> Result<()> {
        if self.group.is_none() {
            return Err(SyncError::NoDeviceGroup);
        }
        self.publish_group_signal(GroupSignal::DeviceLeave {});
        self.pool.unsubscribe(KEYS_SUB_ID);
        self.pool.unsubscribe(SIGNALS_SUB_ID);
        self.group = None;
        self.db.clear_device_group()?;
        self.board.device_group.send_replace(None);
        info!("left device group");
        self.refresh_status();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Incoming
    // -----------------------------------------------------------------------

    pub(super) fn on_group_record(&mut self, record: &Record) {
        let Some(update) = self
            .group
            .as_ref()
            .and_then(|state| state.channel.decode(record, &self.local))
        else {
            return;
        };
        match update {
            GroupUpdate::Snapshot(snapshot) => {
                debug!(tanks = snapshot.tanks.len(), "group key snapshot");
                let mut adopted = false;
                for (tank_id, info) in snapshot.tanks {
                    adopted |= self.adopt_tank(tank_id, &info);
                }
                if adopted {
                    self.publish_tanks();
                }
            }
            GroupUpdate::Signal { from, signal, .. } => match signal {
                GroupSignal::DeviceJoin { device_name } => {
                    let limit = self.config.max_group_devices;
                    let now = Self::now_rfc3339();
                    let Some(state) = self.group.as_mut() else {
                        return;
                    };
                    let known = state.group.has_device(&from);
                    let added = add_device(&mut state.group, &from, device_name, &now, limit);
                    if !known && !added {
                        warn!(peer = %from.short(), limit, "device group is full, ignoring join");
                        return;
                    }
                    info!(peer = %from.short(), "device joined group");
                    self.group_changed();
                    if added && !self.keys.is_empty() {
                        self.publish_group_snapshot();
                    }
                }
                GroupSignal::DeviceLeave {} => {
                    let removed = self
                        .group
                        .as_mut()
                        .map(|state| remove_device(&mut state.group, &from))
                        .unwrap_or(false);
                    if removed {
                        info!(peer = %from.short(), "device left group");
                        self.group_changed();
                    }
                }
                GroupSignal::TankAdd { tank_id, key } => {
                    if self.adopt_tank(tank_id, &key) {
                        self.publish_tanks();
                    }
                }
                GroupSignal::TankRemove { tank_id } => {
                    if !self.keys.contains_key(&tank_id) {
                        return;
                    }
                    info!(tank = %tank_id.short(), from = %from.short(), "tank removed on another device");
                    self.stop_sync(&tank_id, false);
                    self.tanks.retain(|t| t.id != tank_id);
                    if let Err(e) = self.db.delete_files_for_tank(&tank_id) {
                        warn!(tank = %tank_id.short(), error = %e, "failed to delete tank files");
                    }
                    self.publish_tanks();
                }
            },
        }
    }

    /// Start syncing a tank another group device holds. `false` if it was
    /// already synced here.
    fn adopt_tank(&mut self, tank_id: TankId, info: &KeyInfo) -> bool {
        if self.keys.contains_key(&tank_id) {
            return false;
        }
        if self.tank(&tank_id).is_none() {
            let tank = Tank {
                id: tank_id.clone(),
                owner_id: None,
                ..Tank::new(info.display_name(), &self.local)
            };
            self.tanks.push(tank);
        }
        match self.join_tank(&tank_id, info.sync_key(), None) {
            Ok(()) => {
                info!(tank = %tank_id.short(), "adopted tank from device group");
                true
            }
            Err(e) => {
                warn!(tank = %tank_id.short(), error = %e, "failed to adopt group tank");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Outgoing
    // -----------------------------------------------------------------------

    fn publish_group_snapshot(&mut self) {
        let relays = self.group_relays();
        let Some(state) = &self.group else {
            return;
        };
        let tanks: BTreeMap<TankId, KeyInfo> = self
            .keys
            .iter()
            .map(|(id, key)| {
                let name = self.tank(id).map(|t| t.name.as_str()).unwrap_or("");
                (id.clone(), KeyInfo::new(key, name))
            })
            .collect();
        let count = tanks.len();
        match state.channel.snapshot_record(&mut self.clock, &KeySnapshot { tanks }) {
            Ok(record) => {
                self.pool.publish(&record, &relays);
                debug!(tanks = count, "published group key snapshot");
            }
            Err(e) => warn!(error = %e, "failed to seal group snapshot"),
        }
    }

    fn publish_group_signal(&mut self, signal: GroupSignal) {
        let relays = self.group_relays();
        let Some(state) = &self.group else {
            return;
        };
        match state.channel.signal_record(&self.local, signal) {
            Ok(record) => {
                self.pool.publish(&record, &relays);
            }
            Err(e) => warn!(error = %e, "failed to seal group signal"),
        }
    }

    pub(super) fn announce_tank_added(&mut self, tank_id: &TankId) {
        if self.group.is_none() {
            return;
        }
        let Some(key) = self.keys.get(tank_id) else {
            return;
        };
        let name = self.tank(tank_id).map(|t| t.name.as_str()).unwrap_or("");
        let info = KeyInfo::new(key, name);
        self.publish_group_signal(GroupSignal::TankAdd {
            tank_id: tank_id.clone(),
            key: info,
        });
        self.publish_group_snapshot();
    }

    pub(super) fn announce_tank_removed(&mut self, tank_id: &TankId) {
        if self.group.is_none() {
            return;
        }
        self.publish_group_signal(GroupSignal::TankRemove {
            tank_id: tank_id.clone(),
        });
        self.publish_group_snapshot();
    }
}
