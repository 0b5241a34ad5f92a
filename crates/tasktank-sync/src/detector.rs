//! Turning a new tank snapshot into wire changes.
//!
//! The diff runs against the engine's current state, never against what
//! was last pushed. Items a remote change touched a moment ago are pinned
//! to their merged value first so a snapshot that was already in flight
//! cannot bounce them back out.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use tasktank_shared::models::{Fish, Tank};
use tasktank_shared::protocol::TankChange;
use tasktank_shared::types::{DeviceId, FishId, TankId};

/// Something a remote change wrote.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Touched {
    Meta(TankId),
    Fish(TankId, FishId),
}

/// Remote-sourced items, remembered for a short window.
#[derive(Debug)]
pub struct RemoteWindow {
    window: Duration,
    touched: HashMap<Touched, Instant>,
}

impl RemoteWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            touched: HashMap::new(),
        }
    }

    pub fn mark(&mut self, item: Touched, now: Instant) {
        self.touched.insert(item, now);
    }

    pub fn is_recent(&self, item: &Touched, now: Instant) -> bool {
        self.touched
            .get(item)
            .map(|at| now.saturating_duration_since(*at) <= self.window)
            .unwrap_or(false)
    }

    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.touched
            .retain(|_, at| now.saturating_duration_since(*at) <= window);
    }

    /// Put back the engine's version of every recently touched item into
    /// `next`. Peers and our own permission always come from `current`;
    /// they are written by the sync layer only.
    pub fn pin(&self, current: &[Tank], next: &mut [Tank], now: Instant) {
        for tank in next.iter_mut() {
            let Some(cur) = current.iter().find(|t| t.id == tank.id) else {
                continue;
            };
            tank.peers = cur.peers.clone();
            tank.my_permission = cur.my_permission;

            if self.is_recent(&Touched::Meta(tank.id.clone()), now) {
                tank.name = cur.name.clone();
                tank.speed_idx = cur.speed_idx;
                tank.owner_id = cur.owner_id.clone();
            }

            for (item, _) in self.touched.iter().filter(|(_, at)| {
                now.saturating_duration_since(**at) <= self.window
            }) {
                let Touched::Fish(tank_id, fish_id) = item else {
                    continue;
                };
                if tank_id != &tank.id {
                    continue;
                }
                pin_fish(cur, tank, fish_id);
            }
        }
    }
}

fn pin_fish(current: &Tank, next: &mut Tank, fish_id: &FishId) {
    match current.fish(fish_id) {
        Some(merged) => match next.fish_mut(fish_id) {
            Some(slot) => *slot = merged.clone(),
            None => next.fishes.push(merged.clone()),
        },
        None => next.fishes.retain(|f| &f.id != fish_id),
    }
}

/// Keep this device's "bytes held locally" flags when a snapshot from the
/// UI predates a finished download.
pub fn carry_blob_flags(current: &[Tank], next: &mut [Tank]) {
    for tank in next.iter_mut() {
        let Some(cur) = current.iter().find(|t| t.id == tank.id) else {
            continue;
        };
        for fish in tank.fishes.iter_mut() {
            let Some(cur_fish) = cur.fish(&fish.id) else {
                continue;
            };
            for attachment in fish.attachments.iter_mut().filter(|a| !a.has_local_blob) {
                attachment.has_local_blob = attachment
                    .file_id
                    .as_ref()
                    .and_then(|file| cur_fish.attachment_by_file(file))
                    .map(|a| a.has_local_blob)
                    .unwrap_or(false);
            }
        }
    }
}

/// Changes between two snapshots of the synced tanks that exist in both.
/// Readonly tanks produce nothing.
pub fn diff_tanks(
    prev: &[Tank],
    next: &[Tank],
    is_synced: impl Fn(&TankId) -> bool,
    local: &DeviceId,
) -> Vec<(TankId, Vec<TankChange>)> {
    let mut out = Vec::new();
    for tank in next {
        if !is_synced(&tank.id) || tank.is_readonly_for(local) {
            continue;
        }
        let Some(old) = prev.iter().find(|t| t.id == tank.id) else {
            continue;
        };
        let changes = diff_tank(old, tank);
        if !changes.is_empty() {
            out.push((tank.id.clone(), changes));
        }
    }
    out
}

pub fn diff_tank(old: &Tank, new: &Tank) -> Vec<TankChange> {
    let mut changes = Vec::new();
    if old.name != new.name || old.speed_idx != new.speed_idx {
        changes.push(TankChange::Meta { data: new.meta() });
    }

    let before: HashMap<&FishId, &Fish> = old.fishes.iter().map(|f| (&f.id, f)).collect();
    for fish in &new.fishes {
        let outgoing = fish.for_sync();
        let differs = before
            .get(&fish.id)
            .map(|prev| prev.for_sync() != outgoing)
            .unwrap_or(true);
        if differs {
            changes.push(TankChange::FishUpsert {
                fish_id: fish.id.clone(),
                data: outgoing,
            });
        }
    }

    for fish in &old.fishes {
        if new.fish(&fish.id).is_none() {
            changes.push(TankChange::FishDelete {
                fish_id: fish.id.clone(),
            });
        }
    }
    changes
}
