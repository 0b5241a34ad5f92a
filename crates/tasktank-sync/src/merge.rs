//! Applying remote changes to local tank state.
//!
//! Last write wins by arrival: whatever comes in overwrites what is there,
//! with two exceptions. A fish id that has been deleted stays deleted, and
//! device-local attachment flags survive an upsert of the same file.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use tasktank_shared::models::{Fish, Peer, PeerInfo, Tank, TankMeta};
use tasktank_shared::protocol::TankChange;
use tasktank_shared::types::{DeviceId, FileId, FishId, TankId};

/// What a change did to the tank it was applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Unchanged,
    MetaChanged,
    FishChanged(FishId),
    FishRemoved(FishId),
    PeersChanged,
}

impl Applied {
    pub fn changed(&self) -> bool {
        !matches!(self, Applied::Unchanged)
    }
}

/// Fish ids known to be deleted, per tank. Deletion is terminal: later
/// upserts for these ids are ignored.
#[derive(Debug, Default)]
pub struct Tombstones {
    by_tank: HashMap<TankId, HashSet<FishId>>,
}

impl Tombstones {
    pub fn insert(&mut self, tank_id: &TankId, fish_id: FishId) {
        self.by_tank.entry(tank_id.clone()).or_default().insert(fish_id);
    }

    pub fn contains(&self, tank_id: &TankId, fish_id: &FishId) -> bool {
        self.by_tank
            .get(tank_id)
            .map(|ids| ids.contains(fish_id))
            .unwrap_or(false)
    }

    pub fn forget_tank(&mut self, tank_id: &TankId) {
        self.by_tank.remove(tank_id);
    }
}

/// Apply one remote change to `tank`. `now` is the RFC 3339 time used for
/// peer bookkeeping.
pub fn apply_change(
    tank: &mut Tank,
    change: &TankChange,
    local: &DeviceId,
    tombstones: &mut Tombstones,
    now: &str,
) -> Applied {
    match change {
        TankChange::Meta { data } => apply_meta(tank, data),
        TankChange::FishUpsert { fish_id, data } => {
            if tombstones.contains(&tank.id, fish_id) {
                debug!(tank = %tank.id.short(), fish = %fish_id.short(), "ignoring upsert of deleted fish");
                return Applied::Unchanged;
            }
            upsert_fish(tank, fish_id, data)
        }
        TankChange::FishDelete { fish_id } => {
            tombstones.insert(&tank.id, fish_id.clone());
            let before = tank.fishes.len();
            tank.fishes.retain(|f| &f.id != fish_id);
            if tank.fishes.len() == before {
                Applied::Unchanged
            } else {
                Applied::FishRemoved(fish_id.clone())
            }
        }
        TankChange::Peer { peer_id, data } => apply_peer(tank, peer_id, data, local, now),
    }
}

fn apply_meta(tank: &mut Tank, meta: &TankMeta) -> Applied {
    let before = tank.meta();
    if !meta.name.is_empty() {
        tank.name = meta.name.clone();
    }
    if let Some(speed) = meta.speed_idx {
        tank.speed_idx = speed;
    }
    if meta.owner_id.is_some() {
        tank.owner_id = meta.owner_id.clone();
    }
    if tank.meta() == before {
        Applied::Unchanged
    } else {
        Applied::MetaChanged
    }
}

fn upsert_fish(tank: &mut Tank, fish_id: &FishId, data: &Fish) -> Applied {
    let mut incoming = data.clone();
    incoming.id = fish_id.clone();

    match tank.fish_mut(fish_id) {
        Some(existing) => {
            for attachment in &mut incoming.attachments {
                let held = attachment
                    .file_id
                    .as_ref()
                    .and_then(|file| existing.attachment_by_file(file))
                    .map(|a| a.has_local_blob)
                    .unwrap_or(false);
                attachment.has_local_blob = held;
            }
            if *existing == incoming {
                return Applied::Unchanged;
            }
            *existing = incoming;
        }
        None => tank.fishes.push(incoming),
    }
    Applied::FishChanged(fish_id.clone())
}

fn apply_peer(tank: &mut Tank, peer_id: &DeviceId, info: &PeerInfo, local: &DeviceId, now: &str) -> Applied {
    if peer_id == local {
        // Someone edited our own membership, which only carries permission.
        if info.left || info.permission.is_none() || tank.my_permission == info.permission {
            return Applied::Unchanged;
        }
        tank.my_permission = info.permission;
        return Applied::PeersChanged;
    }

    if info.left {
        let before = tank.peers.len();
        tank.peers.retain(|p| &p.device_id != peer_id);
        return if tank.peers.len() == before {
            Applied::Unchanged
        } else {
            Applied::PeersChanged
        };
    }

    let existing = tank.peer(peer_id).cloned();
    let peer = Peer {
        device_id: peer_id.clone(),
        device_name: info
            .device_name
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| existing.as_ref().map(|p| p.device_name.clone()))
            .unwrap_or_else(|| Peer::fallback_name(peer_id)),
        permission: info
            .permission
            .or_else(|| existing.as_ref().map(|p| p.permission))
            .unwrap_or_default(),
        paired_at: info
            .joined_at
            .clone()
            .or_else(|| existing.as_ref().and_then(|p| p.paired_at.clone()))
            .or_else(|| Some(now.to_string())),
        last_sync_at: Some(now.to_string()),
    };
    match tank.peers.iter_mut().find(|p| &p.device_id == peer_id) {
        Some(slot) => *slot = peer,
        None => tank.peers.push(peer),
    }
    Applied::PeersChanged
}

/// Mark an attachment's bytes as held locally. Returns `true` if a flag
/// flipped.
pub fn mark_file_present(tank: &mut Tank, fish_id: &FishId, file_id: &FileId) -> bool {
    let Some(fish) = tank.fish_mut(fish_id) else {
        return false;
    };
    let mut flipped = false;
    for attachment in &mut fish.attachments {
        if attachment.file_id.as_ref() == Some(file_id) && !attachment.has_local_blob {
            attachment.has_local_blob = true;
            flipped = true;
        }
    }
    flipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasktank_shared::models::Attachment;
    use tasktank_shared::types::Permission;

    const NOW: &str = "2024-05-01T10:00:00+00:00";

    fn me() -> DeviceId {
        DeviceId::from("dev-me")
    }

    fn tank() -> Tank {
        Tank::new("Home", &DeviceId::from("dev-owner"))
    }

    fn upsert(fish: &Fish) -> TankChange {
        TankChange::FishUpsert {
            fish_id: fish.id.clone(),
            data: fish.clone(),
        }
    }

    #[test]
    fn unknown_fish_is_appended_then_overwritten() {
        let mut t = tank();
        let mut stones = Tombstones::default();
        let mut fish = Fish::new("water plants");

        let applied = apply_change(&mut t, &upsert(&fish), &me(), &mut stones, NOW);
        assert_eq!(applied, Applied::FishChanged(fish.id.clone()));
        assert_eq!(t.fishes.len(), 1);

        fish.set_completed(true);
        apply_change(&mut t, &upsert(&fish), &me(), &mut stones, NOW);
        assert_eq!(t.fishes.len(), 1);
        assert!(t.fishes[0].completed);
    }

    #[test]
    fn same_upsert_twice_is_idempotent() {
        let mut t = tank();
        let mut stones = Tombstones::default();
        let fish = Fish::new("once");
        apply_change(&mut t, &upsert(&fish), &me(), &mut stones, NOW);
        let snapshot = t.clone();

        let again = apply_change(&mut t, &upsert(&fish), &me(), &mut stones, NOW);
        assert_eq!(again, Applied::Unchanged);
        assert_eq!(t, snapshot);
    }

    #[test]
    fn deleted_fish_stays_deleted() {
        let mut t = tank();
        let mut stones = Tombstones::default();
        let fish = Fish::new("gone");
        apply_change(&mut t, &upsert(&fish), &me(), &mut stones, NOW);

        let delete = TankChange::FishDelete {
            fish_id: fish.id.clone(),
        };
        assert_eq!(
            apply_change(&mut t, &delete, &me(), &mut stones, NOW),
            Applied::FishRemoved(fish.id.clone())
        );
        assert_eq!(
            apply_change(&mut t, &upsert(&fish), &me(), &mut stones, NOW),
            Applied::Unchanged
        );
        assert!(t.fishes.is_empty());
    }

    #[test]
    fn delete_before_any_upsert_still_blocks_it() {
        let mut t = tank();
        let mut stones = Tombstones::default();
        let fish = Fish::new("never seen");
        let delete = TankChange::FishDelete {
            fish_id: fish.id.clone(),
        };
        assert_eq!(apply_change(&mut t, &delete, &me(), &mut stones, NOW), Applied::Unchanged);
        apply_change(&mut t, &upsert(&fish), &me(), &mut stones, NOW);
        assert!(t.fishes.is_empty());
    }

    #[test]
    fn local_blob_flag_survives_upsert() {
        let mut t = tank();
        let mut stones = Tombstones::default();
        let mut fish = Fish::new("photo");
        fish.attachments.push(Attachment {
            id: "a1".into(),
            name: "cat.png".into(),
            url: None,
            file_id: Some(FileId::from("file-1")),
            mime_type: Some("image/png".into()),
            size: Some(10),
            checksum: None,
            has_local_blob: true,
        });
        t.fishes.push(fish.clone());

        let mut remote = fish.for_sync();
        remote.task = "photo of the cat".into();
        apply_change(&mut t, &upsert(&remote), &me(), &mut stones, NOW);
        assert_eq!(t.fishes[0].task, "photo of the cat");
        assert!(t.fishes[0].attachments[0].has_local_blob);
    }

    #[test]
    fn meta_keeps_local_name_when_remote_is_blank() {
        let mut t = tank();
        let mut stones = Tombstones::default();
        let change = TankChange::Meta {
            data: TankMeta {
                name: String::new(),
                speed_idx: Some(4),
                owner_id: None,
            },
        };
        assert_eq!(apply_change(&mut t, &change, &me(), &mut stones, NOW), Applied::MetaChanged);
        assert_eq!(t.name, "Home");
        assert_eq!(t.speed_idx, 4);
        assert_eq!(t.owner_id, Some(DeviceId::from("dev-owner")));
    }

    #[test]
    fn peer_upsert_fills_defaults_and_left_removes() {
        let mut t = tank();
        let mut stones = Tombstones::default();
        let peer_id = DeviceId::from("dev-abcdefghijklmnop");
        let change = TankChange::Peer {
            peer_id: peer_id.clone(),
            data: PeerInfo::default(),
        };
        apply_change(&mut t, &change, &me(), &mut stones, NOW);
        let peer = t.peer(&peer_id).unwrap();
        assert_eq!(peer.device_name, "dev-abcdefgh");
        assert_eq!(peer.permission, Permission::Shared);
        assert_eq!(peer.paired_at.as_deref(), Some(NOW));

        let left = TankChange::Peer {
            peer_id: peer_id.clone(),
            data: PeerInfo::left(),
        };
        assert_eq!(apply_change(&mut t, &left, &me(), &mut stones, NOW), Applied::PeersChanged);
        assert!(t.peer(&peer_id).is_none());
    }

    #[test]
    fn peer_record_about_us_sets_permission() {
        let mut t = tank();
        let mut stones = Tombstones::default();
        let change = TankChange::Peer {
            peer_id: me(),
            data: PeerInfo {
                permission: Some(Permission::Readonly),
                ..PeerInfo::default()
            },
        };
        apply_change(&mut t, &change, &me(), &mut stones, NOW);
        assert_eq!(t.my_permission, Some(Permission::Readonly));
        assert!(t.peers.is_empty());
        assert!(t.is_readonly_for(&me()));
    }

    #[test]
    fn mark_file_present_flips_once() {
        let mut t = tank();
        let mut fish = Fish::new("doc");
        fish.attachments.push(Attachment {
            id: "a1".into(),
            name: "doc.pdf".into(),
            url: None,
            file_id: Some(FileId::from("file-9")),
            mime_type: None,
            size: None,
            checksum: None,
            has_local_blob: false,
        });
        let fish_id = fish.id.clone();
        t.fishes.push(fish);

        assert!(mark_file_present(&mut t, &fish_id, &FileId::from("file-9")));
        assert!(!mark_file_present(&mut t, &fish_id, &FileId::from("file-9")));
        assert!(!mark_file_present(&mut t, &FishId::from("nope"), &FileId::from("file-9")));
    }
}
