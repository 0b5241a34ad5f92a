//! Device-group replication: one shared key for all of a user's devices.
//!
//! The group publishes a single replaceable record, `{groupId}:keys`,
//! holding every synced tank's key, plus ephemeral signals for joins,
//! leaves and tank additions or removals.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use tasktank_shared::constants::KIND_REPLACEABLE;
use tasktank_shared::crypto::{open_json, seal_json, EncKey};
use tasktank_shared::error::CryptoError;
use tasktank_shared::identity::AuthorIdentity;
use tasktank_shared::models::{DeviceGroup, GroupDevice, Peer};
use tasktank_shared::record::{now_secs, Record, RecordFilter};
use tasktank_shared::types::{DeviceId, SyncId, SyncKey, TankId};

use crate::tank_store::RecordClock;

pub const KEYS_SUB_ID: &str = "group:keys";
pub const SIGNALS_SUB_ID: &str = "group:signals";
pub const DEFAULT_TANK_NAME: &str = "Tank";

/// One tank's credentials inside the key snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    pub sync_id: SyncId,
    pub enc_key: EncKey,
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl KeyInfo {
    pub fn new(key: &SyncKey, name: &str) -> Self {
        Self {
            sync_id: key.sync_id.clone(),
            enc_key: key.enc_key.clone(),
            relays: key.relays.clone(),
            name: Some(name.to_string()).filter(|n| !n.is_empty()),
        }
    }

    pub fn sync_key(&self) -> SyncKey {
        SyncKey {
            sync_id: self.sync_id.clone(),
            enc_key: self.enc_key.clone(),
            relays: self.relays.clone(),
            relay_only: false,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_TANK_NAME)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeySnapshot {
    #[serde(default)]
    pub tanks: BTreeMap<TankId, KeyInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GroupSignal {
    #[serde(rename = "device.join", rename_all = "camelCase")]
    DeviceJoin {
        device_name: Option<String>,
    },

    #[serde(rename = "device.leave")]
    DeviceLeave {},

    #[serde(rename = "tank.add", rename_all = "camelCase")]
    TankAdd { tank_id: TankId, key: KeyInfo },

    #[serde(rename = "tank.remove", rename_all = "camelCase")]
    TankRemove { tank_id: TankId },
}

/// A group signal with its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupEnvelope {
    pub device_id: DeviceId,
    pub ts: i64,
    #[serde(flatten)]
    pub signal: GroupSignal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupUpdate {
    Snapshot(KeySnapshot),
    Signal {
        from: DeviceId,
        ts: i64,
        signal: GroupSignal,
    },
}

/// Record layout for one device group.
#[derive(Debug, Clone)]
pub struct GroupChannel {
    group_id: SyncId,
    key: EncKey,
    author: AuthorIdentity,
}

impl GroupChannel {
    pub fn new(group: &DeviceGroup) -> Self {
        Self {
            group_id: group.group_id.clone(),
            key: group.group_key.clone(),
            author: AuthorIdentity::derive(&group.group_key),
        }
    }

    pub fn keys_tag(&self) -> String {
        format!("{}:keys", self.group_id)
    }

    pub fn snapshot_filter(&self) -> RecordFilter {
        RecordFilter::author(self.author.pubkey())
            .kind(KIND_REPLACEABLE)
            .d_tag(self.keys_tag())
    }

    pub fn signal_filter(&self, since: i64) -> RecordFilter {
        tasktank_link::signaling_filter(self.author.pubkey(), since)
    }

    pub fn snapshot_record(&self, clock: &mut RecordClock, snapshot: &KeySnapshot) -> Result<Record, CryptoError> {
        let tag = self.keys_tag();
        let created_at = clock.stamp(&tag, now_secs());
        Ok(Record::sign(
            &self.author,
            KIND_REPLACEABLE,
            vec![vec!["d".into(), tag]],
            seal_json(&self.key, snapshot)?,
            created_at,
        ))
    }

    pub fn signal_record(&self, from: &DeviceId, signal: GroupSignal) -> Result<Record, CryptoError> {
        let envelope = GroupEnvelope {
            device_id: from.clone(),
            ts: now_secs(),
            signal,
        };
        Ok(Record::ephemeral(&self.author, seal_json(&self.key, &envelope)?))
    }

    /// Decode a group record. Our own signals come back as `None`.
    pub fn decode(&self, record: &Record, local: &DeviceId) -> Option<GroupUpdate> {
        if record.pubkey != self.author.pubkey() {
            return None;
        }
        if record.is_replaceable() {
            if record.d_tag() != Some(self.keys_tag().as_str()) {
                return None;
            }
            return open_json(&self.key, &record.content).map(GroupUpdate::Snapshot);
        }
        if record.is_ephemeral() {
            let envelope: GroupEnvelope = open_json(&self.key, &record.content)?;
            if &envelope.device_id == local {
                trace!("own group signal");
                return None;
            }
            return Some(GroupUpdate::Signal {
                from: envelope.device_id,
                ts: envelope.ts,
                signal: envelope.signal,
            });
        }
        None
    }
}

/// Add a device to the group. `false` if it was already there or the
/// group is at `limit`.
pub fn add_device(
    group: &mut DeviceGroup,
    device_id: &DeviceId,
    device_name: Option<String>,
    at: &str,
    limit: usize,
) -> bool {
    if let Some(existing) = group.devices.iter_mut().find(|d| &d.device_id == device_id) {
        existing.last_seen_at = at.to_string();
        if let Some(name) = device_name.filter(|n| !n.is_empty()) {
            existing.device_name = name;
        }
        return false;
    }
    if group.devices.len() >= limit {
        return false;
    }
    group.devices.push(GroupDevice {
        device_id: device_id.clone(),
        device_name: device_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| Peer::fallback_name(device_id)),
        paired_at: at.to_string(),
        last_seen_at: at.to_string(),
    });
    true
}

pub fn remove_device(group: &mut DeviceGroup, device_id: &DeviceId) -> bool {
    let before = group.devices.len();
    group.devices.retain(|d| &d.device_id != device_id);
    group.devices.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> DeviceGroup {
        DeviceGroup {
            group_id: SyncId::from("gggg-hhhh-iiii"),
            group_key: EncKey::from_bytes([4u8; 32]),
            device_name: "Laptop".into(),
            created_at: "2024-05-01T10:00:00+00:00".into(),
            devices: vec![],
            relays: vec!["mem://r".into()],
        }
    }

    fn key_info() -> KeyInfo {
        KeyInfo {
            sync_id: SyncId::from("aaaa-bbbb-cccc"),
            enc_key: EncKey::from_bytes([1u8; 32]),
            relays: vec!["mem://r".into()],
            name: Some("Groceries".into()),
        }
    }

    #[test]
    fn snapshot_round_trip() {
        let ch = GroupChannel::new(&group());
        let mut snapshot = KeySnapshot::default();
        snapshot.tanks.insert(TankId::from("t1"), key_info());

        let record = ch.snapshot_record(&mut RecordClock::default(), &snapshot).unwrap();
        assert!(ch.snapshot_filter().matches(&record));
        assert_eq!(
            ch.decode(&record, &DeviceId::from("dev-a")),
            Some(GroupUpdate::Snapshot(snapshot))
        );
    }

    #[test]
    fn signals_skip_their_sender() {
        let ch = GroupChannel::new(&group());
        let from = DeviceId::from("dev-a");
        let record = ch
            .signal_record(&from, GroupSignal::TankAdd {
                tank_id: TankId::from("t1"),
                key: key_info(),
            })
            .unwrap();

        assert_eq!(ch.decode(&record, &from), None);
        match ch.decode(&record, &DeviceId::from("dev-b")) {
            Some(GroupUpdate::Signal { from: f, signal, .. }) => {
                assert_eq!(f, from);
                assert!(matches!(signal, GroupSignal::TankAdd { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn signal_wire_shape() {
        let envelope = GroupEnvelope {
            device_id: DeviceId::from("dev-a"),
            ts: 5,
            signal: GroupSignal::DeviceJoin {
                device_name: Some("Phone".into()),
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "device.join");
        assert_eq!(json["deviceId"], "dev-a");
        assert_eq!(json["deviceName"], "Phone");
    }

    #[test]
    fn other_group_is_ignored() {
        let mine = GroupChannel::new(&group());
        let mut theirs = group();
        theirs.group_key = EncKey::from_bytes([5u8; 32]);
        let record = GroupChannel::new(&theirs)
            .signal_record(&DeviceId::from("dev-x"), GroupSignal::DeviceLeave {})
            .unwrap();
        assert_eq!(mine.decode(&record, &DeviceId::from("dev-a")), None);
    }

    #[test]
    fn device_limit_is_enforced() {
        let mut g = group();
        let at = "2024-05-01T10:00:00+00:00";
        assert!(add_device(&mut g, &DeviceId::from("dev-1"), None, at, 2));
        assert!(add_device(&mut g, &DeviceId::from("dev-2"), Some("Phone".into()), at, 2));
        assert!(!add_device(&mut g, &DeviceId::from("dev-3"), None, at, 2));
        assert!(!add_device(&mut g, &DeviceId::from("dev-1"), None, at, 2));
        assert_eq!(g.devices.len(), 2);
        assert_eq!(g.devices[0].device_name, "dev-1");

        assert!(remove_device(&mut g, &DeviceId::from("dev-1")));
        assert!(!remove_device(&mut g, &DeviceId::from("dev-1")));
    }
}
