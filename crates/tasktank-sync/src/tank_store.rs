//! Tanks as replaceable relay records.
//!
//! Every tank maps onto a set of `d` tags under its sync id:
//! `{syncId}:m` for metadata, `{syncId}:f:{fishId}` for each fish and
//! `{syncId}:p:{deviceId}` for peer info. A deleted fish keeps its tag and
//! gets a `{"_del": true}` payload, so the relay's latest record for that
//! fish is the tombstone.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use tasktank_shared::constants::{KIND_REPLACEABLE, TOMBSTONE_FIELD};
use tasktank_shared::crypto::{open_json, seal_json};
use tasktank_shared::error::CryptoError;
use tasktank_shared::identity::AuthorIdentity;
use tasktank_shared::models::{Fish, PeerInfo, Tank, TankMeta};
use tasktank_shared::protocol::TankChange;
use tasktank_shared::record::{now_secs, Record, RecordFilter};
use tasktank_shared::types::{DeviceId, FishId, SyncKey, TankId};

/// Hands out `created_at` values that never repeat for the same `d` tag.
///
/// Relays keep the newer of two records per tag and break equal timestamps
/// by id, so two edits within one second could otherwise lose the later one.
#[derive(Debug, Default)]
pub struct RecordClock {
    last: HashMap<String, i64>,
}

impl RecordClock {
    pub fn stamp(&mut self, d_tag: &str, now: i64) -> i64 {
        let next = match self.last.get(d_tag) {
            Some(&last) if last >= now => last + 1,
            _ => now,
        };
        self.last.insert(d_tag.to_string(), next);
        next
    }
}

/// One synced tank: its key, derived author and record layout.
#[derive(Debug, Clone)]
pub struct TankChannel {
    tank_id: TankId,
    key: SyncKey,
    author: AuthorIdentity,
}

impl TankChannel {
    pub fn new(tank_id: TankId, key: SyncKey) -> Self {
        let author = AuthorIdentity::derive(&key.enc_key);
        Self {
            tank_id,
            key,
            author,
        }
    }

    pub fn tank_id(&self) -> &TankId {
        &self.tank_id
    }

    pub fn key(&self) -> &SyncKey {
        &self.key
    }

    pub fn sub_id(&self) -> String {
        format!("tank:{}", self.tank_id)
    }

    /// Every replaceable record authored under this tank's key. Records of
    /// other tanks sharing the key are told apart by `d` tag in
    /// [`TankChannel::decode`].
    pub fn filter(&self) -> RecordFilter {
        RecordFilter::author(self.author.pubkey()).kind(KIND_REPLACEABLE)
    }

    pub fn meta_tag(&self) -> String {
        format!("{}:m", self.key.sync_id)
    }

    pub fn fish_tag(&self, fish_id: &FishId) -> String {
        format!("{}:f:{}", self.key.sync_id, fish_id)
    }

    pub fn peer_tag(&self, device_id: &DeviceId) -> String {
        format!("{}:p:{}", self.key.sync_id, device_id)
    }

    fn seal<T: Serialize>(
        &self,
        clock: &mut RecordClock,
        d_tag: String,
        value: &T,
    ) -> Result<Record, CryptoError> {
        let content = seal_json(&self.key.enc_key, value)?;
        let created_at = clock.stamp(&d_tag, now_secs());
        Ok(Record::sign(
            &self.author,
            KIND_REPLACEABLE,
            vec![vec!["d".into(), d_tag]],
            content,
            created_at,
        ))
    }

    pub fn meta_record(&self, clock: &mut RecordClock, meta: &TankMeta) -> Result<Record, CryptoError> {
        self.seal(clock, self.meta_tag(), meta)
    }

    /// Device-local fields are stripped before sealing.
    pub fn fish_record(&self, clock: &mut RecordClock, fish: &Fish) -> Result<Record, CryptoError> {
        self.seal(clock, self.fish_tag(&fish.id), &fish.for_sync())
    }

    pub fn tombstone_record(&self, clock: &mut RecordClock, fish_id: &FishId) -> Result<Record, CryptoError> {
        let marker = serde_json::json!({ TOMBSTONE_FIELD: true });
        self.seal(clock, self.fish_tag(fish_id), &marker)
    }

    pub fn peer_record(
        &self,
        clock: &mut RecordClock,
        device_id: &DeviceId,
        info: &PeerInfo,
    ) -> Result<Record, CryptoError> {
        self.seal(clock, self.peer_tag(device_id), info)
    }

    pub fn change_record(&self, clock: &mut RecordClock, change: &TankChange) -> Result<Record, CryptoError> {
        match change {
            TankChange::Meta { data } => self.meta_record(clock, data),
            TankChange::FishUpsert { fish_id, data } => {
                let mut fish = data.clone();
                fish.id = fish_id.clone();
                self.fish_record(clock, &fish)
            }
            TankChange::FishDelete { fish_id } => self.tombstone_record(clock, fish_id),
            TankChange::Peer { peer_id, data } => self.peer_record(clock, peer_id, data),
        }
    }

    /// Metadata plus every fish, for first share and re-migration.
    pub fn full_tank_records(&self, clock: &mut RecordClock, tank: &Tank) -> Result<Vec<Record>, CryptoError> {
        let mut records = Vec::with_capacity(tank.fishes.len() + 1);
        records.push(self.meta_record(clock, &tank.meta())?);
        for fish in &tank.fishes {
            records.push(self.fish_record(clock, fish)?);
        }
        Ok(records)
    }

    /// Turn a relay record into a change for this tank. Anything that is
    /// not ours (foreign key, other sync id, garbage) is `None`.
    pub fn decode(&self, record: &Record) -> Option<TankChange> {
        if !record.is_replaceable() || record.pubkey != self.author.pubkey() {
            return None;
        }
        let d_tag = record.d_tag()?;
        let rest = d_tag
            .strip_prefix(self.key.sync_id.as_str())
            .and_then(|r| r.strip_prefix(':'))?;

        let value: Value = open_json(&self.key.enc_key, &record.content)?;
        if rest == "m" {
            let data: TankMeta = serde_json::from_value(value).ok()?;
            return Some(TankChange::Meta { data });
        }
        if let Some(fish_id) = rest.strip_prefix("f:").filter(|id| !id.is_empty()) {
            let fish_id = FishId::from(fish_id);
            if value.get(TOMBSTONE_FIELD).and_then(Value::as_bool) == Some(true) {
                return Some(TankChange::FishDelete { fish_id });
            }
            let data = fish_from_value(value, &fish_id)?;
            return Some(TankChange::FishUpsert { fish_id, data });
        }
        if let Some(peer_id) = rest.strip_prefix("p:").filter(|id| !id.is_empty()) {
            let data: PeerInfo = serde_json::from_value(value).ok()?;
            return Some(TankChange::Peer {
                peer_id: DeviceId::from(peer_id),
                data,
            });
        }
        trace!(tag = d_tag, "unknown tank record tag");
        None
    }
}

// The tag is authoritative for the id, whatever the payload says.
fn fish_from_value(mut value: Value, fish_id: &FishId) -> Option<Fish> {
    let object = value.as_object_mut()?;
    object.insert("id".into(), Value::String(fish_id.to_string()));
    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasktank_shared::crypto::EncKey;
    use tasktank_shared::models::Attachment;
    use tasktank_shared::types::{FileId, SyncId};

    fn channel(sync_id: &str, key_byte: u8) -> TankChannel {
        TankChannel::new(
            TankId::from("tank-1"),
            SyncKey {
                sync_id: SyncId::from(sync_id),
                enc_key: EncKey::from_bytes([key_byte; 32]),
                relays: vec![],
                relay_only: false,
            },
        )
    }

    #[test]
    fn clock_never_repeats_a_timestamp_per_tag() {
        let mut clock = RecordClock::default();
        assert_eq!(clock.stamp("a", 100), 100);
        assert_eq!(clock.stamp("a", 100), 101);
        assert_eq!(clock.stamp("a", 100), 102);
        assert_eq!(clock.stamp("b", 100), 100);
        assert_eq!(clock.stamp("a", 200), 200);
    }

    #[test]
    fn fish_round_trip() {
        let ch = channel("aaaa-bbbb-cccc", 1);
        let mut clock = RecordClock::default();
        let fish = Fish::new("buy milk");
        let record = ch.fish_record(&mut clock, &fish).unwrap();
        assert_eq!(record.d_tag(), Some(ch.fish_tag(&fish.id).as_str()));
        assert!(record.verify().is_ok());

        match ch.decode(&record) {
            Some(TankChange::FishUpsert { fish_id, data }) => {
                assert_eq!(fish_id, fish.id);
                assert_eq!(data, fish);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn tombstone_decodes_as_delete() {
        let ch = channel("aaaa-bbbb-cccc", 1);
        let mut clock = RecordClock::default();
        let id = FishId::from("f1");
        let record = ch.tombstone_record(&mut clock, &id).unwrap();
        assert_eq!(ch.decode(&record), Some(TankChange::FishDelete { fish_id: id }));
    }

    #[test]
    fn meta_and_peer_decode() {
        let ch = channel("aaaa-bbbb-cccc", 1);
        let mut clock = RecordClock::default();
        let meta = TankMeta {
            name: "Groceries".into(),
            speed_idx: Some(3),
            owner_id: Some(DeviceId::from("dev-a")),
        };
        let record = ch.meta_record(&mut clock, &meta).unwrap();
        assert_eq!(ch.decode(&record), Some(TankChange::Meta { data: meta }));

        let record = ch
            .peer_record(&mut clock, &DeviceId::from("dev-b"), &PeerInfo::left())
            .unwrap();
        match ch.decode(&record) {
            Some(TankChange::Peer { peer_id, data }) => {
                assert_eq!(peer_id, DeviceId::from("dev-b"));
                assert!(data.left);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn other_sync_id_under_same_key_is_ignored() {
        let mine = channel("aaaa-bbbb-cccc", 1);
        let other = channel("zzzz-yyyy-xxxx", 1);
        let mut clock = RecordClock::default();
        let record = other.fish_record(&mut clock, &Fish::new("not mine")).unwrap();
        assert_eq!(mine.decode(&record), None);
    }

    #[test]
    fn prefix_must_end_at_separator() {
        let mine = channel("aaaa", 1);
        let longer = channel("aaaa-bbbb", 1);
        let mut clock = RecordClock::default();
        let record = longer.meta_record(&mut clock, &TankMeta::default()).unwrap();
        assert_eq!(mine.decode(&record), None);
    }

    #[test]
    fn foreign_key_is_ignored() {
        let mine = channel("aaaa-bbbb-cccc", 1);
        let stranger = channel("aaaa-bbbb-cccc", 2);
        let mut clock = RecordClock::default();
        let record = stranger.meta_record(&mut clock, &TankMeta::default()).unwrap();
        assert_eq!(mine.decode(&record), None);
    }

    #[test]
    fn local_blob_flag_never_reaches_the_relay() {
        let ch = channel("aaaa-bbbb-cccc", 1);
        let mut clock = RecordClock::default();
        let mut fish = Fish::new("photo");
        fish.attachments.push(Attachment {
            id: "a1".into(),
            name: "cat.png".into(),
            url: None,
            file_id: Some(FileId::from("file-1")),
            mime_type: None,
            size: Some(3),
            checksum: None,
            has_local_blob: true,
        });
        let record = ch.fish_record(&mut clock, &fish).unwrap();
        let Some(TankChange::FishUpsert { data, .. }) = ch.decode(&record) else {
            panic!("expected upsert");
        };
        assert!(!data.attachments[0].has_local_blob);
    }

    #[test]
    fn full_tank_is_meta_plus_each_fish() {
        let ch = channel("aaaa-bbbb-cccc", 1);
        let mut clock = RecordClock::default();
        let mut tank = Tank::new("Home", &DeviceId::from("dev-a"));
        tank.fishes.push(Fish::new("one"));
        tank.fishes.push(Fish::new("two"));
        let records = ch.full_tank_records(&mut clock, &tank).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].d_tag(), Some("aaaa-bbbb-cccc:m"));
    }
}
