use serde::{Deserialize, Serialize};

use crate::constants::DEVICE_NAME_FALLBACK_LEN;
use crate::crypto::EncKey;
use crate::types::{DeviceId, FileId, FishId, Permission, SyncId, TankId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    #[default]
    Normal,
    Important,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Device-local: whether this device holds the bytes. Never synced.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub has_local_blob: bool,
}

/// A task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fish {
    pub id: FishId,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub checklist: Vec<ChecklistItem>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Fish {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            id: FishId::generate(),
            task: task.into(),
            color: String::new(),
            importance: Importance::Normal,
            due_date: None,
            duration: None,
            completed: false,
            completed_at: None,
            checklist: Vec::new(),
            links: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn with_importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    pub fn set_completed(&mut self, completed: bool) {
        self.completed = completed;
        self.completed_at = completed.then(|| chrono::Utc::now().to_rfc3339());
    }

    /// Copy with device-local fields stripped, as it goes on the wire.
    pub fn for_sync(&self) -> Fish {
        let mut fish = self.clone();
        for attachment in &mut fish.attachments {
            attachment.has_local_blob = false;
        }
        fish
    }

    pub fn attachment_by_file(&self, file_id: &FileId) -> Option<&Attachment> {
        self.attachments
            .iter()
            .find(|a| a.file_id.as_ref() == Some(file_id))
    }
}

/// A remote device's membership in a tank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub device_id: DeviceId,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub permission: Permission,
    #[serde(default)]
    pub paired_at: Option<String>,
    #[serde(default)]
    pub last_sync_at: Option<String>,
}

impl Peer {
    pub fn fallback_name(device_id: &DeviceId) -> String {
        device_id
            .as_str()
            .chars()
            .take(DEVICE_NAME_FALLBACK_LEN)
            .collect()
    }
}

/// A task list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tank {
    pub id: TankId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_speed_idx")]
    pub speed_idx: u8,
    #[serde(default)]
    pub owner_id: Option<DeviceId>,
    #[serde(default)]
    pub peers: Vec<Peer>,
    #[serde(default)]
    pub my_permission: Option<Permission>,
    #[serde(default)]
    pub fishes: Vec<Fish>,
}

fn default_speed_idx() -> u8 {
    2
}

impl Tank {
    pub fn new(name: impl Into<String>, owner: &DeviceId) -> Self {
        Self {
            id: TankId::generate(),
            name: name.into(),
            speed_idx: default_speed_idx(),
            owner_id: Some(owner.clone()),
            peers: Vec::new(),
            my_permission: None,
            fishes: Vec::new(),
        }
    }

    pub fn meta(&self) -> TankMeta {
        TankMeta {
            name: self.name.clone(),
            speed_idx: Some(self.speed_idx),
            owner_id: self.owner_id.clone(),
        }
    }

    pub fn is_owned_by(&self, device: &DeviceId) -> bool {
        match &self.owner_id {
            Some(owner) => owner == device,
            None => true,
        }
    }

    /// A tank owned elsewhere where this device only has readonly access.
    pub fn is_readonly_for(&self, device: &DeviceId) -> bool {
        !self.is_owned_by(device) && self.my_permission == Some(Permission::Readonly)
    }

    pub fn fish(&self, id: &FishId) -> Option<&Fish> {
        self.fishes.iter().find(|f| &f.id == id)
    }

    pub fn fish_mut(&mut self, id: &FishId) -> Option<&mut Fish> {
        self.fishes.iter_mut().find(|f| &f.id == id)
    }

    pub fn peer(&self, id: &DeviceId) -> Option<&Peer> {
        self.peers.iter().find(|p| &p.device_id == id)
    }
}

/// Replicated tank metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TankMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub speed_idx: Option<u8>,
    #[serde(default)]
    pub owner_id: Option<DeviceId>,
}

/// Replicated peer-info record payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<String>,
    #[serde(rename = "_left", default, skip_serializing_if = "std::ops::Not::not")]
    pub left: bool,
}

impl PeerInfo {
    pub fn left() -> Self {
        Self {
            left: true,
            ..Self::default()
        }
    }
}

/// This device's membership in a group of the user's own devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceGroup {
    pub group_id: SyncId,
    pub group_key: EncKey,
    pub device_name: String,
    pub created_at: String,
    #[serde(default)]
    pub devices: Vec<GroupDevice>,
    #[serde(default)]
    pub relays: Vec<String>,
}

impl DeviceGroup {
    pub fn has_device(&self, id: &DeviceId) -> bool {
        self.devices.iter().any(|d| &d.device_id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDevice {
    pub device_id: DeviceId,
    pub device_name: String,
    pub paired_at: String,
    pub last_seen_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_sync_strips_local_blob_flag() {
        let mut fish = Fish::new("photo");
        fish.attachments.push(Attachment {
            id: "a1".into(),
            name: "cat.png".into(),
            url: None,
            file_id: Some(FileId::from("f1")),
            mime_type: Some("image/png".into()),
            size: Some(10),
            checksum: Some("00".into()),
            has_local_blob: true,
        });

        let synced = fish.for_sync();
        assert!(!synced.attachments[0].has_local_blob);
        assert!(fish.attachments[0].has_local_blob);

        let json = serde_json::to_value(&synced).unwrap();
        assert!(json["attachments"][0].get("hasLocalBlob").is_none());
    }

    #[test]
    fn test_readonly_rules() {
        let me = DeviceId::from("me");
        let other = DeviceId::from("other");

        let mut tank = Tank::new("Work", &other);
        assert!(!tank.is_readonly_for(&me));

        tank.my_permission = Some(Permission::Readonly);
        assert!(tank.is_readonly_for(&me));
        assert!(!tank.is_readonly_for(&other));

        let mine = Tank::new("Home", &me);
        assert!(!mine.is_readonly_for(&me));
    }

    #[test]
    fn test_fish_parses_sparse_json() {
        let fish: Fish = serde_json::from_str(r#"{"id":"x1","task":"water plants"}"#).unwrap();
        assert_eq!(fish.importance, Importance::Normal);
        assert!(fish.checklist.is_empty());
        assert!(!fish.completed);
    }

    #[test]
    fn test_peer_info_left_marker() {
        let json = serde_json::to_string(&PeerInfo::left()).unwrap();
        assert_eq!(json, r#"{"_left":true}"#);
        let back: PeerInfo = serde_json::from_str(&json).unwrap();
        assert!(back.left);
    }

    #[test]
    fn test_fallback_name_truncates() {
        let id = DeviceId::from("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(Peer::fallback_name(&id), "abcdefghijkl");
    }
}
