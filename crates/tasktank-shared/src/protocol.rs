use serde::{Deserialize, Serialize};

use crate::models::{Fish, PeerInfo, TankMeta};
use crate::types::{DeviceId, FileId, FishId, TankId};

// ---------------------------------------------------------------------------
// Tank changes
// ---------------------------------------------------------------------------

/// One replicated change to a tank, as emitted by the change detector and
/// as decoded from relay records or direct-link messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TankChange {
    #[serde(rename = "meta")]
    Meta { data: TankMeta },

    #[serde(rename = "fish.upsert")]
    FishUpsert {
        #[serde(rename = "fishId")]
        fish_id: FishId,
        data: Fish,
    },

    #[serde(rename = "fish.delete")]
    FishDelete {
        #[serde(rename = "fishId")]
        fish_id: FishId,
    },

    #[serde(rename = "peer")]
    Peer {
        #[serde(rename = "peerId")]
        peer_id: DeviceId,
        data: PeerInfo,
    },
}

impl TankChange {
    pub fn kind(&self) -> &'static str {
        match self {
            TankChange::Meta { .. } => "meta",
            TankChange::FishUpsert { .. } => "fish.upsert",
            TankChange::FishDelete { .. } => "fish.delete",
            TankChange::Peer { .. } => "peer",
        }
    }

    pub fn fish_id(&self) -> Option<&FishId> {
        match self {
            TankChange::FishUpsert { fish_id, .. } | TankChange::FishDelete { fish_id } => {
                Some(fish_id)
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Direct link messages
// ---------------------------------------------------------------------------

/// A tank change sent over a direct link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub tank_id: TankId,
    pub change: TankChange,
    pub ts: i64,
    pub device_id: DeviceId,
}

/// Chunked file transfer messages, each tied to a transfer id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FileMessage {
    #[serde(rename = "file.offer", rename_all = "camelCase")]
    Offer {
        file_id: FileId,
        name: String,
        size: u64,
        mime_type: Option<String>,
        checksum: Option<String>,
        fish_id: FishId,
        tank_id: TankId,
    },

    #[serde(rename = "file.request", rename_all = "camelCase")]
    Request { file_id: FileId, transfer_id: String },

    #[serde(rename = "file.chunk", rename_all = "camelCase")]
    Chunk {
        transfer_id: String,
        index: u32,
        total: u32,
        data: String,
    },

    #[serde(rename = "file.complete", rename_all = "camelCase")]
    Complete { transfer_id: String, file_id: FileId },

    #[serde(rename = "file.ack", rename_all = "camelCase")]
    Ack {
        transfer_id: String,
        file_id: FileId,
        success: bool,
    },

    #[serde(rename = "file.error", rename_all = "camelCase")]
    Error { transfer_id: String, error: String },
}

impl FileMessage {
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            FileMessage::Offer { .. } => None,
            FileMessage::Request { transfer_id, .. }
            | FileMessage::Chunk { transfer_id, .. }
            | FileMessage::Complete { transfer_id, .. }
            | FileMessage::Ack { transfer_id, .. }
            | FileMessage::Error { transfer_id, .. } => Some(transfer_id),
        }
    }
}

/// Anything carried on a direct link's data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkFrame {
    Sync(SyncMessage),
    File(FileMessage),
}

impl LinkFrame {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// `None` for anything that is not a frame we understand.
    pub fn from_text(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}
