//! State the engine exposes to the UI, as watch channels.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use tasktank_shared::models::{DeviceGroup, Tank};
use tasktank_shared::types::{DeviceId, FileId, SyncStatus, TankId};

/// How a remote device is currently reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Open direct link.
    Connected,
    /// Heard from recently, reachable through relays only.
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub direction: TransferDirection,
    /// 0.0 ..= 1.0
    pub progress: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferProgress {
    pub fn started(direction: TransferDirection) -> Self {
        Self {
            direction,
            progress: 0.0,
            error: None,
        }
    }
}

/// Senders for every piece of observable state.
pub struct StatusBoard {
    pub tanks: watch::Sender<Vec<Tank>>,
    pub status: watch::Sender<SyncStatus>,
    pub synced: watch::Sender<BTreeSet<TankId>>,
    pub peers: watch::Sender<HashMap<DeviceId, PeerStatus>>,
    pub transfers: watch::Sender<HashMap<FileId, TransferProgress>>,
    pub device_group: watch::Sender<Option<DeviceGroup>>,
}

/// The matching receivers, cloned into every handle.
#[derive(Clone)]
pub struct StatusWatch {
    pub tanks: watch::Receiver<Vec<Tank>>,
    pub status: watch::Receiver<SyncStatus>,
    pub synced: watch::Receiver<BTreeSet<TankId>>,
    pub peers: watch::Receiver<HashMap<DeviceId, PeerStatus>>,
    pub transfers: watch::Receiver<HashMap<FileId, TransferProgress>>,
    pub device_group: watch::Receiver<Option<DeviceGroup>>,
}

impl StatusBoard {
    pub fn new(tanks: Vec<Tank>, group: Option<DeviceGroup>) -> (Self, StatusWatch) {
        let (tanks_tx, tanks_rx) = watch::channel(tanks);
        let (status_tx, status_rx) = watch::channel(SyncStatus::Off);
        let (synced_tx, synced_rx) = watch::channel(BTreeSet::new());
        let (peers_tx, peers_rx) = watch::channel(HashMap::new());
        let (transfers_tx, transfers_rx) = watch::channel(HashMap::new());
        let (group_tx, group_rx) = watch::channel(group);
        (
            Self {
                tanks: tanks_tx,
                status: status_tx,
                synced: synced_tx,
                peers: peers_tx,
                transfers: transfers_tx,
                device_group: group_tx,
            },
            StatusWatch {
                tanks: tanks_rx,
                status: status_rx,
                synced: synced_rx,
                peers: peers_rx,
                transfers: transfers_rx,
                device_group: group_rx,
            },
        )
    }

    pub fn set_status(&self, status: SyncStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    pub fn set_peer(&self, device: &DeviceId, status: Option<PeerStatus>) {
        self.peers.send_if_modified(|map| match status {
            Some(s) => map.insert(device.clone(), s) != Some(s),
            None => map.remove(device).is_some(),
        });
    }

    pub fn set_synced(&self, synced: BTreeSet<TankId>) {
        self.synced.send_if_modified(|current| {
            if *current == synced {
                return false;
            }
            *current = synced;
            true
        });
    }

    pub fn set_transfers(&self, transfers: HashMap<FileId, TransferProgress>) {
        self.transfers.send_replace(transfers);
    }
}
