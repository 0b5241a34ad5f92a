//! The application's side of the sync engine.
//!
//! A [`SyncHandle`] is cheap to clone. Actions go to the engine task as
//! [`SyncCommand`]s and wait for its reply; observable state is read from
//! watch channels without involving the engine at all.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::{mpsc, oneshot, watch};

use tasktank_shared::models::{Attachment, DeviceGroup, PeerInfo, Tank};
use tasktank_shared::pairing::ShareCode;
use tasktank_shared::record::now_secs;
use tasktank_shared::types::{
    DeviceId, FileId, FishId, Permission, SyncKey, SyncStatus, TankId,
};

use crate::error::{Result, SyncError};
use crate::status::{PeerStatus, StatusWatch, TransferProgress};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Commands sent *into* the engine task.
#[derive(Debug)]
pub(crate) enum SyncCommand {
    /// A new snapshot of every local tank, as the UI sees it.
    UpdateTanks {
        tanks: Vec<Tank>,
        reply: Reply<()>,
    },
    ShareTank {
        tank_id: TankId,
        reply: Reply<SyncKey>,
    },
    JoinTank {
        tank_id: TankId,
        key: SyncKey,
        reply: Reply<()>,
    },
    AcceptPair {
        code: String,
        reply: Reply<TankId>,
    },
    UnsyncTank {
        tank_id: TankId,
        reply: Reply<()>,
    },
    UpdatePeer {
        tank_id: TankId,
        device_id: DeviceId,
        info: PeerInfo,
        reply: Reply<()>,
    },
    GenerateShareCode {
        tank_id: TankId,
        permission: Permission,
        recipient_name: Option<String>,
        relay_only: bool,
        reply: Reply<String>,
    },
    AttachFile {
        tank_id: TankId,
        fish_id: FishId,
        name: String,
        mime_type: Option<String>,
        data: Vec<u8>,
        reply: Reply<Attachment>,
    },
    RequestFile {
        tank_id: TankId,
        fish_id: FishId,
        file_id: FileId,
        reply: Reply<bool>,
    },
    PairDevice {
        device_name: Option<String>,
        reply: Reply<String>,
    },
    AcceptDevicePair {
        code: String,
        reply: Reply<()>,
    },
    UnpairDevice {
        reply: Reply<()>,
    },
    /// The app came to the foreground (or left it).
    SetVisible(bool),
    /// Flush pending relay pushes, close everything and stop.
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct SyncHandle {
    cmd_tx: mpsc::Sender<SyncCommand>,
    watch: StatusWatch,
    device_id: DeviceId,
}

impl SyncHandle {
    pub(crate) fn new(cmd_tx: mpsc::Sender<SyncCommand>, watch: StatusWatch, device_id: DeviceId) -> Self {
        Self {
            cmd_tx,
            watch,
            device_id,
        }
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> SyncCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        rx.await.map_err(|_| SyncError::EngineStopped)?
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    // -----------------------------------------------------------------------
    // Observable state
    // -----------------------------------------------------------------------

    /// Every local tank, updated on each local or remote change.
    pub fn tanks(&self) -> watch::Receiver<Vec<Tank>> {
        self.watch.tanks.clone()
    }

    pub fn current_tanks(&self) -> Vec<Tank> {
        self.watch.tanks.borrow().clone()
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.watch.status.clone()
    }

    pub fn synced_tanks(&self) -> watch::Receiver<BTreeSet<TankId>> {
        self.watch.synced.clone()
    }

    pub fn peer_status(&self) -> watch::Receiver<HashMap<DeviceId, PeerStatus>> {
        self.watch.peers.clone()
    }

    pub fn transfers(&self) -> watch::Receiver<HashMap<FileId, TransferProgress>> {
        self.watch.transfers.clone()
    }

    pub fn device_group(&self) -> watch::Receiver<Option<DeviceGroup>> {
        self.watch.device_group.clone()
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    /// Hand the engine a new snapshot of all tanks. Changes to synced tanks
    /// go out over direct links right away and to relays after a debounce.
    pub async fn update_tanks(&self, tanks: Vec<Tank>) -> Result<()> {
        self.call(|reply| SyncCommand::UpdateTanks { tanks, reply }).await
    }

    /// Start syncing a local tank. Returns its key, new or existing.
    pub async fn share_tank(&self, tank_id: &TankId) -> Result<SyncKey> {
        let tank_id = tank_id.clone();
        self.call(|reply| SyncCommand::ShareTank { tank_id, reply }).await
    }

    pub async fn join_tank(&self, tank_id: &TankId, key: SyncKey) -> Result<()> {
        let tank_id = tank_id.clone();
        self.call(|reply| SyncCommand::JoinTank { tank_id, key, reply })
            .await
    }

    /// Join the tank a share code points at, creating it locally if needed.
    pub async fn accept_pair(&self, code: &str) -> Result<TankId> {
        let code = code.to_string();
        self.call(|reply| SyncCommand::AcceptPair { code, reply }).await
    }

    /// Stop syncing a tank. The local copy stays.
    pub async fn unsync_tank(&self, tank_id: &TankId) -> Result<()> {
        let tank_id = tank_id.clone();
        self.call(|reply| SyncCommand::UnsyncTank { tank_id, reply })
            .await
    }

    pub async fn update_peer(&self, tank_id: &TankId, device_id: &DeviceId, info: PeerInfo) -> Result<()> {
        let tank_id = tank_id.clone();
        let device_id = device_id.clone();
        self.call(|reply| SyncCommand::UpdatePeer {
            tank_id,
            device_id,
            info,
            reply,
        })
        .await
    }

    /// Share the tank if needed and encode an invitation for it.
    pub async fn generate_share_code(
        &self,
        tank_id: &TankId,
        permission: Permission,
        recipient_name: Option<String>,
        relay_only: bool,
    ) -> Result<String> {
        let tank_id = tank_id.clone();
        self.call(|reply| SyncCommand::GenerateShareCode {
            tank_id,
            permission,
            recipient_name,
            relay_only,
            reply,
        })
        .await
    }

    /// Validate a share code without acting on it.
    pub fn parse_share_code(&self, code: &str) -> Result<ShareCode> {
        Ok(ShareCode::parse(code, &self.device_id, now_secs())?)
    }

    /// Store `data` as a new attachment on a fish and offer it to
    /// connected peers.
    pub async fn attach_file(
        &self,
        tank_id: &TankId,
        fish_id: &FishId,
        name: &str,
        mime_type: Option<String>,
        data: Vec<u8>,
    ) -> Result<Attachment> {
        let tank_id = tank_id.clone();
        let fish_id = fish_id.clone();
        let name = name.to_string();
        self.call(|reply| SyncCommand::AttachFile {
            tank_id,
            fish_id,
            name,
            mime_type,
            data,
            reply,
        })
        .await
    }

    /// Ask the first connected peer of the tank for an attachment's bytes.
    /// `false` when no peer is connected or the file is already here.
    pub async fn request_file_from_peer(
        &self,
        file_id: &FileId,
        fish_id: &FishId,
        tank_id: &TankId,
    ) -> Result<bool> {
        let file_id = file_id.clone();
        let fish_id = fish_id.clone();
        let tank_id = tank_id.clone();
        self.call(|reply| SyncCommand::RequestFile {
            tank_id,
            fish_id,
            file_id,
            reply,
        })
        .await
    }

    /// Create (or reuse) the device group and return a code for a new device.
    pub async fn pair_device(&self, device_name: Option<String>) -> Result<String> {
        self.call(|reply| SyncCommand::PairDevice { device_name, reply })
            .await
    }

    pub async fn accept_device_pair(&self, code: &str) -> Result<()> {
        let code = code.to_string();
        self.call(|reply| SyncCommand::AcceptDevicePair { code, reply })
            .await
    }

    pub async fn unpair_device(&self) -> Result<()> {
        self.call(|reply| SyncCommand::UnpairDevice { reply }).await
    }

    pub async fn set_visible(&self, visible: bool) -> Result<()> {
        self.cmd_tx
            .send(SyncCommand::SetVisible(visible))
            .await
            .map_err(|_| SyncError::EngineStopped)
    }

    /// Stop the engine. Pending relay pushes are flushed first.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SyncCommand::Shutdown(reply))
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }
}
