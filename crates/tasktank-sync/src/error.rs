use thiserror::Error;

use tasktank_shared::error::CryptoError;
use tasktank_shared::pairing::PairingError;
use tasktank_shared::types::{FishId, TankId};
use tasktank_store::StoreError;

/// Failures of explicit user actions. Background sync never surfaces these;
/// it logs and carries on.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Unknown tank {0}")]
    UnknownTank(TankId),

    #[error("Unknown fish {0}")]
    UnknownFish(FishId),

    #[error("Tank {0} is not synced")]
    NotSynced(TankId),

    #[error("File is too large ({size} bytes, limit {limit})")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("No device group")]
    NoDeviceGroup,

    #[error("Device group is full ({0} devices)")]
    GroupFull(usize),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Sync engine has stopped")]
    EngineStopped,
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Why a single file transfer ended without a stored file. The display
/// strings travel in `file.error` messages and show up in the UI.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("File not found")]
    NotFound,

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Missing chunks")]
    MissingChunks,

    #[error("Bad chunk encoding")]
    BadChunk,

    #[error("File too large")]
    TooLarge,

    #[error("Storage full")]
    StorageFull,

    #[error("Store failed")]
    StoreFailed,

    #[error("Send failed")]
    SendFailed,

    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("{0}")]
    Remote(String),
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::StorageFull => TransferError::StorageFull,
            _ => TransferError::StoreFailed,
        }
    }
}
