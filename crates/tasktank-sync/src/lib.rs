//! # tasktank-sync
//!
//! Keeps tanks consistent across devices. Changes travel two ways at once:
//! straight over a direct link to every connected peer, and as encrypted
//! replaceable records on relays for everyone else. The engine runs as a
//! single tokio task; the app talks to it through a [`SyncHandle`].

pub mod config;
pub mod detector;
pub mod device_group;
pub mod error;
pub mod merge;
pub mod status;
pub mod tank_store;
pub mod transfer;

mod engine;
mod handle;

pub use config::SyncConfig;
pub use engine::{spawn_engine, SyncDeps};
pub use error::{Result, SyncError, TransferError};
pub use handle::SyncHandle;
pub use status::{PeerStatus, TransferDirection, TransferProgress};
