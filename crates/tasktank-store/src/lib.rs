//! # tasktank-store
//!
//! Local durable storage for TaskTank, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for the two things a
//! device keeps locally besides its tanks: small key-value settings (sync
//! keys, the device group, the ranked relay cache) and file blobs attached to
//! fish.

pub mod blobs;
pub mod database;
pub mod kv;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
