//! Model structs persisted in the local database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tasktank_shared::types::{FileId, FishId, TankId};

// ---------------------------------------------------------------------------
// FileBlob
// ---------------------------------------------------------------------------

/// Binary content of an attachment. Never replicated through relays;
/// moved between devices over a direct link on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlob {
    pub file_id: FileId,
    pub name: String,
    pub mime_type: Option<String>,
    pub size: u64,
    /// Hex BLAKE3 of `data`.
    pub checksum: Option<String>,
    pub data: Vec<u8>,
    /// Owning tank, used for bulk garbage collection.
    pub tank_id: TankId,
    /// Owning fish, used for bulk garbage collection.
    pub fish_id: FishId,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// RelayCache
// ---------------------------------------------------------------------------

/// Latency-ranked relay list with the time it was measured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCache {
    /// Unix millis when the ranking was taken.
    pub ts: i64,
    pub relays: Vec<String>,
}

impl RelayCache {
    pub fn is_fresh(&self, now_ms: i64, ttl_ms: i64) -> bool {
        !self.relays.is_empty() && now_ms - self.ts < ttl_ms
    }
}
