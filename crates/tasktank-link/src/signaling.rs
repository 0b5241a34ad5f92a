//! Signaling payloads carried as encrypted ephemeral relay records.
//!
//! Relays only ever see an ephemeral record authored by the key-derived
//! identity. Who is signaling whom lives inside the ciphertext.

use serde::{Deserialize, Serialize};
use tracing::trace;

use tasktank_shared::constants::KIND_EPHEMERAL;
use tasktank_shared::crypto::{open_json, seal_json, EncKey};
use tasktank_shared::identity::{AuthorIdentity, AuthorPubkey};
use tasktank_shared::record::{Record, RecordFilter};
use tasktank_shared::types::{DeviceId, TankId};

use crate::error::LinkError;

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer {
        from: DeviceId,
        to: DeviceId,
        sdp: String,
        ts: i64,
    },
    Answer {
        from: DeviceId,
        to: DeviceId,
        sdp: String,
        ts: i64,
    },
    Ice {
        from: DeviceId,
        to: DeviceId,
        candidate: String,
        #[serde(rename = "sdpMid", default)]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", default)]
        sdp_mline_index: Option<u16>,
        ts: i64,
    },
    /// Presence: the sender is alive and has these tanks active.
    Heartbeat {
        from: DeviceId,
        tanks: Vec<TankId>,
        ts: i64,
    },
}

impl SignalPayload {
    pub fn ice(from: DeviceId, to: DeviceId, candidate: IceCandidate) -> Self {
        SignalPayload::Ice {
            from,
            to,
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ts: now_millis(),
        }
    }

    pub fn heartbeat(from: DeviceId, tanks: Vec<TankId>) -> Self {
        SignalPayload::Heartbeat {
            from,
            tanks,
            ts: now_millis(),
        }
    }

    pub fn sender(&self) -> &DeviceId {
        match self {
            SignalPayload::Offer { from, .. }
            | SignalPayload::Answer { from, .. }
            | SignalPayload::Ice { from, .. }
            | SignalPayload::Heartbeat { from, .. } => from,
        }
    }

    /// Addressee, `None` for broadcast heartbeats.
    pub fn recipient(&self) -> Option<&DeviceId> {
        match self {
            SignalPayload::Offer { to, .. }
            | SignalPayload::Answer { to, .. }
            | SignalPayload::Ice { to, .. } => Some(to),
            SignalPayload::Heartbeat { .. } => None,
        }
    }

    pub fn candidate(&self) -> Option<IceCandidate> {
        match self {
            SignalPayload::Ice {
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..
            } => Some(IceCandidate {
                candidate: candidate.clone(),
                sdp_mid: sdp_mid.clone(),
                sdp_mline_index: *sdp_mline_index,
            }),
            _ => None,
        }
    }

    /// Encrypt under the group key and wrap in an ephemeral record.
    pub fn seal(&self, key: &EncKey, author: &AuthorIdentity) -> Result<Record, LinkError> {
        Ok(Record::ephemeral(author, seal_json(key, self)?))
    }

    /// Decrypt a record meant for `local`. Foreign ciphertext, our own echo
    /// and signals addressed to someone else all come back as `None`.
    pub fn open(record: &Record, key: &EncKey, local: &DeviceId) -> Option<Self> {
        if !record.is_ephemeral() {
            return None;
        }
        let payload: SignalPayload = open_json(key, &record.content)?;
        if payload.sender() == local {
            return None;
        }
        if let Some(to) = payload.recipient() {
            if to != local {
                trace!(to = %to.short(), "signal for another device");
                return None;
            }
        }
        Some(payload)
    }
}

/// Live signaling for one group identity, starting now.
pub fn signaling_filter(author: AuthorPubkey, since: i64) -> RecordFilter {
    RecordFilter::author(author).kind(KIND_EPHEMERAL).since(since)
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
