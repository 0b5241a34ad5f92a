use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEVICE_PAIR_CODE_VALIDITY_SECS, DEVICE_PAIR_CODE_VERSION, SHARE_CODE_VALIDITY_SECS,
    SHARE_CODE_VERSION,
};
use crate::crypto::EncKey;
use crate::types::{DeviceId, Permission, SyncId, TankId};

/// Typed reasons a pasted code is rejected. Displayed inline, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("Invalid code format")]
    InvalidFormat,

    #[error("Not a pairing code")]
    NotAPairingCode,

    #[error("Missing sync credentials")]
    MissingCredentials,

    #[error("Can't pair with yourself")]
    SelfIssued,

    #[error("Pairing code expired")]
    Expired,
}

/// Decoded tank pairing code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareCode {
    pub version: u8,
    pub device_id: DeviceId,
    pub device_name: String,
    pub tank_id: TankId,
    pub tank_name: String,
    pub fish_count: usize,
    /// Permission granted to the recipient.
    pub permission: Permission,
    pub sync_id: SyncId,
    pub enc_key: EncKey,
    pub relays: Vec<String>,
    /// Expiry, unix seconds.
    pub expires_at: i64,
    pub recipient_name: Option<String>,
    pub relay_only: bool,
}

// Compact wire form. Every field optional so parse errors can be typed.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CompactShareCode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    v: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    d: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    t: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    c: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    p: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    s: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    k: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    y: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    r: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    o: Option<bool>,
    #[serde(rename = "_dg", default, skip_serializing_if = "Option::is_none")]
    dg: Option<bool>,
}

impl ShareCode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: DeviceId,
        device_name: String,
        tank_id: TankId,
        tank_name: String,
        fish_count: usize,
        permission: Permission,
        sync_id: SyncId,
        enc_key: EncKey,
        relays: Vec<String>,
        now: i64,
    ) -> Self {
        Self {
            version: SHARE_CODE_VERSION,
            device_id,
            device_name,
            tank_id,
            tank_name,
            fish_count,
            permission,
            sync_id,
            enc_key,
            relays,
            expires_at: now + SHARE_CODE_VALIDITY_SECS,
            recipient_name: None,
            relay_only: false,
        }
    }

    pub fn encode(&self) -> String {
        let compact = CompactShareCode {
            v: Some(self.version),
            d: Some(self.device_id.to_string()),
            dn: Some(self.device_name.clone()),
            t: Some(self.tank_id.to_string()),
            n: Some(self.tank_name.clone()),
            c: Some(self.fish_count),
            p: Some(self.permission.code().to_string()),
            s: Some(self.sync_id.to_string()),
            k: Some(self.enc_key.to_base64()),
            y: Some(self.relays.clone()),
            x: Some(self.expires_at),
            r: self.recipient_name.clone(),
            o: self.relay_only.then_some(true),
            dg: None,
        };
        // A struct of strings and numbers always serializes.
        let json = serde_json::to_vec(&compact).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Validate a pasted code against the local device and current time.
    pub fn parse(code: &str, local_device: &DeviceId, now: i64) -> Result<Self, PairingError> {
        let raw: CompactShareCode = decode_compact(code)?;
        if raw.dg == Some(true) {
            return Err(PairingError::NotAPairingCode);
        }
        let (Some(device_id), Some(tank_id)) = (raw.d, raw.t) else {
            return Err(PairingError::NotAPairingCode);
        };
        let device_id = DeviceId(device_id);
        if &device_id == local_device {
            return Err(PairingError::SelfIssued);
        }
        if matches!(raw.x, Some(x) if x < now) {
            return Err(PairingError::Expired);
        }
        let (Some(sync_id), Some(key)) = (raw.s, raw.k) else {
            return Err(PairingError::MissingCredentials);
        };
        let enc_key = EncKey::from_base64(&key).map_err(|_| PairingError::MissingCredentials)?;

        let device_name = raw
            .dn
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| crate::models::Peer::fallback_name(&device_id));

        Ok(Self {
            version: raw.v.unwrap_or(SHARE_CODE_VERSION),
            device_id,
            device_name,
            tank_id: TankId(tank_id),
            tank_name: raw.n.unwrap_or_default(),
            fish_count: raw.c.unwrap_or(0),
            permission: raw.p.as_deref().map(Permission::from_code).unwrap_or_default(),
            sync_id: SyncId(sync_id),
            enc_key,
            relays: raw.y.unwrap_or_default(),
            expires_at: raw.x.unwrap_or(now + SHARE_CODE_VALIDITY_SECS),
            recipient_name: raw.r,
            relay_only: raw.o.unwrap_or(false),
        })
    }
}

/// Decoded device pair code: bootstraps a new device into a device group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePairCode {
    pub version: u8,
    pub group_id: SyncId,
    pub group_key: EncKey,
    pub relays: Vec<String>,
    pub expires_at: i64,
    pub device_id: DeviceId,
    pub device_name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CompactDevicePairCode {
    #[serde(rename = "_dg", default)]
    dg: Option<bool>,
    #[serde(default)]
    g: Option<String>,
    #[serde(default)]
    k: Option<String>,
    #[serde(default)]
    y: Option<Vec<String>>,
    #[serde(default)]
    x: Option<i64>,
    #[serde(default)]
    d: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    v: Option<u8>,
}

impl DevicePairCode {
    pub fn new(
        group_id: SyncId,
        group_key: EncKey,
        relays: Vec<String>,
        device_id: DeviceId,
        device_name: String,
        now: i64,
    ) -> Self {
        Self {
            version: DEVICE_PAIR_CODE_VERSION,
            group_id,
            group_key,
            relays,
            expires_at: now + DEVICE_PAIR_CODE_VALIDITY_SECS,
            device_id,
            device_name,
        }
    }

    pub fn encode(&self) -> String {
        let compact = CompactDevicePairCode {
            dg: Some(true),
            g: Some(self.group_id.to_string()),
            k: Some(self.group_key.to_base64()),
            y: Some(self.relays.clone()),
            x: Some(self.expires_at),
            d: Some(self.device_id.to_string()),
            n: Some(self.device_name.clone()),
            v: Some(self.version),
        };
        let json = serde_json::to_vec(&compact).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Falls back to `default_relays` when the code carries none.
    pub fn parse(
        code: &str,
        local_device: &DeviceId,
        now: i64,
        default_relays: &[String],
    ) -> Result<Self, PairingError> {
        let raw: CompactDevicePairCode = decode_compact(code)?;
        if raw.dg != Some(true) {
            return Err(PairingError::NotAPairingCode);
        }
        let (Some(group_id), Some(key)) = (raw.g, raw.k) else {
            return Err(PairingError::MissingCredentials);
        };
        let group_key = EncKey::from_base64(&key).map_err(|_| PairingError::MissingCredentials)?;
        let device_id = DeviceId(raw.d.unwrap_or_default());
        if &device_id == local_device {
            return Err(PairingError::SelfIssued);
        }
        if matches!(raw.x, Some(x) if x < now) {
            return Err(PairingError::Expired);
        }
        let relays = match raw.y {
            Some(relays) if !relays.is_empty() => relays,
            _ => default_relays.to_vec(),
        };
        let device_name = raw
            .n
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| crate::models::Peer::fallback_name(&device_id));

        Ok(Self {
            version: raw.v.unwrap_or(DEVICE_PAIR_CODE_VERSION),
            group_id: SyncId(group_id),
            group_key,
            relays,
            expires_at: raw.x.unwrap_or(now + DEVICE_PAIR_CODE_VALIDITY_SECS),
            device_id,
            device_name,
        })
    }
}

// Accepts base64url with or without padding, and plain base64.
fn decode_compact<T: serde::de::DeserializeOwned>(code: &str) -> Result<T, PairingError> {
    let trimmed = code.trim().trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(code.trim()))
        .map_err(|_| PairingError::InvalidFormat)?;
    serde_json::from_slice(&bytes).map_err(|_| PairingError::InvalidFormat)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn share_code() -> ShareCode {
        ShareCode::new(
            DeviceId::from("device-a"),
            "Laptop".into(),
            TankId::from("tank-1"),
            "Groceries".into(),
            2,
            Permission::Readonly,
            SyncId::from("abcd-efgh-ijkl"),
            EncKey::from_bytes([4u8; 32]),
            vec!["wss://relay.one".into()],
            NOW,
        )
    }

    #[test]
    fn test_share_code_parses_back() {
        let code = share_code();
        let parsed = ShareCode::parse(&code.encode(), &DeviceId::from("device-b"), NOW).unwrap();
        assert_eq!(parsed, code);
    }

    #[test]
    fn test_share_code_is_url_safe() {
        let encoded = share_code().encode();
        assert!(!encoded.contains('+') && !encoded.contains('/') && !encoded.contains('='));
    }

    #[test]
    fn test_self_issued_rejected() {
        let encoded = share_code().encode();
        assert_eq!(
            ShareCode::parse(&encoded, &DeviceId::from("device-a"), NOW),
            Err(PairingError::SelfIssued)
        );
    }

    #[test]
    fn test_expired_rejected() {
        let encoded = share_code().encode();
        let later = NOW + SHARE_CODE_VALIDITY_SECS + 1;
        assert_eq!(
            ShareCode::parse(&encoded, &DeviceId::from("device-b"), later),
            Err(PairingError::Expired)
        );
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let json = r#"{"v":2,"d":"device-a","t":"tank-1","s":"abcd-efgh-ijkl"}"#;
        let encoded = URL_SAFE_NO_PAD.encode(json);
        assert_eq!(
            ShareCode::parse(&encoded, &DeviceId::from("device-b"), NOW),
            Err(PairingError::MissingCredentials)
        );
    }

    #[test]
    fn test_garbage_rejected() {
        let me = DeviceId::from("device-b");
        assert_eq!(ShareCode::parse("%%%", &me, NOW), Err(PairingError::InvalidFormat));
        assert_eq!(
            ShareCode::parse(&URL_SAFE_NO_PAD.encode("[1,2]"), &me, NOW),
            Err(PairingError::InvalidFormat)
        );
        assert_eq!(
            ShareCode::parse(&URL_SAFE_NO_PAD.encode("{}"), &me, NOW),
            Err(PairingError::NotAPairingCode)
        );
    }

    #[test]
    fn test_device_code_not_accepted_as_share_code() {
        let device_code = DevicePairCode::new(
            SyncId::from("gggg-hhhh-iiii"),
            EncKey::from_bytes([8u8; 32]),
            vec![],
            DeviceId::from("device-a"),
            "Phone".into(),
            NOW,
        )
        .encode();
        assert_eq!(
            ShareCode::parse(&device_code, &DeviceId::from("device-b"), NOW),
            Err(PairingError::NotAPairingCode)
        );
    }

    #[test]
    fn test_device_pair_code_roundtrip_and_defaults() {
        let code = DevicePairCode::new(
            SyncId::from("gggg-hhhh-iiii"),
            EncKey::from_bytes([8u8; 32]),
            vec![],
            DeviceId::from("device-a"),
            String::new(),
            NOW,
        );
        let defaults = vec!["wss://fallback".to_string()];
        let parsed =
            DevicePairCode::parse(&code.encode(), &DeviceId::from("device-b"), NOW, &defaults)
                .unwrap();
        assert_eq!(parsed.relays, defaults);
        assert_eq!(parsed.device_name, "device-a");
        assert_eq!(parsed.expires_at, NOW + DEVICE_PAIR_CODE_VALIDITY_SECS);

        let expired = DevicePairCode::parse(
            &code.encode(),
            &DeviceId::from("device-b"),
            NOW + DEVICE_PAIR_CODE_VALIDITY_SECS + 1,
            &defaults,
        );
        assert_eq!(expired, Err(PairingError::Expired));
    }

    #[test]
    fn test_share_code_not_accepted_as_device_code() {
        assert_eq!(
            DevicePairCode::parse(&share_code().encode(), &DeviceId::from("b"), NOW, &[]),
            Err(PairingError::NotAPairingCode)
        );
    }
}
