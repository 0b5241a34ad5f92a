use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::crypto::EncKey;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub fn base36(mut n: u64) -> String {
    if n == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn random_base36(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect()
}

/// Short time-ordered local id: base36 millis followed by 6 random chars.
pub fn uid() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    format!("{}{}", base36(millis), random_base36(6))
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn short(&self) -> &str {
                let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
                &self.0[..end]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Stable per-installation device identifier. Ordering decides which
    /// side of a direct link initiates.
    DeviceId
);
string_id!(TankId);
string_id!(FishId);
string_id!(FileId);
string_id!(
    /// Random room identifier that prefixes every `d` tag of a tank.
    SyncId
);

impl DeviceId {
    pub fn generate() -> Self {
        Self(format!("{}-{}", uid(), uid()))
    }

    /// The lower id initiates the offer, so both sides agree without a
    /// negotiation round-trip.
    pub fn initiates_with(&self, remote: &DeviceId) -> bool {
        self < remote
    }
}

impl TankId {
    pub fn generate() -> Self {
        Self(uid())
    }
}

impl FishId {
    pub fn generate() -> Self {
        Self(uid())
    }
}

impl FileId {
    pub fn generate() -> Self {
        Self(uid())
    }
}

impl SyncId {
    /// Three 4-char base36 segments, `xxxx-xxxx-xxxx`.
    pub fn generate() -> Self {
        Self(format!(
            "{}-{}-{}",
            random_base36(4),
            random_base36(4),
            random_base36(4)
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    Shared,
    Readonly,
}

impl Permission {
    /// Single-letter form used inside pairing codes.
    pub fn code(self) -> &'static str {
        match self {
            Permission::Shared => "s",
            Permission::Readonly => "r",
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "r" | "readonly" => Permission::Readonly,
            _ => Permission::Shared,
        }
    }
}

/// Aggregate relay connectivity exposed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Off,
    Connecting,
    Connected,
    Disconnected,
}

/// Per-tank secret bundle. Anyone holding it can read and write the tank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncKey {
    pub sync_id: SyncId,
    pub enc_key: EncKey,
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub relay_only: bool,
}

impl SyncKey {
    pub fn generate(relays: Vec<String>) -> Result<Self, crate::error::CryptoError> {
        Ok(Self {
            sync_id: SyncId::generate(),
            enc_key: crate::crypto::generate_key()?,
            relays,
            relay_only: false,
        })
    }
}
