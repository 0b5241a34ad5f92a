/// Application name
pub const APP_NAME: &str = "TaskTank";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Relay record kind for state that a relay keeps only the latest of
/// (keyed by author, kind and `d` tag)
pub const KIND_REPLACEABLE: u32 = 30078;

/// Relay record kind for signaling and heartbeats, never stored
pub const KIND_EPHEMERAL: u32 = 20078;

/// Key derivation context for the record author key (BLAKE3)
pub const KDF_CONTEXT_AUTHOR_KEY: &str = "tasktank-author-key-v1";

/// Marker payload field for a tombstoned fish
pub const TOMBSTONE_FIELD: &str = "_del";

/// Pairing code format version
pub const SHARE_CODE_VERSION: u8 = 2;

/// Device pair code format version
pub const DEVICE_PAIR_CODE_VERSION: u8 = 1;

/// Pairing code validity (24 hours)
pub const SHARE_CODE_VALIDITY_SECS: i64 = 24 * 60 * 60;

/// Device pair code validity (10 minutes)
pub const DEVICE_PAIR_CODE_VALIDITY_SECS: i64 = 10 * 60;

/// Maximum attachment size in bytes (50 MiB)
pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// File transfer chunk size in bytes (64 KiB)
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum number of devices in a device group
pub const MAX_GROUP_DEVICES: usize = 20;

/// Length of a device id prefix used as a fallback display name
pub const DEVICE_NAME_FALLBACK_LEN: usize = 12;

/// Direct link data channel label
pub const DATA_CHANNEL_LABEL: &str = "tasktank-sync";

/// Bounded retransmissions on the direct link data channel
pub const DATA_CHANNEL_MAX_RETRANSMITS: u16 = 3;

/// Public STUN servers for direct link negotiation
pub const STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Relays used when nothing better is known
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://nostr.wine",
    "wss://relay.snort.social",
    "wss://nostr-pub.wellorder.net",
];

/// Default relay server listen address
pub const DEFAULT_RELAY_LISTEN_ADDR: &str = "0.0.0.0:7777";
