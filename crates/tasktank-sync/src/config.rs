//! Sync engine configuration.
//!
//! Every timing and size limit the engine uses lives here so tests can
//! shrink them. Defaults match what deployed devices run with.

use std::time::Duration;

use tasktank_shared::constants::{
    DEFAULT_RELAYS, FILE_CHUNK_SIZE, MAX_FILE_SIZE, MAX_GROUP_DEVICES,
};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Candidate relays, ranked by latency at startup.
    /// Env: `TASKTANK_RELAYS` (comma separated)
    pub relays: Vec<String>,

    /// Name announced when joining a tank without a recipient hint.
    /// Env: `TASKTANK_DEVICE_NAME`
    pub device_name: String,

    /// Skip latency ranking and use `relays` in order.
    pub rank_relays: bool,
    pub relay_top_n: usize,
    pub relay_probe_timeout: Duration,
    pub relay_cache_ttl: Duration,
    /// How long the initial "connecting" status may last before it is
    /// reported as "disconnected".
    pub connecting_grace: Duration,

    pub heartbeat_interval: Duration,
    pub presence_timeout: Duration,
    pub presence_check_interval: Duration,

    /// Relay push delay while some peer has no direct link.
    pub debounce_fast: Duration,
    /// Relay push delay while every peer has a direct link.
    pub debounce_slow: Duration,
    /// Local updates touching remotely changed items this soon after the
    /// remote change are treated as stale echoes.
    pub remote_echo_window: Duration,

    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,

    pub chunk_size: usize,
    /// Buffered bytes above which a file sender waits for the channel to drain.
    pub backpressure_threshold: usize,
    pub drain_timeout: Duration,
    pub max_file_size: u64,

    pub max_group_devices: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
            device_name: "Device".to_string(),
            rank_relays: true,
            relay_top_n: 5,
            relay_probe_timeout: Duration::from_secs(4),
            relay_cache_ttl: Duration::from_secs(24 * 60 * 60),
            connecting_grace: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            presence_timeout: Duration::from_secs(90),
            presence_check_interval: Duration::from_secs(30),
            debounce_fast: Duration::from_millis(300),
            debounce_slow: Duration::from_secs(30),
            remote_echo_window: Duration::from_millis(50),
            backoff_floor: Duration::from_secs(2),
            backoff_ceiling: Duration::from_secs(60),
            chunk_size: FILE_CHUNK_SIZE,
            backpressure_threshold: FILE_CHUNK_SIZE * 4,
            drain_timeout: Duration::from_secs(2),
            max_file_size: MAX_FILE_SIZE,
            max_group_devices: MAX_GROUP_DEVICES,
        }
    }
}

impl SyncConfig {
    /// Load overrides from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("TASKTANK_RELAYS") {
            let relays = parse_relay_list(&raw);
            if relays.is_empty() {
                tracing::warn!(value = %raw, "Invalid TASKTANK_RELAYS, using defaults");
            } else {
                config.relays = relays;
            }
        }

        if let Ok(name) = std::env::var("TASKTANK_DEVICE_NAME") {
            if !name.trim().is_empty() {
                config.device_name = name.trim().to_string();
            }
        }

        config
    }
}

fn parse_relay_list(raw: &str) -> Vec<String> {
    let mut relays: Vec<String> = Vec::new();
    for url in raw.split(',').map(str::trim).filter(|u| !u.is_empty()) {
        if !relays.iter().any(|r| r == url) {
            relays.push(url.to_string());
        }
    }
    relays
}

/// Union of two relay lists, first occurrence wins, order kept.
pub fn union_relays(first: &[String], second: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(first.len() + second.len());
    for url in first.iter().chain(second) {
        if !out.contains(url) {
            out.push(url.clone());
        }
    }
    out
}
