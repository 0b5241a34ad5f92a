//! Relay server configuration loaded from environment variables.
//!
//! Every setting has a default, so `tasktank-relay` starts with no
//! configuration at all.

use std::net::SocketAddr;

use tasktank_shared::constants::DEFAULT_RELAY_LISTEN_ADDR;

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Socket address for the WebSocket endpoint and `/health`.
    /// Env: `LISTEN_ADDR`
    /// Default: `0.0.0.0:7777`
    pub listen_addr: SocketAddr,

    /// Largest EVENT frame accepted, in bytes.
    /// Env: `MAX_RECORD_SIZE`
    /// Default: 256 KiB
    pub max_record_size: usize,

    /// Open subscriptions allowed per connection.
    /// Env: `MAX_SUBSCRIPTIONS`
    /// Default: `64`
    pub max_subscriptions: usize,

    /// Live records buffered per connection before a slow reader starts
    /// missing them.
    pub live_buffer: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_RELAY_LISTEN_ADDR
                .parse()
                .unwrap_or_else(|_| ([0, 0, 0, 0], 7777).into()),
            max_record_size: 256 * 1024,
            max_subscriptions: 64,
            live_buffer: 1024,
        }
    }
}

impl RelayServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("LISTEN_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.listen_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid LISTEN_ADDR, using default"),
            }
        }

        if let Some(val) = lookup("MAX_RECORD_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_record_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_RECORD_SIZE, using default"),
            }
        }

        if let Some(val) = lookup("MAX_SUBSCRIPTIONS") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_subscriptions = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_SUBSCRIPTIONS, using default"),
            }
        }

        config
    }
}
