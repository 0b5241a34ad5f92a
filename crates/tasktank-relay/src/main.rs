//! # tasktank-relay
//!
//! Self-hostable relay for TaskTank devices.
//!
//! A relay is a dumb store-and-forward server: it verifies each signed
//! record, keeps the newest replaceable record per (author, kind, `d` tag),
//! never keeps ephemeral ones, and pushes everything it accepts to matching
//! live subscriptions. It cannot read record contents.

mod api;
mod config;
mod error;
mod relay;

use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::RelayServerConfig;
use crate::relay::RelayState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tasktank_relay=debug")),
        )
        .init();

    info!("Starting TaskTank relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = RelayServerConfig::from_env();
    info!(?config, "Loaded configuration");
    let listen_addr = config.listen_addr;

    let state = RelayState::new(config);

    // -----------------------------------------------------------------------
    // 3. Periodic stats
    // -----------------------------------------------------------------------
    let stats = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let connections = stats.connections();
            let records = stats.stored().await;
            info!(
                connections = connections,
                records = records,
                "relay stats"
            );
        }
    });

    // -----------------------------------------------------------------------
    // 4. Serve until failure or Ctrl+C
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(state, listen_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Relay server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
