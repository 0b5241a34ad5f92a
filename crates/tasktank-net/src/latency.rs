//! Relay latency ranking.

use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info};

use crate::relay::RelayConnector;

/// Probe every candidate in parallel and return the `top_n` fastest
/// reachable relays, fastest first. When nothing answers, the candidates are
/// returned unchanged so sync can still try them later.
pub async fn rank_relays(
    connector: &dyn RelayConnector,
    candidates: &[String],
    top_n: usize,
    timeout: Duration,
) -> Vec<String> {
    let probes = candidates.iter().map(|url| {
        let probe = connector.probe(url, timeout);
        let url = url.clone();
        async move { (url, probe.await) }
    });

    let mut reachable: Vec<(String, Duration)> = Vec::new();
    for (url, result) in join_all(probes).await {
        match result {
            Ok(latency) => {
                debug!(relay = %url, latency_ms = latency.as_millis() as u64, "relay probe ok");
                reachable.push((url, latency));
            }
            Err(e) => debug!(relay = %url, error = %e, "relay probe failed"),
        }
    }

    if reachable.is_empty() {
        info!(candidates = candidates.len(), "no relay answered, keeping candidate list");
        return candidates.iter().take(top_n).cloned().collect();
    }

    reachable.sort_by_key(|(_, latency)| *latency);
    let ranked: Vec<String> = reachable.into_iter().take(top_n).map(|(url, _)| url).collect();
    info!(relays = ?ranked, "ranked relays");
    ranked
}
