//! Heartbeat-driven liveness. A soft signal only: a device is "present"
//! while its heartbeats keep arriving inside the timeout window.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use tasktank_shared::types::DeviceId;

pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug)]
pub struct PresenceTracker {
    timeout: Duration,
    last_seen: HashMap<DeviceId, Instant>,
}

impl PresenceTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_seen: HashMap::new(),
        }
    }

    /// Record a heartbeat. Returns `true` when the device was not present
    /// before (first sighting, or back after timing out).
    pub fn observe(&mut self, device: &DeviceId, now: Instant) -> bool {
        let was_present = self.is_present(device, now);
        self.last_seen.insert(device.clone(), now);
        !was_present
    }

    pub fn is_present(&self, device: &DeviceId, now: Instant) -> bool {
        self.last_seen
            .get(device)
            .map(|seen| now.saturating_duration_since(*seen) <= self.timeout)
            .unwrap_or(false)
    }

    /// Forget devices whose last heartbeat is older than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<DeviceId> {
        let timeout = self.timeout;
        let stale: Vec<DeviceId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.last_seen.remove(id);
        }
        stale
    }

    pub fn present(&self, now: Instant) -> Vec<DeviceId> {
        self.last_seen
            .keys()
            .filter(|id| self.is_present(id, now))
            .cloned()
            .collect()
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TIMEOUT)
    }
}
