//! Relay connection abstraction.
//!
//! A connection never blocks its caller: publishes and subscriptions are
//! queued, and everything the relay says back arrives as a [`RelayEvent`] on
//! the channel handed to [`RelayConnector::connect`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use tasktank_shared::error::RecordError;
use tasktank_shared::record::{Record, RecordFilter};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Timed out connecting to {0}")]
    Timeout(String),

    #[error("Relay {0} is offline")]
    Offline(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] RecordError),
}

/// Notifications sent *from* relay connections to their owner.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A record matching subscription `sub_id`.
    Record {
        relay: String,
        sub_id: String,
        record: Record,
    },
    /// Stored records for `sub_id` have all been sent; the rest is live.
    Eose { relay: String, sub_id: String },
    /// The relay answered a publish.
    PublishResult {
        relay: String,
        id: String,
        accepted: bool,
        message: String,
    },
    /// The relay connection went up or down.
    Status { relay: String, connected: bool },
    /// Human-readable notice from the relay.
    Notice { relay: String, message: String },
}

impl RelayEvent {
    pub fn relay(&self) -> &str {
        match self {
            RelayEvent::Record { relay, .. }
            | RelayEvent::Eose { relay, .. }
            | RelayEvent::PublishResult { relay, .. }
            | RelayEvent::Status { relay, .. }
            | RelayEvent::Notice { relay, .. } => relay,
        }
    }
}

/// One long-lived connection to one relay.
pub trait RelayConnection: Send + Sync {
    fn url(&self) -> &str;

    /// Best effort. Dropped with a log line while the relay is unreachable.
    fn publish(&self, record: Record);

    /// Replaces any subscription with the same id. Kept across reconnects.
    fn subscribe(&self, sub_id: &str, filters: Vec<RecordFilter>);

    fn unsubscribe(&self, sub_id: &str);

    fn is_connected(&self) -> bool;

    fn close(&self);
}

/// Opens relay connections and probes relay latency.
pub trait RelayConnector: Send + Sync {
    fn connect(
        &self,
        url: &str,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Arc<dyn RelayConnection>;

    /// Time to a successful connection, for ranking.
    fn probe(&self, url: &str, timeout: Duration) -> BoxFuture<'static, Result<Duration, RelayError>>;
}
