//! Direct link abstraction.
//!
//! Like relay connections, a link never blocks its owner: negotiation steps
//! are queued commands and everything that happens on the link comes back
//! as a [`LinkEvent`] tagged with the remote device and link generation.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use tasktank_shared::types::DeviceId;

use crate::signaling::IceCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// States worth keeping a connection object around for.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            LinkState::New | LinkState::Connecting | LinkState::Connected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::New => "new",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone)]
pub enum LinkEventKind {
    /// A local offer or answer is ready to be signaled.
    LocalDescription { kind: SdpKind, sdp: String },
    LocalCandidate(IceCandidate),
    State(LinkState),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
    /// A negotiation step was rejected by the transport.
    Failed(String),
    /// Posted by the manager's own reconnect timer.
    ReconnectDue,
}

#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub remote: DeviceId,
    pub generation: u64,
    pub kind: LinkEventKind,
}

/// One negotiated connection to one remote device.
pub trait PeerLink: Send + Sync {
    /// Produce a local offer, reported as [`LinkEventKind::LocalDescription`].
    fn create_offer(&self);

    /// Apply a remote offer and answer it.
    fn accept_offer(&self, sdp: String);

    fn accept_answer(&self, sdp: String);

    /// Only valid once a remote description has been applied.
    fn add_ice_candidate(&self, candidate: IceCandidate);

    /// Queue text on the data channel. `false` if it is not open.
    fn send(&self, text: String) -> bool;

    /// Bytes queued but not yet handed to the transport.
    fn buffered_amount(&self) -> usize;

    /// Notified whenever the buffered amount falls to the low-water mark.
    fn drained(&self) -> Arc<Notify>;

    fn is_open(&self) -> bool;

    fn close(&self);
}

/// Creates links. `initiator` decides which side opens the data channel.
pub trait LinkFactory: Send + Sync {
    fn create(
        &self,
        local: &DeviceId,
        remote: &DeviceId,
        generation: u64,
        initiator: bool,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Arc<dyn PeerLink>;
}

/// Sends events for one link generation.
#[derive(Clone)]
pub(crate) struct Emitter {
    pub remote: DeviceId,
    pub generation: u64,
    pub events: mpsc::UnboundedSender<LinkEvent>,
}

impl Emitter {
    pub fn emit(&self, kind: LinkEventKind) {
        let _ = self.events.send(LinkEvent {
            remote: self.remote.clone(),
            generation: self.generation,
            kind,
        });
    }
}
