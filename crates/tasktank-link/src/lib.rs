// Direct peer links: signaling over relays, link lifecycle, data channels.

pub mod backoff;
pub mod channel;
pub mod error;
pub mod link;
pub mod manager;
pub mod memory;
pub mod presence;
pub mod signaling;
pub mod webrtc_link;

pub use backoff::Backoff;
pub use channel::{wait_for_drain, OutboundQueue, OutboundReceiver};
pub use error::LinkError;
pub use link::{LinkEvent, LinkEventKind, LinkFactory, LinkState, PeerLink, SdpKind};
pub use manager::{PeerManager, PeerUpdate, SignalRoute};
pub use memory::MemoryLinkNetwork;
pub use presence::PresenceTracker;
pub use signaling::{signaling_filter, IceCandidate, SignalPayload};
pub use webrtc_link::WebRtcLinkFactory;
