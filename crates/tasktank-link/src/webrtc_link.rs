//! WebRTC data-channel links (webrtc-rs).
//!
//! Each link runs one task that owns the `RTCPeerConnection` and applies
//! negotiation commands in order, so a candidate queued after a remote
//! description is always applied after it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use tasktank_shared::constants::{
    DATA_CHANNEL_LABEL, DATA_CHANNEL_MAX_RETRANSMITS, FILE_CHUNK_SIZE, STUN_SERVERS,
};
use tasktank_shared::types::DeviceId;

use crate::channel::{OutboundQueue, OutboundReceiver};
use crate::error::LinkError;
use crate::link::{Emitter, LinkEvent, LinkEventKind, LinkFactory, LinkState, PeerLink, SdpKind};
use crate::signaling::IceCandidate;

#[derive(Debug, Clone)]
pub struct WebRtcLinkFactory {
    stun_servers: Vec<String>,
    low_water: usize,
}

impl WebRtcLinkFactory {
    pub fn new(stun_servers: Vec<String>, low_water: usize) -> Self {
        Self {
            stun_servers,
            low_water,
        }
    }
}

impl Default for WebRtcLinkFactory {
    fn default() -> Self {
        Self::new(
            STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            FILE_CHUNK_SIZE,
        )
    }
}

#[derive(Debug)]
enum LinkCommand {
    CreateOffer,
    AcceptOffer(String),
    AcceptAnswer(String),
    AddIce(IceCandidate),
    Close,
}

impl LinkFactory for WebRtcLinkFactory {
    fn create(
        &self,
        _local: &DeviceId,
        remote: &DeviceId,
        generation: u64,
        initiator: bool,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Arc<dyn PeerLink> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (queue, outbound) = OutboundQueue::new(self.low_water);
        let emitter = Emitter {
            remote: remote.clone(),
            generation,
            events,
        };

        tokio::spawn(link_task(
            self.stun_servers.clone(),
            emitter,
            initiator,
            cmd_rx,
            queue.clone(),
            outbound,
        ));

        Arc::new(WebRtcLink { cmd_tx, queue })
    }
}

struct WebRtcLink {
    cmd_tx: mpsc::UnboundedSender<LinkCommand>,
    queue: OutboundQueue,
}

impl WebRtcLink {
    fn command(&self, cmd: LinkCommand) {
        if self.cmd_tx.send(cmd).is_err() {
            debug!("link task gone, command dropped");
        }
    }
}

impl PeerLink for WebRtcLink {
    fn create_offer(&self) {
        self.command(LinkCommand::CreateOffer);
    }

    fn accept_offer(&self, sdp: String) {
        self.command(LinkCommand::AcceptOffer(sdp));
    }

    fn accept_answer(&self, sdp: String) {
        self.command(LinkCommand::AcceptAnswer(sdp));
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) {
        self.command(LinkCommand::AddIce(candidate));
    }

    fn send(&self, text: String) -> bool {
        self.queue.push(text)
    }

    fn buffered_amount(&self) -> usize {
        self.queue.buffered_amount()
    }

    fn drained(&self) -> Arc<Notify> {
        self.queue.drained()
    }

    fn is_open(&self) -> bool {
        self.queue.is_open()
    }

    fn close(&self) {
        self.queue.set_open(false);
        self.command(LinkCommand::Close);
    }
}

impl Drop for WebRtcLink {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(LinkCommand::Close);
    }
}

async fn link_task(
    stun_servers: Vec<String>,
    emitter: Emitter,
    initiator: bool,
    mut cmd_rx: mpsc::UnboundedReceiver<LinkCommand>,
    queue: OutboundQueue,
    outbound: OutboundReceiver,
) {
    let pc = match new_peer_connection(&stun_servers).await {
        Ok(pc) => pc,
        Err(e) => {
            warn!(peer = %emitter.remote.short(), error = %e, "failed to create peer connection");
            emitter.emit(LinkEventKind::Failed(e.to_string()));
            emitter.emit(LinkEventKind::State(LinkState::Failed));
            return;
        }
    };
    install_connection_handlers(&pc, &emitter);

    if initiator {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            max_retransmits: Some(DATA_CHANNEL_MAX_RETRANSMITS),
            ..Default::default()
        };
        match pc.create_data_channel(DATA_CHANNEL_LABEL, Some(init)).await {
            Ok(dc) => wire_channel(dc, emitter.clone(), queue.clone(), outbound).await,
            Err(e) => {
                warn!(peer = %emitter.remote.short(), error = %e, "failed to create data channel");
                emitter.emit(LinkEventKind::Failed(e.to_string()));
            }
        }
    } else {
        let slot = Arc::new(Mutex::new(Some(outbound)));
        let emitter = emitter.clone();
        let queue = queue.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let slot = slot.clone();
            let emitter = emitter.clone();
            let queue = queue.clone();
            Box::pin(async move {
                let outbound = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
                match outbound {
                    Some(outbound) => wire_channel(dc, emitter, queue, outbound).await,
                    None => debug!(label = dc.label(), "ignoring extra data channel"),
                }
            })
        }));
    }

    while let Some(cmd) = cmd_rx.recv().await {
        let result = match cmd {
            LinkCommand::CreateOffer => create_offer(&pc).await.map(|sdp| {
                emitter.emit(LinkEventKind::LocalDescription {
                    kind: SdpKind::Offer,
                    sdp,
                })
            }),
            LinkCommand::AcceptOffer(sdp) => accept_offer(&pc, sdp).await.map(|sdp| {
                emitter.emit(LinkEventKind::LocalDescription {
                    kind: SdpKind::Answer,
                    sdp,
                })
            }),
            LinkCommand::AcceptAnswer(sdp) => accept_answer(&pc, sdp).await,
            LinkCommand::AddIce(candidate) => add_candidate(&pc, candidate).await,
            LinkCommand::Close => break,
        };
        if let Err(e) = result {
            warn!(peer = %emitter.remote.short(), error = %e, "negotiation step failed");
            emitter.emit(LinkEventKind::Failed(e.to_string()));
        }
    }

    queue.set_open(false);
    if let Err(e) = pc.close().await {
        debug!(peer = %emitter.remote.short(), error = %e, "error closing peer connection");
    }
    debug!(peer = %emitter.remote.short(), "link task finished");
}

async fn new_peer_connection(stun_servers: &[String]) -> Result<Arc<RTCPeerConnection>, LinkError> {
    let mut media = MediaEngine::default();
    let registry = register_default_interceptors(Registry::new(), &mut media)?;
    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: stun_servers.to_vec(),
            ..Default::default()
        }],
        ..Default::default()
    };
    Ok(Arc::new(api.new_peer_connection(config).await?))
}

fn install_connection_handlers(pc: &Arc<RTCPeerConnection>, emitter: &Emitter) {
    let e = emitter.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let e = e.clone();
        Box::pin(async move {
            if let Some(state) = map_state(state) {
                info!(peer = %e.remote.short(), state = %state, "peer connection state");
                e.emit(LinkEventKind::State(state));
            }
        })
    }));

    let e = emitter.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let e = e.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => e.emit(LinkEventKind::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                })),
                Err(err) => debug!(error = %err, "could not serialize ICE candidate"),
            }
        })
    }));
}

async fn wire_channel(
    dc: Arc<RTCDataChannel>,
    emitter: Emitter,
    queue: OutboundQueue,
    outbound: OutboundReceiver,
) {
    let (e, q) = (emitter.clone(), queue.clone());
    dc.on_open(Box::new(move || {
        let (e, q) = (e.clone(), q.clone());
        Box::pin(async move {
            debug!(peer = %e.remote.short(), "data channel open");
            q.set_open(true);
            e.emit(LinkEventKind::ChannelOpen);
        })
    }));

    let (e, q) = (emitter.clone(), queue.clone());
    dc.on_close(Box::new(move || {
        let (e, q) = (e.clone(), q.clone());
        Box::pin(async move {
            debug!(peer = %e.remote.short(), "data channel closed");
            q.set_open(false);
            e.emit(LinkEventKind::ChannelClosed);
        })
    }));

    let e = emitter.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let e = e.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => e.emit(LinkEventKind::ChannelMessage(text)),
                Err(_) => trace!(peer = %e.remote.short(), "dropping binary data channel message"),
            }
        })
    }));

    let transport_low = Arc::new(Notify::new());
    dc.set_buffered_amount_low_threshold(outbound.low_water())
        .await;
    let notify = transport_low.clone();
    dc.on_buffered_amount_low(Box::new(move || {
        let notify = notify.clone();
        Box::pin(async move { notify.notify_waiters() })
    }))
    .await;

    tokio::spawn(write_loop(dc, outbound, transport_low));
}

/// Move queued text into the data channel, holding back while the
/// transport's own buffer is above the high-water mark.
async fn write_loop(
    dc: Arc<RTCDataChannel>,
    mut outbound: OutboundReceiver,
    transport_low: Arc<Notify>,
) {
    let high_water = outbound.low_water() * 4;
    while let Some(text) = outbound.next().await {
        while dc.buffered_amount().await > high_water {
            let _ = tokio::time::timeout(Duration::from_millis(250), transport_low.notified()).await;
        }
        let len = text.len();
        if let Err(e) = dc.send_text(text).await {
            debug!(error = %e, "data channel send failed");
        }
        outbound.sent(len);
    }
}

async fn create_offer(pc: &RTCPeerConnection) -> Result<String, LinkError> {
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer.clone()).await?;
    Ok(offer.sdp)
}

async fn accept_offer(pc: &RTCPeerConnection, sdp: String) -> Result<String, LinkError> {
    pc.set_remote_description(RTCSessionDescription::offer(sdp)?)
        .await?;
    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer.clone()).await?;
    Ok(answer.sdp)
}

async fn accept_answer(pc: &RTCPeerConnection, sdp: String) -> Result<(), LinkError> {
    pc.set_remote_description(RTCSessionDescription::answer(sdp)?)
        .await?;
    Ok(())
}

async fn add_candidate(pc: &RTCPeerConnection, candidate: IceCandidate) -> Result<(), LinkError> {
    pc.add_ice_candidate(RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    })
    .await?;
    Ok(())
}

fn map_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}
