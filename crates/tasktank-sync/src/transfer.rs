//! Chunked file transfer over direct links.
//!
//! A transfer moves one blob between exactly two devices:
//! offer → request → chunk… → complete → ack, any step of which may be
//! cut short by an error. The receiver checks the reassembled bytes
//! against the offered checksum; there is no per-chunk integrity check and
//! no automatic retry.
//!
//! Sending runs in its own task per transfer so that waiting for the data
//! channel to drain never stalls the engine. The task reports back through
//! [`TransferEvent`]s.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use tasktank_link::{wait_for_drain, PeerLink, PeerManager};
use tasktank_shared::crypto::checksum;
use tasktank_shared::models::Tank;
use tasktank_shared::protocol::{FileMessage, LinkFrame};
use tasktank_shared::types::{base36, DeviceId, FileId, FishId, TankId};
use tasktank_store::{Database, FileBlob};

use crate::config::SyncConfig;
use crate::error::TransferError;
use crate::status::{TransferDirection, TransferProgress};

/// How file messages reach a peer.
pub trait FileSender {
    fn send_file(&self, remote: &DeviceId, message: FileMessage) -> bool;

    /// The live link to `remote`, for streaming with backpressure.
    fn open_link(&self, remote: &DeviceId) -> Option<Arc<dyn PeerLink>>;
}

impl FileSender for PeerManager {
    fn send_file(&self, remote: &DeviceId, message: FileMessage) -> bool {
        self.send_file_message(remote, message)
    }

    fn open_link(&self, remote: &DeviceId) -> Option<Arc<dyn PeerLink>> {
        if !self.is_connected(remote) {
            return None;
        }
        self.link(remote)
    }
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub backpressure_threshold: usize,
    pub drain_timeout: Duration,
    /// Offers above this are never requested.
    pub max_file_size: u64,
}

impl From<&SyncConfig> for TransferConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            backpressure_threshold: config.backpressure_threshold,
            drain_timeout: config.drain_timeout,
            max_file_size: config.max_file_size,
        }
    }
}

/// A locally held file, as announced to a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct FileOffer {
    pub file_id: FileId,
    pub name: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub checksum: Option<String>,
    pub fish_id: FishId,
    pub tank_id: TankId,
}

impl FileOffer {
    fn into_message(self) -> FileMessage {
        FileMessage::Offer {
            file_id: self.file_id,
            name: self.name,
            size: self.size,
            mime_type: self.mime_type,
            checksum: self.checksum,
            fish_id: self.fish_id,
            tank_id: self.tank_id,
        }
    }
}

/// Every attachment in `tank` whose bytes this device holds.
pub fn local_offers(tank: &Tank) -> Vec<FileOffer> {
    let mut offers = Vec::new();
    for fish in &tank.fishes {
        for attachment in &fish.attachments {
            let Some(file_id) = attachment.file_id.clone().filter(|_| attachment.has_local_blob) else {
                continue;
            };
            offers.push(FileOffer {
                file_id,
                name: attachment.name.clone(),
                size: attachment.size.unwrap_or(0),
                mime_type: attachment.mime_type.clone(),
                checksum: attachment.checksum.clone(),
                fish_id: fish.id.clone(),
                tank_id: tank.id.clone(),
            });
        }
    }
    offers
}

/// Reports from sending tasks.
#[derive(Debug)]
pub enum TransferEvent {
    ChunkSent {
        transfer_id: String,
        index: u32,
        total: u32,
    },
    Finished {
        transfer_id: String,
    },
    Failed {
        transfer_id: String,
        error: TransferError,
    },
}

/// A file that arrived intact and is now in the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub file_id: FileId,
    pub fish_id: FishId,
    pub tank_id: TankId,
}

struct Outgoing {
    remote: DeviceId,
    file_id: FileId,
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Outgoing {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.task.abort();
    }
}

struct Incoming {
    remote: DeviceId,
    offer: FileOffer,
    /// Chunk count, fixed by the first chunk.
    total: Option<u32>,
    chunks: BTreeMap<u32, Vec<u8>>,
    /// Bytes held so far; never more than the offered size.
    bytes: u64,
}

impl Incoming {
    fn new(remote: DeviceId, offer: FileOffer) -> Self {
        Self {
            remote,
            offer,
            total: None,
            chunks: BTreeMap::new(),
            bytes: 0,
        }
    }

    /// Store one chunk. Rejects anything inconsistent with the offer or
    /// with earlier chunks.
    fn accept_chunk(&mut self, index: u32, total: u32, bytes: Vec<u8>) -> Result<(), TransferError> {
        if total == 0 || index >= total || u64::from(total) > self.offer.size.max(1) {
            return Err(TransferError::BadChunk);
        }
        match self.total {
            Some(expected) if expected != total => return Err(TransferError::BadChunk),
            Some(_) => {}
            None => self.total = Some(total),
        }
        if self.chunks.contains_key(&index) {
            return Ok(());
        }
        let len = bytes.len() as u64;
        if self.bytes + len > self.offer.size {
            return Err(TransferError::BadChunk);
        }
        self.bytes += len;
        self.chunks.insert(index, bytes);
        Ok(())
    }

    fn progress(&self) -> f32 {
        match self.total {
            Some(total) => self.chunks.len() as f32 / total as f32,
            None => 0.0,
        }
    }

    fn assemble(&self) -> Result<Vec<u8>, TransferError> {
        let total = self.total.unwrap_or(0);
        if self.chunks.len() != total as usize {
            return Err(TransferError::MissingChunks);
        }
        let mut data = Vec::with_capacity(self.bytes as usize);
        for chunk in self.chunks.values() {
            data.extend_from_slice(chunk);
        }
        if let Some(expected) = &self.offer.checksum {
            if &checksum(&data) != expected {
                return Err(TransferError::ChecksumMismatch);
            }
        }
        Ok(data)
    }
}

pub struct FileTransferManager {
    config: TransferConfig,
    counter: u64,
    outgoing: HashMap<String, Outgoing>,
    incoming: HashMap<String, Incoming>,
    progress: HashMap<FileId, TransferProgress>,
    events_tx: mpsc::UnboundedSender<TransferEvent>,
}

impl FileTransferManager {
    pub fn new(config: TransferConfig, events_tx: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self {
            config,
            counter: 0,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            progress: HashMap::new(),
            events_tx,
        }
    }

    pub fn progress(&self) -> &HashMap<FileId, TransferProgress> {
        &self.progress
    }

    fn next_transfer_id(&mut self) -> String {
        self.counter += 1;
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        format!("ft-{}-{}", base36(millis), base36(self.counter))
    }

    fn set_error(&mut self, file_id: &FileId, direction: TransferDirection, error: String) {
        let entry = self
            .progress
            .entry(file_id.clone())
            .or_insert_with(|| TransferProgress::started(direction));
        entry.error = Some(error);
    }

    // -----------------------------------------------------------------------
    // Receiving side
    // -----------------------------------------------------------------------

    /// Announce locally held files to a newly connected peer.
    pub fn offer_files(
        &self,
        remote: &DeviceId,
        offers: impl IntoIterator<Item = FileOffer>,
        sender: &dyn FileSender,
    ) -> usize {
        let mut sent = 0;
        for offer in offers {
            if sender.send_file(remote, offer.into_message()) {
                sent += 1;
            }
        }
        if sent > 0 {
            debug!(peer = %remote.short(), files = sent, "offered files");
        }
        sent
    }

    /// Ask `remote` for a file unless we already hold it or are already
    /// fetching it. Returns `true` if a request went out.
    pub fn request(
        &mut self,
        remote: &DeviceId,
        offer: FileOffer,
        db: &Database,
        sender: &dyn FileSender,
    ) -> bool {
        match db.has_file(&offer.file_id) {
            Ok(true) => {
                trace!(file = %offer.file_id.short(), "already have offered file");
                return false;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(file = %offer.file_id.short(), error = %e, "blob lookup failed");
                return false;
            }
        }
        if self.incoming.values().any(|t| t.offer.file_id == offer.file_id) {
            return false;
        }

        let transfer_id = self.next_transfer_id();
        if offer.size > self.config.max_file_size {
            warn!(
                peer = %remote.short(),
                file = %offer.file_id.short(),
                size = offer.size,
                limit = self.config.max_file_size,
                "offered file too large, not requesting"
            );
            self.refuse(remote, transfer_id, TransferError::TooLarge, sender);
            self.set_error(&offer.file_id, TransferDirection::Down, TransferError::TooLarge.to_string());
            return false;
        }
        let request = FileMessage::Request {
            file_id: offer.file_id.clone(),
            transfer_id: transfer_id.clone(),
        };
        if !sender.send_file(remote, request) {
            debug!(peer = %remote.short(), file = %offer.file_id.short(), "could not request file");
            return false;
        }

        debug!(peer = %remote.short(), file = %offer.file_id.short(), transfer = %transfer_id, "requested file");
        self.progress
            .insert(offer.file_id.clone(), TransferProgress::started(TransferDirection::Down));
        self.incoming
            .insert(transfer_id, Incoming::new(remote.clone(), offer));
        true
    }

    /// Tell `remote` a transfer will not happen.
    pub fn refuse(
        &self,
        remote: &DeviceId,
        transfer_id: String,
        error: TransferError,
        sender: &dyn FileSender,
    ) {
        sender.send_file(
            remote,
            FileMessage::Error {
                transfer_id,
                error: error.to_string(),
            },
        );
    }

    /// Handle a file message from `remote`. Returns the file when one has
    /// just been stored.
    pub fn handle_message(
        &mut self,
        remote: &DeviceId,
        message: FileMessage,
        db: &Database,
        sender: &dyn FileSender,
    ) -> Option<ReceivedFile> {
        match message {
            FileMessage::Offer {
                file_id,
                name,
                size,
                mime_type,
                checksum,
                fish_id,
                tank_id,
            } => {
                let offer = FileOffer {
                    file_id,
                    name,
                    size,
                    mime_type,
                    checksum,
                    fish_id,
                    tank_id,
                };
                self.request(remote, offer, db, sender);
                None
            }
            FileMessage::Request {
                file_id,
                transfer_id,
            } => {
                self.start_sending(remote, file_id, transfer_id, db, sender);
                None
            }
            FileMessage::Chunk {
                transfer_id,
                index,
                total,
                data,
            } => {
                self.on_chunk(remote, &transfer_id, index, total, &data, sender);
                None
            }
            FileMessage::Complete {
                transfer_id,
                file_id,
            } => self.on_complete(remote, &transfer_id, &file_id, db, sender),
            FileMessage::Ack {
                transfer_id,
                file_id,
                success,
            } => {
                self.on_ack(remote, &transfer_id, &file_id, success);
                None
            }
            FileMessage::Error { transfer_id, error } => {
                self.on_error(remote, &transfer_id, error);
                None
            }
        }
    }

    fn on_chunk(
        &mut self,
        remote: &DeviceId,
        transfer_id: &str,
        index: u32,
        total: u32,
        data: &str,
        sender: &dyn FileSender,
    ) {
        let Some(entry) = self.incoming.get_mut(transfer_id).filter(|t| &t.remote == remote) else {
            trace!(transfer = transfer_id, "chunk for unknown transfer");
            return;
        };
        let accepted = STANDARD
            .decode(data)
            .map_err(|_| TransferError::BadChunk)
            .and_then(|bytes| entry.accept_chunk(index, total, bytes));
        if let Err(e) = accepted {
            self.fail_incoming(transfer_id, e, sender);
            return;
        }
        let progress = entry.progress();
        let file_id = entry.offer.file_id.clone();
        if let Some(p) = self.progress.get_mut(&file_id) {
            p.progress = progress;
        }
    }

    fn on_complete(
        &mut self,
        remote: &DeviceId,
        transfer_id: &str,
        file_id: &FileId,
        db: &Database,
        sender: &dyn FileSender,
    ) -> Option<ReceivedFile> {
        if !self
            .incoming
            .get(transfer_id)
            .map(|t| &t.remote == remote)
            .unwrap_or(false)
        {
            trace!(transfer = transfer_id, "completion for unknown transfer");
            return None;
        }
        let entry = self.incoming.remove(transfer_id)?;

        let stored = entry.assemble().and_then(|data| {
            let blob = FileBlob {
                file_id: entry.offer.file_id.clone(),
                name: entry.offer.name.clone(),
                mime_type: entry.offer.mime_type.clone(),
                size: data.len() as u64,
                checksum: entry.offer.checksum.clone(),
                data,
                tank_id: entry.offer.tank_id.clone(),
                fish_id: entry.offer.fish_id.clone(),
                created_at: Utc::now(),
            };
            db.store_file(&blob).map_err(TransferError::from)
        });

        let success = stored.is_ok();
        sender.send_file(
            remote,
            FileMessage::Ack {
                transfer_id: transfer_id.to_string(),
                file_id: file_id.clone(),
                success,
            },
        );

        match stored {
            Ok(()) => {
                info!(peer = %remote.short(), file = %file_id.short(), "file received");
                self.progress.remove(&entry.offer.file_id);
                Some(ReceivedFile {
                    file_id: entry.offer.file_id,
                    fish_id: entry.offer.fish_id,
                    tank_id: entry.offer.tank_id,
                })
            }
            Err(e) => {
                warn!(peer = %remote.short(), file = %file_id.short(), error = %e, "rejected received file");
                sender.send_file(
                    remote,
                    FileMessage::Error {
                        transfer_id: transfer_id.to_string(),
                        error: e.to_string(),
                    },
                );
                self.set_error(&entry.offer.file_id, TransferDirection::Down, e.to_string());
                None
            }
        }
    }

    fn fail_incoming(&mut self, transfer_id: &str, error: TransferError, sender: &dyn FileSender) {
        let Some(entry) = self.incoming.remove(transfer_id) else {
            return;
        };
        warn!(peer = %entry.remote.short(), transfer = transfer_id, error = %error, "incoming transfer failed");
        sender.send_file(
            &entry.remote,
            FileMessage::Error {
                transfer_id: transfer_id.to_string(),
                error: error.to_string(),
            },
        );
        self.set_error(&entry.offer.file_id, TransferDirection::Down, error.to_string());
    }

    // -----------------------------------------------------------------------
    // Sending side
    // -----------------------------------------------------------------------

    fn start_sending(
        &mut self,
        remote: &DeviceId,
        file_id: FileId,
        transfer_id: String,
        db: &Database,
        sender: &dyn FileSender,
    ) {
        let blob = match db.get_file(&file_id) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(file = %file_id.short(), error = %e, "blob lookup failed");
                None
            }
        };
        let Some(blob) = blob else {
            debug!(peer = %remote.short(), file = %file_id.short(), "requested file not found");
            sender.send_file(
                remote,
                FileMessage::Error {
                    transfer_id,
                    error: TransferError::NotFound.to_string(),
                },
            );
            return;
        };
        let Some(link) = sender.open_link(remote) else {
            return;
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        let job = StreamJob {
            link,
            transfer_id: transfer_id.clone(),
            file_id: file_id.clone(),
            data: blob.data,
            config: self.config.clone(),
            cancelled: cancelled.clone(),
            events: self.events_tx.clone(),
        };
        info!(peer = %remote.short(), file = %file_id.short(), size = blob.size, "sending file");
        let task = tokio::spawn(stream_file(job));

        self.progress
            .insert(file_id.clone(), TransferProgress::started(TransferDirection::Up));
        self.outgoing.insert(
            transfer_id,
            Outgoing {
                remote: remote.clone(),
                file_id,
                cancelled,
                task,
            },
        );
    }

    /// Progress reports from sending tasks.
    pub fn on_event(&mut self, event: TransferEvent, sender: &dyn FileSender) {
        match event {
            TransferEvent::ChunkSent {
                transfer_id,
                index,
                total,
            } => {
                let Some(entry) = self.outgoing.get(&transfer_id) else {
                    return;
                };
                if let Some(p) = self.progress.get_mut(&entry.file_id) {
                    p.progress = (index + 1) as f32 / total.max(1) as f32;
                }
            }
            TransferEvent::Finished { transfer_id } => {
                let Some(entry) = self.outgoing.get(&transfer_id) else {
                    return;
                };
                debug!(peer = %entry.remote.short(), transfer = %transfer_id, "all chunks sent");
                if let Some(p) = self.progress.get_mut(&entry.file_id) {
                    p.progress = 1.0;
                }
            }
            TransferEvent::Failed { transfer_id, error } => {
                let Some(entry) = self.outgoing.remove(&transfer_id) else {
                    return;
                };
                warn!(peer = %entry.remote.short(), transfer = %transfer_id, error = %error, "outgoing transfer failed");
                sender.send_file(
                    &entry.remote,
                    FileMessage::Error {
                        transfer_id,
                        error: error.to_string(),
                    },
                );
                self.set_error(&entry.file_id, TransferDirection::Up, error.to_string());
            }
        }
    }

    fn on_ack(&mut self, remote: &DeviceId, transfer_id: &str, file_id: &FileId, success: bool) {
        if !self
            .outgoing
            .get(transfer_id)
            .map(|t| &t.remote == remote)
            .unwrap_or(false)
        {
            return;
        }
        let Some(entry) = self.outgoing.remove(transfer_id) else {
            return;
        };
        if success {
            info!(peer = %remote.short(), file = %file_id.short(), "file delivered");
            self.progress.remove(&entry.file_id);
        } else {
            warn!(peer = %remote.short(), file = %file_id.short(), "peer rejected file");
            self.set_error(&entry.file_id, TransferDirection::Up, "Rejected by peer".into());
        }
    }

    fn on_error(&mut self, remote: &DeviceId, transfer_id: &str, error: String) {
        let error = TransferError::Remote(error);
        let owns_incoming = self
            .incoming
            .get(transfer_id)
            .map(|t| &t.remote == remote)
            .unwrap_or(false);
        let owns_outgoing = self
            .outgoing
            .get(transfer_id)
            .map(|t| &t.remote == remote)
            .unwrap_or(false);
        if !owns_incoming && !owns_outgoing {
            trace!(peer = %remote.short(), transfer = transfer_id, "error for a transfer not shared with this peer");
            return;
        }

        if owns_incoming {
            if let Some(entry) = self.incoming.remove(transfer_id) {
                debug!(peer = %remote.short(), transfer = transfer_id, error = %error, "incoming transfer aborted");
                self.set_error(&entry.offer.file_id, TransferDirection::Down, error.to_string());
            }
        }
        if !owns_outgoing {
            return;
        }
        if let Some(entry) = self.outgoing.remove(transfer_id) {
            debug!(peer = %remote.short(), transfer = transfer_id, error = %error, "outgoing transfer aborted");
            entry.cancel();
            self.set_error(&entry.file_id, TransferDirection::Up, error.to_string());
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// The link to `remote` is gone: stop sending to it and fail what it
    /// was sending us.
    pub fn cleanup_peer(&mut self, remote: &DeviceId) {
        let outgoing: Vec<String> = self
            .outgoing
            .iter()
            .filter(|(_, t)| &t.remote == remote)
            .map(|(id, _)| id.clone())
            .collect();
        for id in outgoing {
            if let Some(entry) = self.outgoing.remove(&id) {
                entry.cancel();
                self.progress.remove(&entry.file_id);
            }
        }

        let incoming: Vec<String> = self
            .incoming
            .iter()
            .filter(|(_, t)| &t.remote == remote)
            .map(|(id, _)| id.clone())
            .collect();
        for id in incoming {
            if let Some(entry) = self.incoming.remove(&id) {
                self.set_error(
                    &entry.offer.file_id,
                    TransferDirection::Down,
                    TransferError::PeerDisconnected.to_string(),
                );
            }
        }
    }

    pub fn shutdown(&mut self) {
        for (_, entry) in self.outgoing.drain() {
            entry.cancel();
        }
        self.incoming.clear();
    }
}

struct StreamJob {
    link: Arc<dyn PeerLink>,
    transfer_id: String,
    file_id: FileId,
    data: Vec<u8>,
    config: TransferConfig,
    cancelled: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

fn send_frame(link: &dyn PeerLink, message: FileMessage) -> bool {
    match LinkFrame::File(message).to_text() {
        Ok(text) => link.send(text),
        Err(_) => false,
    }
}

async fn stream_file(job: StreamJob) {
    let chunk_size = job.config.chunk_size.max(1);
    let total = job.data.len().div_ceil(chunk_size) as u32;
    let threshold = job.config.backpressure_threshold;

    for (index, chunk) in job.data.chunks(chunk_size).enumerate() {
        if job.cancelled.load(Ordering::Relaxed) {
            return;
        }
        if job.link.buffered_amount() > threshold
            && !wait_for_drain(job.link.as_ref(), threshold, job.config.drain_timeout).await
        {
            trace!(transfer = %job.transfer_id, "drain wait timed out, sending anyway");
        }
        if job.cancelled.load(Ordering::Relaxed) {
            return;
        }

        let index = index as u32;
        let message = FileMessage::Chunk {
            transfer_id: job.transfer_id.clone(),
            index,
            total,
            data: STANDARD.encode(chunk),
        };
        if !send_frame(job.link.as_ref(), message) {
            let _ = job.events.send(TransferEvent::Failed {
                transfer_id: job.transfer_id,
                error: TransferError::SendFailed,
            });
            return;
        }
        let _ = job.events.send(TransferEvent::ChunkSent {
            transfer_id: job.transfer_id.clone(),
            index,
            total,
        });
    }

    if job.cancelled.load(Ordering::Relaxed) {
        return;
    }
    let complete = FileMessage::Complete {
        transfer_id: job.transfer_id.clone(),
        file_id: job.file_id,
    };
    let event = if send_frame(job.link.as_ref(), complete) {
        TransferEvent::Finished {
            transfer_id: job.transfer_id,
        }
    } else {
        TransferEvent::Failed {
            transfer_id: job.transfer_id,
            error: TransferError::SendFailed,
        }
    };
    let _ = job.events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// A link that keeps what it was asked to send.
    #[derive(Default)]
    struct CapturingLink {
        sent: Mutex<Vec<String>>,
        buffered: AtomicUsize,
        drained: Arc<Notify>,
    }

    impl CapturingLink {
        fn frames(&self) -> Vec<FileMessage> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|t| match LinkFrame::from_text(t) {
                    Some(LinkFrame::File(m)) => Some(m),
                    _ => None,
                })
                .collect()
        }
    }

    impl PeerLink for CapturingLink {
        fn create_offer(&self) {}
        fn accept_offer(&self, _sdp: String) {}
        fn accept_answer(&self, _sdp: String) {}
        fn add_ice_candidate(&self, _candidate: tasktank_link::IceCandidate) {}
        fn send(&self, text: String) -> bool {
            self.sent.lock().unwrap().push(text);
            true
        }
        fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::Relaxed)
        }
        fn drained(&self) -> Arc<Notify> {
            self.drained.clone()
        }
        fn is_open(&self) -> bool {
            true
        }
        fn close(&self) {}
    }

    #[derive(Default)]
    struct FakeSender {
        messages: Mutex<Vec<FileMessage>>,
        link: Arc<CapturingLink>,
    }

    impl FakeSender {
        fn take(&self) -> Vec<FileMessage> {
            std::mem::take(&mut *self.messages.lock().unwrap())
        }
    }

    impl FileSender for FakeSender {
        fn send_file(&self, _remote: &DeviceId, message: FileMessage) -> bool {
            self.messages.lock().unwrap().push(message);
            true
        }
        fn open_link(&self, _remote: &DeviceId) -> Option<Arc<dyn PeerLink>> {
            Some(self.link.clone())
        }
    }

    fn config() -> TransferConfig {
        TransferConfig {
            chunk_size: 16,
            backpressure_threshold: 64,
            drain_timeout: Duration::from_secs(2),
            max_file_size: 1024,
        }
    }

    fn manager() -> (FileTransferManager, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FileTransferManager::new(config(), tx), rx)
    }

    fn blob(data: &[u8]) -> FileBlob {
        FileBlob {
            file_id: FileId::from("file-1"),
            name: "notes.txt".into(),
            mime_type: Some("text/plain".into()),
            size: data.len() as u64,
            checksum: Some(checksum(data)),
            data: data.to_vec(),
            tank_id: TankId::from("tank-1"),
            fish_id: FishId::from("fish-1"),
            created_at: Utc::now(),
        }
    }

    fn offer_for(b: &FileBlob) -> FileOffer {
        FileOffer {
            file_id: b.file_id.clone(),
            name: b.name.clone(),
            size: b.size,
            mime_type: b.mime_type.clone(),
            checksum: b.checksum.clone(),
            fish_id: b.fish_id.clone(),
            tank_id: b.tank_id.clone(),
        }
    }

    async fn until_finished(rx: &mut mpsc::UnboundedReceiver<TransferEvent>, mgr: &mut FileTransferManager, sender: &dyn FileSender) {
        while let Some(event) = rx.recv().await {
            let done = matches!(event, TransferEvent::Finished { .. } | TransferEvent::Failed { .. });
            mgr.on_event(event, sender);
            if done {
                return;
            }
        }
    }

    struct Pair {
        alice: FileTransferManager,
        alice_events: mpsc::UnboundedReceiver<TransferEvent>,
        alice_db: Database,
        alice_out: FakeSender,
        bob: FileTransferManager,
        bob_db: Database,
        bob_out: FakeSender,
    }

    fn pair(data: &[u8]) -> (Pair, FileBlob) {
        let alice_db = Database::open_in_memory().unwrap();
        let b = blob(data);
        alice_db.store_file(&b).unwrap();
        let (alice, alice_events) = manager();
        let (bob, _) = manager();
        (
            Pair {
                alice,
                alice_events,
                alice_db,
                alice_out: FakeSender::default(),
                bob,
                bob_db: Database::open_in_memory().unwrap(),
                bob_out: FakeSender::default(),
            },
            b,
        )
    }

    fn alice() -> DeviceId {
        DeviceId::from("dev-alice")
    }

    fn bob() -> DeviceId {
        DeviceId::from("dev-bob")
    }

    /// Offer from Alice through to Bob's chunks being handed over.
    async fn run_to_chunks(p: &mut Pair, b: &FileBlob) -> Vec<FileMessage> {
        let sent = p.alice.offer_files(&bob(), vec![offer_for(b)], &p.alice_out);
        assert_eq!(sent, 1);
        for message in p.alice_out.take() {
            assert!(p.bob.handle_message(&alice(), message, &p.bob_db, &p.bob_out).is_none());
        }
        let requests = p.bob_out.take();
        assert!(matches!(requests.as_slice(), [FileMessage::Request { .. }]));
        for message in requests {
            p.alice.handle_message(&bob(), message, &p.alice_db, &p.alice_out);
        }
        until_finished(&mut p.alice_events, &mut p.alice, &p.alice_out).await;
        p.alice_out.link.frames()
    }

    #[tokio::test]
    async fn file_arrives_byte_identical() {
        let data: Vec<u8> = (0..100u8).collect();
        let (mut p, b) = pair(&data);
        let frames = run_to_chunks(&mut p, &b).await;
        assert_eq!(frames.len(), 7 + 1);

        let mut received = None;
        for message in frames {
            if let Some(file) = p.bob.handle_message(&alice(), message, &p.bob_db, &p.bob_out) {
                received = Some(file);
            }
        }
        let received = received.expect("file stored");
        assert_eq!(received.fish_id, b.fish_id);

        let stored = p.bob_db.get_file(&b.file_id).unwrap().unwrap();
        assert_eq!(stored.data, data);
        assert_eq!(checksum(&stored.data), checksum(&data));
        assert!(p.bob.progress().is_empty());

        for message in p.bob_out.take() {
            assert!(matches!(message, FileMessage::Ack { success: true, .. }));
            p.alice.handle_message(&bob(), message, &p.alice_db, &p.alice_out);
        }
        assert!(p.alice.progress().is_empty());
    }

    #[tokio::test]
    async fn corrupted_chunk_is_rejected_by_checksum() {
        let data = vec![7u8; 40];
        let (mut p, b) = pair(&data);
        let frames = run_to_chunks(&mut p, &b).await;

        for mut message in frames {
            if let FileMessage::Chunk { index: 1, data, .. } = &mut message {
                *data = STANDARD.encode([9u8; 16]);
            }
            assert!(p.bob.handle_message(&alice(), message, &p.bob_db, &p.bob_out).is_none());
        }
        assert!(!p.bob_db.has_file(&b.file_id).unwrap());
        let replies = p.bob_out.take();
        assert!(replies
            .iter()
            .any(|m| matches!(m, FileMessage::Ack { success: false, .. })));
        assert!(replies
            .iter()
            .any(|m| matches!(m, FileMessage::Error { error, .. } if error == "Checksum mismatch")));
        assert_eq!(
            p.bob.progress()[&b.file_id].error.as_deref(),
            Some("Checksum mismatch")
        );

        for message in replies {
            p.alice.handle_message(&bob(), message, &p.alice_db, &p.alice_out);
        }
        assert_eq!(
            p.alice.progress()[&b.file_id].error.as_deref(),
            Some("Rejected by peer")
        );
    }

    #[tokio::test]
    async fn missing_chunk_fails_completion() {
        let data = vec![1u8; 40];
        let (mut p, b) = pair(&data);
        let frames = run_to_chunks(&mut p, &b).await;
        for message in frames {
            if matches!(message, FileMessage::Chunk { index: 0, .. }) {
                continue;
            }
            p.bob.handle_message(&alice(), message, &p.bob_db, &p.bob_out);
        }
        assert!(!p.bob_db.has_file(&b.file_id).unwrap());
        assert_eq!(
            p.bob.progress()[&b.file_id].error.as_deref(),
            Some("Missing chunks")
        );
    }

    #[test]
    fn request_for_unknown_file_answers_not_found() {
        let db = Database::open_in_memory().unwrap();
        let (mut mgr, _rx) = manager();
        let out = FakeSender::default();
        mgr.handle_message(
            &bob(),
            FileMessage::Request {
                file_id: FileId::from("nope"),
                transfer_id: "ft-1-1".into(),
            },
            &db,
            &out,
        );
        assert_eq!(
            out.take(),
            vec![FileMessage::Error {
                transfer_id: "ft-1-1".into(),
                error: "File not found".into(),
            }]
        );
    }

    #[test]
    fn offer_for_held_file_is_ignored() {
        let db = Database::open_in_memory().unwrap();
        let b = blob(b"already here");
        db.store_file(&b).unwrap();
        let (mut mgr, _rx) = manager();
        let out = FakeSender::default();
        assert!(!mgr.request(&alice(), offer_for(&b), &db, &out));
        assert!(out.take().is_empty());
    }

    #[test]
    fn duplicate_offer_requests_once() {
        let db = Database::open_in_memory().unwrap();
        let b = blob(b"abc");
        let (mut mgr, _rx) = manager();
        let out = FakeSender::default();
        assert!(mgr.request(&alice(), offer_for(&b), &db, &out));
        assert!(!mgr.request(&alice(), offer_for(&b), &db, &out));
        assert_eq!(out.take().len(), 1);
    }

    #[test]
    fn disconnect_fails_incoming() {
        let db = Database::open_in_memory().unwrap();
        let b = blob(b"abc");
        let (mut mgr, _rx) = manager();
        let out = FakeSender::default();
        mgr.request(&alice(), offer_for(&b), &db, &out);

        mgr.cleanup_peer(&alice());
        assert_eq!(
            mgr.progress()[&b.file_id].error.as_deref(),
            Some("Peer disconnected")
        );
    }

    fn chunk(transfer_id: &str, index: u32, total: u32, bytes: &[u8]) -> FileMessage {
        FileMessage::Chunk {
            transfer_id: transfer_id.into(),
            index,
            total,
            data: STANDARD.encode(bytes),
        }
    }

    /// Request `offer` from Alice and return the transfer id Bob picked.
    fn requested(mgr: &mut FileTransferManager, offer: FileOffer, db: &Database, out: &FakeSender) -> String {
        assert!(mgr.request(&alice(), offer, db, out));
        match out.take().as_slice() {
            [FileMessage::Request { transfer_id, .. }] => transfer_id.clone(),
            other => panic!("unexpected messages {other:?}"),
        }
    }

    #[test]
    fn oversized_offer_is_refused() {
        let db = Database::open_in_memory().unwrap();
        let (mut mgr, _rx) = manager();
        let out = FakeSender::default();
        let mut offer = offer_for(&blob(b"abc"));
        offer.size = u64::MAX;

        assert!(!mgr.request(&alice(), offer.clone(), &db, &out));
        match out.take().as_slice() {
            [FileMessage::Error { error, .. }] => assert_eq!(error, "File too large"),
            other => panic!("unexpected messages {other:?}"),
        }
        assert_eq!(
            mgr.progress()[&offer.file_id].error.as_deref(),
            Some("File too large")
        );

        // Chunks and completion for a transfer that never started are ignored.
        mgr.handle_message(&alice(), chunk("ft-forged", 0, 1, b"abc"), &db, &out);
        let done = mgr.handle_message(
            &alice(),
            FileMessage::Complete {
                transfer_id: "ft-forged".into(),
                file_id: offer.file_id.clone(),
            },
            &db,
            &out,
        );
        assert!(done.is_none());
        assert!(!db.has_file(&offer.file_id).unwrap());
    }

    #[test]
    fn chunk_total_must_stay_consistent() {
        let db = Database::open_in_memory().unwrap();
        let (mut mgr, _rx) = manager();
        let out = FakeSender::default();
        let b = blob(&[3u8; 40]);

        let id = requested(&mut mgr, offer_for(&b), &db, &out);
        mgr.handle_message(&alice(), chunk(&id, 0, 3, &[3u8; 16]), &db, &out);
        assert!(out.take().is_empty());
        // Same transfer, different chunk count.
        mgr.handle_message(&alice(), chunk(&id, 1, 4, &[3u8; 16]), &db, &out);
        assert!(matches!(out.take().as_slice(), [FileMessage::Error { error, .. }] if error == "Bad chunk encoding"));
        assert_eq!(
            mgr.progress()[&b.file_id].error.as_deref(),
            Some("Bad chunk encoding")
        );

        let id = requested(&mut mgr, offer_for(&b), &db, &out);
        mgr.handle_message(&alice(), chunk(&id, 3, 3, &[3u8; 16]), &db, &out);
        assert!(matches!(out.take().as_slice(), [FileMessage::Error { .. }]));

        // More bytes than were offered.
        let id = requested(&mut mgr, offer_for(&b), &db, &out);
        mgr.handle_message(&alice(), chunk(&id, 0, 2, &[3u8; 32]), &db, &out);
        mgr.handle_message(&alice(), chunk(&id, 1, 2, &[3u8; 32]), &db, &out);
        assert!(matches!(out.take().as_slice(), [FileMessage::Error { .. }]));
    }

    #[test]
    fn error_from_one_peer_leaves_others_alone() {
        let db = Database::open_in_memory().unwrap();
        let (mut mgr, _rx) = manager();
        let out = FakeSender::default();
        let b = blob(b"abc");
        let id = requested(&mut mgr, offer_for(&b), &db, &out);

        let mallory = DeviceId::from("dev-mallory");
        mgr.handle_message(
            &mallory,
            FileMessage::Error {
                transfer_id: id.clone(),
                error: "nope".into(),
            },
            &db,
            &out,
        );
        assert!(mgr.progress()[&b.file_id].error.is_none());

        // The transfer still completes from its real sender.
        mgr.handle_message(&alice(), chunk(&id, 0, 1, b"abc"), &db, &out);
        let done = mgr.handle_message(
            &alice(),
            FileMessage::Complete {
                transfer_id: id,
                file_id: b.file_id.clone(),
            },
            &db,
            &out,
        );
        assert_eq!(done.map(|f| f.file_id), Some(b.file_id.clone()));
        assert!(db.has_file(&b.file_id).unwrap());
    }

    #[test]
    fn transfer_ids_are_unique() {
        let (mut mgr, _rx) = manager();
        let a = mgr.next_transfer_id();
        let b = mgr.next_transfer_id();
        assert!(a.starts_with("ft-"));
        assert_ne!(a, b);
    }

    #[test]
    fn offers_cover_only_local_blobs() {
        use tasktank_shared::models::{Attachment, Fish};
        let mut tank = Tank::new("T", &alice());
        let mut fish = Fish::new("with files");
        for (id, local) in [("f-local", true), ("f-remote", false)] {
            fish.attachments.push(Attachment {
                id: id.into(),
                name: id.into(),
                url: None,
                file_id: Some(FileId::from(id)),
                mime_type: None,
                size: Some(3),
                checksum: None,
                has_local_blob: local,
            });
        }
        tank.fishes.push(fish);
        let offers = local_offers(&tank);
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].file_id, FileId::from("f-local"));
    }

    #[tokio::test(start_paused = true)]
    async fn sender_pauses_until_drained() {
        let (mut mgr, mut rx) = manager();
        let db = Database::open_in_memory().unwrap();
        db.store_file(&blob(&[5u8; 48])).unwrap();
        let out = FakeSender::default();
        out.link.buffered.store(1_000, Ordering::Relaxed);

        mgr.handle_message(
            &bob(),
            FileMessage::Request {
                file_id: FileId::from("file-1"),
                transfer_id: "ft-x".into(),
            },
            &db,
            &out,
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(out.link.frames().is_empty());

        out.link.buffered.store(0, Ordering::Relaxed);
        out.link.drained.notify_waiters();
        until_finished(&mut rx, &mut mgr, &out).await;
        assert_eq!(out.link.frames().len(), 3 + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_drain_times_out_and_continues() {
        let (mut mgr, mut rx) = manager();
        let db = Database::open_in_memory().unwrap();
        db.store_file(&blob(&[5u8; 32])).unwrap();
        let out = FakeSender::default();
        out.link.buffered.store(1_000, Ordering::Relaxed);

        let started = tokio::time::Instant::now();
        mgr.handle_message(
            &bob(),
            FileMessage::Request {
                file_id: FileId::from("file-1"),
                transfer_id: "ft-y".into(),
            },
            &db,
            &out,
        );
        until_finished(&mut rx, &mut mgr, &out).await;
        assert_eq!(out.link.frames().len(), 2 + 1);
        assert!(started.elapsed() >= Duration::from_secs(4));
    }
}
