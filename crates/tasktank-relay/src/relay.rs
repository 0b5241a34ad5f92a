//! Record retention and subscription fan-out.
//!
//! All connections share one [`RelayState`]: a [`RecordStore`] for what is
//! retained and a broadcast channel carrying every accepted record to the
//! live subscriptions of every connection. Each connection drives a
//! [`Session`] that turns client frames into relay frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, trace};

use tasktank_net::{RecordStore, StoreOutcome};
use tasktank_shared::record::{Record, RecordFilter};
use tasktank_shared::wire::{ClientFrame, RelayFrame};

use crate::config::RelayServerConfig;
use crate::error::RelayServerError;

#[derive(Clone)]
pub struct RelayState {
    store: Arc<Mutex<RecordStore>>,
    live: broadcast::Sender<Record>,
    connections: Arc<AtomicUsize>,
    pub config: Arc<RelayServerConfig>,
}

impl RelayState {
    pub fn new(config: RelayServerConfig) -> Self {
        let (live, _) = broadcast::channel(config.live_buffer.max(1));
        Self {
            store: Arc::new(Mutex::new(RecordStore::new())),
            live,
            connections: Arc::new(AtomicUsize::new(0)),
            config: Arc::new(config),
        }
    }

    /// Verify, retain and fan out one record.
    pub async fn ingest(&self, record: Record) -> Result<StoreOutcome, RelayServerError> {
        record.verify()?;
        let outcome = self.store.lock().await.accept(record.clone());
        if outcome.should_broadcast() {
            // No receivers just means nobody is connected.
            let _ = self.live.send(record);
        }
        Ok(outcome)
    }

    pub async fn query(&self, filters: &[RecordFilter]) -> Vec<Record> {
        self.store.lock().await.query(filters)
    }

    pub async fn stored(&self) -> usize {
        self.store.lock().await.len()
    }

    pub fn subscribe_live(&self) -> broadcast::Receiver<Record> {
        self.live.subscribe()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub(crate) fn connection_opened(&self) -> usize {
        self.connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn connection_closed(&self) -> usize {
        self.connections.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }
}

/// One client connection's subscriptions.
pub struct Session {
    state: RelayState,
    peer: String,
    subs: HashMap<String, Vec<RecordFilter>>,
}

impl Session {
    pub fn new(state: RelayState, peer: impl Into<String>) -> Self {
        Self {
            state,
            peer: peer.into(),
            subs: HashMap::new(),
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.len()
    }

    /// Frames to send back for one text frame from the client.
    pub async fn handle_text(&mut self, text: &str) -> Vec<RelayFrame> {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "unparseable client frame");
                return vec![RelayFrame::Notice(
                    RelayServerError::BadFrame(e.to_string()).to_string(),
                )];
            }
        };

        match frame {
            ClientFrame::Event(record) => vec![self.on_event(record, text.len()).await],
            ClientFrame::Req { sub_id, filters } => self.on_req(sub_id, filters).await,
            ClientFrame::Close(sub_id) => {
                if self.subs.remove(&sub_id).is_some() {
                    trace!(peer = %self.peer, sub = %sub_id, "subscription closed");
                }
                Vec::new()
            }
        }
    }

    async fn on_event(&self, record: Record, frame_len: usize) -> RelayFrame {
        let id = record.id.clone();
        let max = self.state.config.max_record_size;
        if frame_len > max {
            debug!(peer = %self.peer, id = %id, size = frame_len, "record too large");
            return RelayFrame::Ok {
                id,
                accepted: false,
                message: RelayServerError::TooLarge { size: frame_len, max }.to_string(),
            };
        }

        match self.state.ingest(record).await {
            Ok(outcome) => {
                trace!(peer = %self.peer, id = %id, ?outcome, "record ingested");
                let message = match outcome {
                    StoreOutcome::Duplicate => "duplicate: already have this record",
                    StoreOutcome::Stale => "duplicate: a newer record is stored",
                    _ => "",
                };
                RelayFrame::Ok {
                    id,
                    accepted: true,
                    message: message.to_string(),
                }
            }
            Err(e) => {
                debug!(peer = %self.peer, id = %id, error = %e, "record refused");
                RelayFrame::Ok {
                    id,
                    accepted: false,
                    message: e.to_string(),
                }
            }
        }
    }

    async fn on_req(&mut self, sub_id: String, filters: Vec<RecordFilter>) -> Vec<RelayFrame> {
        let max = self.state.config.max_subscriptions;
        if !self.subs.contains_key(&sub_id) && self.subs.len() >= max {
            return vec![RelayFrame::Notice(
                RelayServerError::TooManySubscriptions(max).to_string(),
            )];
        }

        let mut frames: Vec<RelayFrame> = self
            .state
            .query(&filters)
            .await
            .into_iter()
            .map(|record| RelayFrame::Event {
                sub_id: sub_id.clone(),
                record,
            })
            .collect();
        debug!(peer = %self.peer, sub = %sub_id, stored = frames.len(), "subscription opened");
        frames.push(RelayFrame::Eose(sub_id.clone()));
        self.subs.insert(sub_id, filters);
        frames
    }

    /// EVENT frames for a freshly accepted record, one per matching
    /// subscription.
    pub fn on_live(&self, record: &Record) -> Vec<RelayFrame> {
        let mut matching: Vec<&String> = self
            .subs
            .iter()
            .filter(|(_, filters)| filters.iter().any(|f| f.matches(record)))
            .map(|(sub_id, _)| sub_id)
            .collect();
        matching.sort();
        matching
            .into_iter()
            .map(|sub_id| RelayFrame::Event {
                sub_id: sub_id.clone(),
                record: record.clone(),
            })
            .collect()
    }
}
