//! Outbound message queue in front of a data channel.
//!
//! `send` on a link must not block, so text is queued here and a writer
//! task drains it into the transport. The queue tracks how many bytes are
//! still waiting, which is what senders use for backpressure.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use crate::link::PeerLink;

#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<String>,
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    open: Arc<AtomicBool>,
}

pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<String>,
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    low_water: usize,
}

impl OutboundQueue {
    /// `low_water` is the buffered amount at or below which waiters on
    /// [`OutboundQueue::drained`] are woken.
    pub fn new(low_water: usize) -> (Self, OutboundReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(Notify::new());
        (
            Self {
                tx,
                pending: pending.clone(),
                drained: drained.clone(),
                open: Arc::new(AtomicBool::new(false)),
            },
            OutboundReceiver {
                rx,
                pending,
                drained,
                low_water,
            },
        )
    }

    /// Queue `text`. `false` when the channel is not open.
    pub fn push(&self, text: String) -> bool {
        if !self.is_open() {
            return false;
        }
        let len = text.len();
        self.pending.fetch_add(len, Ordering::AcqRel);
        if self.tx.send(text).is_err() {
            self.pending.fetch_sub(len, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub fn buffered_amount(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn drained(&self) -> Arc<Notify> {
        self.drained.clone()
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
        if !open {
            // Nobody will drain a closed channel; release waiting senders.
            self.drained.notify_waiters();
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl OutboundReceiver {
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Mark `len` bytes as handed to the transport.
    pub fn sent(&self, len: usize) {
        let before = self.pending.fetch_sub(len, Ordering::AcqRel);
        if before.saturating_sub(len) <= self.low_water {
            self.drained.notify_waiters();
        }
    }

    pub fn low_water(&self) -> usize {
        self.low_water
    }
}

/// Wait until the link's buffered amount is at most `threshold`, a drain
/// notification arrives, or `timeout` passes. Returns `false` on timeout.
pub async fn wait_for_drain(link: &dyn PeerLink, threshold: usize, timeout: Duration) -> bool {
    let drained = link.drained();
    let notified = drained.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();
    if link.buffered_amount() <= threshold {
        return true;
    }
    tokio::time::timeout(timeout, notified).await.is_ok()
}
