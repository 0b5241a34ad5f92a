//! WebSocket relay client.
//!
//! Each connection runs in its own tokio task that reconnects with
//! exponential backoff and re-sends its subscriptions after every reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use tasktank_shared::record::{Record, RecordFilter};
use tasktank_shared::wire::{ClientFrame, RelayFrame};

use crate::relay::{RelayConnection, RelayConnector, RelayError, RelayEvent};

/// Reconnect and timeout settings for WebSocket relays.
#[derive(Debug, Clone)]
pub struct WsRelayConfig {
    pub connect_timeout: Duration,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for WsRelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            initial_reconnect_delay: Duration::from_secs(2),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
enum WsCommand {
    Publish(Record),
    Subscribe(String, Vec<RecordFilter>),
    Unsubscribe(String),
    Close,
}

/// Opens WebSocket connections to relays.
#[derive(Debug, Clone, Default)]
pub struct WsRelayConnector {
    config: WsRelayConfig,
}

impl WsRelayConnector {
    pub fn new(config: WsRelayConfig) -> Self {
        Self { config }
    }
}

impl RelayConnector for WsRelayConnector {
    fn connect(
        &self,
        url: &str,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Arc<dyn RelayConnection> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        tokio::spawn(connection_loop(
            url.to_string(),
            self.config.clone(),
            cmd_rx,
            events,
            connected.clone(),
        ));

        Arc::new(WsRelayConnection {
            url: url.to_string(),
            cmd_tx,
            connected,
        })
    }

    fn probe(&self, url: &str, timeout: Duration) -> BoxFuture<'static, Result<Duration, RelayError>> {
        let url = url.to_string();
        Box::pin(async move {
            let started = Instant::now();
            match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
                Ok(Ok((mut ws, _))) => {
                    let elapsed = started.elapsed();
                    let _ = ws.close(None).await;
                    Ok(elapsed)
                }
                Ok(Err(e)) => Err(RelayError::Connect {
                    url,
                    reason: e.to_string(),
                }),
                Err(_) => Err(RelayError::Timeout(url)),
            }
        })
    }
}

struct WsRelayConnection {
    url: String,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    connected: Arc<AtomicBool>,
}

impl WsRelayConnection {
    fn send(&self, cmd: WsCommand) {
        if self.cmd_tx.send(cmd).is_err() {
            debug!(relay = %self.url, "relay task gone, command dropped");
        }
    }
}

impl RelayConnection for WsRelayConnection {
    fn url(&self) -> &str {
        &self.url
    }

    fn publish(&self, record: Record) {
        self.send(WsCommand::Publish(record));
    }

    fn subscribe(&self, sub_id: &str, filters: Vec<RecordFilter>) {
        self.send(WsCommand::Subscribe(sub_id.to_string(), filters));
    }

    fn unsubscribe(&self, sub_id: &str) {
        self.send(WsCommand::Unsubscribe(sub_id.to_string()));
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.send(WsCommand::Close);
    }
}

impl Drop for WsRelayConnection {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WsCommand::Close);
    }
}

/// What ended a connected session.
enum SessionEnd {
    Closed,
    Dropped,
}

async fn connection_loop(
    url: String,
    config: WsRelayConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    events: mpsc::UnboundedSender<RelayEvent>,
    connected: Arc<AtomicBool>,
) {
    let mut subs: HashMap<String, Vec<RecordFilter>> = HashMap::new();
    let mut delay = config.initial_reconnect_delay;

    loop {
        match tokio::time::timeout(config.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws, _))) => {
                info!(relay = %url, "relay connected");
                delay = config.initial_reconnect_delay;
                connected.store(true, Ordering::Relaxed);
                let _ = events.send(RelayEvent::Status {
                    relay: url.clone(),
                    connected: true,
                });

                let end = run_session(&url, ws, &mut subs, &mut cmd_rx, &events).await;

                connected.store(false, Ordering::Relaxed);
                let _ = events.send(RelayEvent::Status {
                    relay: url.clone(),
                    connected: false,
                });
                if matches!(end, SessionEnd::Closed) {
                    debug!(relay = %url, "relay connection closed");
                    return;
                }
                warn!(relay = %url, "relay connection dropped");
            }
            Ok(Err(e)) => {
                warn!(relay = %url, error = %e, retry_in = ?delay, "relay connect failed");
                let _ = events.send(RelayEvent::Status {
                    relay: url.clone(),
                    connected: false,
                });
            }
            Err(_) => {
                warn!(relay = %url, retry_in = ?delay, "relay connect timed out");
                let _ = events.send(RelayEvent::Status {
                    relay: url.clone(),
                    connected: false,
                });
            }
        }

        // Wait before reconnecting; keep subscription bookkeeping current.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(WsCommand::Close) => return,
                    Some(WsCommand::Subscribe(id, filters)) => {
                        subs.insert(id, filters);
                    }
                    Some(WsCommand::Unsubscribe(id)) => {
                        subs.remove(&id);
                    }
                    Some(WsCommand::Publish(record)) => {
                        debug!(relay = %url, id = %record.id, "relay offline, dropping publish");
                    }
                },
            }
        }
        delay = (delay * 2).min(config.max_reconnect_delay);
    }
}

async fn run_session<S>(
    url: &str,
    ws: tokio_tungstenite::WebSocketStream<S>,
    subs: &mut HashMap<String, Vec<RecordFilter>>,
    cmd_rx: &mut mpsc::UnboundedReceiver<WsCommand>,
    events: &mpsc::UnboundedSender<RelayEvent>,
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();

    for (sub_id, filters) in subs.iter() {
        let frame = ClientFrame::Req {
            sub_id: sub_id.clone(),
            filters: filters.clone(),
        };
        if write.send(Message::Text(frame.to_json())).await.is_err() {
            return SessionEnd::Dropped;
        }
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let frame = match cmd {
                    None | Some(WsCommand::Close) => {
                        let _ = write.close().await;
                        return SessionEnd::Closed;
                    }
                    Some(WsCommand::Publish(record)) => ClientFrame::Event(record),
                    Some(WsCommand::Subscribe(id, filters)) => {
                        subs.insert(id.clone(), filters.clone());
                        ClientFrame::Req { sub_id: id, filters }
                    }
                    Some(WsCommand::Unsubscribe(id)) => {
                        if subs.remove(&id).is_none() {
                            continue;
                        }
                        ClientFrame::Close(id)
                    }
                };
                if let Err(e) = write.send(Message::Text(frame.to_json())).await {
                    debug!(relay = %url, error = %e, "relay write failed");
                    return SessionEnd::Dropped;
                }
            }

            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_frame(url, &text, events),
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                Some(Err(e)) => {
                    debug!(relay = %url, error = %e, "relay read failed");
                    return SessionEnd::Dropped;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

fn handle_frame(url: &str, text: &str, events: &mpsc::UnboundedSender<RelayEvent>) {
    let frame = match RelayFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            trace!(relay = %url, error = %e, "ignoring unparseable relay frame");
            return;
        }
    };

    let event = match frame {
        RelayFrame::Event { sub_id, record } => {
            if let Err(e) = record.verify() {
                trace!(relay = %url, id = %record.id, error = %e, "dropping unverifiable record");
                return;
            }
            RelayEvent::Record {
                relay: url.to_string(),
                sub_id,
                record,
            }
        }
        RelayFrame::Eose(sub_id) => RelayEvent::Eose {
            relay: url.to_string(),
            sub_id,
        },
        RelayFrame::Ok {
            id,
            accepted,
            message,
        } => RelayEvent::PublishResult {
            relay: url.to_string(),
            id,
            accepted,
            message,
        },
        RelayFrame::Notice(message) => RelayEvent::Notice {
            relay: url.to_string(),
            message,
        },
    };
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasktank_shared::crypto::EncKey;
    use tasktank_shared::identity::AuthorIdentity;

    #[test]
    fn event_frames_become_record_events() {
        let author = AuthorIdentity::derive(&EncKey::from_bytes([1u8; 32]));
        let record = Record::replaceable(&author, "s:m", "c".into());
        let text = RelayFrame::Event {
            sub_id: "s1".into(),
            record: record.clone(),
        }
        .to_json();

        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_frame("wss://r", &text, &tx);
        match rx.try_recv().unwrap() {
            RelayEvent::Record { sub_id, record: r, .. } => {
                assert_eq!(sub_id, "s1");
                assert_eq!(r, record);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unverifiable_records_are_dropped() {
        let author = AuthorIdentity::derive(&EncKey::from_bytes([1u8; 32]));
        let mut record = Record::replaceable(&author, "s:m", "c".into());
        record.sig = "00".repeat(64);
        let text = RelayFrame::Event {
            sub_id: "s1".into(),
            record,
        }
        .to_json();

        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_frame("wss://r", &text, &tx);
        handle_frame("wss://r", "not json", &tx);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unreachable_relay_reports_disconnected() {
        let connector = WsRelayConnector::new(WsRelayConfig {
            connect_timeout: Duration::from_millis(200),
            ..WsRelayConfig::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = connector.connect("ws://127.0.0.1:1", tx);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, RelayEvent::Status { connected: false, .. }));
        assert!(!conn.is_connected());
        conn.close();
    }
}
