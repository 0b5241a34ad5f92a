//! The sync engine task.
//!
//! One task owns every piece of sync state: the relay pool, the direct-link
//! manager, the file transfers and the tanks themselves. Local snapshots,
//! relay records, link events and timers all arrive on channels and are
//! handled one at a time, so nothing here needs a lock. Handlers never
//! await; slow work (timers, latency probes, chunk streaming) runs in
//! spawned tasks that report back through a channel.

mod group;
mod links;
mod tanks;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use tasktank_link::{LinkEvent, LinkFactory, PeerManager, PresenceTracker};
use tasktank_net::{rank_relays, RelayConnector, RelayEvent, RelayPool};
use tasktank_shared::crypto::EncKey;
use tasktank_shared::identity::AuthorIdentity;
use tasktank_shared::models::Tank;
use tasktank_shared::protocol::TankChange;
use tasktank_shared::types::{DeviceId, SyncKey, SyncStatus, TankId};
use tasktank_store::{Database, RelayCache};

use crate::config::SyncConfig;
use crate::detector::RemoteWindow;
use crate::error::Result;
use crate::handle::{SyncCommand, SyncHandle};
use crate::merge::Tombstones;
use crate::status::StatusBoard;
use crate::tank_store::{RecordClock, TankChannel};
use crate::transfer::{FileTransferManager, TransferEvent};

use self::group::GroupState;

const COMMAND_BUFFER: usize = 256;
const TANK_SUB_PREFIX: &str = "tank:";
const SIGNAL_SUB_PREFIX: &str = "sig:";

/// What the engine needs from its host.
pub struct SyncDeps {
    pub db: Database,
    pub relays: Arc<dyn RelayConnector>,
    pub links: Arc<dyn LinkFactory>,
    /// The tanks as loaded by the app.
    pub tanks: Vec<Tank>,
}

/// Wake-ups from tasks the engine spawned.
#[derive(Debug)]
enum TimerEvent {
    PushDue { tank_id: TankId, generation: u64 },
    RelaysRanked(Vec<String>),
    GraceOver,
    /// Relays came back and their stored records have had time to replay.
    Resync,
}

/// Changes waiting for a tank's relay debounce, latest per record.
#[derive(Debug, Default)]
struct PendingPush {
    generation: u64,
    changes: BTreeMap<String, TankChange>,
    /// When each slot was last edited locally, in record seconds.
    edited_at: BTreeMap<String, i64>,
}

/// A change that no relay took, kept per record slot until one does.
#[derive(Debug)]
struct Unsent {
    change: TankChange,
    /// `created_at` of the record it was last sealed into.
    stamped: i64,
    /// Published again after relays came back; dropped at the next resync.
    resent: bool,
}

/// Signaling for one encryption key, shared by every tank using it.
struct Signaling {
    author: AuthorIdentity,
    relays: Vec<String>,
    relay_only: bool,
    sub_id: String,
}

struct Inbox {
    commands: mpsc::Receiver<SyncCommand>,
    relay: mpsc::UnboundedReceiver<RelayEvent>,
    links: mpsc::UnboundedReceiver<LinkEvent>,
    transfers: mpsc::UnboundedReceiver<TransferEvent>,
    timers: mpsc::UnboundedReceiver<TimerEvent>,
}

pub(crate) struct SyncEngine {
    config: SyncConfig,
    local: DeviceId,
    db: Database,
    board: StatusBoard,
    connector: Arc<dyn RelayConnector>,
    pool: RelayPool,
    peers: PeerManager,
    transfers: FileTransferManager,
    presence: PresenceTracker,
    /// Tanks each remote device announced under a key we hold for them.
    holders: HashMap<DeviceId, HashSet<TankId>>,
    tanks: Vec<Tank>,
    keys: HashMap<TankId, SyncKey>,
    channels: HashMap<TankId, TankChannel>,
    signaling: HashMap<EncKey, Signaling>,
    group: Option<GroupState>,
    tombstones: Tombstones,
    remote_window: RemoteWindow,
    clock: RecordClock,
    pending: HashMap<TankId, PendingPush>,
    outbox: HashMap<TankId, BTreeMap<String, Unsent>>,
    next_generation: u64,
    preferred_relays: Vec<String>,
    started_at: Instant,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
}

/// Start the engine on the current tokio runtime.
pub fn spawn_engine(config: SyncConfig, deps: SyncDeps) -> Result<SyncHandle> {
    let SyncDeps {
        db,
        relays,
        links,
        tanks,
    } = deps;

    let local = db.device_id()?;
    let keys = db.load_sync_keys();
    let group = db.load_device_group();
    let (board, watch) = StatusBoard::new(tanks.clone(), group.clone());

    let (cmd_tx, commands) = mpsc::channel(COMMAND_BUFFER);
    let (relay_tx, relay) = mpsc::unbounded_channel();
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
    let (timer_tx, timers) = mpsc::unbounded_channel();

    let peers = PeerManager::new(
        local.clone(),
        links,
        link_tx,
        config.backoff_floor,
        config.backoff_ceiling,
    );
    let transfers = FileTransferManager::new((&config).into(), transfer_tx);

    let engine = SyncEngine {
        local: local.clone(),
        db,
        board,
        pool: RelayPool::new(relays.clone(), relay_tx),
        connector: relays,
        peers,
        transfers,
        presence: PresenceTracker::new(config.presence_timeout),
        holders: HashMap::new(),
        tanks,
        keys,
        channels: HashMap::new(),
        signaling: HashMap::new(),
        group: group.map(GroupState::new),
        tombstones: Tombstones::default(),
        remote_window: RemoteWindow::new(config.remote_echo_window),
        clock: RecordClock::default(),
        pending: HashMap::new(),
        outbox: HashMap::new(),
        next_generation: 0,
        preferred_relays: config.relays.clone(),
        started_at: Instant::now(),
        timer_tx,
        config,
    };

    info!(device = %local.short(), tanks = engine.keys.len(), "starting sync engine");
    tokio::spawn(engine.run(Inbox {
        commands,
        relay,
        links: link_rx,
        transfers: transfer_rx,
        timers,
    }));

    Ok(SyncHandle::new(cmd_tx, watch, local))
}

impl SyncEngine {
    async fn run(mut self, mut inbox: Inbox) {
        self.start();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut presence = tokio::time::interval(self.config.presence_check_interval);
        presence.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // --- Incoming commands ---
                cmd = inbox.commands.recv() => match cmd {
                    Some(SyncCommand::Shutdown(reply)) => {
                        info!("sync engine shutdown requested");
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        info!("all sync handles dropped, shutting down");
                        self.shutdown();
                        break;
                    }
                },

                // --- Relay records and status ---
                Some(event) = inbox.relay.recv() => self.on_relay_event(event),

                // --- Direct links ---
                Some(event) = inbox.links.recv() => {
                    let updates = self.peers.handle_event(event);
                    self.on_peer_updates(updates);
                }

                // --- File streaming tasks ---
                Some(event) = inbox.transfers.recv() => {
                    self.transfers.on_event(event, &self.peers);
                    self.publish_transfers();
                }

                // --- Timers ---
                Some(event) = inbox.timers.recv() => self.on_timer(event),
                _ = heartbeat.tick() => self.send_heartbeats(),
                _ = presence.tick() => self.expire_presence(),
            }
        }

        info!("sync engine stopped");
    }

    fn start(&mut self) {
        let now_ms = Utc::now().timestamp_millis();
        let ttl_ms = self.config.relay_cache_ttl.as_millis() as i64;
        match self.db.load_relay_cache() {
            Some(cache) if cache.is_fresh(now_ms, ttl_ms) => {
                debug!(relays = ?cache.relays, "using cached relay ranking");
                self.preferred_relays = cache.relays;
            }
            _ if self.config.rank_relays => self.spawn_ranking(),
            _ => {}
        }
        let preferred = self.preferred_relays.clone();
        self.pool.ensure(&preferred);

        let synced: Vec<TankId> = self.keys.keys().cloned().collect();
        for tank_id in synced {
            if self.tank(&tank_id).is_none() {
                warn!(tank = %tank_id.short(), "sync key for a tank that no longer exists");
                continue;
            }
            self.activate_tank(&tank_id);
        }
        self.activate_group();

        let grace = self.config.connecting_grace;
        self.spawn_timer(grace, TimerEvent::GraceOver);
        self.publish_synced();
        self.refresh_status();
    }

    fn handle_command(&mut self, cmd: SyncCommand) {
        match cmd {
            SyncCommand::UpdateTanks { tanks, reply } => {
                self.update_tanks(tanks);
                let _ = reply.send(Ok(()));
            }
            SyncCommand::ShareTank { tank_id, reply } => {
                let _ = reply.send(self.share_tank(&tank_id));
            }
            SyncCommand::JoinTank {
                tank_id,
                key,
                reply,
            } => {
                let _ = reply.send(self.join_tank(&tank_id, key, None));
            }
            SyncCommand::AcceptPair { code, reply } => {
                let _ = reply.send(self.accept_pair(&code));
            }
            SyncCommand::UnsyncTank { tank_id, reply } => {
                let _ = reply.send(self.unsync_tank(&tank_id));
            }
            SyncCommand::UpdatePeer {
                tank_id,
                device_id,
                info,
                reply,
            } => {
                let _ = reply.send(self.update_peer(&tank_id, device_id, info));
            }
            SyncCommand::GenerateShareCode {
                tank_id,
                permission,
                recipient_name,
                relay_only,
                reply,
            } => {
                let result = self.generate_share_code(&tank_id, permission, recipient_name, relay_only);
                let _ = reply.send(result);
            }
            SyncCommand::AttachFile {
                tank_id,
                fish_id,
                name,
                mime_type,
                data,
                reply,
            } => {
                let result = self.attach_file(&tank_id, &fish_id, name, mime_type, data);
                let _ = reply.send(result);
            }
            SyncCommand::RequestFile {
                tank_id,
                fish_id,
                file_id,
                reply,
            } => {
                let _ = reply.send(self.request_file(&tank_id, &fish_id, &file_id));
            }
            SyncCommand::PairDevice { device_name, reply } => {
                let _ = reply.send(self.pair_device(device_name));
            }
            SyncCommand::AcceptDevicePair { code, reply } => {
                let _ = reply.send(self.accept_device_pair(&code));
            }
            SyncCommand::UnpairDevice { reply } => {
                let _ = reply.send(self.unpair_device());
            }
            SyncCommand::SetVisible(visible) => {
                if visible {
                    debug!("app visible again");
                    self.peers.set_visible(true);
                    self.send_heartbeats();
                }
            }
            // Handled by the run loop.
            SyncCommand::Shutdown(_) => {}
        }
    }

    // -----------------------------------------------------------------------
    // Relay events
    // -----------------------------------------------------------------------

    fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Record {
                relay,
                sub_id,
                record,
            } => {
                if let Some(tank_id) = sub_id.strip_prefix(TANK_SUB_PREFIX) {
                    self.on_tank_record(&TankId::from(tank_id), &record);
                } else if sub_id.starts_with(SIGNAL_SUB_PREFIX) {
                    // Signals fan out from every relay; act on the first copy.
                    if self.pool.first_sighting(&record.id) {
                        self.on_signal_record(&sub_id, &record);
                    }
                } else if group::is_group_sub(&sub_id) {
                    self.on_group_record(&record);
                } else {
                    trace!(relay = %relay, sub = %sub_id, "record for unknown subscription");
                }
            }
            RelayEvent::Status { relay, connected } => {
                let reachable = self.pool.on_status(&relay, connected);
                if connected {
                    // Before the relay's replay is merged, so newer local
                    // edits are not rolled back by it.
                    self.flush_outbox();
                }
                if reachable {
                    info!(relay = %relay, "relays reachable");
                    let delay = self.config.debounce_fast;
                    self.spawn_timer(delay, TimerEvent::Resync);
                }
                self.refresh_status();
            }
            RelayEvent::PublishResult {
                relay,
                id,
                accepted,
                message,
            } => {
                if !accepted {
                    warn!(relay = %relay, id = %id, message = %message, "relay rejected record");
                }
            }
            RelayEvent::Eose { relay, sub_id } => {
                trace!(relay = %relay, sub = %sub_id, "stored records replayed");
            }
            RelayEvent::Notice { relay, message } => {
                debug!(relay = %relay, message = %message, "relay notice");
            }
        }
    }

    /// Relays came back: restate what this device is responsible for, once
    /// the replay has been merged. Tanks edited while no relay was reachable
    /// are restated in full whoever owns them.
    fn resync(&mut self) {
        self.flush_outbox();
        let dirty: HashSet<TankId> = self
            .outbox
            .iter()
            .filter(|(_, slots)| slots.values().any(|u| u.resent))
            .map(|(tank_id, _)| tank_id.clone())
            .collect();
        let synced: Vec<TankId> = self.channels.keys().cloned().collect();
        for tank_id in synced {
            let owned = self
                .tank(&tank_id)
                .map(|t| t.is_owned_by(&self.local))
                .unwrap_or(false);
            if owned || dirty.contains(&tank_id) {
                self.push_full_tank(&tank_id);
            }
            self.publish_own_peer_info(&tank_id, None, None);
        }
        for slots in self.outbox.values_mut() {
            slots.retain(|_, unsent| !unsent.resent);
        }
        self.outbox.retain(|_, slots| !slots.is_empty());
        self.send_heartbeats();
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn spawn_timer(&self, delay: Duration, event: TimerEvent) {
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }

    fn spawn_ranking(&self) {
        let connector = self.connector.clone();
        let candidates = self.config.relays.clone();
        let top_n = self.config.relay_top_n;
        let timeout = self.config.relay_probe_timeout;
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            let ranked = rank_relays(connector.as_ref(), &candidates, top_n, timeout).await;
            let _ = tx.send(TimerEvent::RelaysRanked(ranked));
        });
    }

    fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::PushDue {
                tank_id,
                generation,
            } => self.flush_push(&tank_id, generation),
            TimerEvent::RelaysRanked(relays) => {
                if relays.is_empty() {
                    return;
                }
                let cache = RelayCache {
                    ts: Utc::now().timestamp_millis(),
                    relays: relays.clone(),
                };
                if let Err(e) = self.db.save_relay_cache(&cache) {
                    warn!(error = %e, "failed to cache relay ranking");
                }
                self.pool.ensure(&relays);
                self.preferred_relays = relays;
            }
            TimerEvent::GraceOver => self.refresh_status(),
            TimerEvent::Resync => {
                debug!(tanks = self.channels.len(), "resyncing with relays");
                self.resync();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    fn tank(&self, tank_id: &TankId) -> Option<&Tank> {
        self.tanks.iter().find(|t| &t.id == tank_id)
    }

    fn tank_mut(&mut self, tank_id: &TankId) -> Option<&mut Tank> {
        self.tanks.iter_mut().find(|t| &t.id == tank_id)
    }

    /// A key's own relays, or the preferred list when it names none.
    fn relays_for(&self, key: &SyncKey) -> Vec<String> {
        if key.relays.is_empty() {
            self.preferred_relays.clone()
        } else {
            key.relays.clone()
        }
    }

    fn save_keys(&self) {
        if let Err(e) = self.db.save_sync_keys(&self.keys) {
            warn!(error = %e, "failed to persist sync keys");
        }
    }

    fn now_rfc3339() -> String {
        Utc::now().to_rfc3339()
    }

    fn publish_tanks(&self) {
        self.board.tanks.send_replace(self.tanks.clone());
    }

    fn publish_synced(&self) {
        let synced: BTreeSet<TankId> = self.keys.keys().cloned().collect();
        self.board.set_synced(synced);
    }

    fn publish_transfers(&self) {
        self.board.set_transfers(self.transfers.progress().clone());
    }

    fn refresh_status(&self) {
        let status = if self.keys.is_empty() && self.group.is_none() {
            SyncStatus::Off
        } else {
            match self.pool.status() {
                SyncStatus::Disconnected if self.started_at.elapsed() < self.config.connecting_grace => {
                    SyncStatus::Connecting
                }
                other => other,
            }
        };
        self.board.set_status(status);
    }

    fn shutdown(&mut self) {
        let due: Vec<TankId> = self.pending.keys().cloned().collect();
        for tank_id in due {
            if let Some(pending) = self.pending.remove(&tank_id) {
                self.publish_changes(&tank_id, pending.changes.into_values());
            }
        }
        self.transfers.shutdown();
        self.peers.close_all();
        self.pool.close_all();
        self.board.set_status(SyncStatus::Off);
    }
}
