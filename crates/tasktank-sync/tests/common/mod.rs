//! Simulated devices sharing in-process relays and links.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

use tasktank_link::MemoryLinkNetwork;
use tasktank_net::MemoryRelayNetwork;
use tasktank_shared::models::{Fish, Tank};
use tasktank_shared::types::{DeviceId, Permission, TankId};
use tasktank_store::Database;
use tasktank_sync::{spawn_engine, PeerStatus, SyncConfig, SyncDeps, SyncHandle};

pub const RELAYS: [&str; 2] = ["mem://one", "mem://two"];

pub struct Harness {
    pub relays: MemoryRelayNetwork,
    pub links: MemoryLinkNetwork,
}

pub struct Device {
    pub id: DeviceId,
    pub handle: SyncHandle,
}

pub fn config(name: &str) -> SyncConfig {
    SyncConfig {
        relays: RELAYS.iter().map(|r| r.to_string()).collect(),
        device_name: name.to_string(),
        rank_relays: false,
        ..SyncConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self {
            relays: MemoryRelayNetwork::new(),
            links: MemoryLinkNetwork::new(),
        }
    }

    pub fn device(&self, name: &str, tanks: impl FnOnce(&DeviceId) -> Vec<Tank>) -> Device {
        self.device_with(name, |_| {}, tanks)
    }

    pub fn device_with(
        &self,
        name: &str,
        tweak: impl FnOnce(&mut SyncConfig),
        tanks: impl FnOnce(&DeviceId) -> Vec<Tank>,
    ) -> Device {
        let mut config = config(name);
        tweak(&mut config);
        self.spawn(config, Database::open_in_memory().expect("open db"), tanks)
    }

    /// A device whose database lives at `path`, so it can be restarted.
    pub fn device_at(
        &self,
        name: &str,
        path: &Path,
        tanks: impl FnOnce(&DeviceId) -> Vec<Tank>,
    ) -> Device {
        let db = Database::open_at(path).expect("open db");
        self.spawn(config(name), db, tanks)
    }

    fn spawn(
        &self,
        config: SyncConfig,
        db: Database,
        tanks: impl FnOnce(&DeviceId) -> Vec<Tank>,
    ) -> Device {
        let id = db.device_id().expect("device id");
        let tanks = tanks(&id);
        let handle = spawn_engine(
            config,
            SyncDeps {
                db,
                relays: Arc::new(self.relays.connector()),
                links: Arc::new(self.links.clone()),
                tanks,
            },
        )
        .expect("spawn engine");
        Device { id, handle }
    }
}

pub fn groceries(owner: &DeviceId) -> Tank {
    let mut tank = Tank::new("Groceries", owner);
    tank.fishes.push(Fish::new("Milk"));
    tank.fishes.push(Fish::new("Bread"));
    tank
}

pub async fn eventually<T>(mut rx: watch::Receiver<T>, what: &str, pred: impl FnMut(&T) -> bool) {
    match timeout(Duration::from_secs(120), rx.wait_for(pred)).await {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => panic!("engine stopped while waiting for {what}"),
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

pub fn find_tank<'a>(tanks: &'a [Tank], id: &TankId) -> Option<&'a Tank> {
    tanks.iter().find(|t| &t.id == id)
}

pub fn has_fish(tanks: &[Tank], id: &TankId, task: &str) -> bool {
    find_tank(tanks, id)
        .map(|t| t.fishes.iter().any(|f| f.task == task))
        .unwrap_or(false)
}

pub async fn edit(device: &Device, tank_id: &TankId, f: impl FnOnce(&mut Tank)) {
    let mut tanks = device.handle.current_tanks();
    if let Some(tank) = tanks.iter_mut().find(|t| &t.id == tank_id) {
        f(tank);
    }
    device.handle.update_tanks(tanks).await.expect("update tanks");
}

/// Share A's first tank with B and wait until both know about each other.
pub async fn share(a: &Device, b: &Device, permission: Permission, relay_only: bool) -> TankId {
    let tank_id = a.handle.current_tanks()[0].id.clone();
    let code = a
        .handle
        .generate_share_code(&tank_id, permission, Some("Phone".into()), relay_only)
        .await
        .expect("share code");
    let joined = b.handle.accept_pair(&code).await.expect("accept pair");
    assert_eq!(joined, tank_id);

    let b_id = b.id.clone();
    eventually(a.handle.tanks(), "joiner in peer list", |tanks| {
        find_tank(tanks, &tank_id)
            .and_then(|t| t.peer(&b_id))
            .is_some()
    })
    .await;
    tank_id
}

/// Wait until both devices report an open direct link to each other.
pub async fn linked(a: &Device, b: &Device) {
    let b_id = b.id.clone();
    eventually(a.handle.peer_status(), "direct link", |peers| {
        peers.get(&b_id) == Some(&PeerStatus::Connected)
    })
    .await;
    let a_id = a.id.clone();
    eventually(b.handle.peer_status(), "direct link on the other side", |peers| {
        peers.get(&a_id) == Some(&PeerStatus::Connected)
    })
    .await;
}
