//! End-to-end sync between two devices over in-process relays and links.

mod common;

use std::time::Duration;

use tokio::time::{sleep, timeout};

use tasktank_shared::models::Fish;
use tasktank_shared::types::{Permission, SyncStatus};
use tasktank_sync::PeerStatus;

use common::*;

#[tokio::test(start_paused = true)]
async fn share_and_join_converge() {
    let net = Harness::new();
    let a = net.device("Laptop", |id| vec![groceries(id)]);
    let b = net.device("Phone", |_| Vec::new());

    let tank_id = share(&a, &b, Permission::Shared, false).await;

    eventually(b.handle.tanks(), "shared fish on joiner", |tanks| {
        has_fish(tanks, &tank_id, "Milk") && has_fish(tanks, &tank_id, "Bread")
    })
    .await;

    let tanks = a.handle.current_tanks();
    let peer = find_tank(&tanks, &tank_id)
        .and_then(|t| t.peer(&b.id))
        .cloned()
        .expect("joiner listed");
    assert_eq!(peer.device_name, "Phone");
    assert_eq!(peer.permission, Permission::Shared);

    let b_tanks = b.handle.current_tanks();
    let joined = find_tank(&b_tanks, &tank_id).expect("tank on joiner");
    assert_eq!(joined.name, "Groceries");
    assert_eq!(joined.owner_id.as_ref(), Some(&a.id));
    assert_eq!(joined.my_permission, Some(Permission::Shared));
    // Two relays deliver every record; each fish still appears once.
    assert_eq!(joined.fishes.len(), 2);

    edit(&b, &tank_id, |t| t.fishes.push(Fish::new("Eggs"))).await;
    eventually(a.handle.tanks(), "joiner's fish on owner", |tanks| {
        has_fish(tanks, &tank_id, "Eggs")
    })
    .await;

    assert!(a.handle.synced_tanks().borrow().contains(&tank_id));
    eventually(b.handle.status(), "relays connected", |s| *s == SyncStatus::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn direct_link_beats_relay_debounce() {
    let net = Harness::new();
    let a = net.device("Laptop", |id| vec![groceries(id)]);
    let b = net.device("Phone", |_| Vec::new());
    let tank_id = share(&a, &b, Permission::Shared, false).await;

    linked(&a, &b).await;
    assert!(net.links.is_connected(&a.id, &b.id));

    edit(&a, &tank_id, |t| t.fishes[0].task = "Oat milk".into()).await;

    // Relay pushes wait at least the fast debounce; this lands sooner.
    let mut rx = b.handle.tanks();
    let landed = timeout(
        Duration::from_millis(200),
        rx.wait_for(|tanks| has_fish(tanks, &tank_id, "Oat milk")),
    )
    .await;
    assert!(matches!(landed, Ok(Ok(_))), "change did not arrive over the link");
}

#[tokio::test(start_paused = true)]
async fn deleted_fish_stays_deleted() {
    let net = Harness::new();
    let a = net.device("Laptop", |id| vec![groceries(id)]);
    let b = net.device("Phone", |_| Vec::new());
    let tank_id = share(&a, &b, Permission::Shared, false).await;
    eventually(b.handle.tanks(), "fish on joiner", |tanks| {
        has_fish(tanks, &tank_id, "Bread")
    })
    .await;

    let stale = b.handle.current_tanks();
    edit(&a, &tank_id, |t| t.fishes.retain(|f| f.task != "Bread")).await;
    eventually(b.handle.tanks(), "delete on joiner", |tanks| {
        !has_fish(tanks, &tank_id, "Bread")
    })
    .await;

    // A stale snapshot on B, well after the delete, still holds the fish.
    sleep(Duration::from_secs(1)).await;
    b.handle.update_tanks(stale).await.expect("stale update");
    assert!(!has_fish(&b.handle.current_tanks(), &tank_id, "Bread"));
    sleep(Duration::from_secs(5)).await;

    assert!(!has_fish(&a.handle.current_tanks(), &tank_id, "Bread"));
    assert!(has_fish(&a.handle.current_tanks(), &tank_id, "Milk"));
}

#[tokio::test(start_paused = true)]
async fn readonly_member_cannot_push() {
    let net = Harness::new();
    let a = net.device("Laptop", |id| vec![groceries(id)]);
    let b = net.device("Phone", |_| Vec::new());
    let tank_id = share(&a, &b, Permission::Readonly, false).await;
    eventually(b.handle.tanks(), "fish on viewer", |tanks| {
        has_fish(tanks, &tank_id, "Milk")
    })
    .await;

    let b_tanks = b.handle.current_tanks();
    assert_eq!(
        find_tank(&b_tanks, &tank_id).and_then(|t| t.my_permission),
        Some(Permission::Readonly)
    );

    edit(&b, &tank_id, |t| {
        t.name = "Hijacked".into();
        t.fishes.push(Fish::new("Cake"));
    })
    .await;
    sleep(Duration::from_secs(5)).await;

    let a_tanks = a.handle.current_tanks();
    let tank = find_tank(&a_tanks, &tank_id).expect("owner tank");
    assert_eq!(tank.name, "Groceries");
    assert!(!has_fish(&a_tanks, &tank_id, "Cake"));

    // The owner's edits still reach the viewer.
    edit(&a, &tank_id, |t| t.fishes.push(Fish::new("Apples"))).await;
    eventually(b.handle.tanks(), "owner edit on viewer", |tanks| {
        has_fish(tanks, &tank_id, "Apples")
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn blocked_link_falls_back_to_relays() {
    let net = Harness::new();
    let a = net.device("Laptop", |id| vec![groceries(id)]);
    let b = net.device("Phone", |_| Vec::new());
    net.links.set_blocked(&a.id, &b.id, true);

    let tank_id = share(&a, &b, Permission::Shared, false).await;
    let b_id = b.id.clone();
    eventually(a.handle.peer_status(), "relay presence", |peers| {
        peers.get(&b_id) == Some(&PeerStatus::Relay)
    })
    .await;

    edit(&a, &tank_id, |t| t.fishes.push(Fish::new("Coffee"))).await;
    eventually(b.handle.tanks(), "relay delivery", |tanks| {
        has_fish(tanks, &tank_id, "Coffee")
    })
    .await;
    assert!(!net.links.is_connected(&a.id, &b.id));
}

#[tokio::test(start_paused = true)]
async fn edits_made_offline_survive_reconnect() {
    let net = Harness::new();
    let a = net.device("Laptop", |id| vec![groceries(id)]);
    let b = net.device("Phone", |_| Vec::new());
    net.links.set_blocked(&a.id, &b.id, true);

    let tank_id = share(&a, &b, Permission::Shared, false).await;
    eventually(b.handle.tanks(), "shared fish on joiner", |tanks| {
        has_fish(tanks, &tank_id, "Milk")
    })
    .await;

    for relay in RELAYS {
        net.relays.set_online(relay, false);
    }
    eventually(a.handle.status(), "relays gone on owner", |s| *s != SyncStatus::Connected).await;
    eventually(b.handle.status(), "relays gone on joiner", |s| *s != SyncStatus::Connected).await;

    edit(&a, &tank_id, |t| {
        if let Some(fish) = t.fishes.iter_mut().find(|f| f.task == "Milk") {
            fish.task = "Oat milk".into();
        }
    })
    .await;
    // The joiner does not own the tank.
    edit(&b, &tank_id, |t| t.fishes.push(Fish::new("Jam"))).await;
    // Long past every debounce: both pushes found no relay.
    sleep(Duration::from_secs(30)).await;

    for relay in RELAYS {
        net.relays.set_online(relay, true);
    }
    for device in [&a, &b] {
        eventually(device.handle.tanks(), "both offline edits", |tanks| {
            has_fish(tanks, &tank_id, "Oat milk") && has_fish(tanks, &tank_id, "Jam")
        })
        .await;
    }

    // Replayed records from before the outage do not roll anything back.
    sleep(Duration::from_secs(30)).await;
    for device in [&a, &b] {
        let tanks = device.handle.current_tanks();
        assert!(has_fish(&tanks, &tank_id, "Oat milk"));
        assert!(!has_fish(&tanks, &tank_id, "Milk"));
        assert!(has_fish(&tanks, &tank_id, "Jam"));
    }
}

#[tokio::test(start_paused = true)]
async fn relay_only_code_never_negotiates() {
    let net = Harness::new();
    let a = net.device("Laptop", |id| vec![groceries(id)]);
    let b = net.device("Phone", |_| Vec::new());

    let tank_id = share(&a, &b, Permission::Shared, true).await;
    edit(&b, &tank_id, |t| t.fishes.push(Fish::new("Tea"))).await;
    eventually(a.handle.tanks(), "relay-only delivery", |tanks| {
        has_fish(tanks, &tank_id, "Tea")
    })
    .await;

    sleep(Duration::from_secs(60)).await;
    assert_eq!(net.links.offers_created(), 0);
    let b_id = b.id.clone();
    assert_eq!(a.handle.peer_status().borrow().get(&b_id), Some(&PeerStatus::Relay));
}

#[tokio::test(start_paused = true)]
async fn unsync_stops_updates() {
    let net = Harness::new();
    let a = net.device("Laptop", |id| vec![groceries(id)]);
    let b = net.device("Phone", |_| Vec::new());
    let tank_id = share(&a, &b, Permission::Shared, false).await;

    b.handle.unsync_tank(&tank_id).await.expect("unsync");
    assert!(!b.handle.synced_tanks().borrow().contains(&tank_id));

    let b_id = b.id.clone();
    eventually(a.handle.tanks(), "goodbye record", |tanks| {
        find_tank(tanks, &tank_id)
            .map(|t| t.peer(&b_id).is_none())
            .unwrap_or(false)
    })
    .await;

    edit(&a, &tank_id, |t| t.fishes.push(Fish::new("Late"))).await;
    sleep(Duration::from_secs(5)).await;
    assert!(!has_fish(&b.handle.current_tanks(), &tank_id, "Late"));
    // The local copy is kept.
    assert!(has_fish(&b.handle.current_tanks(), &tank_id, "Milk"));

    let again = b.handle.unsync_tank(&tank_id).await;
    assert!(again.is_err());
}
