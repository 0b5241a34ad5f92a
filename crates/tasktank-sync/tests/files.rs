//! Attachments travelling over direct links.

mod common;

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use tasktank_shared::models::Tank;
use tasktank_shared::protocol::{FileMessage, LinkFrame};
use tasktank_shared::types::{FileId, FishId, Permission, TankId};
use tasktank_sync::SyncError;

use common::*;

fn attachment_held(tanks: &[Tank], tank_id: &TankId, file_id: &FileId) -> bool {
    find_tank(tanks, tank_id)
        .into_iter()
        .flat_map(|t| t.fishes.iter())
        .flat_map(|f| f.attachments.iter())
        .any(|a| a.file_id.as_ref() == Some(file_id) && a.has_local_blob)
}

fn first_fish(device: &Device, tank_id: &TankId) -> FishId {
    let tanks = device.handle.current_tanks();
    find_tank(&tanks, tank_id).expect("tank").fishes[0].id.clone()
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test(start_paused = true)]
async fn attachment_streams_to_linked_peer() {
    let net = Harness::new();
    let a = net.device_with("Laptop", |c| c.chunk_size = 16 * 1024, |id| vec![groceries(id)]);
    let b = net.device("Phone", |_| Vec::new());
    let tank_id = share(&a, &b, Permission::Shared, false).await;
    linked(&a, &b).await;

    let fish_id = first_fish(&a, &tank_id);
    let attachment = a
        .handle
        .attach_file(&tank_id, &fish_id, "receipt.pdf", Some("application/pdf".into()), payload(100_000))
        .await
        .expect("attach");
    assert!(attachment.has_local_blob);
    assert_eq!(attachment.size, Some(100_000));
    let file_id = attachment.file_id.clone().expect("file id");

    eventually(b.handle.tanks(), "downloaded attachment", |tanks| {
        attachment_held(tanks, &tank_id, &file_id)
    })
    .await;
    eventually(b.handle.transfers(), "transfer finished", |t| !t.contains_key(&file_id)).await;

    // Already held: nothing to fetch.
    let fetched = b
        .handle
        .request_file_from_peer(&file_id, &fish_id, &tank_id)
        .await
        .expect("request");
    assert!(!fetched);
}

#[tokio::test(start_paused = true)]
async fn corrupted_transfer_is_rejected() {
    let net = Harness::new();
    let a = net.device("Laptop", |id| vec![groceries(id)]);
    let b = net.device("Phone", |_| Vec::new());

    let a_id = a.id.clone();
    net.links.set_interceptor(move |from, text| {
        let marker = "\"data\":\"";
        match text.find(marker) {
            Some(at) if from == &a_id && text.contains("file.chunk") => {
                // Same length, different bytes.
                let start = at + marker.len();
                let mut text = text;
                text.replace_range(start..start + 4, "////");
                text
            }
            _ => text,
        }
    });

    let tank_id = share(&a, &b, Permission::Shared, false).await;
    linked(&a, &b).await;

    let fish_id = first_fish(&a, &tank_id);
    let attachment = a
        .handle
        .attach_file(&tank_id, &fish_id, "photo.jpg", None, payload(10_000))
        .await
        .expect("attach");
    let file_id = attachment.file_id.clone().expect("file id");

    eventually(b.handle.transfers(), "checksum failure", |t| {
        t.get(&file_id).and_then(|p| p.error.as_deref()) == Some("Checksum mismatch")
    })
    .await;
    assert!(!attachment_held(&b.handle.current_tanks(), &tank_id, &file_id));
}

#[tokio::test(start_paused = true)]
async fn detached_file_is_not_served() {
    let net = Harness::new();
    let a = net.device("Laptop", |id| vec![groceries(id)]);
    let b = net.device("Phone", |_| Vec::new());

    // Every frame A sends, and a file id B will ask for instead of offering.
    let (sent_tx, sent_rx) = watch::channel(Vec::<String>::new());
    let wanted: Arc<Mutex<Option<FileId>>> = Arc::default();
    let (a_id, b_id, target) = (a.id.clone(), b.id.clone(), wanted.clone());
    net.links.set_interceptor(move |from, text| {
        if from == &a_id {
            sent_tx.send_modify(|sent| sent.push(text.clone()));
            return text;
        }
        let file_id = target.lock().unwrap().clone();
        match file_id {
            Some(file_id) if from == &b_id && text.contains("file.offer") => {
                let request = FileMessage::Request {
                    file_id,
                    transfer_id: "ft-detached".into(),
                };
                LinkFrame::File(request).to_text().expect("encode")
            }
            _ => text,
        }
    });

    let tank_id = share(&a, &b, Permission::Shared, false).await;
    linked(&a, &b).await;

    let fish_id = first_fish(&a, &tank_id);
    let attachment = a
        .handle
        .attach_file(&tank_id, &fish_id, "old.txt", None, payload(64))
        .await
        .expect("attach");
    let file_id = attachment.file_id.clone().expect("file id");
    eventually(b.handle.tanks(), "attachment on B", |tanks| {
        attachment_held(tanks, &tank_id, &file_id)
    })
    .await;

    // Detaching keeps the blob on disk, but nothing references it any more.
    edit(&a, &tank_id, |t| {
        for fish in &mut t.fishes {
            fish.attachments.clear();
        }
    })
    .await;
    *wanted.lock().unwrap() = Some(file_id);

    b.handle
        .attach_file(&tank_id, &fish_id, "new.txt", None, payload(32))
        .await
        .expect("attach on B");

    eventually(sent_rx.clone(), "refusal", |sent| {
        sent.iter()
            .any(|t| t.contains("file.error") && t.contains("ft-detached"))
    })
    .await;
    assert!(!sent_rx
        .borrow()
        .iter()
        .any(|t| t.contains("file.chunk") && t.contains("ft-detached")));
}

#[tokio::test(start_paused = true)]
async fn attach_checks_limits() {
    let net = Harness::new();
    let a = net.device_with("Laptop", |c| c.max_file_size = 1024, |id| vec![groceries(id)]);
    let tank_id = a.handle.current_tanks()[0].id.clone();
    let fish_id = first_fish(&a, &tank_id);

    let too_big = a
        .handle
        .attach_file(&tank_id, &fish_id, "big.bin", None, payload(2048))
        .await;
    assert!(matches!(too_big, Err(SyncError::FileTooLarge { size: 2048, limit: 1024 })));

    let unknown = a
        .handle
        .attach_file(&tank_id, &FishId::generate(), "a.txt", None, payload(10))
        .await;
    assert!(matches!(unknown, Err(SyncError::UnknownFish(_))));

    // Unsynced tanks keep attachments locally.
    let attachment = a
        .handle
        .attach_file(&tank_id, &fish_id, "a.txt", Some("text/plain".into()), payload(10))
        .await
        .expect("attach");
    let file_id = attachment.file_id.clone().expect("file id");
    assert!(attachment_held(&a.handle.current_tanks(), &tank_id, &file_id));

    let fetched = a
        .handle
        .request_file_from_peer(&file_id, &fish_id, &tank_id)
        .await
        .expect("request");
    assert!(!fetched);
}
