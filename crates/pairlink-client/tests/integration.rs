//! Integration tests for pairlink sessions
//!
//! Two or more registries talk through the in-process loopback hub: direct
//! links run over the mock direct network, relayed links through the hub.

use pairlink_client::events::{Notice, PeerEvent};
use pairlink_client::loopback::Loopback;
use pairlink_client::registry::Command;
use pairlink_core::proto::Message;
use pairlink_core::{FileContent, OutgoingFile, PeerId, ReceivedFile, SessionState, TransferSettings};
use tempfile::TempDir;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn small_direct_chunks() -> TransferSettings {
    TransferSettings {
        direct_default_chunk_size: 1024,
        direct_high_watermark: 8 * 1024,
        direct_low_watermark: 4 * 1024,
        ..TransferSettings::default()
    }
}

fn small_relay_chunks() -> TransferSettings {
    TransferSettings {
        relay_chunk_size: 1024,
        max_unconfirmed_bytes: 4 * 1024,
        ..TransferSettings::default()
    }
}

fn is_connected(lb: &Loopback, a: &PeerId, b: &PeerId) -> bool {
    let stable = |x: &PeerId, y: &PeerId| {
        lb.node(x)
            .and_then(|n| n.registry().peer(y))
            .map(|s| s.is_stable())
            .unwrap_or(false)
    };
    stable(a, b) && stable(b, a)
}

fn has_event(lb: &Loopback, node: &PeerId, pred: impl Fn(&PeerEvent) -> bool) -> bool {
    lb.node(node)
        .map(|n| n.events().iter().any(pred))
        .unwrap_or(false)
}

fn received_files(lb: &Loopback, node: &PeerId) -> Option<(Vec<ReceivedFile>, u64)> {
    lb.node(node)?.events().iter().find_map(|e| match e {
        PeerEvent::FilesReceived { files, total_size, .. } => Some((files.clone(), *total_size)),
        _ => None,
    })
}

fn state_of(lb: &Loopback, node: &PeerId, peer: &PeerId) -> Option<SessionState> {
    lb.node(node)?.registry().peer(peer).map(|s| s.state())
}

/// Connect two fresh nodes and return (sender, receiver)
async fn pair(
    lb: &mut Loopback,
    sender_rtc: bool,
    receiver_rtc: bool,
    settings: TransferSettings,
    download_dir: Option<std::path::PathBuf>,
) -> (PeerId, PeerId) {
    let sender = lb.add_node(sender_rtc, settings.clone(), None).unwrap();
    let receiver = lb.add_node(receiver_rtc, settings, download_dir).unwrap();
    lb.run_until(|lb| is_connected(lb, &sender, &receiver)).await.unwrap();
    lb.settle().await.unwrap();
    (sender, receiver)
}

/// Offer `files`, accept on the other side and wait until the sender is done
async fn transfer(lb: &mut Loopback, sender: &PeerId, receiver: &PeerId, files: Vec<OutgoingFile>) {
    lb.command(
        sender,
        Command::FilesSelected {
            to: receiver.clone(),
            files,
            thumbnail_data_url: None,
        },
    )
    .unwrap();
    lb.run_until(|lb| has_event(lb, receiver, |e| matches!(e, PeerEvent::FilesTransferRequest { .. })))
        .await
        .unwrap();
    lb.command(
        receiver,
        Command::RespondToTransferRequest {
            to: sender.clone(),
            accepted: true,
        },
    )
    .unwrap();
}

#[tokio::test]
async fn test_direct_round_trip_of_several_files() {
    let mut lb = Loopback::new(false);
    let (sender, receiver) = pair(&mut lb, true, true, small_direct_chunks(), None).await;
    assert!(lb.node(&sender).unwrap().registry().peer(&receiver).unwrap().is_direct());

    let contents = [pattern(20 * 1024 + 17, 1), Vec::new(), pattern(3000, 7)];
    let files = vec![
        OutgoingFile::from_bytes("first.bin", "application/octet-stream", contents[0].clone()),
        OutgoingFile::from_bytes("empty.txt", "text/plain", contents[1].clone()),
        OutgoingFile::from_bytes("photo.png", "image/png", contents[2].clone()),
    ];
    transfer(&mut lb, &sender, &receiver, files).await;

    lb.run_until(|lb| has_event(lb, &sender, |e| matches!(e, PeerEvent::FilesSent { .. })))
        .await
        .unwrap();
    lb.settle().await.unwrap();

    let (files, total_size) = received_files(&lb, &receiver).unwrap();
    assert_eq!(files.len(), 3);
    assert_eq!(total_size, (20 * 1024 + 17 + 3000) as u64);
    for (file, expected) in files.iter().zip(contents.iter()) {
        assert_eq!(file.bytes().await.unwrap().as_ref(), expected.as_slice());
    }
    assert_eq!(files[2].name, "photo.png");

    assert_eq!(state_of(&lb, &sender, &receiver), Some(SessionState::Idle));
    assert_eq!(state_of(&lb, &receiver, &sender), Some(SessionState::Idle));
    assert!(lb.node(&sender).unwrap().events().contains(&PeerEvent::NotifyUser(Notice::FileTransferCompleted)));
}

#[tokio::test]
async fn test_direct_drop_resumes_from_receiver_offset() {
    let mut lb = Loopback::new(false);
    let (sender, receiver) = pair(&mut lb, true, true, small_direct_chunks(), None).await;

    let data = pattern(64 * 1024, 3);
    let file = OutgoingFile::from_bytes("big.bin", "application/octet-stream", data.clone());
    transfer(&mut lb, &sender, &receiver, vec![file]).await;

    let half = data.len() as u64 / 2;
    lb.run_until(|lb| lb.network().delivered_bytes(&sender, &receiver) >= half)
        .await
        .unwrap();

    let offset = lb.network().delivered_bytes(&sender, &receiver);
    assert!(offset < data.len() as u64);
    lb.network().drop_link(&sender, &receiver);

    lb.run_until(|lb| received_files(lb, &receiver).is_some())
        .await
        .unwrap();
    lb.settle().await.unwrap();

    // Exactly one rewind, to what the receiver had when the link went down
    let resends: Vec<u64> = lb
        .node(&sender)
        .unwrap()
        .received()
        .iter()
        .filter_map(|(from, m)| match m {
            Message::ResendRequest { offset } if from == &receiver => Some(*offset),
            _ => None,
        })
        .collect();
    assert_eq!(resends, vec![offset]);

    let (files, _) = received_files(&lb, &receiver).unwrap();
    assert_eq!(files[0].bytes().await.unwrap().as_ref(), data.as_slice());
    assert!(is_connected(&lb, &sender, &receiver));
    assert!(has_event(&lb, &sender, |e| matches!(e, PeerEvent::FilesSent { .. })));
}

#[tokio::test]
async fn test_reannounce_keeps_direct_link() {
    let mut lb = Loopback::new(false);
    let (sender, receiver) = pair(&mut lb, true, true, TransferSettings::default(), None).await;
    let connecting_events = |lb: &Loopback| {
        lb.node(&sender)
            .unwrap()
            .events()
            .iter()
            .filter(|e| matches!(e, PeerEvent::PeerConnecting { .. }))
            .count()
    };
    assert_eq!(connecting_events(&lb), 1);

    lb.reannounce(&receiver).unwrap();
    lb.settle().await.unwrap();

    assert_eq!(connecting_events(&lb), 1);
    assert!(lb.network().is_linked(&sender, &receiver));
    assert!(is_connected(&lb, &sender, &receiver));
}

#[tokio::test]
async fn test_crossed_requests_decline_then_proceed() {
    let mut lb = Loopback::new(false);
    let (sender, receiver) = pair(&mut lb, true, true, TransferSettings::default(), None).await;

    let data = pattern(2048, 5);
    for (from, to, name) in [(&sender, &receiver, "mine.bin"), (&receiver, &sender, "theirs.bin")] {
        lb.command(
            from,
            Command::FilesSelected {
                to: to.clone(),
                files: vec![OutgoingFile::from_bytes(name, "application/octet-stream", data.clone())],
                thumbnail_data_url: None,
            },
        )
        .unwrap();
    }
    lb.settle().await.unwrap();
    assert_eq!(state_of(&lb, &sender, &receiver), Some(SessionState::Wait));
    assert_eq!(state_of(&lb, &receiver, &sender), Some(SessionState::Wait));

    // Accepting while our own request is open turns into a decline
    lb.command(
        &sender,
        Command::RespondToTransferRequest {
            to: receiver.clone(),
            accepted: true,
        },
    )
    .unwrap();
    lb.settle().await.unwrap();
    assert_eq!(state_of(&lb, &sender, &receiver), Some(SessionState::Wait));
    assert_eq!(state_of(&lb, &receiver, &sender), Some(SessionState::Idle));
    assert!(lb.node(&receiver).unwrap().events().contains(&PeerEvent::SetProgress {
        peer_id: sender.clone(),
        progress: 0.0,
        status: None,
    }));

    lb.command(
        &receiver,
        Command::RespondToTransferRequest {
            to: sender.clone(),
            accepted: true,
        },
    )
    .unwrap();
    lb.run_until(|lb| has_event(lb, &sender, |e| matches!(e, PeerEvent::FilesSent { .. })))
        .await
        .unwrap();
    lb.settle().await.unwrap();

    let (files, _) = received_files(&lb, &receiver).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "mine.bin");
    assert_eq!(files[0].bytes().await.unwrap().as_ref(), data.as_slice());
    assert!(received_files(&lb, &sender).is_none());
}

#[tokio::test]
async fn test_relay_text_exchange() {
    let mut lb = Loopback::new(true);
    let (sender, receiver) = pair(&mut lb, false, true, TransferSettings::default(), None).await;
    assert!(!lb.node(&sender).unwrap().registry().peer(&receiver).unwrap().is_direct());

    lb.command(
        &sender,
        Command::SendText {
            to: receiver.clone(),
            text: "Grüße über das Relay".to_string(),
        },
    )
    .unwrap();
    lb.settle().await.unwrap();

    assert!(lb.node(&receiver).unwrap().events().contains(&PeerEvent::TextReceived {
        peer_id: sender.clone(),
        text: "Grüße über das Relay".to_string(),
    }));
    assert!(lb
        .node(&sender)
        .unwrap()
        .events()
        .contains(&PeerEvent::NotifyUser(Notice::MessageTransferCompleted)));
    assert_eq!(state_of(&lb, &sender, &receiver), Some(SessionState::Idle));
}

#[tokio::test]
async fn test_relay_transfer_to_disk() {
    let downloads = TempDir::new().unwrap();
    let mut lb = Loopback::new(true);
    let (sender, receiver) = pair(
        &mut lb,
        true,
        false,
        small_relay_chunks(),
        Some(downloads.path().to_path_buf()),
    )
    .await;

    let data = pattern(10 * 1024 + 5, 9);
    let file = OutgoingFile::from_bytes("notes.txt", "text/plain", data.clone());
    transfer(&mut lb, &sender, &receiver, vec![file]).await;
    lb.run_until(|lb| has_event(lb, &sender, |e| matches!(e, PeerEvent::FilesSent { .. })))
        .await
        .unwrap();
    lb.settle().await.unwrap();

    let (files, _) = received_files(&lb, &receiver).unwrap();
    let FileContent::Disk(path) = &files[0].content else {
        panic!("expected the file on disk, got {:?}", files[0].content);
    };
    assert!(path.starts_with(downloads.path()));
    assert_eq!(std::fs::read(path).unwrap(), data);

    // The window forced the sender to wait for confirmations
    let confirmations = lb
        .node(&sender)
        .unwrap()
        .received()
        .iter()
        .filter(|(_, m)| matches!(m, Message::ReceiveConfirmation { .. }))
        .count();
    assert!(confirmations >= 4);
}

#[tokio::test]
async fn test_second_offer_while_waiting_is_not_sent() {
    let mut lb = Loopback::new(false);
    let (sender, receiver) = pair(&mut lb, true, true, TransferSettings::default(), None).await;

    for name in ["one.bin", "two.bin"] {
        lb.command(
            &sender,
            Command::FilesSelected {
                to: receiver.clone(),
                files: vec![OutgoingFile::from_bytes(name, "application/octet-stream", vec![1u8; 8])],
                thumbnail_data_url: None,
            },
        )
        .unwrap();
    }
    lb.settle().await.unwrap();

    let requests: Vec<&PeerEvent> = lb
        .node(&receiver)
        .unwrap()
        .events()
        .iter()
        .filter(|e| matches!(e, PeerEvent::FilesTransferRequest { .. }))
        .collect();
    assert_eq!(requests.len(), 1);
    assert!(matches!(
        requests[0],
        PeerEvent::FilesTransferRequest { request, .. } if request.header[0].name == "one.bin"
    ));
    assert_eq!(state_of(&lb, &sender, &receiver), Some(SessionState::Wait));

    // Declining returns the sender to idle
    lb.command(
        &receiver,
        Command::RespondToTransferRequest {
            to: sender.clone(),
            accepted: false,
        },
    )
    .unwrap();
    lb.settle().await.unwrap();
    assert_eq!(state_of(&lb, &sender, &receiver), Some(SessionState::Idle));
    assert!(lb.node(&sender).unwrap().events().contains(&PeerEvent::SetProgress {
        peer_id: receiver.clone(),
        progress: 0.0,
        status: None,
    }));
}

#[tokio::test]
async fn test_auto_accept_for_paired_peer_is_per_secret() {
    let mut lb = Loopback::new(false);
    let (sender, receiver) = pair(&mut lb, true, true, TransferSettings::default(), None).await;

    // Auto-accept for a secret the peers do not share changes nothing
    lb.command(
        &receiver,
        Command::SetAutoAccept {
            room_secret: "unrelated".to_string(),
            auto_accept: true,
        },
    )
    .unwrap();
    lb.settle().await.unwrap();
    assert!(!lb.node(&receiver).unwrap().registry().peer(&sender).unwrap().auto_accept());
}

#[tokio::test]
async fn test_disconnect_peer_reports_and_forgets() {
    let mut lb = Loopback::new(false);
    let (sender, receiver) = pair(&mut lb, true, true, TransferSettings::default(), None).await;

    lb.command(&sender, Command::DisconnectPeer(receiver.clone())).unwrap();
    lb.settle().await.unwrap();

    assert!(lb.node(&sender).unwrap().registry().peer(&receiver).is_none());
    assert!(lb.node(&sender).unwrap().events().contains(&PeerEvent::PeerDisconnected {
        peer_id: receiver.clone()
    }));
}
