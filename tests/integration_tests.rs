// End-to-end tests for the transfer system: real relay on an ephemeral port,
// real sender and receiver sessions talking through it over localhost.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::net::TcpListener;
use tokio::time::timeout;

use caesar_transfer::cryptography::{self, KeyMaterial};
use caesar_transfer::networking::{self, FrameReader, FrameWriter};
use caesar_transfer::receiver::ReceiverSession;
use caesar_transfer::relay;
use caesar_transfer::sender::SenderSession;
use caesar_transfer::wire::{FileEntry, JoinStatus, PeerPacket, PeerRole};
use caesar_transfer::{Config, TransferError, SEED_SIZE};

const WAIT: Duration = Duration::from_secs(10);

async fn spawn_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = relay::serve(listener).await;
    });
    addr.to_string()
}

fn test_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("caesar_e2e_{}_{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn config_for(relay_url: &str, destination: &Path) -> Config {
    let mut config = Config::default();
    config.relay_url = relay_url.to_string();
    config.destination_dir = destination.to_path_buf();
    config
}

/// Drive the sender-side protocol by hand up to an approved list, so tests
/// can then misbehave on the chunk stream.
async fn handshaken_fake_sender(
    relay_url: &str,
    name: &str,
    entries: Vec<FileEntry>,
) -> (FrameReader, FrameWriter, KeyMaterial, [u8; SEED_SIZE]) {
    let (mut reader, mut writer) = networking::connect_relay(relay_url).await.unwrap();
    let status = networking::join_room(&mut reader, &mut writer, PeerRole::Sender, name)
        .await
        .unwrap();
    assert_eq!(status, JoinStatus::Ok);

    timeout(WAIT, networking::await_paired(&mut reader))
        .await
        .expect("receiver should join promptly")
        .unwrap();
    let material = timeout(
        WAIT,
        networking::exchange_pake(&mut reader, &mut writer, name, PeerRole::Sender),
    )
    .await
    .expect("pake should complete promptly")
    .unwrap();

    let session_seed = [9u8; SEED_SIZE];
    writer
        .send_payload(
            &PeerPacket::Handshake {
                version: 1,
                session_seed,
            }
            .encode(),
        )
        .await
        .unwrap();
    let response = recv_packet(&mut reader).await;
    assert!(matches!(response, PeerPacket::HandshakeResponse { .. }));

    writer
        .send_payload(&PeerPacket::List { entries }.encode())
        .await
        .unwrap();
    let approval = recv_packet(&mut reader).await;
    assert!(matches!(approval, PeerPacket::Approve));

    (reader, writer, material, session_seed)
}

async fn recv_packet(reader: &mut FrameReader) -> PeerPacket {
    let body = timeout(WAIT, reader.recv_payload())
        .await
        .expect("peer should answer promptly")
        .unwrap();
    PeerPacket::decode(&body).unwrap()
}

// ============================================================================
// Happy paths
// ============================================================================

#[tokio::test]
async fn single_file_round_trips() {
    let relay_url = spawn_relay().await;
    let dir = test_dir("single");
    let destination = dir.join("out");
    std::fs::create_dir_all(&destination).unwrap();

    let source = dir.join("payload.bin");
    std::fs::write(&source, vec![b'A'; 160_000]).unwrap();

    let mut sender_config = config_for(&relay_url, &dir);
    sender_config.chunk_size = 65_536;
    let receiver_config = config_for(&relay_url, &destination);

    // The sender's progress hook fires once per chunk.
    let chunks_sent = Arc::new(AtomicUsize::new(0));
    let counter = chunks_sent.clone();

    let sender = SenderSession::new(sender_config, vec![source])
        .with_transfer_name("single-file-case")
        .with_progress(Arc::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    let receiver = ReceiverSession::new(receiver_config, "single-file-case");

    let sender_task = tokio::spawn(sender.run());
    tokio::time::sleep(Duration::from_millis(200)).await;
    let receiver_task = tokio::spawn(receiver.run());

    sender_task.await.unwrap().expect("sender should succeed");
    receiver_task.await.unwrap().expect("receiver should succeed");

    let received = std::fs::read(destination.join("payload.bin")).unwrap();
    assert_eq!(received.len(), 160_000);
    assert!(received.iter().all(|&byte| byte == b'A'));

    // 160 000 bytes in 65 536-byte chunks: two full chunks plus a tail.
    assert_eq!(chunks_sent.load(Ordering::SeqCst), 3);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn multiple_files_round_trip() {
    let relay_url = spawn_relay().await;
    let dir = test_dir("multi");
    let destination = dir.join("out");
    std::fs::create_dir_all(&destination).unwrap();

    let empty = dir.join("a.bin");
    std::fs::write(&empty, b"").unwrap();
    let tiny = dir.join("b.bin");
    std::fs::write(&tiny, [0x7Fu8]).unwrap();
    let big = dir.join("c.bin");
    let mut random_bytes = vec![0u8; 200_000];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    std::fs::write(&big, &random_bytes).unwrap();

    let sender = SenderSession::new(
        config_for(&relay_url, &dir),
        vec![empty.clone(), tiny.clone(), big.clone()],
    )
    .with_transfer_name("multi-file-case");
    let receiver = ReceiverSession::new(config_for(&relay_url, &destination), "multi-file-case");

    let sender_task = tokio::spawn(sender.run());
    tokio::time::sleep(Duration::from_millis(200)).await;
    let receiver_task = tokio::spawn(receiver.run());

    sender_task.await.unwrap().expect("sender should succeed");
    receiver_task.await.unwrap().expect("receiver should succeed");

    assert_eq!(std::fs::read(destination.join("a.bin")).unwrap(), b"");
    assert_eq!(std::fs::read(destination.join("b.bin")).unwrap(), [0x7F]);
    assert_eq!(std::fs::read(destination.join("c.bin")).unwrap(), random_bytes);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn large_file_exercises_the_credit_window() {
    let relay_url = spawn_relay().await;
    let dir = test_dir("large");
    let destination = dir.join("out");
    std::fs::create_dir_all(&destination).unwrap();

    // Six MiB: larger than the sender's 4 MiB credit window, so the
    // transfer only completes if the receiver's cumulative acks flow.
    let source = dir.join("big.bin");
    let mut payload = vec![0u8; 6 * 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);
    std::fs::write(&source, &payload).unwrap();

    let sender = SenderSession::new(config_for(&relay_url, &dir), vec![source])
        .with_transfer_name("large-file-case");
    let receiver = ReceiverSession::new(config_for(&relay_url, &destination), "large-file-case");

    let sender_task = tokio::spawn(sender.run());
    tokio::time::sleep(Duration::from_millis(200)).await;
    let receiver_task = tokio::spawn(receiver.run());

    sender_task.await.unwrap().expect("sender should succeed");
    receiver_task.await.unwrap().expect("receiver should succeed");

    assert_eq!(std::fs::read(destination.join("big.bin")).unwrap(), payload);

    let _ = std::fs::remove_dir_all(&dir);
}

// ============================================================================
// Rendezvous failures
// ============================================================================

#[tokio::test]
async fn receiver_with_wrong_name_is_turned_away() {
    let relay_url = spawn_relay().await;
    let dir = test_dir("wrong_name");
    let source = dir.join("payload.bin");
    std::fs::write(&source, b"some data").unwrap();

    let sender = SenderSession::new(config_for(&relay_url, &dir), vec![source])
        .with_transfer_name("brave-otter-lime");
    let sender_task = tokio::spawn(sender.run());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // One vowel off: a different room, and no sender ever created it.
    let receiver = ReceiverSession::new(config_for(&relay_url, &dir), "brave-otter-lima");
    let error = receiver.run().await.expect_err("join must fail");
    assert!(matches!(error, TransferError::NoSuchTransfer));

    // The sender is still parked waiting for its receiver.
    assert!(!sender_task.is_finished());
    sender_task.abort();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn second_sender_on_the_same_name_is_rejected() {
    let relay_url = spawn_relay().await;

    let (mut first_reader, mut first_writer) =
        networking::connect_relay(&relay_url).await.unwrap();
    let first = networking::join_room(&mut first_reader, &mut first_writer, PeerRole::Sender, "x-y-z")
        .await
        .unwrap();
    assert_eq!(first, JoinStatus::Ok);

    let (mut second_reader, mut second_writer) =
        networking::connect_relay(&relay_url).await.unwrap();
    let second = networking::join_room(
        &mut second_reader,
        &mut second_writer,
        PeerRole::Sender,
        "x-y-z",
    )
    .await
    .unwrap();
    assert_eq!(second, JoinStatus::NameInUse);
}

// ============================================================================
// Hostile and failing peers
// ============================================================================

#[tokio::test]
async fn tampered_chunk_aborts_and_leaves_no_file() {
    let relay_url = spawn_relay().await;
    let dir = test_dir("tamper");

    let entries = vec![FileEntry {
        name: "t.bin".to_string(),
        size: 40,
    }];
    let fake = {
        let relay_url = relay_url.clone();
        tokio::spawn(async move {
            let (reader, mut writer, material, seed) =
                handshaken_fake_sender(&relay_url, "tamper-case", entries).await;

            let (mut cipher, tag) =
                cryptography::seal_chunk(&material, &seed, 0, &[0x55u8; 40]).unwrap();
            cipher[3] ^= 0x80; // one flipped bit in transit

            writer
                .send_payload(
                    &PeerPacket::Chunk {
                        file_index: 0,
                        offset: 0,
                        cipher,
                        tag,
                    }
                    .encode(),
                )
                .await
                .unwrap();
            // Keep the connection open so the receiver's abort can route back.
            (reader, writer)
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    let receiver = ReceiverSession::new(config_for(&relay_url, &dir), "tamper-case");
    let error = receiver.run().await.expect_err("tampering must be fatal");
    assert!(matches!(error, TransferError::DecryptFailed));

    // The partial output is gone.
    assert!(!dir.join("t.bin").exists());

    // The receiver aborted toward the sender before leaving.
    let (mut reader, _writer) = fake.await.unwrap();
    let mut aborted = false;
    while let Ok(Ok(Some(frame))) = timeout(WAIT, reader.recv()).await {
        if let networking::Frame::Payload(body) = frame {
            if matches!(PeerPacket::decode(&body), Ok(PeerPacket::Abort { .. })) {
                aborted = true;
                break;
            }
        }
    }
    assert!(aborted, "receiver should signal the abort");

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn chunk_with_a_gap_is_rejected_as_out_of_order() {
    let relay_url = spawn_relay().await;
    let dir = test_dir("gap");

    let entries = vec![FileEntry {
        name: "o.bin".to_string(),
        size: 65_536,
    }];
    let fake = {
        let relay_url = relay_url.clone();
        tokio::spawn(async move {
            let (reader, mut writer, material, seed) =
                handshaken_fake_sender(&relay_url, "gap-case", entries).await;

            // First chunk claims an offset past the start of the file.
            let (cipher, tag) =
                cryptography::seal_chunk(&material, &seed, 0, &[0x11u8; 1024]).unwrap();
            writer
                .send_payload(
                    &PeerPacket::Chunk {
                        file_index: 0,
                        offset: 32_768,
                        cipher,
                        tag,
                    }
                    .encode(),
                )
                .await
                .unwrap();
            (reader, writer)
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    let receiver = ReceiverSession::new(config_for(&relay_url, &dir), "gap-case");
    let error = receiver.run().await.expect_err("a gap must be fatal");
    assert!(matches!(error, TransferError::OutOfOrderChunk { .. }));
    assert!(!dir.join("o.bin").exists());

    let _ = fake.await.unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn replayed_chunk_is_rejected_as_reuse() {
    let relay_url = spawn_relay().await;
    let dir = test_dir("replay");

    let entries = vec![FileEntry {
        name: "r.bin".to_string(),
        size: 2048,
    }];
    let fake = {
        let relay_url = relay_url.clone();
        tokio::spawn(async move {
            let (reader, mut writer, material, seed) =
                handshaken_fake_sender(&relay_url, "replay-case", entries).await;

            let (cipher, tag) =
                cryptography::seal_chunk(&material, &seed, 0, &[0x22u8; 1024]).unwrap();
            let chunk = PeerPacket::Chunk {
                file_index: 0,
                offset: 0,
                cipher,
                tag,
            }
            .encode();

            // The same bytes twice: a replayed first chunk.
            writer.send_payload(&chunk).await.unwrap();
            writer.send_payload(&chunk).await.unwrap();
            (reader, writer)
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    let receiver = ReceiverSession::new(config_for(&relay_url, &dir), "replay-case");
    let error = receiver.run().await.expect_err("a replay must be fatal");
    assert!(matches!(error, TransferError::NonceReuse));
    assert!(!dir.join("r.bin").exists());

    let _ = fake.await.unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn sender_disconnect_mid_transfer_cleans_up() {
    let relay_url = spawn_relay().await;
    let dir = test_dir("disconnect");

    let chunk = 32_768usize;
    let entries = vec![FileEntry {
        name: "d.bin".to_string(),
        size: (chunk * 5) as u64,
    }];
    let fake = {
        let relay_url = relay_url.clone();
        tokio::spawn(async move {
            let (reader, mut writer, material, seed) =
                handshaken_fake_sender(&relay_url, "disconnect-case", entries).await;

            // Two of five chunks, then the plug is pulled.
            for sequence in 0..2u64 {
                let (cipher, tag) =
                    cryptography::seal_chunk(&material, &seed, sequence, &vec![0xAA; chunk])
                        .unwrap();
                writer
                    .send_payload(
                        &PeerPacket::Chunk {
                            file_index: 0,
                            offset: sequence * chunk as u64,
                            cipher,
                            tag,
                        }
                        .encode(),
                    )
                    .await
                    .unwrap();
            }
            writer.close().await;
            drop(reader);
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    let receiver = ReceiverSession::new(config_for(&relay_url, &dir), "disconnect-case");
    let error = receiver.run().await.expect_err("disconnect must be fatal");
    assert!(matches!(error, TransferError::TransportClosed));

    assert!(!dir.join("d.bin").exists(), "partial file must be removed");

    fake.await.unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn existing_destination_aborts_the_session() {
    let relay_url = spawn_relay().await;
    let dir = test_dir("conflict");
    let destination = dir.join("out");
    std::fs::create_dir_all(&destination).unwrap();

    let source = dir.join("a.bin");
    std::fs::write(&source, b"new contents").unwrap();
    // The receiver already has a file by that name.
    std::fs::write(destination.join("a.bin"), b"precious").unwrap();

    let sender = SenderSession::new(config_for(&relay_url, &dir), vec![source])
        .with_transfer_name("conflict-case");
    let receiver = ReceiverSession::new(config_for(&relay_url, &destination), "conflict-case");

    let sender_task = tokio::spawn(sender.run());
    tokio::time::sleep(Duration::from_millis(200)).await;
    let receiver_task = tokio::spawn(receiver.run());

    let receiver_error = receiver_task.await.unwrap().expect_err("conflict is fatal");
    assert!(matches!(
        receiver_error,
        TransferError::DestinationConflict(_)
    ));

    let sender_result = sender_task.await.unwrap();
    assert!(sender_result.is_err(), "sender should observe the abort");

    // The pre-existing file is untouched.
    assert_eq!(
        std::fs::read(destination.join("a.bin")).unwrap(),
        b"precious"
    );

    let _ = std::fs::remove_dir_all(&dir);
}
