//! The sender side of a session: announce a transfer, agree on a key, and
//! stream the files as encrypted chunks.

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::Config;
use crate::cryptography::{self, KeyMaterial};
use crate::error::{Result, TransferError};
use crate::networking::{self, Outbound, PeerEvent};
use crate::wire::{ControlMessage, FileEntry, PeerPacket, PeerRole};
use crate::{
    wordlist, ProgressFn, LIVENESS_TIMEOUT, MAX_UNACKED_BYTES, NAME_RETRY_LIMIT,
    OUTBOUND_QUEUE_CAPACITY, PAKE_TIMEOUT, SEED_SIZE,
};

/// Invoked once the relay has accepted a transfer name, so the caller can
/// show it to the human who relays it to the receiving side.
pub type NameFn = Arc<dyn Fn(&str) + Send + Sync>;

struct SourceFile {
    path: PathBuf,
    entry: FileEntry,
}

/// One outgoing transfer. Construct, optionally attach hooks, then `run`.
pub struct SenderSession {
    config: Config,
    paths: Vec<PathBuf>,
    transfer_name: Option<String>,
    progress: Option<ProgressFn>,
    on_name: Option<NameFn>,
}

impl SenderSession {
    pub fn new(config: Config, paths: Vec<PathBuf>) -> SenderSession {
        SenderSession {
            config,
            paths,
            transfer_name: None,
            progress: None,
            on_name: None,
        }
    }

    /// Use a caller-supplied transfer name instead of generating one. A
    /// supplied name is not retried on collision.
    pub fn with_transfer_name(mut self, name: impl Into<String>) -> SenderSession {
        self.transfer_name = Some(name.into());
        self
    }

    pub fn with_progress(mut self, hook: ProgressFn) -> SenderSession {
        self.progress = Some(hook);
        self
    }

    pub fn on_name_allocated(mut self, hook: NameFn) -> SenderSession {
        self.on_name = Some(hook);
        self
    }

    pub async fn run(self) -> Result<()> {
        self.config.validate()?;
        let files = enumerate_files(&self.paths)?;
        let total_bytes: u64 = files.iter().map(|file| file.entry.size).sum();
        debug!(
            "offering {} file(s), {} bytes total",
            files.len(),
            total_bytes
        );

        let (mut reader, mut writer) = networking::connect_relay(&self.config.relay_url).await?;
        let name = join_with_retries(&mut reader, &mut writer, self.transfer_name.as_deref()).await?;
        info!("transfer '{name}' registered with the relay");
        if let Some(hook) = &self.on_name {
            hook(&name);
        }

        // Pairing and key agreement share the PAKE deadline: a sender whose
        // receiver never shows up gives up here.
        let material = timeout(PAKE_TIMEOUT, async {
            networking::await_paired(&mut reader).await?;
            networking::exchange_pake(&mut reader, &mut writer, &name, PeerRole::Sender).await
        })
        .await
        .map_err(|_| TransferError::Timeout("key agreement"))??;

        let (outbound, outbound_rx) = networking::outbound_channel();
        tokio::spawn(networking::writer_task(writer, outbound_rx));
        let (events_tx, mut events) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        tokio::spawn(networking::peer_reader_task(reader, events_tx));

        let result = drive(
            &self.config,
            &files,
            &material,
            &outbound,
            &mut events,
            self.progress.as_ref(),
        )
        .await;

        match &result {
            Ok(()) => info!("transfer '{name}' complete"),
            Err(error) => {
                warn!("transfer '{name}' failed: {error}");
                let abort = PeerPacket::Abort {
                    reason: error.to_string(),
                };
                let _ = outbound.send(Outbound::packet(&abort)).await;
            }
        }
        let _ = outbound.send(Outbound::control(&ControlMessage::Leave)).await;
        let _ = outbound.send(Outbound::Close).await;
        // Short drain so our abort and leave reach the wire and the peer's
        // last words are consumed before the connection drops.
        if result.is_err() {
            let _ = timeout(crate::SHUTDOWN_DRAIN, async {
                while events.recv().await.is_some() {}
            })
            .await;
        }
        result
    }
}

fn enumerate_files(paths: &[PathBuf]) -> Result<Vec<SourceFile>> {
    if paths.is_empty() {
        return Err(TransferError::InvalidConfig("no files to send".to_string()));
    }

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let metadata = std::fs::metadata(path).map_err(TransferError::ReadFailed)?;
        if metadata.is_dir() {
            return Err(TransferError::ReadFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("'{}' is a directory, not a file", path.display()),
            )));
        }
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                TransferError::ReadFailed(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("'{}' has no usable file name", path.display()),
                ))
            })?;
        files.push(SourceFile {
            path: path.clone(),
            entry: FileEntry {
                name: name.to_string(),
                size: metadata.len(),
            },
        });
    }
    Ok(files)
}

/// Join as sender, regenerating auto-generated names on collision up to the
/// retry budget.
async fn join_with_retries(
    reader: &mut networking::FrameReader,
    writer: &mut networking::FrameWriter,
    requested: Option<&str>,
) -> Result<String> {
    if let Some(name) = requested {
        let status = networking::join_room(reader, writer, PeerRole::Sender, name).await?;
        status.into_result()?;
        return Ok(name.to_string());
    }

    for attempt in 1..=NAME_RETRY_LIMIT {
        let name = wordlist::generate_transfer_name();
        let status = networking::join_room(reader, writer, PeerRole::Sender, &name).await?;
        match status.into_result() {
            Ok(()) => return Ok(name),
            Err(TransferError::NameInUse) => {
                debug!("name '{name}' already in use ({attempt}/{NAME_RETRY_LIMIT})");
            }
            Err(other) => return Err(other),
        }
    }
    Err(TransferError::NameAllocationFailed)
}

async fn drive(
    config: &Config,
    files: &[SourceFile],
    material: &KeyMaterial,
    outbound: &mpsc::Sender<Outbound>,
    events: &mut mpsc::Receiver<PeerEvent>,
    progress: Option<&ProgressFn>,
) -> Result<()> {
    let mut session_seed = [0u8; SEED_SIZE];
    OsRng.fill_bytes(&mut session_seed);

    send_packet(
        outbound,
        &PeerPacket::Handshake {
            version: config.protocol_version,
            session_seed,
        },
    )
    .await?;

    match networking::next_packet(events, LIVENESS_TIMEOUT, "handshake response").await? {
        PeerPacket::HandshakeResponse { accepted_version } => {
            if accepted_version != config.protocol_version {
                return Err(TransferError::UnknownVersion(accepted_version));
            }
        }
        PeerPacket::Abort { reason } => return Err(TransferError::SessionAborted(reason)),
        _ => return Err(TransferError::UnexpectedPacket("expected a handshake response")),
    }

    let entries: Vec<FileEntry> = files.iter().map(|file| file.entry.clone()).collect();
    send_packet(outbound, &PeerPacket::List { entries }).await?;

    match networking::next_packet(events, LIVENESS_TIMEOUT, "list approval").await? {
        PeerPacket::Approve => debug!("receiver approved the file list"),
        PeerPacket::Abort { reason } => return Err(TransferError::SessionAborted(reason)),
        _ => return Err(TransferError::UnexpectedPacket("expected list approval")),
    }

    // Chunk sequence doubles as the cipher nonce counter; it never resets
    // within a session.
    let mut sequence: u64 = 0;
    let mut unacked: u64 = 0;

    for (index, source) in files.iter().enumerate() {
        let file_index = index as u64;
        let total = source.entry.size;
        let mut handle = File::open(&source.path)
            .await
            .map_err(TransferError::ReadFailed)?;
        let mut hasher = Sha256::new();
        let mut offset: u64 = 0;

        loop {
            // Credit gate: block while too much ciphertext is unacknowledged.
            while unacked > MAX_UNACKED_BYTES {
                match networking::next_packet(events, LIVENESS_TIMEOUT, "transfer credit").await? {
                    // Acks are cumulative: one ack covers everything sent
                    // before it was emitted.
                    PeerPacket::Ack { .. } => unacked = 0,
                    PeerPacket::Abort { reason } => {
                        return Err(TransferError::SessionAborted(reason))
                    }
                    PeerPacket::Progress { .. } => {}
                    _ => {
                        return Err(TransferError::UnexpectedPacket(
                            "unexpected packet while streaming chunks",
                        ))
                    }
                }
            }

            let mut buffer = vec![0u8; config.chunk_size];
            let read = read_full(&mut handle, &mut buffer)
                .await
                .map_err(TransferError::ReadFailed)?;
            if read == 0 {
                break;
            }
            buffer.truncate(read);
            hasher.update(&buffer);

            let (cipher, tag) = cryptography::seal_chunk(material, &session_seed, sequence, &buffer)?;
            sequence += 1;
            unacked += cipher.len() as u64;

            send_packet(
                outbound,
                &PeerPacket::Chunk {
                    file_index,
                    offset,
                    cipher,
                    tag,
                },
            )
            .await?;
            offset += read as u64;

            drain_pending_events(events, &mut unacked)?;

            if let Some(hook) = progress {
                hook(file_index, offset, total);
            }
            send_packet(
                outbound,
                &PeerPacket::Progress {
                    file_index,
                    bytes_done: offset,
                    bytes_total: total,
                },
            )
            .await?;
        }

        if offset != total {
            // The file shrank or grew under us; the announced list is void.
            return Err(TransferError::SizeMismatch {
                expected: total,
                actual: offset,
            });
        }

        let file_hash: [u8; 32] = hasher.finalize().into();
        send_packet(
            outbound,
            &PeerPacket::FileEnd {
                file_index,
                file_hash,
            },
        )
        .await?;
        debug!("sent '{}' ({} bytes)", source.entry.name, total);
    }

    send_packet(outbound, &PeerPacket::TransferEnd).await?;
    await_completion(events).await
}

/// Fill the buffer completely unless the file ends first, so every chunk
/// except the last is exactly the configured size.
async fn read_full(file: &mut File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = file.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// Consume whatever the receiver already sent without blocking, crediting
/// acknowledged bytes.
fn drain_pending_events(events: &mut mpsc::Receiver<PeerEvent>, unacked: &mut u64) -> Result<()> {
    loop {
        match events.try_recv() {
            Ok(PeerEvent::Packet(PeerPacket::Ack { .. })) => *unacked = 0,
            Ok(PeerEvent::Packet(PeerPacket::Abort { reason })) => {
                return Err(TransferError::SessionAborted(reason))
            }
            Ok(PeerEvent::Packet(PeerPacket::Progress { .. })) => {}
            Ok(PeerEvent::Packet(_)) => {
                return Err(TransferError::UnexpectedPacket(
                    "unexpected packet while streaming chunks",
                ))
            }
            Ok(PeerEvent::Left) => return Err(TransferError::TransportClosed),
            Ok(PeerEvent::Fault(error)) => return Err(error),
            Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                return Err(TransferError::TransportClosed)
            }
        }
    }
}

/// After `TransferEnd`: wait for the receiver's final acknowledgement and
/// its orderly leave.
async fn await_completion(events: &mut mpsc::Receiver<PeerEvent>) -> Result<()> {
    let mut acknowledged = false;
    loop {
        match timeout(LIVENESS_TIMEOUT, events.recv())
            .await
            .map_err(|_| TransferError::Timeout("final acknowledgement"))?
        {
            Some(PeerEvent::Packet(PeerPacket::Ack { .. })) => acknowledged = true,
            Some(PeerEvent::Packet(PeerPacket::Abort { reason })) => {
                return Err(TransferError::SessionAborted(reason))
            }
            Some(PeerEvent::Packet(PeerPacket::Progress { .. })) => {}
            Some(PeerEvent::Packet(_)) => {
                return Err(TransferError::UnexpectedPacket(
                    "unexpected packet at transfer end",
                ))
            }
            Some(PeerEvent::Left) | None => {
                if acknowledged {
                    return Ok(());
                }
                return Err(TransferError::TransportClosed);
            }
            Some(PeerEvent::Fault(error)) => return Err(error),
        }
    }
}

async fn send_packet(outbound: &mpsc::Sender<Outbound>, packet: &PeerPacket) -> Result<()> {
    outbound
        .send(Outbound::packet(packet))
        .await
        .map_err(|_| TransferError::TransportClosed)
}
