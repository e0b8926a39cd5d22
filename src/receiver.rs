//! The receiver side of a session: join by transfer name, agree on a key,
//! validate the offered list, then decrypt and persist the chunks.

use std::path::PathBuf;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::Config;
use crate::cryptography::{self, KeyMaterial};
use crate::error::{Result, TransferError};
use crate::networking::{self, Outbound, PeerEvent};
use crate::wire::{ControlMessage, FileEntry, PeerPacket, PeerRole};
use crate::{
    ProgressFn, ACK_INTERVAL_BYTES, HASH_SIZE, LIVENESS_TIMEOUT, OUTBOUND_QUEUE_CAPACITY,
    PAKE_TIMEOUT, SEED_SIZE,
};

/// What to do with a partially written file when the session dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    /// Remove the partial file.
    #[default]
    Delete,
    /// Keep it under a `.part` suffix.
    MarkPart,
}

/// The file currently being written, between its first chunk and its
/// `FileEnd`.
struct ActiveFile {
    file: tokio::fs::File,
    path: PathBuf,
    index: u64,
    entry: FileEntry,
    hasher: Sha256,
    written: u64,
}

/// One incoming transfer. Construct with the transfer name the sender
/// announced, then `run`.
pub struct ReceiverSession {
    config: Config,
    transfer_name: String,
    cleanup: CleanupPolicy,
    progress: Option<ProgressFn>,
}

impl ReceiverSession {
    pub fn new(config: Config, transfer_name: impl Into<String>) -> ReceiverSession {
        ReceiverSession {
            config,
            transfer_name: transfer_name.into(),
            cleanup: CleanupPolicy::default(),
            progress: None,
        }
    }

    pub fn with_cleanup(mut self, policy: CleanupPolicy) -> ReceiverSession {
        self.cleanup = policy;
        self
    }

    pub fn with_progress(mut self, hook: ProgressFn) -> ReceiverSession {
        self.progress = Some(hook);
        self
    }

    pub async fn run(self) -> Result<()> {
        self.config.validate()?;

        let (mut reader, mut writer) = networking::connect_relay(&self.config.relay_url).await?;
        let status =
            networking::join_room(&mut reader, &mut writer, PeerRole::Receiver, &self.transfer_name)
                .await?;
        status.into_result()?;
        info!("joined transfer '{}'", self.transfer_name);

        let material = timeout(
            PAKE_TIMEOUT,
            networking::exchange_pake(
                &mut reader,
                &mut writer,
                &self.transfer_name,
                PeerRole::Receiver,
            ),
        )
        .await
        .map_err(|_| TransferError::Timeout("key agreement"))??;

        let (outbound, outbound_rx) = networking::outbound_channel();
        tokio::spawn(networking::writer_task(writer, outbound_rx));
        let (events_tx, mut events) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        tokio::spawn(networking::peer_reader_task(reader, events_tx));

        let mut active: Option<ActiveFile> = None;
        let result = drive(
            &self.config,
            &material,
            &outbound,
            &mut events,
            &mut active,
            self.progress.as_ref(),
        )
        .await;

        match &result {
            Ok(()) => info!("receive of '{}' complete", self.transfer_name),
            Err(error) => {
                warn!("receive of '{}' failed: {error}", self.transfer_name);
                if let Some(partial) = active.take() {
                    cleanup_partial(partial, self.cleanup).await;
                }
                let abort = PeerPacket::Abort {
                    reason: error.to_string(),
                };
                let _ = outbound.send(Outbound::packet(&abort)).await;
            }
        }
        let _ = outbound.send(Outbound::control(&ControlMessage::Leave)).await;
        let _ = outbound.send(Outbound::Close).await;
        // Short drain so the final ack (or abort) reaches the wire before
        // the connection drops.
        let _ = timeout(crate::SHUTDOWN_DRAIN, async {
            while events.recv().await.is_some() {}
        })
        .await;
        result
    }
}

async fn drive(
    config: &Config,
    material: &KeyMaterial,
    outbound: &mpsc::Sender<Outbound>,
    events: &mut mpsc::Receiver<PeerEvent>,
    active: &mut Option<ActiveFile>,
    progress: Option<&ProgressFn>,
) -> Result<()> {
    let session_seed: [u8; SEED_SIZE] =
        match networking::next_packet(events, LIVENESS_TIMEOUT, "handshake").await? {
            PeerPacket::Handshake {
                version,
                session_seed,
            } => {
                if version != config.protocol_version {
                    return Err(TransferError::UnknownVersion(version));
                }
                send_packet(
                    outbound,
                    &PeerPacket::HandshakeResponse {
                        accepted_version: version,
                    },
                )
                .await?;
                session_seed
            }
            PeerPacket::Abort { reason } => return Err(TransferError::SessionAborted(reason)),
            _ => return Err(TransferError::UnexpectedPacket("expected a handshake")),
        };

    let entries = match networking::next_packet(events, LIVENESS_TIMEOUT, "file list").await? {
        PeerPacket::List { entries } => entries,
        PeerPacket::Abort { reason } => return Err(TransferError::SessionAborted(reason)),
        _ => return Err(TransferError::UnexpectedPacket("expected the file list")),
    };
    validate_list(&entries, config)?;
    send_packet(outbound, &PeerPacket::Approve).await?;
    info!("approved a list of {} file(s)", entries.len());

    let mut next_index: usize = 0;
    // Chunk sequence mirrors the sender's nonce counter; in-order delivery
    // keeps the two in lockstep, and any slip fails authentication.
    let mut sequence: u64 = 0;
    let mut cipher_since_ack: u64 = 0;

    loop {
        match networking::next_packet(events, LIVENESS_TIMEOUT, "transfer data").await? {
            PeerPacket::Chunk {
                file_index,
                offset,
                cipher,
                tag,
            } => {
                if active.is_none() {
                    *active =
                        Some(open_destination(config, &entries, next_index, file_index).await?);
                }
                let Some(current) = active.as_mut() else {
                    return Err(TransferError::UnexpectedPacket("no destination file open"));
                };
                if file_index != current.index {
                    return Err(TransferError::UnexpectedPacket(
                        "chunk for a file that is not open",
                    ));
                }
                if offset < current.written {
                    return Err(TransferError::NonceReuse);
                }
                if offset > current.written {
                    return Err(TransferError::OutOfOrderChunk {
                        expected: current.written,
                        got: offset,
                    });
                }

                let plain =
                    cryptography::open_chunk(material, &session_seed, sequence, &cipher, &tag)?;
                sequence += 1;

                current
                    .file
                    .write_all(&plain)
                    .await
                    .map_err(TransferError::WriteFailed)?;
                current.hasher.update(&plain);
                current.written += plain.len() as u64;
                if current.written > current.entry.size {
                    return Err(TransferError::SizeMismatch {
                        expected: current.entry.size,
                        actual: current.written,
                    });
                }

                if let Some(hook) = progress {
                    hook(file_index, current.written, current.entry.size);
                }

                cipher_since_ack += cipher.len() as u64;
                if cipher_since_ack >= ACK_INTERVAL_BYTES {
                    send_packet(outbound, &PeerPacket::Ack { file_index }).await?;
                    cipher_since_ack = 0;
                }
            }
            PeerPacket::FileEnd {
                file_index,
                file_hash,
            } => {
                if active.is_none() {
                    // A zero-byte file produces no chunks at all.
                    *active =
                        Some(open_destination(config, &entries, next_index, file_index).await?);
                }
                let Some(current) = active.as_mut() else {
                    return Err(TransferError::UnexpectedPacket("no destination file open"));
                };
                if file_index != current.index {
                    return Err(TransferError::UnexpectedPacket(
                        "file end for a file that is not open",
                    ));
                }

                current
                    .file
                    .flush()
                    .await
                    .map_err(TransferError::WriteFailed)?;
                current
                    .file
                    .sync_all()
                    .await
                    .map_err(TransferError::WriteFailed)?;

                if current.written != current.entry.size {
                    return Err(TransferError::SizeMismatch {
                        expected: current.entry.size,
                        actual: current.written,
                    });
                }
                let digest: [u8; HASH_SIZE] = current.hasher.finalize_reset().into();
                if digest != file_hash {
                    return Err(TransferError::HashMismatch(current.entry.name.clone()));
                }

                info!("received '{}' ({} bytes)", current.entry.name, current.written);
                send_packet(outbound, &PeerPacket::Ack { file_index }).await?;
                cipher_since_ack = 0;
                *active = None;
                next_index += 1;
            }
            PeerPacket::TransferEnd => {
                if active.is_some() || next_index != entries.len() {
                    return Err(TransferError::UnexpectedPacket(
                        "transfer end before every file completed",
                    ));
                }
                let last = entries.len().saturating_sub(1) as u64;
                send_packet(outbound, &PeerPacket::Ack { file_index: last }).await?;
                return Ok(());
            }
            PeerPacket::Progress {
                file_index,
                bytes_done,
                bytes_total,
            } => {
                debug!("sender heartbeat: file {file_index} at {bytes_done}/{bytes_total}");
            }
            PeerPacket::Abort { reason } => return Err(TransferError::SessionAborted(reason)),
            _ => {
                return Err(TransferError::UnexpectedPacket(
                    "unexpected packet during transfer",
                ))
            }
        }
    }
}

fn validate_list(entries: &[FileEntry], config: &Config) -> Result<()> {
    let mut total: u64 = 0;
    for entry in entries {
        sanitize_name(&entry.name)?;
        total = total
            .checked_add(entry.size)
            .ok_or(TransferError::ListTooLarge {
                announced: u64::MAX,
                limit: config.max_list_bytes,
            })?;
    }
    if total > config.max_list_bytes {
        return Err(TransferError::ListTooLarge {
            announced: total,
            limit: config.max_list_bytes,
        });
    }
    Ok(())
}

/// A file name from the wire must be a bare basename: no separators, no null
/// bytes, no traversal components.
fn sanitize_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(TransferError::MalformedFrame(format!(
            "unsafe file name {name:?}"
        )));
    }
    Ok(())
}

async fn open_destination(
    config: &Config,
    entries: &[FileEntry],
    next_index: usize,
    requested: u64,
) -> Result<ActiveFile> {
    if requested != next_index as u64 || next_index >= entries.len() {
        return Err(TransferError::UnexpectedPacket(
            "data for an unexpected file index",
        ));
    }
    let entry = entries[next_index].clone();
    let path = config.destination_dir.join(&entry.name);

    match tokio::fs::metadata(&path).await {
        Ok(_) if !config.overwrite => return Err(TransferError::DestinationConflict(path)),
        Ok(_) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(TransferError::WriteFailed(error)),
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .await
        .map_err(TransferError::WriteFailed)?;

    debug!("writing '{}'", path.display());
    Ok(ActiveFile {
        file,
        path,
        index: requested,
        entry,
        hasher: Sha256::new(),
        written: 0,
    })
}

/// Dispose of a partially written file after a fatal error, per policy.
async fn cleanup_partial(partial: ActiveFile, policy: CleanupPolicy) {
    let ActiveFile { file, path, .. } = partial;
    drop(file);

    match policy {
        CleanupPolicy::Delete => match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("removed partial file '{}'", path.display()),
            Err(error) => warn!("failed to remove partial '{}': {error}", path.display()),
        },
        CleanupPolicy::MarkPart => {
            let mut marked = path.clone().into_os_string();
            marked.push(".part");
            match tokio::fs::rename(&path, &marked).await {
                Ok(()) => info!("kept partial file as '{}.part'", path.display()),
                Err(error) => warn!("failed to mark partial '{}': {error}", path.display()),
            }
        }
    }
}

async fn send_packet(outbound: &mpsc::Sender<Outbound>, packet: &PeerPacket) -> Result<()> {
    outbound
        .send(Outbound::packet(packet))
        .await
        .map_err(|_| TransferError::TransportClosed)
}
