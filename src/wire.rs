//! On-wire packet types shared by the peers and the relay.
//!
//! Two framings coexist. Relay control messages are textual tagged records
//! (JSON) exchanged between a peer and the relay while a room is being set
//! up. Peer packets are a compact binary encoding, one type byte followed by
//! a type-specific body, tunneled through the relay as opaque payloads.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};
use crate::{HASH_SIZE, MAX_FRAME_SIZE, SEED_SIZE, TAG_SIZE};

/// Longest accepted file basename, in bytes.
pub const MAX_NAME_LEN: usize = 255;
/// Longest accepted abort reason, in bytes.
pub const MAX_REASON_LEN: usize = 1024;
/// Most entries a single file list may carry.
pub const MAX_LIST_ENTRIES: u64 = 65_536;

const TAG_HANDSHAKE: u8 = 1;
const TAG_HANDSHAKE_RESPONSE: u8 = 2;
const TAG_LIST: u8 = 3;
const TAG_APPROVE: u8 = 4;
const TAG_ABORT: u8 = 5;
const TAG_CHUNK: u8 = 6;
const TAG_FILE_END: u8 = 7;
const TAG_TRANSFER_END: u8 = 8;
const TAG_ACK: u8 = 9;
const TAG_PROGRESS: u8 = 10;

/// One file offered by the sender. The index of an entry is its position in
/// the list packet, so indices are dense in `[0..N)` by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

/// The peer-to-peer message types. The relay never sees these decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerPacket {
    Handshake {
        version: u16,
        session_seed: [u8; SEED_SIZE],
    },
    HandshakeResponse {
        accepted_version: u16,
    },
    List {
        entries: Vec<FileEntry>,
    },
    Approve,
    Abort {
        reason: String,
    },
    Chunk {
        file_index: u64,
        offset: u64,
        cipher: Vec<u8>,
        tag: [u8; TAG_SIZE],
    },
    FileEnd {
        file_index: u64,
        file_hash: [u8; HASH_SIZE],
    },
    TransferEnd,
    Ack {
        file_index: u64,
    },
    Progress {
        file_index: u64,
        bytes_done: u64,
        bytes_total: u64,
    },
}

impl PeerPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            PeerPacket::Handshake {
                version,
                session_seed,
            } => {
                buf.push(TAG_HANDSHAKE);
                buf.extend_from_slice(&version.to_be_bytes());
                buf.extend_from_slice(session_seed);
            }
            PeerPacket::HandshakeResponse { accepted_version } => {
                buf.push(TAG_HANDSHAKE_RESPONSE);
                buf.extend_from_slice(&accepted_version.to_be_bytes());
            }
            PeerPacket::List { entries } => {
                buf.push(TAG_LIST);
                write_varint(&mut buf, entries.len() as u64);
                for entry in entries {
                    write_varint(&mut buf, entry.name.len() as u64);
                    buf.extend_from_slice(entry.name.as_bytes());
                    buf.extend_from_slice(&entry.size.to_be_bytes());
                }
            }
            PeerPacket::Approve => buf.push(TAG_APPROVE),
            PeerPacket::Abort { reason } => {
                buf.push(TAG_ABORT);
                write_varint(&mut buf, reason.len() as u64);
                buf.extend_from_slice(reason.as_bytes());
            }
            PeerPacket::Chunk {
                file_index,
                offset,
                cipher,
                tag,
            } => {
                buf.push(TAG_CHUNK);
                write_varint(&mut buf, *file_index);
                buf.extend_from_slice(&offset.to_be_bytes());
                write_varint(&mut buf, cipher.len() as u64);
                buf.extend_from_slice(cipher);
                buf.extend_from_slice(tag);
            }
            PeerPacket::FileEnd {
                file_index,
                file_hash,
            } => {
                buf.push(TAG_FILE_END);
                write_varint(&mut buf, *file_index);
                buf.extend_from_slice(file_hash);
            }
            PeerPacket::TransferEnd => buf.push(TAG_TRANSFER_END),
            PeerPacket::Ack { file_index } => {
                buf.push(TAG_ACK);
                write_varint(&mut buf, *file_index);
            }
            PeerPacket::Progress {
                file_index,
                bytes_done,
                bytes_total,
            } => {
                buf.push(TAG_PROGRESS);
                write_varint(&mut buf, *file_index);
                buf.extend_from_slice(&bytes_done.to_be_bytes());
                buf.extend_from_slice(&bytes_total.to_be_bytes());
            }
        }
        buf
    }

    /// Decode one packet from a complete frame body. Decoding is total: any
    /// leftover or missing bytes fail with `MalformedFrame`, never a partial
    /// packet.
    pub fn decode(bytes: &[u8]) -> Result<PeerPacket> {
        let mut cur = bytes;
        let tag = read_u8(&mut cur)?;

        let packet = match tag {
            TAG_HANDSHAKE => PeerPacket::Handshake {
                version: read_u16(&mut cur)?,
                session_seed: read_array::<SEED_SIZE>(&mut cur)?,
            },
            TAG_HANDSHAKE_RESPONSE => PeerPacket::HandshakeResponse {
                accepted_version: read_u16(&mut cur)?,
            },
            TAG_LIST => {
                let count = read_varint(&mut cur)?;
                if count > MAX_LIST_ENTRIES {
                    return Err(malformed(format!("list announces {count} entries")));
                }
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let name = read_string(&mut cur, MAX_NAME_LEN)?;
                    let size = read_u64(&mut cur)?;
                    entries.push(FileEntry { name, size });
                }
                PeerPacket::List { entries }
            }
            TAG_APPROVE => PeerPacket::Approve,
            TAG_ABORT => PeerPacket::Abort {
                reason: read_string(&mut cur, MAX_REASON_LEN)?,
            },
            TAG_CHUNK => {
                let file_index = read_varint(&mut cur)?;
                let offset = read_u64(&mut cur)?;
                let cipher_len = read_varint(&mut cur)? as usize;
                if cipher_len > MAX_FRAME_SIZE {
                    return Err(malformed(format!(
                        "chunk length {cipher_len} exceeds the frame ceiling"
                    )));
                }
                let cipher = take(&mut cur, cipher_len)?.to_vec();
                let tag = read_array::<TAG_SIZE>(&mut cur)?;
                PeerPacket::Chunk {
                    file_index,
                    offset,
                    cipher,
                    tag,
                }
            }
            TAG_FILE_END => PeerPacket::FileEnd {
                file_index: read_varint(&mut cur)?,
                file_hash: read_array::<HASH_SIZE>(&mut cur)?,
            },
            TAG_TRANSFER_END => PeerPacket::TransferEnd,
            TAG_ACK => PeerPacket::Ack {
                file_index: read_varint(&mut cur)?,
            },
            TAG_PROGRESS => PeerPacket::Progress {
                file_index: read_varint(&mut cur)?,
                bytes_done: read_u64(&mut cur)?,
                bytes_total: read_u64(&mut cur)?,
            },
            other => return Err(malformed(format!("unknown packet tag {other}"))),
        };

        if !cur.is_empty() {
            return Err(malformed(format!(
                "{} trailing bytes after packet body",
                cur.len()
            )));
        }

        Ok(packet)
    }
}

/// Which side of the transfer a peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Sender,
    Receiver,
}

impl PeerRole {
    pub fn opposite(self) -> PeerRole {
        match self {
            PeerRole::Sender => PeerRole::Receiver,
            PeerRole::Receiver => PeerRole::Sender,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeerRole::Sender => "sender",
            PeerRole::Receiver => "receiver",
        }
    }
}

/// Outcome of a join request, as reported to the joining peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinStatus {
    Ok,
    NameInUse,
    NoSuchTransfer,
    AlreadyPaired,
}

impl JoinStatus {
    pub fn into_result(self) -> Result<()> {
        match self {
            JoinStatus::Ok => Ok(()),
            JoinStatus::NameInUse => Err(TransferError::NameInUse),
            JoinStatus::NoSuchTransfer => Err(TransferError::NoSuchTransfer),
            JoinStatus::AlreadyPaired => Err(TransferError::AlreadyPaired),
        }
    }
}

/// Control traffic between a peer and the relay. Once a room is paired the
/// only control message still exchanged is `Leave`; everything else on the
/// connection is an opaque payload frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ControlMessage {
    Join { role: PeerRole, name: String },
    JoinAck { status: JoinStatus },
    Paired,
    Leave,
}

impl ControlMessage {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("control messages always serialize")
    }

    pub fn decode(bytes: &[u8]) -> Result<ControlMessage> {
        serde_json::from_slice(bytes)
            .map_err(|error| malformed(format!("bad control message: {error}")))
    }
}

pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub fn read_varint(cur: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if shift >= 64 {
            return Err(malformed("varint is longer than 10 bytes".to_string()));
        }
        let byte = read_u8(cur)?;
        let bits = u64::from(byte & 0x7f);
        if shift == 63 && bits > 1 {
            return Err(malformed("varint overflows u64".to_string()));
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn malformed(reason: impl Into<String>) -> TransferError {
    TransferError::MalformedFrame(reason.into())
}

fn take<'a>(cur: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if cur.len() < len {
        return Err(malformed(format!(
            "truncated frame: wanted {len} bytes, {} left",
            cur.len()
        )));
    }
    let (head, rest) = cur.split_at(len);
    *cur = rest;
    Ok(head)
}

fn read_u8(cur: &mut &[u8]) -> Result<u8> {
    Ok(take(cur, 1)?[0])
}

fn read_u16(cur: &mut &[u8]) -> Result<u16> {
    let bytes = take(cur, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u64(cur: &mut &[u8]) -> Result<u64> {
    let bytes = take(cur, 8)?;
    Ok(u64::from_be_bytes(bytes.try_into().expect("8 bytes")))
}

fn read_array<const N: usize>(cur: &mut &[u8]) -> Result<[u8; N]> {
    let bytes = take(cur, N)?;
    Ok(bytes.try_into().expect("exact length"))
}

fn read_string(cur: &mut &[u8], max_len: usize) -> Result<String> {
    let len = read_varint(&mut *cur)? as usize;
    if len > max_len {
        return Err(malformed(format!("string of {len} bytes exceeds {max_len}")));
    }
    let bytes = take(cur, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| malformed("string is not UTF-8".to_string()))
}
