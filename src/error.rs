use std::path::PathBuf;

use thiserror::Error;

/// Every way a transfer can fail. All variants are fatal to the session that
/// raised them; the session coordinator translates them into a best-effort
/// `Abort` packet toward the peer and a structured result to the caller.
#[derive(Debug, Error)]
pub enum TransferError {
    // Transport
    #[error("failed to connect: {0}")]
    ConnectFailed(#[source] std::io::Error),
    #[error("transport closed unexpectedly")]
    TransportClosed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    // Relay control
    #[error("transfer name is already in use")]
    NameInUse,
    #[error("no transfer with that name")]
    NoSuchTransfer,
    #[error("transfer already has both peers")]
    AlreadyPaired,
    #[error("relay rejected the request: {0}")]
    BadRequest(String),

    // Protocol
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unsupported protocol version {0}")]
    UnknownVersion(u16),
    #[error("unexpected packet: {0}")]
    UnexpectedPacket(&'static str),
    #[error("chunk repeats already-received bytes")]
    NonceReuse,
    #[error("chunk out of order: expected offset {expected}, got {got}")]
    OutOfOrderChunk { expected: u64, got: u64 },
    #[error("session aborted: {0}")]
    SessionAborted(String),

    // Crypto
    #[error("key agreement failed, transfer names likely differ")]
    KeyMismatch,
    #[error("chunk failed authenticated decryption")]
    DecryptFailed,

    // Filesystem
    #[error("destination already exists: {0}")]
    DestinationConflict(PathBuf),
    #[error("failed to read source file: {0}")]
    ReadFailed(#[source] std::io::Error),
    #[error("failed to write destination file: {0}")]
    WriteFailed(#[source] std::io::Error),
    #[error("file size mismatch: announced {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("file hash mismatch for '{0}'")]
    HashMismatch(String),

    // Policy
    #[error("could not allocate an unused transfer name")]
    NameAllocationFailed,
    #[error("announced transfer of {announced} bytes exceeds the {limit} byte ceiling")]
    ListTooLarge { announced: u64, limit: u64 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, TransferError>;
