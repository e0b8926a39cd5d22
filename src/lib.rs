pub mod config;
pub mod cryptography;
pub mod error;
pub mod networking;
pub mod receiver;
pub mod registry;
pub mod relay;
pub mod sender;
pub mod wire;
pub mod wordlist;

pub mod commands;

use std::time::Duration;

pub use config::Config;
pub use error::{Result, TransferError};

/// Progress hook invoked synchronously by the sessions after every chunk:
/// `(file_index, bytes_done, bytes_total)`. UI adaptation happens outside
/// the core.
pub type ProgressFn = std::sync::Arc<dyn Fn(u64, u64, u64) + Send + Sync>;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const HASH_SIZE: usize = 32;
pub const SEED_SIZE: usize = 32;

pub const PROTOCOL_VERSION: u16 = 1;

pub const MIN_CHUNK_SIZE: usize = 16 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Ceiling on a single framed message, ciphertext and codec overhead included.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Capacity of every per-peer outbound queue. Writers park when it fills,
/// which is what propagates backpressure from a slow socket to its producer.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Sender-side credit window: pause once this many ciphertext bytes are
/// outstanding, resume when the receiver acknowledges.
pub const MAX_UNACKED_BYTES: u64 = 4 * 1024 * 1024;
/// Receiver-side ack cadence, half the credit window so the sender never
/// stalls waiting for a credit that will not come.
pub const ACK_INTERVAL_BYTES: u64 = 2 * 1024 * 1024;

pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const PAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);
pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

/// How many fresh transfer names a sender tries before giving up with
/// `NameAllocationFailed`.
pub const NAME_RETRY_LIMIT: usize = 8;
