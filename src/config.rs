use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Result, TransferError};
use crate::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, PROTOCOL_VERSION};

/// The complete configuration surface of the core. Components take this
/// record explicitly at construction; there are no hidden globals.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where peers connect, as `host:port`.
    pub relay_url: String,
    /// Where the relay binds (relay mode only).
    pub listen_addr: String,
    /// Port the relay binds to.
    pub listen_port: u16,
    /// Sender chunk size in bytes, 16 KiB..=1 MiB.
    pub chunk_size: usize,
    /// Receiver output root.
    pub destination_dir: PathBuf,
    /// Permit overwriting existing files at the destination.
    pub overwrite: bool,
    /// Ceiling on the total announced transfer size in bytes.
    pub max_list_bytes: u64,
    /// Protocol version offered in the handshake.
    pub protocol_version: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            relay_url: "127.0.0.1:8080".to_string(),
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 8080,
            chunk_size: DEFAULT_CHUNK_SIZE,
            destination_dir: PathBuf::from("."),
            overwrite: false,
            max_list_bytes: 4 * 1024 * 1024 * 1024,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl Config {
    /// Reject option values the protocol cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size < MIN_CHUNK_SIZE || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::InvalidConfig(format!(
                "chunk_size {} outside {}..={}",
                self.chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }
        if self.relay_url.is_empty() {
            return Err(TransferError::InvalidConfig("relay_url is empty".into()));
        }
        if self.max_list_bytes == 0 {
            return Err(TransferError::InvalidConfig("max_list_bytes is zero".into()));
        }
        Ok(())
    }
}
