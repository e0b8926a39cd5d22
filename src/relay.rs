//! The relay rendezvous service.
//!
//! Each accepted connection runs a reader loop on its own task plus a writer
//! task draining the peer's outbound queue. A connection moves through
//! `AwaitingJoin → Joined → Forwarding → Closed`; every transition is
//! logged. The relay never parses payload frames, never retries a transport
//! error, and persists nothing: any anomaly simply closes the room.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::error::{Result, TransferError};
use crate::networking::{self, Frame, FrameReader, Outbound, FRAME_CONTROL};
use crate::registry::{JoinGrant, PeerSink, Registry};
use crate::wire::{ControlMessage, JoinStatus};
use crate::JOIN_TIMEOUT;

/// Joins allowed from one source address inside the sliding window. Online
/// guessing of transfer names has to get through this gate.
const JOIN_LIMIT: usize = 30;
const JOIN_WINDOW: Duration = Duration::from_secs(60);

struct JoinRateLimiter {
    attempts: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl JoinRateLimiter {
    fn new() -> JoinRateLimiter {
        JoinRateLimiter {
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn allow(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut attempts = self.attempts.lock().expect("rate limiter mutex poisoned");
        let stamps = attempts.entry(ip).or_default();
        stamps.retain(|stamp| now.duration_since(*stamp) < JOIN_WINDOW);
        if stamps.len() >= JOIN_LIMIT {
            return false;
        }
        stamps.push(now);
        true
    }
}

/// Bind and serve until a shutdown signal arrives.
pub async fn run(listen_addr: &str, port: u16) -> Result<()> {
    let bind_addr = format!("{listen_addr}:{port}");
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(TransferError::ConnectFailed)?;
    info!("relay listening on {bind_addr}");
    serve(listener).await
}

/// Accept loop over an already-bound listener. Split out from `run` so tests
/// can serve on an ephemeral port.
pub async fn serve(listener: TcpListener) -> Result<()> {
    let registry = Arc::new(Registry::new());
    let limiter = Arc::new(JoinRateLimiter::new());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted.map_err(TransferError::ConnectFailed)?;
                debug!("{addr}: connected");
                tokio::spawn(handle_connection(
                    stream,
                    addr,
                    registry.clone(),
                    limiter.clone(),
                ));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, relay stopping");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<Registry>,
    limiter: Arc<JoinRateLimiter>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = networking::split(stream);
    let (sink, outbound_rx) = networking::outbound_channel();
    tokio::spawn(networking::writer_task(writer, outbound_rx));

    debug!("{addr}: AwaitingJoin");
    let grant = match await_join(&mut reader, addr, &registry, &limiter, &sink).await {
        Ok(Some(grant)) => grant,
        Ok(None) => {
            debug!("{addr}: left before joining");
            let _ = sink.send(Outbound::Close).await;
            return;
        }
        Err(error) => {
            debug!("{addr}: closed during join: {error}");
            let _ = sink.send(Outbound::Close).await;
            return;
        }
    };

    let handle = grant.handle;
    info!(
        "{addr}: Joined('{}', {})",
        handle.name,
        handle.role.as_str()
    );

    // A receiver join pairs the room; tell the waiting sender. This happens
    // before this task reads any payload, so `Paired` always precedes the
    // receiver's first forwarded frame at the sender.
    if let Some(partner) = grant.partner {
        let _ = partner.send(Outbound::control(&ControlMessage::Paired)).await;
    }

    loop {
        match reader.recv_raw().await {
            Ok(Some((FRAME_CONTROL, body))) => match ControlMessage::decode(&body) {
                Ok(ControlMessage::Leave) => {
                    debug!("{addr}: Leave");
                    break;
                }
                Ok(message) => {
                    warn!("{addr}: unexpected control message {message:?}");
                    break;
                }
                Err(error) => {
                    warn!("{addr}: bad control message: {error}");
                    break;
                }
            },
            Ok(Some((kind, body))) => {
                if let Err(error) = registry.forward(&handle, kind, body).await {
                    debug!("{addr}: forwarding stopped: {error}");
                    break;
                }
            }
            Ok(None) => {
                debug!("{addr}: disconnected");
                break;
            }
            Err(error) => {
                warn!("{addr}: read failed: {error}");
                break;
            }
        }
    }

    registry.leave(&handle).await;
    let _ = sink.send(Outbound::Close).await;
    info!("{addr}: Closed('{}')", handle.name);
}

/// The AwaitingJoin state. A join with a taken or unknown name answers with
/// the matching status and stays here so the peer can retry with another
/// name; anything that is not a join closes the connection.
async fn await_join(
    reader: &mut FrameReader,
    addr: SocketAddr,
    registry: &Registry,
    limiter: &JoinRateLimiter,
    sink: &PeerSink,
) -> Result<Option<JoinGrant>> {
    loop {
        let frame = timeout(JOIN_TIMEOUT, reader.recv())
            .await
            .map_err(|_| TransferError::Timeout("join request"))??;

        let (role, name) = match frame {
            None => return Ok(None),
            Some(Frame::Control(ControlMessage::Join { role, name })) => (role, name),
            Some(Frame::Control(ControlMessage::Leave)) => return Ok(None),
            Some(_) => {
                return Err(TransferError::BadRequest(
                    "expected a join request".to_string(),
                ))
            }
        };

        if !limiter.allow(addr.ip()) {
            warn!("{addr}: join rate limit exceeded");
            return Err(TransferError::BadRequest(
                "join rate limit exceeded".to_string(),
            ));
        }

        match registry.join(&name, role, sink.clone()) {
            Ok(grant) => {
                let _ = sink
                    .send(Outbound::control(&ControlMessage::JoinAck {
                        status: JoinStatus::Ok,
                    }))
                    .await;
                return Ok(Some(grant));
            }
            Err(error) => {
                let status = match error {
                    TransferError::NameInUse => JoinStatus::NameInUse,
                    TransferError::NoSuchTransfer => JoinStatus::NoSuchTransfer,
                    TransferError::AlreadyPaired => JoinStatus::AlreadyPaired,
                    other => return Err(other),
                };
                debug!(
                    "{addr}: join('{}', {}) rejected: {status:?}",
                    name,
                    role.as_str()
                );
                let _ = sink
                    .send(Outbound::control(&ControlMessage::JoinAck { status }))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_caps_a_burst() {
        let limiter = JoinRateLimiter::new();
        let ip: IpAddr = "203.0.113.7".parse().unwrap();

        for _ in 0..JOIN_LIMIT {
            assert!(limiter.allow(ip));
        }
        assert!(!limiter.allow(ip));
    }

    #[test]
    fn rate_limiter_tracks_addresses_independently() {
        let limiter = JoinRateLimiter::new();
        let first: IpAddr = "203.0.113.7".parse().unwrap();
        let second: IpAddr = "203.0.113.8".parse().unwrap();

        for _ in 0..JOIN_LIMIT {
            assert!(limiter.allow(first));
        }
        assert!(!limiter.allow(first));
        assert!(limiter.allow(second));
    }
}
