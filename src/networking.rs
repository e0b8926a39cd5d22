//! Framed message transport and the client side of the relay protocol.
//!
//! TCP gives a byte stream, so every message is framed as a `u32` big-endian
//! length followed by a one-byte frame kind and the body. Control frames
//! carry the textual relay messages; payload frames are opaque to the relay
//! and carry PAKE messages and peer packets end-to-end.

use std::io::ErrorKind;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::cryptography::{self, KeyMaterial};
use crate::error::{Result, TransferError};
use crate::wire::{ControlMessage, JoinStatus, PeerPacket, PeerRole};
use crate::{JOIN_TIMEOUT, MAX_FRAME_SIZE, OUTBOUND_QUEUE_CAPACITY};

pub const FRAME_CONTROL: u8 = 0;
pub const FRAME_PAYLOAD: u8 = 1;

/// One decoded inbound frame.
#[derive(Debug)]
pub enum Frame {
    Control(ControlMessage),
    Payload(Vec<u8>),
}

/// One queued outbound frame, or the instruction to close the socket.
#[derive(Debug)]
pub enum Outbound {
    Frame { kind: u8, body: Vec<u8> },
    Close,
}

impl Outbound {
    pub fn control(message: &ControlMessage) -> Outbound {
        Outbound::Frame {
            kind: FRAME_CONTROL,
            body: message.encode(),
        }
    }

    pub fn packet(packet: &PeerPacket) -> Outbound {
        Outbound::Frame {
            kind: FRAME_PAYLOAD,
            body: packet.encode(),
        }
    }
}

pub struct FrameReader {
    inner: OwnedReadHalf,
}

pub struct FrameWriter {
    inner: OwnedWriteHalf,
    closed: bool,
}

pub fn split(stream: TcpStream) -> (FrameReader, FrameWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        FrameReader { inner: read_half },
        FrameWriter {
            inner: write_half,
            closed: false,
        },
    )
}

impl FrameReader {
    /// Receive the next raw frame as `(kind, body)`.
    ///
    /// Returns `Ok(None)` on a clean close at a frame boundary; a close in
    /// the middle of a frame is `TransportClosed`.
    pub async fn recv_raw(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        let len = match self.inner.read_u32().await {
            Ok(len) => len as usize,
            Err(error) if error.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(_) => return Err(TransferError::TransportClosed),
        };

        if len == 0 {
            return Err(TransferError::MalformedFrame("zero-length frame".to_string()));
        }
        if len > MAX_FRAME_SIZE + 1 {
            return Err(TransferError::MalformedFrame(format!(
                "frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte ceiling"
            )));
        }

        let mut frame = vec![0u8; len];
        self.inner
            .read_exact(&mut frame)
            .await
            .map_err(|_| TransferError::TransportClosed)?;

        let body = frame.split_off(1);
        Ok(Some((frame[0], body)))
    }

    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        match self.recv_raw().await? {
            None => Ok(None),
            Some((FRAME_CONTROL, body)) => Ok(Some(Frame::Control(ControlMessage::decode(&body)?))),
            Some((FRAME_PAYLOAD, body)) => Ok(Some(Frame::Payload(body))),
            Some((kind, _)) => Err(TransferError::MalformedFrame(format!(
                "unknown frame kind {kind}"
            ))),
        }
    }

    /// Receive the next opaque payload. A `Leave` or a close here means the
    /// peer is gone.
    pub async fn recv_payload(&mut self) -> Result<Vec<u8>> {
        match self.recv().await? {
            Some(Frame::Payload(body)) => Ok(body),
            Some(Frame::Control(ControlMessage::Leave)) | None => {
                Err(TransferError::TransportClosed)
            }
            Some(Frame::Control(_)) => Err(TransferError::UnexpectedPacket(
                "control message while expecting a payload",
            )),
        }
    }
}

impl FrameWriter {
    pub async fn send_raw(&mut self, kind: u8, body: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TransferError::TransportClosed);
        }
        if body.len() > MAX_FRAME_SIZE {
            return Err(TransferError::MalformedFrame(format!(
                "refusing to send a {} byte frame",
                body.len()
            )));
        }

        let len = (body.len() + 1) as u32;
        self.inner
            .write_u32(len)
            .await
            .map_err(|_| TransferError::TransportClosed)?;
        self.inner
            .write_u8(kind)
            .await
            .map_err(|_| TransferError::TransportClosed)?;
        self.inner
            .write_all(body)
            .await
            .map_err(|_| TransferError::TransportClosed)?;
        self.inner
            .flush()
            .await
            .map_err(|_| TransferError::TransportClosed)?;
        Ok(())
    }

    pub async fn send_control(&mut self, message: &ControlMessage) -> Result<()> {
        self.send_raw(FRAME_CONTROL, &message.encode()).await
    }

    pub async fn send_payload(&mut self, body: &[u8]) -> Result<()> {
        self.send_raw(FRAME_PAYLOAD, body).await
    }

    /// Close the write side. Calling this on an already-closed writer is a
    /// no-op.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.inner.shutdown().await;
        }
    }
}

pub fn outbound_channel() -> (mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
    mpsc::channel(OUTBOUND_QUEUE_CAPACITY)
}

/// The per-connection write task: drains the outbound queue to the socket
/// until the queue closes, a `Close` is queued, or the socket dies.
pub async fn writer_task(mut writer: FrameWriter, mut queue: mpsc::Receiver<Outbound>) {
    while let Some(outbound) = queue.recv().await {
        match outbound {
            Outbound::Frame { kind, body } => {
                if let Err(error) = writer.send_raw(kind, &body).await {
                    debug!("write task stopping: {error}");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    writer.close().await;
}

/// What a session's network-read task reports to its pipeline task.
#[derive(Debug)]
pub enum PeerEvent {
    Packet(PeerPacket),
    /// The peer (or the relay on its behalf) left the room, or the
    /// connection closed cleanly.
    Left,
    /// The connection or the codec failed; the session is over.
    Fault(TransferError),
}

/// The per-session network-read task: decodes payload frames into peer
/// packets and feeds them to the pipeline task. Ends on the first fault,
/// leave, or close.
pub async fn peer_reader_task(mut reader: FrameReader, events: mpsc::Sender<PeerEvent>) {
    loop {
        match reader.recv().await {
            Ok(Some(Frame::Payload(body))) => match PeerPacket::decode(&body) {
                Ok(packet) => {
                    if events.send(PeerEvent::Packet(packet)).await.is_err() {
                        return;
                    }
                }
                Err(error) => {
                    let _ = events.send(PeerEvent::Fault(error)).await;
                    return;
                }
            },
            Ok(Some(Frame::Control(ControlMessage::Leave))) | Ok(None) => {
                let _ = events.send(PeerEvent::Left).await;
                return;
            }
            Ok(Some(Frame::Control(_))) => {
                let _ = events
                    .send(PeerEvent::Fault(TransferError::UnexpectedPacket(
                        "control message inside an established session",
                    )))
                    .await;
                return;
            }
            Err(error) => {
                let _ = events.send(PeerEvent::Fault(error)).await;
                return;
            }
        }
    }
}

/// Wait for the next peer packet, bounding the wait with `deadline`.
pub async fn next_packet(
    events: &mut mpsc::Receiver<PeerEvent>,
    deadline: std::time::Duration,
    what: &'static str,
) -> Result<PeerPacket> {
    match timeout(deadline, events.recv())
        .await
        .map_err(|_| TransferError::Timeout(what))?
    {
        Some(PeerEvent::Packet(packet)) => Ok(packet),
        Some(PeerEvent::Left) | None => Err(TransferError::TransportClosed),
        Some(PeerEvent::Fault(error)) => Err(error),
    }
}

pub async fn connect_relay(relay_url: &str) -> Result<(FrameReader, FrameWriter)> {
    let stream = TcpStream::connect(relay_url)
        .await
        .map_err(TransferError::ConnectFailed)?;
    // Chunks are flushed per frame; coalescing only adds latency.
    let _ = stream.set_nodelay(true);
    debug!("connected to relay at {relay_url}");
    Ok(split(stream))
}

/// Announce ourselves to the relay and wait for its verdict.
pub async fn join_room(
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    role: PeerRole,
    name: &str,
) -> Result<JoinStatus> {
    writer
        .send_control(&ControlMessage::Join {
            role,
            name: name.to_string(),
        })
        .await?;

    let answer = timeout(JOIN_TIMEOUT, reader.recv())
        .await
        .map_err(|_| TransferError::Timeout("join acknowledgement"))??;

    match answer {
        Some(Frame::Control(ControlMessage::JoinAck { status })) => Ok(status),
        Some(_) => Err(TransferError::UnexpectedPacket(
            "expected a join acknowledgement",
        )),
        None => Err(TransferError::TransportClosed),
    }
}

/// Sender side: block until the relay reports that the receiver has joined.
/// The caller bounds this wait with the PAKE deadline.
pub async fn await_paired(reader: &mut FrameReader) -> Result<()> {
    match reader.recv().await? {
        Some(Frame::Control(ControlMessage::Paired)) => Ok(()),
        Some(_) => Err(TransferError::UnexpectedPacket(
            "expected a pairing notification",
        )),
        None => Err(TransferError::TransportClosed),
    }
}

/// Run the password-authenticated key agreement end-to-end, including the
/// key-confirmation round. Both sides call this with their own role; the
/// exchange is symmetric, so neither blocks on the other's send.
pub async fn exchange_pake(
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    transfer_name: &str,
    role: PeerRole,
) -> Result<KeyMaterial> {
    let (state, first_message) = cryptography::start_pake(transfer_name);
    writer.send_payload(&first_message).await?;
    let peer_message = reader.recv_payload().await?;
    let material = cryptography::finish_pake(state, &peer_message)?;

    let tag = cryptography::confirmation_tag(&material, role);
    writer.send_payload(&tag).await?;
    let peer_tag = reader.recv_payload().await?;
    cryptography::verify_confirmation(&material, role.opposite(), &peer_tag)?;

    debug!("key agreement complete as {}", role.as_str());
    Ok(material)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let (a, b) = socket_pair().await;
        let (_ar, mut aw) = split(a);
        let (mut br, _bw) = split(b);

        aw.send_payload(b"opaque bytes").await.unwrap();
        aw.send_control(&ControlMessage::Leave).await.unwrap();

        match br.recv().await.unwrap() {
            Some(Frame::Payload(body)) => assert_eq!(body, b"opaque bytes"),
            other => panic!("expected payload, got {other:?}"),
        }
        match br.recv().await.unwrap() {
            Some(Frame::Control(ControlMessage::Leave)) => {}
            other => panic!("expected leave, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (a, b) = socket_pair().await;
        let (_ar, mut aw) = split(a);
        let (mut br, _bw) = split(b);

        aw.close().await;
        assert!(matches!(br.recv().await, Ok(None)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (a, _b) = socket_pair().await;
        let (_reader, mut writer) = split(a);

        writer.close().await;
        writer.close().await;
        assert!(matches!(
            writer.send_payload(b"x").await,
            Err(TransferError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_sending() {
        let (a, _b) = socket_pair().await;
        let (_reader, mut writer) = split(a);

        let body = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            writer.send_payload(&body).await,
            Err(TransferError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn unknown_frame_kind_is_malformed() {
        let (a, b) = socket_pair().await;
        let (_ar, mut aw) = split(a);
        let (mut br, _bw) = split(b);

        aw.send_raw(9, b"???").await.unwrap();
        assert!(matches!(
            br.recv().await,
            Err(TransferError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn pake_exchange_agrees_over_sockets() {
        let (a, b) = socket_pair().await;
        let (mut ar, mut aw) = split(a);
        let (mut br, mut bw) = split(b);

        let sender = tokio::spawn(async move {
            exchange_pake(&mut ar, &mut aw, "brave-otter-lime", PeerRole::Sender).await
        });
        let receiver = tokio::spawn(async move {
            exchange_pake(&mut br, &mut bw, "brave-otter-lime", PeerRole::Receiver).await
        });

        sender.await.unwrap().expect("sender side agrees");
        receiver.await.unwrap().expect("receiver side agrees");
    }

    #[tokio::test]
    async fn pake_exchange_detects_name_mismatch() {
        let (a, b) = socket_pair().await;
        let (mut ar, mut aw) = split(a);
        let (mut br, mut bw) = split(b);

        let sender = tokio::spawn(async move {
            exchange_pake(&mut ar, &mut aw, "brave-otter-lime", PeerRole::Sender).await
        });
        let receiver = tokio::spawn(async move {
            exchange_pake(&mut br, &mut bw, "brave-otter-lima", PeerRole::Receiver).await
        });

        let sender_result = sender.await.unwrap();
        let receiver_result = receiver.await.unwrap();
        assert!(sender_result.is_err() || receiver_result.is_err());
        for result in [sender_result, receiver_result] {
            if let Err(error) = result {
                assert!(matches!(error, TransferError::KeyMismatch));
            }
        }
    }
}
