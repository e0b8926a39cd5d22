//! Relay-side room bookkeeping.
//!
//! One mutex guards the name→room map; every operation takes it for a short
//! critical section only. Forwarding clones the partner's sink handle under
//! the lock and performs the actual (possibly blocking) queue write after
//! releasing it, so a slow peer never stalls unrelated rooms.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, info};
use tokio::sync::mpsc;

use crate::error::{Result, TransferError};
use crate::networking::Outbound;
use crate::wire::{ControlMessage, PeerRole};

/// A peer's outbound queue as seen by the registry. Bounded, so forwarding
/// into a full queue parks the forwarding task and backpressure reaches the
/// origin socket.
pub type PeerSink = mpsc::Sender<Outbound>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    PendingReceiver,
    Paired,
    Closed,
}

struct Room {
    state: RoomState,
    sender_sink: PeerSink,
    receiver_sink: Option<PeerSink>,
}

impl Room {
    fn sink_for(&self, role: PeerRole) -> Option<&PeerSink> {
        match role {
            PeerRole::Sender => Some(&self.sender_sink),
            PeerRole::Receiver => self.receiver_sink.as_ref(),
        }
    }
}

/// Proof of room membership handed back from `join`. The embedded sink is
/// this peer's own queue and is only used to make sure a stale handle can
/// never act on a newer room that reused the same name.
pub struct RoomHandle {
    pub name: String,
    pub role: PeerRole,
    own_sink: PeerSink,
}

/// Result of a successful join. For a receiver join `partner` carries the
/// sender's sink so the caller can emit `Paired` outside the registry lock.
pub struct JoinGrant {
    pub handle: RoomHandle,
    pub partner: Option<PeerSink>,
}

#[derive(Default)]
pub struct Registry {
    rooms: Mutex<HashMap<String, Room>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Attach a peer to the room named `name`, creating it for a sender.
    pub fn join(&self, name: &str, role: PeerRole, sink: PeerSink) -> Result<JoinGrant> {
        let mut rooms = self.rooms.lock().expect("registry mutex poisoned");

        match role {
            PeerRole::Sender => match rooms.entry(name.to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(Room {
                        state: RoomState::PendingReceiver,
                        sender_sink: sink.clone(),
                        receiver_sink: None,
                    });
                    info!("room '{name}' created, waiting for a receiver");
                    Ok(JoinGrant {
                        handle: RoomHandle {
                            name: name.to_string(),
                            role,
                            own_sink: sink,
                        },
                        partner: None,
                    })
                }
                Entry::Occupied(_) => Err(TransferError::NameInUse),
            },
            PeerRole::Receiver => {
                let Some(room) = rooms.get_mut(name) else {
                    return Err(TransferError::NoSuchTransfer);
                };
                match room.state {
                    RoomState::Paired | RoomState::Closed => Err(TransferError::AlreadyPaired),
                    RoomState::PendingReceiver => {
                        room.receiver_sink = Some(sink.clone());
                        room.state = RoomState::Paired;
                        info!("room '{name}' paired");
                        Ok(JoinGrant {
                            handle: RoomHandle {
                                name: name.to_string(),
                                role,
                                own_sink: sink,
                            },
                            partner: Some(room.sender_sink.clone()),
                        })
                    }
                }
            }
        }
    }

    /// Forward one opaque frame to the other peer of the room. Best-effort:
    /// if the partner's queue is gone, the room is marked closed and the
    /// caller gets `TransportClosed`.
    pub async fn forward(&self, handle: &RoomHandle, kind: u8, body: Vec<u8>) -> Result<()> {
        let partner = {
            let mut rooms = self.rooms.lock().expect("registry mutex poisoned");
            let room = rooms
                .get_mut(&handle.name)
                .filter(|room| Self::is_member(room, handle))
                .ok_or(TransferError::TransportClosed)?;
            if room.state != RoomState::Paired {
                return Err(TransferError::UnexpectedPacket(
                    "payload frame before the room was paired",
                ));
            }
            room.sink_for(handle.role.opposite())
                .cloned()
                .ok_or(TransferError::TransportClosed)?
        };

        if partner.send(Outbound::Frame { kind, body }).await.is_err() {
            let mut rooms = self.rooms.lock().expect("registry mutex poisoned");
            if let Some(room) = rooms
                .get_mut(&handle.name)
                .filter(|room| Self::is_member(room, handle))
            {
                room.state = RoomState::Closed;
                debug!("room '{}' closed: partner queue is gone", handle.name);
            }
            return Err(TransferError::TransportClosed);
        }
        Ok(())
    }

    /// Drop this peer's membership, remove the room, and signal the partner
    /// with a close indication. Safe to call more than once.
    pub async fn leave(&self, handle: &RoomHandle) {
        let partner = {
            let mut rooms = self.rooms.lock().expect("registry mutex poisoned");
            match rooms.remove(&handle.name) {
                Some(room) if Self::is_member(&room, handle) => {
                    info!("room '{}' closed by {}", handle.name, handle.role.as_str());
                    room.sink_for(handle.role.opposite()).cloned()
                }
                Some(room) => {
                    // Someone else's room under a reused name; put it back.
                    rooms.insert(handle.name.clone(), room);
                    return;
                }
                None => return,
            }
        };

        if let Some(partner) = partner {
            let _ = partner.send(Outbound::control(&ControlMessage::Leave)).await;
            let _ = partner.send(Outbound::Close).await;
        }
    }

    /// Whether this handle still refers to this room, not to a newer room
    /// that happens to reuse the name.
    fn is_member(room: &Room, handle: &RoomHandle) -> bool {
        room.sink_for(handle.role)
            .map(|sink| sink.same_channel(&handle.own_sink))
            .unwrap_or(false)
    }

    #[cfg(test)]
    fn room_count(&self) -> usize {
        self.rooms.lock().expect("registry mutex poisoned").len()
    }
}
