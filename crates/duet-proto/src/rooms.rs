//! Rendezvous rules of the relay, independent of any socket type.
//!
//! A room holds at most two participants. The registry turns each event
//! into a list of deliveries for the caller to put on the wire.

use std::collections::HashMap;

use crate::signaling::{ClientMessage, PeerId, PeerSummary, ServerMessage};

pub const ROOM_CAPACITY: usize = 2;

#[derive(Debug, Clone)]
pub struct Member<C> {
    pub peer_id: PeerId,
    pub display_name: String,
    pub participant_id: String,
    pub conn: C,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<C> {
    Send { conn: C, message: ServerMessage },
    Close { conn: C },
}

#[derive(Debug)]
pub struct RoomRegistry<C> {
    rooms: HashMap<String, Vec<Member<C>>>,
}

impl<C> Default for RoomRegistry<C> {
    fn default() -> Self {
        Self {
            rooms: HashMap::new(),
        }
    }
}

impl<C: Copy + Eq> RoomRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn members(&self, room_id: &str) -> &[Member<C>] {
        self.rooms.get(room_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn join(
        &mut self,
        room_id: &str,
        peer_id: PeerId,
        display_name: String,
        participant_id: Option<String>,
        conn: C,
    ) -> Vec<Delivery<C>> {
        let participant_id = participant_id.unwrap_or_else(|| display_name.clone());
        let members = self.rooms.entry(room_id.to_string()).or_default();
        let mut out = Vec::new();

        let rejoining = members.iter().position(|m| m.peer_id == peer_id);
        if let Some(index) = rejoining {
            // Same identity reconnecting: rebind the socket.
            let existing = &mut members[index];
            let stale = existing.conn;
            existing.conn = conn;
            existing.display_name = display_name;
            if stale != conn {
                out.push(Delivery::Close { conn: stale });
            }
        } else if let Some(index) = members
            .iter()
            .position(|m| m.participant_id == participant_id)
        {
            let old = members.remove(index);
            out.push(Delivery::Send {
                conn: old.conn,
                message: ServerMessage::Superseded {
                    by_peer_id: peer_id.clone(),
                },
            });
            out.push(Delivery::Close { conn: old.conn });
            for other in members.iter() {
                out.push(Delivery::Send {
                    conn: other.conn,
                    message: ServerMessage::PeerReplaced {
                        old_peer_id: old.peer_id.clone(),
                        new_peer_id: peer_id.clone(),
                    },
                });
            }
            members.push(Member {
                peer_id: peer_id.clone(),
                display_name,
                participant_id,
                conn,
            });
            announce_newcomer(members, &peer_id, room_id, false, &mut out);
            return out;
        } else if members.len() >= ROOM_CAPACITY {
            out.push(Delivery::Send {
                conn,
                message: ServerMessage::JoinError {
                    reason: "room is full".into(),
                },
            });
            return out;
        } else {
            members.push(Member {
                peer_id: peer_id.clone(),
                display_name,
                participant_id,
                conn,
            });
        }

        announce_newcomer(members, &peer_id, room_id, true, &mut out);
        out
    }

    /// Socket closed. Only removes the member if the socket is still the
    /// one bound to it.
    pub fn disconnect(&mut self, conn: C) -> Vec<Delivery<C>> {
        let Some((room_id, index)) = self.locate(conn) else {
            return Vec::new();
        };
        self.remove_at(&room_id, index)
    }

    pub fn leave(&mut self, conn: C, room_id: &str, peer_id: &PeerId) -> Vec<Delivery<C>> {
        let index = self
            .members(room_id)
            .iter()
            .position(|m| m.peer_id == *peer_id && m.conn == conn);
        match index {
            Some(index) => self.remove_at(room_id, index),
            None => Vec::new(),
        }
    }

    /// Forwards a peer-to-peer message from `conn` to its room.
    pub fn relay(&self, conn: C, message: ClientMessage) -> Vec<Delivery<C>> {
        if matches!(message, ClientMessage::Ping) {
            return vec![Delivery::Send {
                conn,
                message: ServerMessage::Pong,
            }];
        }
        let Some((room_id, index)) = self.locate(conn) else {
            return vec![Delivery::Send {
                conn,
                message: ServerMessage::Error {
                    message: "join a room first".into(),
                },
            }];
        };
        let members = self.members(&room_id);
        let sender = members[index].peer_id.clone();
        let Some(relayed) = message.into_relayed(sender.clone()) else {
            return Vec::new();
        };
        let target = relayed.to_peer_id().cloned();
        members
            .iter()
            .filter(|m| m.peer_id != sender)
            .filter(|m| target.as_ref().is_none_or(|t| *t == m.peer_id))
            .map(|m| Delivery::Send {
                conn: m.conn,
                message: relayed.clone(),
            })
            .collect()
    }

    fn locate(&self, conn: C) -> Option<(String, usize)> {
        self.rooms.iter().find_map(|(room_id, members)| {
            members
                .iter()
                .position(|m| m.conn == conn)
                .map(|index| (room_id.clone(), index))
        })
    }

    fn remove_at(&mut self, room_id: &str, index: usize) -> Vec<Delivery<C>> {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return Vec::new();
        };
        let gone = members.remove(index);
        let out = members
            .iter()
            .map(|m| Delivery::Send {
                conn: m.conn,
                message: ServerMessage::PeerLeft {
                    peer_id: gone.peer_id.clone(),
                },
            })
            .collect();
        if members.is_empty() {
            self.rooms.remove(room_id);
        }
        out
    }
}

/// Acknowledges the newcomer and introduces it to the other member. The
/// newcomer is the one told to initiate. When `notify_others` is false the
/// others already learned about it through `peer-replaced`.
fn announce_newcomer<C: Copy + Eq>(
    members: &[Member<C>],
    newcomer: &PeerId,
    room_id: &str,
    notify_others: bool,
    out: &mut Vec<Delivery<C>>,
) {
    let Some(me) = members.iter().find(|m| m.peer_id == *newcomer) else {
        return;
    };
    let others: Vec<&Member<C>> = members.iter().filter(|m| m.peer_id != *newcomer).collect();
    out.push(Delivery::Send {
        conn: me.conn,
        message: ServerMessage::Joined {
            room_id: room_id.to_string(),
            peer_id: newcomer.clone(),
            peers: others
                .iter()
                .map(|m| PeerSummary {
                    peer_id: m.peer_id.clone(),
                    display_name: m.display_name.clone(),
                })
                .collect(),
        },
    });
    for other in others {
        out.push(Delivery::Send {
            conn: me.conn,
            message: ServerMessage::PeerJoined {
                peer_id: other.peer_id.clone(),
                display_name: other.display_name.clone(),
                should_initiate: true,
            },
        });
        if notify_others {
            out.push(Delivery::Send {
                conn: other.conn,
                message: ServerMessage::PeerJoined {
                    peer_id: newcomer.clone(),
                    display_name: me.display_name.clone(),
                    should_initiate: false,
                },
            });
        }
    }
}
