//! Live room membership.
//!
//! The registry is the only place that knows whether a connection is still in
//! a room. Call and relay code ask it on every delivery instead of keeping
//! their own copies, since a leave can land between a ring and its answer.

mod member;

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::{
    error::{SignalError, SignalResult},
    gateway::{events::ServerEvent, outbox::Outbox},
};

pub use member::{ConnectionId, Member, Role, RoomId};

#[derive(Debug, Default)]
struct Room {
    // keyed by time-ordered ids, so iteration follows join order
    members: BTreeMap<ConnectionId, Member>,
}

#[derive(Debug, Default)]
struct Rooms {
    rooms: HashMap<RoomId, Room>,
    memberships: HashMap<ConnectionId, RoomId>,
}

impl Rooms {
    /// Removes `id` from its room, dropping the room when it empties.
    fn remove(&mut self, id: ConnectionId) -> Option<(RoomId, Member, bool)> {
        let room_id = self.memberships.remove(&id)?;
        let room = self.rooms.get_mut(&room_id)?;
        let member = room.members.remove(&id)?;

        let emptied = room.members.is_empty();
        if emptied {
            self.rooms.remove(&room_id);
        }
        Some((room_id, member, emptied))
    }
}

pub struct Registry {
    inner: Mutex<Rooms>,
    outbox: Outbox,
}

impl Registry {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            inner: Mutex::new(Rooms::default()),
            outbox,
        }
    }

    /// Adds `member` to `room_id` and tells the rest of the room.
    ///
    /// Returns the elders already in the room when the joiner is family.
    /// A connection already in another room is moved; one already in this
    /// room has its record updated without a new announcement.
    pub fn join(&self, room_id: &str, member: Member) -> SignalResult<Option<Vec<Member>>> {
        let mut rooms = self.inner.lock();

        if member.role == Role::Elder {
            let taken = rooms.rooms.get(room_id).is_some_and(|room| {
                room.members.values().any(|m| {
                    m.id != member.id && m.role == Role::Elder && m.device_name == member.device_name
                })
            });
            if taken {
                return Err(SignalError::DuplicateDisplayName(member.device_name));
            }
        }

        if rooms.memberships.get(&member.id).is_some_and(|current| current != room_id) {
            if let Some((old_room, old, _)) = rooms.remove(member.id) {
                self.announce_left(&rooms, &old_room, old.id);
            }
        }

        let id = member.id;
        let role = member.role;
        let room = rooms.rooms.entry(room_id.to_owned()).or_default();
        let rejoined = room.members.insert(id, member.clone()).is_some();

        if !rejoined {
            for peer in room.members.keys().filter(|&&peer| peer != id) {
                self.outbox.send(*peer, ServerEvent::MemberJoined(member.clone()));
            }
        }

        let elders = (role == Role::Family).then(|| {
            room.members
                .values()
                .filter(|m| m.role == Role::Elder && m.id != id)
                .cloned()
                .collect()
        });

        rooms.memberships.insert(id, room_id.to_owned());
        if rejoined {
            tracing::debug!(conn_id = %id, room = room_id, ?role, "updated room membership");
        } else {
            tracing::info!(conn_id = %id, room = room_id, ?role, "joined room");
        }
        Ok(elders)
    }

    /// Removes the connection from whatever room it is in. Safe to call for
    /// connections that never joined.
    pub fn leave(&self, id: ConnectionId) -> Option<(RoomId, Member)> {
        let mut rooms = self.inner.lock();
        let (room_id, member, emptied) = rooms.remove(id)?;

        if emptied {
            tracing::debug!(room = %room_id, "room emptied");
        } else {
            self.announce_left(&rooms, &room_id, id);
        }
        tracing::info!(conn_id = %id, room = %room_id, "left room");
        Some((room_id, member))
    }

    fn announce_left(&self, rooms: &Rooms, room_id: &str, id: ConnectionId) {
        let Some(room) = rooms.rooms.get(room_id) else {
            return;
        };
        for peer in room.members.keys() {
            self.outbox.send(*peer, ServerEvent::MemberLeft { id });
        }
    }

    pub fn list_members(&self, room_id: &str) -> Vec<Member> {
        self.inner
            .lock()
            .rooms
            .get(room_id)
            .map(|room| room.members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list_elders(&self, room_id: &str) -> Vec<Member> {
        self.inner
            .lock()
            .rooms
            .get(room_id)
            .map(|room| {
                room.members
                    .values()
                    .filter(|m| m.role == Role::Elder)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn room_of(&self, id: ConnectionId) -> Option<RoomId> {
        self.inner.lock().memberships.get(&id).cloned()
    }

    pub fn member(&self, id: ConnectionId) -> Option<Member> {
        self.membership(id).map(|(_, member)| member)
    }

    pub fn membership(&self, id: ConnectionId) -> Option<(RoomId, Member)> {
        let rooms = self.inner.lock();
        let room_id = rooms.memberships.get(&id)?;
        let member = rooms.rooms.get(room_id)?.members.get(&id)?.clone();
        Some((room_id.clone(), member))
    }

    pub fn is_present(&self, id: ConnectionId) -> bool {
        self.inner.lock().memberships.contains_key(&id)
    }

    pub fn room_count(&self) -> usize {
        self.inner.lock().rooms.len()
    }

    /// Sends `event` to every member of the room except `exclude`.
    /// Returns how many members it was handed to.
    pub fn broadcast(&self, room_id: &str, event: &ServerEvent, exclude: Option<ConnectionId>) -> usize {
        let rooms = self.inner.lock();
        let Some(room) = rooms.rooms.get(room_id) else {
            return 0;
        };

        room.members
            .keys()
            .filter(|&&id| Some(id) != exclude)
            .filter(|&&id| self.outbox.send(id, event.clone()))
            .count()
    }

    /// Point-to-point delivery to a connection that is still in a room.
    pub fn send_to(&self, id: ConnectionId, event: ServerEvent) -> bool {
        if !self.is_present(id) {
            tracing::debug!(conn_id = %id, "dropping event for absent connection");
            return false;
        }
        self.outbox.send(id, event)
    }
}
