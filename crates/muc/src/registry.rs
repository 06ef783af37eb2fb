use std::collections::HashMap;

use xmpp_parsers::jid::BareJid;

use crate::room::Room;

/// Rooms the session is joining or has joined, keyed by bare room JID.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<BareJid, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a room, returning the one it replaced.
    pub fn add_room(&mut self, room: Room) -> Option<Room> {
        self.rooms.insert(room.jid().clone(), room)
    }

    pub fn get_room(&self, room_jid: &BareJid) -> Option<&Room> {
        self.rooms.get(room_jid)
    }

    pub fn get_room_mut(&mut self, room_jid: &BareJid) -> Option<&mut Room> {
        self.rooms.get_mut(room_jid)
    }

    pub fn remove_room(&mut self, room_jid: &BareJid) -> Option<Room> {
        self.rooms.remove(room_jid)
    }

    pub fn contains(&self, room_jid: &BareJid) -> bool {
        self.rooms.contains_key(room_jid)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
    }
}
