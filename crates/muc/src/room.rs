//! Rooms and their occupants as seen from the local client.

use std::fmt;
use std::str::FromStr;

use xmpp_parsers::jid::{BareJid, Jid};
use xmpp_parsers::muc::user::{Affiliation as MucAffiliation, Role as MucRole};
use xmpp_parsers::presence::Show;

use crate::error::MucError;

/// Long-lived relationship between a real identity and a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Affiliation {
    Owner,
    Admin,
    Member,
    Outcast,
    #[default]
    None,
}

impl Affiliation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Affiliation::Owner => "owner",
            Affiliation::Admin => "admin",
            Affiliation::Member => "member",
            Affiliation::Outcast => "outcast",
            Affiliation::None => "none",
        }
    }
}

impl FromStr for Affiliation {
    type Err = MucError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Affiliation::Owner),
            "admin" => Ok(Affiliation::Admin),
            "member" => Ok(Affiliation::Member),
            "outcast" => Ok(Affiliation::Outcast),
            "none" => Ok(Affiliation::None),
            other => Err(MucError::UnexpectedResponse(format!(
                "unknown affiliation '{other}'"
            ))),
        }
    }
}

impl From<&MucAffiliation> for Affiliation {
    fn from(affiliation: &MucAffiliation) -> Self {
        match affiliation {
            MucAffiliation::Owner => Affiliation::Owner,
            MucAffiliation::Admin => Affiliation::Admin,
            MucAffiliation::Member => Affiliation::Member,
            MucAffiliation::Outcast => Affiliation::Outcast,
            MucAffiliation::None => Affiliation::None,
        }
    }
}

impl fmt::Display for Affiliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Privilege level of an occupant for the duration of its visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    Moderator,
    Participant,
    Visitor,
    #[default]
    None,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Moderator => "moderator",
            Role::Participant => "participant",
            Role::Visitor => "visitor",
            Role::None => "none",
        }
    }
}

impl FromStr for Role {
    type Err = MucError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "moderator" => Ok(Role::Moderator),
            "participant" => Ok(Role::Participant),
            "visitor" => Ok(Role::Visitor),
            "none" => Ok(Role::None),
            other => Err(MucError::UnexpectedResponse(format!(
                "unknown role '{other}'"
            ))),
        }
    }
}

impl From<&MucRole> for Role {
    fn from(role: &MucRole) -> Self {
        match role {
            MucRole::Moderator => Role::Moderator,
            MucRole::Participant => Role::Participant,
            MucRole::Visitor => Role::Visitor,
            MucRole::None => Role::None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An occupant of a room, identified by its nick within that room.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct User {
    pub nick: String,
    /// Real JID; hidden in anonymous rooms.
    pub entity: Option<Jid>,
    pub affiliation: Affiliation,
    pub role: Role,
    pub show: Option<Show>,
    pub status: Option<String>,
    pub is_self: bool,
}

impl User {
    pub fn new(nick: impl Into<String>) -> Self {
        Self {
            nick: nick.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    jid: BareJid,
    pub room_identifier: String,
    pub service: String,
    /// Our own nick, as last confirmed by the service.
    pub nick: String,
    /// The service created the room for us and it awaits configuration.
    pub locked: bool,
    roster: Vec<User>,
}

impl Room {
    pub fn new(jid: BareJid, nick: impl Into<String>) -> Self {
        let room_identifier = jid
            .node()
            .map(|node| node.to_string())
            .unwrap_or_default();
        let service = jid.domain().to_string();

        Self {
            jid,
            room_identifier,
            service,
            nick: nick.into(),
            locked: false,
            roster: Vec::new(),
        }
    }

    /// Build a room from its parts, e.g. `("test", "conference.example.org")`.
    pub fn from_parts(
        room_identifier: &str,
        service: &str,
        nick: impl Into<String>,
    ) -> Result<Self, MucError> {
        let jid = room_jid(room_identifier, service)?;
        Ok(Self::new(jid, nick))
    }

    pub fn jid(&self) -> &BareJid {
        &self.jid
    }

    /// Full JID of our own occupant in this room.
    pub fn own_occupant_jid(&self) -> Result<Jid, MucError> {
        occupant_jid(&self.jid, &self.nick)
    }

    /// Insert the user, replacing any occupant with the same nick.
    pub fn add_user(&mut self, user: User) {
        match self.roster.iter_mut().find(|u| u.nick == user.nick) {
            Some(existing) => *existing = user,
            None => self.roster.push(user),
        }
    }

    pub fn get_user(&self, nick: &str) -> Option<&User> {
        self.roster.iter().find(|u| u.nick == nick)
    }

    pub fn get_user_mut(&mut self, nick: &str) -> Option<&mut User> {
        self.roster.iter_mut().find(|u| u.nick == nick)
    }

    pub fn remove_user(&mut self, nick: &str) -> Option<User> {
        let index = self.roster.iter().position(|u| u.nick == nick)?;
        Some(self.roster.remove(index))
    }

    /// Move an occupant to a new nick, keeping its place in the roster.
    /// Any occupant already holding `new_nick` is dropped.
    pub fn rename_user(&mut self, old_nick: &str, new_nick: &str) -> Option<&User> {
        if old_nick != new_nick {
            self.roster.retain(|u| u.nick != new_nick);
        }
        let user = self.roster.iter_mut().find(|u| u.nick == old_nick)?;
        user.nick = new_nick.to_string();
        Some(&*user)
    }

    pub fn in_roster(&self, user: &User) -> bool {
        self.roster.iter().any(|u| u.nick == user.nick)
    }

    /// Occupants in the order they were first seen.
    pub fn members(&self) -> Vec<&User> {
        self.roster.iter().collect()
    }

    pub fn occupant_count(&self) -> usize {
        self.roster.len()
    }

    pub fn self_user(&self) -> Option<&User> {
        self.get_user(&self.nick)
    }
}

pub fn room_jid(room_identifier: &str, service: &str) -> Result<BareJid, MucError> {
    let raw = format!("{room_identifier}@{service}");
    raw.parse().map_err(|_| MucError::InvalidJid(raw))
}

pub fn occupant_jid(room: &BareJid, nick: &str) -> Result<Jid, MucError> {
    let raw = format!("{room}/{nick}");
    raw.parse().map_err(|_| MucError::InvalidJid(raw))
}
