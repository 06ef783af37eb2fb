//! Callbacks invoked for unsolicited room events.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use tracing::{debug, warn};
use xmpp_parsers::jid::Jid;

use crate::room::{Room, User};

pub type UserEventFn = Arc<dyn Fn(&Room, &User) + Send + Sync>;
pub type GroupChatFn = Arc<dyn Fn(&Room, Option<&User>, &str) + Send + Sync>;
pub type HistoryFn =
    Arc<dyn Fn(&Room, Option<&User>, &str, DateTime<FixedOffset>, Option<&Jid>) + Send + Sync>;
pub type SubjectFn = Arc<dyn Fn(&Room, Option<&User>, &str) + Send + Sync>;

/// A callback for one kind of room event. Registering a hook replaces any
/// previous hook of the same kind.
#[derive(Clone)]
pub enum Hook {
    UserJoinedRoom(UserEventFn),
    UserLeftRoom(UserEventFn),
    ReceivedGroupChat(GroupChatFn),
    /// Replayed discussion history: body, delay stamp and the original
    /// sender when the room discloses it.
    ReceivedHistory(HistoryFn),
    ReceivedSubject(SubjectFn),
}

impl Hook {
    pub fn user_joined_room(f: impl Fn(&Room, &User) + Send + Sync + 'static) -> Self {
        Hook::UserJoinedRoom(Arc::new(f))
    }

    pub fn user_left_room(f: impl Fn(&Room, &User) + Send + Sync + 'static) -> Self {
        Hook::UserLeftRoom(Arc::new(f))
    }

    pub fn received_group_chat(
        f: impl Fn(&Room, Option<&User>, &str) + Send + Sync + 'static,
    ) -> Self {
        Hook::ReceivedGroupChat(Arc::new(f))
    }

    pub fn received_history(
        f: impl Fn(&Room, Option<&User>, &str, DateTime<FixedOffset>, Option<&Jid>)
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Hook::ReceivedHistory(Arc::new(f))
    }

    pub fn received_subject(f: impl Fn(&Room, Option<&User>, &str) + Send + Sync + 'static) -> Self {
        Hook::ReceivedSubject(Arc::new(f))
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Hook::UserJoinedRoom(_) => "UserJoinedRoom",
            Hook::UserLeftRoom(_) => "UserLeftRoom",
            Hook::ReceivedGroupChat(_) => "ReceivedGroupChat",
            Hook::ReceivedHistory(_) => "ReceivedHistory",
            Hook::ReceivedSubject(_) => "ReceivedSubject",
        };
        f.debug_tuple(kind).finish_non_exhaustive()
    }
}

/// A room event captured under the session lock, dispatched after release.
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    UserJoinedRoom {
        room: Room,
        user: User,
    },
    UserLeftRoom {
        room: Room,
        user: User,
    },
    GroupChat {
        room: Room,
        user: Option<User>,
        body: String,
    },
    History {
        room: Room,
        user: Option<User>,
        body: String,
        stamp: DateTime<FixedOffset>,
        from: Option<Jid>,
    },
    Subject {
        room: Room,
        user: Option<User>,
        subject: String,
    },
}

impl HookEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            HookEvent::UserJoinedRoom { .. } => "user_joined_room",
            HookEvent::UserLeftRoom { .. } => "user_left_room",
            HookEvent::GroupChat { .. } => "received_group_chat",
            HookEvent::History { .. } => "received_history",
            HookEvent::Subject { .. } => "received_subject",
        }
    }

    pub fn room(&self) -> &Room {
        match self {
            HookEvent::UserJoinedRoom { room, .. }
            | HookEvent::UserLeftRoom { room, .. }
            | HookEvent::GroupChat { room, .. }
            | HookEvent::History { room, .. }
            | HookEvent::Subject { room, .. } => room,
        }
    }
}

/// The registered hooks, at most one per event kind.
#[derive(Clone, Default)]
pub struct Hooks {
    user_joined_room: Option<UserEventFn>,
    user_left_room: Option<UserEventFn>,
    received_group_chat: Option<GroupChatFn>,
    received_history: Option<HistoryFn>,
    received_subject: Option<SubjectFn>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Hook) {
        match hook {
            Hook::UserJoinedRoom(f) => self.user_joined_room = Some(f),
            Hook::UserLeftRoom(f) => self.user_left_room = Some(f),
            Hook::ReceivedGroupChat(f) => self.received_group_chat = Some(f),
            Hook::ReceivedHistory(f) => self.received_history = Some(f),
            Hook::ReceivedSubject(f) => self.received_subject = Some(f),
        }
    }

    /// Invoke the hook for `event`, if one is registered.
    ///
    /// A panicking hook is logged and swallowed so that later events are
    /// still dispatched.
    pub fn dispatch(&self, event: &HookEvent) {
        let invoked = catch_unwind(AssertUnwindSafe(|| self.invoke(event)));
        match invoked {
            Ok(true) => debug!(
                hook = event.kind(),
                room = %event.room().jid(),
                "Dispatched room event"
            ),
            Ok(false) => {}
            Err(_) => warn!(
                hook = event.kind(),
                room = %event.room().jid(),
                "Room event hook panicked"
            ),
        }
    }

    fn invoke(&self, event: &HookEvent) -> bool {
        match event {
            HookEvent::UserJoinedRoom { room, user } => match &self.user_joined_room {
                Some(f) => f(room, user),
                None => return false,
            },
            HookEvent::UserLeftRoom { room, user } => match &self.user_left_room {
                Some(f) => f(room, user),
                None => return false,
            },
            HookEvent::GroupChat { room, user, body } => match &self.received_group_chat {
                Some(f) => f(room, user.as_ref(), body),
                None => return false,
            },
            HookEvent::History {
                room,
                user,
                body,
                stamp,
                from,
            } => match &self.received_history {
                Some(f) => f(room, user.as_ref(), body, *stamp, from.as_ref()),
                None => return false,
            },
            HookEvent::Subject {
                room,
                user,
                subject,
            } => match &self.received_subject {
                Some(f) => f(room, user.as_ref(), subject),
                None => return false,
            },
        }
        true
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("user_joined_room", &self.user_joined_room.is_some())
            .field("user_left_room", &self.user_left_room.is_some())
            .field("received_group_chat", &self.received_group_chat.is_some())
            .field("received_history", &self.received_history.is_some())
            .field("received_subject", &self.received_subject.is_some())
            .finish()
    }
}
