//! Session state shared by every [`MucClient`](crate::MucClient) handle:
//! the room registry, both pending-request tables and the hooks.
//!
//! Everything here runs under the client's mutex. Inbound handling never
//! calls hooks directly; it returns [`HookEvent`]s for the caller to
//! dispatch once the lock is released.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use xmpp_parsers::iq::Iq;
use xmpp_parsers::jid::BareJid;
use xmpp_parsers::message::{Message, MessageType};
use xmpp_parsers::minidom::Element;
use xmpp_parsers::muc::user::Status;
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::elements::{MucUserInfo, parse_delay, parse_muc_user};
use crate::error::MucError;
use crate::hooks::{HookEvent, Hooks};
use crate::pending::{IqResponder, PendingIq, PendingTransition, Transition, failure_of};
use crate::registry::RoomRegistry;
use crate::room::User;
use crate::stanza::Stanza;

#[derive(Debug)]
pub(crate) struct SessionState {
    pub registry: RoomRegistry,
    pub hooks: Hooks,
    iqs: HashMap<String, PendingIq>,
    transitions: HashMap<BareJid, PendingTransition>,
    request_timeout: Duration,
}

impl SessionState {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            registry: RoomRegistry::new(),
            hooks: Hooks::new(),
            iqs: HashMap::new(),
            transitions: HashMap::new(),
            request_timeout,
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.request_timeout
    }

    pub fn track_iq(&mut self, id: String, responder: IqResponder) {
        let deadline = self.deadline();
        self.iqs.insert(
            id,
            PendingIq {
                responder,
                deadline,
            },
        );
    }

    pub fn cancel_iq(&mut self, id: &str) {
        self.iqs.remove(id);
    }

    pub fn has_transition(&self, room_jid: &BareJid) -> bool {
        self.transitions.contains_key(room_jid)
    }

    /// Claim the room's transition slot. Fails if another presence change
    /// on the same room is still awaiting its reply.
    pub fn begin_transition(
        &mut self,
        room_jid: &BareJid,
        transition: Transition,
    ) -> Result<(), MucError> {
        if self.has_transition(room_jid) {
            return Err(MucError::TransitionPending(room_jid.clone()));
        }
        let deadline = self.deadline();
        self.transitions.insert(
            room_jid.clone(),
            PendingTransition {
                transition,
                deadline,
            },
        );
        Ok(())
    }

    pub fn cancel_transition(&mut self, room_jid: &BareJid) {
        self.transitions.remove(room_jid);
    }

    pub fn pending_count(&self) -> usize {
        self.iqs.len() + self.transitions.len()
    }

    pub fn handle_stanza(&mut self, stanza: Stanza) -> Vec<HookEvent> {
        let mut events = Vec::new();
        match stanza {
            Stanza::Iq(iq) => self.handle_iq(*iq),
            Stanza::Presence(presence) => self.handle_presence(*presence, &mut events),
            Stanza::Message(message) => self.handle_message(*message, &mut events),
        }
        events
    }

    fn handle_iq(&mut self, iq: Iq) {
        if matches!(iq, Iq::Get { .. } | Iq::Set { .. }) {
            debug!(iq_id = %iq.id(), "Ignoring inbound IQ request");
            return;
        }

        match self.iqs.remove(iq.id()) {
            Some(pending) => {
                debug!(iq_id = %iq.id(), "Resolved pending IQ");
                if let Some(room) = pending
                    .responder
                    .unlocks(&iq)
                    .and_then(|room_jid| self.registry.get_room_mut(room_jid))
                {
                    room.locked = false;
                    debug!(room = %room.jid(), "Room configured and unlocked");
                }
                pending.responder.resolve(iq);
            }
            None => debug!(iq_id = %iq.id(), "Dropping IQ reply with no pending request"),
        }
    }

    fn handle_presence(&mut self, presence: Presence, events: &mut Vec<HookEvent>) {
        let Some(from) = presence.from.clone() else {
            debug!("Ignoring presence without a sender");
            return;
        };
        let room_jid = from.to_bare();

        if presence.type_ == PresenceType::Error {
            self.presence_error(&room_jid, &presence);
            return;
        }

        if !self.registry.contains(&room_jid) {
            debug!(room = %room_jid, "Ignoring presence from unknown room");
            return;
        }
        let Some(nick) = from.resource().map(|r| r.to_string()) else {
            debug!(room = %room_jid, "Ignoring presence from bare room JID");
            return;
        };
        let info = parse_muc_user(&presence.payloads).unwrap_or_default();

        match presence.type_ {
            PresenceType::None => self.available(&room_jid, nick, &presence, &info, events),
            PresenceType::Unavailable => self.unavailable(&room_jid, &nick, &info, events),
            other => debug!(room = %room_jid, nick = %nick, presence_type = ?other, "Ignoring presence"),
        }
    }

    fn presence_error(&mut self, room_jid: &BareJid, presence: &Presence) {
        let Some(pending) = self.transitions.remove(room_jid) else {
            warn!(room = %room_jid, "Presence error with no pending room change");
            return;
        };

        let failure = failure_of(&Element::from(presence.clone()));
        debug!(
            room = %room_jid,
            transition = pending.transition.kind(),
            condition = %failure.condition,
            "Room change rejected"
        );
        if pending.transition.created_room() {
            self.registry.remove_room(room_jid);
        }
        pending.transition.fail(MucError::Protocol(failure));
    }

    fn available(
        &mut self,
        room_jid: &BareJid,
        nick: String,
        presence: &Presence,
        info: &MucUserInfo,
        events: &mut Vec<HookEvent>,
    ) {
        let Some(room) = self.registry.get_room_mut(room_jid) else {
            return;
        };
        let mut user = occupant(nick, presence, info);

        let confirms = self
            .transitions
            .get(room_jid)
            .is_some_and(|pending| match &pending.transition {
                Transition::Leave { .. } => false,
                other => other.expected_nick().unwrap_or(&room.nick) == user.nick,
            });

        if !confirms {
            let is_new = room.get_user(&user.nick).is_none();
            user.is_self = user.nick == room.nick || info.has_status(Status::SelfPresence);
            room.add_user(user.clone());
            if is_new {
                debug!(room = %room_jid, nick = %user.nick, "Occupant joined");
                events.push(HookEvent::UserJoinedRoom {
                    room: room.clone(),
                    user,
                });
            }
            return;
        }

        let Some(pending) = self.transitions.remove(room_jid) else {
            return;
        };
        user.is_self = true;
        match pending.transition {
            Transition::Join { done, .. } => {
                let old_nick = std::mem::replace(&mut room.nick, user.nick.clone());
                if old_nick != user.nick {
                    room.rename_user(&old_nick, &user.nick);
                }
                room.locked = info.has_status(Status::RoomHasBeenCreated);
                room.add_user(user.clone());
                debug!(room = %room_jid, nick = %user.nick, locked = room.locked, "Joined room");
                let _ = done.send(Ok(room.clone()));
                events.push(HookEvent::UserJoinedRoom {
                    room: room.clone(),
                    user,
                });
            }
            Transition::NickChange { done, .. } => {
                let old_nick = std::mem::replace(&mut room.nick, user.nick.clone());
                room.rename_user(&old_nick, &user.nick);
                debug!(room = %room_jid, old = %old_nick, new = %user.nick, "Changed nick");
                room.add_user(user);
                let _ = done.send(Ok(room.clone()));
            }
            Transition::Status { done } => {
                debug!(room = %room_jid, nick = %user.nick, "Changed status");
                room.add_user(user);
                let _ = done.send(Ok(room.clone()));
            }
            Transition::Leave { .. } => {}
        }
    }

    fn unavailable(
        &mut self,
        room_jid: &BareJid,
        nick: &str,
        info: &MucUserInfo,
        events: &mut Vec<HookEvent>,
    ) {
        let Some(room) = self.registry.get_room_mut(room_jid) else {
            return;
        };
        let is_self = nick == room.nick || info.has_status(Status::SelfPresence);

        if info.has_status(Status::NewNick) {
            // The matching available presence from the new nick follows.
            if let (false, Some(new_nick)) = (is_self, info.new_nick.as_deref()) {
                room.rename_user(nick, new_nick);
            }
            debug!(room = %room_jid, nick, "Occupant changing nick");
            return;
        }

        if !is_self {
            match room.remove_user(nick) {
                Some(user) => {
                    debug!(room = %room_jid, nick, "Occupant left");
                    events.push(HookEvent::UserLeftRoom {
                        room: room.clone(),
                        user,
                    });
                }
                None => debug!(room = %room_jid, nick, "Unavailable presence for unknown occupant"),
            }
            return;
        }

        let user = room.remove_user(nick).unwrap_or_else(|| User {
            is_self: true,
            ..User::new(nick)
        });
        let Some(room) = self.registry.remove_room(room_jid) else {
            return;
        };

        match self.transitions.remove(room_jid).map(|p| p.transition) {
            Some(Transition::Leave { done }) => {
                debug!(room = %room_jid, "Left room");
                let _ = done.send(Ok(true));
            }
            pending => {
                if let Some(transition) = pending {
                    transition.fail(MucError::UnexpectedResponse(format!(
                        "removed from room {room_jid}"
                    )));
                }
                let reason = if info.has_status(Status::Banned) {
                    "banned"
                } else if info.has_status(Status::Kicked) {
                    "kicked"
                } else {
                    "unavailable"
                };
                warn!(room = %room_jid, reason, "Removed from room by the service");
                events.push(HookEvent::UserLeftRoom { room, user });
            }
        }
    }

    fn handle_message(&mut self, message: Message, events: &mut Vec<HookEvent>) {
        if message.type_ != MessageType::Groupchat {
            debug!(message_type = ?message.type_, "Ignoring non-groupchat message");
            return;
        }
        let Some(from) = message.from.as_ref() else {
            debug!("Ignoring groupchat message without a sender");
            return;
        };
        let room_jid = from.to_bare();
        let Some(room) = self.registry.get_room(&room_jid) else {
            debug!(room = %room_jid, "Dropping groupchat from unknown room");
            return;
        };

        // Messages from the bare room JID come from the service itself.
        let user = from.resource().map(|resource| {
            let nick = resource.to_string();
            room.get_user(&nick)
                .cloned()
                .unwrap_or_else(|| User::new(nick))
        });

        let body = message.get_best_body(vec![]).map(|(_, body)| body.clone());
        let Some(body) = body else {
            if let Some(subject) = subject_of(&message) {
                debug!(room = %room_jid, "Room subject received");
                events.push(HookEvent::Subject {
                    room: room.clone(),
                    user,
                    subject,
                });
            }
            return;
        };

        match parse_delay(&message.payloads) {
            Some(delay) => events.push(HookEvent::History {
                room: room.clone(),
                user,
                body,
                stamp: delay.stamp,
                from: delay.from,
            }),
            None => events.push(HookEvent::GroupChat {
                room: room.clone(),
                user,
                body,
            }),
        }
    }

    /// Fail every request whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired_iqs: Vec<String> = self
            .iqs
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let expired_rooms: Vec<BareJid> = self
            .transitions
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(room, _)| room.clone())
            .collect();
        let count = expired_iqs.len() + expired_rooms.len();

        for id in expired_iqs {
            if let Some(pending) = self.iqs.remove(&id) {
                warn!(iq_id = %id, "IQ request timed out");
                pending
                    .responder
                    .fail(MucError::Timeout(self.request_timeout));
            }
        }
        for room_jid in expired_rooms {
            if let Some(pending) = self.transitions.remove(&room_jid) {
                warn!(
                    room = %room_jid,
                    transition = pending.transition.kind(),
                    "Room change timed out"
                );
                if pending.transition.created_room() {
                    self.registry.remove_room(&room_jid);
                }
                pending
                    .transition
                    .fail(MucError::Timeout(self.request_timeout));
            }
        }
        count
    }

    /// Fail all pending requests with [`MucError::Disconnected`] and forget
    /// every room.
    pub fn teardown(&mut self) -> usize {
        let count = self.pending_count();
        for (_, pending) in self.iqs.drain() {
            pending.responder.fail(MucError::Disconnected);
        }
        for (_, pending) in self.transitions.drain() {
            pending.transition.fail(MucError::Disconnected);
        }
        self.registry.clear();
        count
    }
}

/// The occupant described by an available presence.
fn occupant(nick: String, presence: &Presence, info: &MucUserInfo) -> User {
    User {
        nick,
        entity: info.entity.clone(),
        affiliation: info.affiliation,
        role: info.role,
        show: presence.show.clone(),
        status: presence.statuses.values().next().cloned(),
        is_self: false,
    }
}

fn subject_of(message: &Message) -> Option<String> {
    if message.subjects.is_empty() {
        return None;
    }
    let element = Element::from(message.clone());
    element
        .children()
        .find(|child| child.name() == "subject")
        .map(|subject| subject.text())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::pending::PendingRequest;
    use crate::room::{Affiliation, Role, Room};

    fn room_jid() -> BareJid {
        "test@conference.example.org".parse().unwrap()
    }

    fn state_with_room() -> SessionState {
        let mut state = SessionState::new(Duration::from_secs(30));
        state.registry.add_room(Room::new(room_jid(), "Nick"));
        state
    }

    fn inbound(state: &mut SessionState, xml: &str) -> Vec<HookEvent> {
        state.handle_stanza(Stanza::parse(xml.as_bytes()).unwrap())
    }

    #[tokio::test]
    async fn join_confirmation_resolves_and_marks_self() {
        let mut state = state_with_room();
        let (done, pending) = PendingRequest::channel();
        state
            .begin_transition(
                &room_jid(),
                Transition::Join {
                    nick: "Nick".to_string(),
                    created: true,
                    done,
                },
            )
            .unwrap();

        let events = inbound(
            &mut state,
            "<presence xmlns='jabber:client' from='test@conference.example.org/Nick'>\
             <x xmlns='http://jabber.org/protocol/muc#user'>\
             <item affiliation='owner' role='moderator'/>\
             <status code='110'/><status code='201'/></x></presence>",
        );

        let room = pending.await.unwrap();
        assert!(room.locked);
        let me = room.self_user().unwrap();
        assert!(me.is_self);
        assert_eq!(me.affiliation, Affiliation::Owner);
        assert_eq!(me.role, Role::Moderator);
        assert_matches!(events.as_slice(), [HookEvent::UserJoinedRoom { .. }]);
        assert_eq!(state.pending_count(), 0);
    }

    #[test]
    fn second_transition_on_same_room_is_rejected() {
        let mut state = state_with_room();
        let (done, _pending) = PendingRequest::channel();
        state
            .begin_transition(&room_jid(), Transition::Leave { done })
            .unwrap();

        let (done, _pending) = PendingRequest::channel();
        let error = state
            .begin_transition(&room_jid(), Transition::Status { done })
            .unwrap_err();
        assert_matches!(error, MucError::TransitionPending(_));
    }

    #[test]
    fn repeated_presence_refreshes_roster_without_event() {
        let mut state = state_with_room();
        let xml = "<presence xmlns='jabber:client' from='test@conference.example.org/thirdwitch'/>";
        assert_eq!(inbound(&mut state, xml).len(), 1);

        let events = inbound(
            &mut state,
            "<presence xmlns='jabber:client' from='test@conference.example.org/thirdwitch'>\
             <show>away</show></presence>",
        );

        assert!(events.is_empty());
        let room = state.registry.get_room(&room_jid()).unwrap();
        assert_eq!(room.occupant_count(), 1);
        assert!(room.get_user("thirdwitch").unwrap().show.is_some());
    }

    #[test]
    fn other_occupant_nick_change_renames_without_events() {
        let mut state = state_with_room();
        inbound(
            &mut state,
            "<presence xmlns='jabber:client' from='test@conference.example.org/oldhag'/>",
        );

        let events = inbound(
            &mut state,
            "<presence xmlns='jabber:client' type='unavailable' \
             from='test@conference.example.org/oldhag'>\
             <x xmlns='http://jabber.org/protocol/muc#user'>\
             <item affiliation='member' role='participant' nick='oldhag2'/><status code='303'/></x></presence>",
        );

        assert!(events.is_empty());
        let room = state.registry.get_room(&room_jid()).unwrap();
        assert!(room.get_user("oldhag").is_none());
        assert!(room.get_user("oldhag2").is_some());
    }

    #[test]
    fn self_kick_removes_room_and_reports_departure() {
        let mut state = state_with_room();
        let events = inbound(
            &mut state,
            "<presence xmlns='jabber:client' type='unavailable' \
             from='test@conference.example.org/Nick'>\
             <x xmlns='http://jabber.org/protocol/muc#user'>\
             <item affiliation='none' role='none'/>\
             <status code='307'/><status code='110'/></x></presence>",
        );

        assert!(!state.registry.contains(&room_jid()));
        assert_matches!(
            events.as_slice(),
            [HookEvent::UserLeftRoom { user, .. }] if user.is_self
        );
    }

    #[test]
    fn groupchat_from_room_has_no_user() {
        let mut state = state_with_room();
        let events = inbound(
            &mut state,
            "<message xmlns='jabber:client' type='groupchat' \
             from='test@conference.example.org'><body>maintenance</body></message>",
        );

        assert_matches!(
            events.as_slice(),
            [HookEvent::GroupChat { user: None, body, .. }] if body == "maintenance"
        );
    }

    #[test]
    fn subject_message_produces_subject_event() {
        let mut state = state_with_room();
        let events = inbound(
            &mut state,
            "<message xmlns='jabber:client' type='groupchat' \
             from='test@conference.example.org/Nick'><subject>Fire Burn</subject></message>",
        );

        assert_matches!(
            events.as_slice(),
            [HookEvent::Subject { subject, user: Some(_), .. }] if subject == "Fire Burn"
        );
    }

    #[test]
    fn messages_for_unknown_rooms_are_dropped() {
        let mut state = SessionState::new(Duration::from_secs(30));
        let events = inbound(
            &mut state,
            "<message xmlns='jabber:client' type='groupchat' \
             from='test@conference.example.org/Nick'><body>test</body></message>",
        );
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn expire_fails_stale_requests_and_drops_joining_room() {
        let mut state = state_with_room();
        let (done, join) = PendingRequest::channel();
        state
            .begin_transition(
                &room_jid(),
                Transition::Join {
                    nick: "Nick".to_string(),
                    created: true,
                    done,
                },
            )
            .unwrap();
        let (tx, ack) = PendingRequest::channel();
        state.track_iq("kick-1".to_string(), IqResponder::Ack(tx));

        assert_eq!(state.expire(Instant::now()), 0);
        assert_eq!(state.expire(Instant::now() + Duration::from_secs(31)), 2);

        assert_matches!(join.await, Err(MucError::Timeout(_)));
        assert_matches!(ack.await, Err(MucError::Timeout(_)));
        assert!(!state.registry.contains(&room_jid()));
    }

    #[tokio::test]
    async fn configure_result_unlocks_room() {
        let mut state = state_with_room();
        state
            .registry
            .get_room_mut(&room_jid())
            .unwrap()
            .locked = true;
        let (done, pending) = PendingRequest::channel();
        state.track_iq(
            "config-1".to_string(),
            IqResponder::Configure {
                room: room_jid(),
                done,
            },
        );

        inbound(
            &mut state,
            "<iq xmlns='jabber:client' type='result' id='config-1' \
             from='test@conference.example.org'/>",
        );

        assert_matches!(pending.await, Ok(Iq::Result { .. }));
        assert!(!state.registry.get_room(&room_jid()).unwrap().locked);
    }

    #[tokio::test]
    async fn rejected_configure_leaves_room_locked() {
        let mut state = state_with_room();
        state
            .registry
            .get_room_mut(&room_jid())
            .unwrap()
            .locked = true;
        let (done, pending) = PendingRequest::channel();
        state.track_iq(
            "config-1".to_string(),
            IqResponder::Configure {
                room: room_jid(),
                done,
            },
        );

        inbound(
            &mut state,
            "<iq xmlns='jabber:client' type='error' id='config-1' \
             from='test@conference.example.org'>\
             <error type='modify'><not-acceptable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
             </error></iq>",
        );

        assert_matches!(pending.await, Err(MucError::Protocol(_)));
        assert!(state.registry.get_room(&room_jid()).unwrap().locked);
    }

    #[tokio::test]
    async fn failed_rejoin_keeps_joined_room() {
        let mut state = state_with_room();
        let (done, pending) = PendingRequest::channel();
        state
            .begin_transition(
                &room_jid(),
                Transition::Join {
                    nick: "Other".to_string(),
                    created: false,
                    done,
                },
            )
            .unwrap();

        inbound(
            &mut state,
            "<presence xmlns='jabber:client' type='error' \
             from='test@conference.example.org/Other'>\
             <error type='cancel'><conflict xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
             </error></presence>",
        );

        let error = pending.await.unwrap_err();
        assert_eq!(error.muc_condition(), Some("conflict"));
        let room = state.registry.get_room(&room_jid()).unwrap();
        assert_eq!(room.nick, "Nick");
    }

    #[tokio::test]
    async fn timed_out_rejoin_keeps_joined_room() {
        let mut state = state_with_room();
        let (done, pending) = PendingRequest::channel();
        state
            .begin_transition(
                &room_jid(),
                Transition::Join {
                    nick: "Nick".to_string(),
                    created: false,
                    done,
                },
            )
            .unwrap();

        assert_eq!(state.expire(Instant::now() + Duration::from_secs(31)), 1);

        assert_matches!(pending.await, Err(MucError::Timeout(_)));
        assert!(state.registry.contains(&room_jid()));
    }

    #[tokio::test]
    async fn teardown_fails_everything_with_disconnect() {
        let mut state = state_with_room();
        let (done, leave) = PendingRequest::channel();
        state
            .begin_transition(&room_jid(), Transition::Leave { done })
            .unwrap();
        let (tx, members) = PendingRequest::channel();
        state.track_iq("members-1".to_string(), IqResponder::Members(tx));

        assert_eq!(state.teardown(), 2);

        assert_matches!(leave.await, Err(MucError::Disconnected));
        assert_matches!(members.await, Err(MucError::Disconnected));
        assert!(state.registry.is_empty());
    }
}
