//! The caller-facing MUC session handle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;
use xmpp_parsers::iq::Iq;
use xmpp_parsers::jid::{BareJid, Jid};
use xmpp_parsers::message::{Message, MessageType};
use xmpp_parsers::presence::{Presence, Show, Type as PresenceType};

use waddle_muc_core::SessionConfig;

use crate::elements::{self, AdminItem, ConfigField, HistoryOptions};
use crate::error::MucError;
use crate::hooks::Hook;
use crate::pending::{IqResponder, PendingRequest, Transition};
use crate::room::{Affiliation, Role, Room, User, occupant_jid, room_jid};
use crate::session::SessionState;
use crate::stanza::Stanza;

/// A one-to-one message to replay into a room, with the time it was sent.
#[derive(Debug, Clone)]
pub struct ArchivedMessage {
    pub stanza: Message,
    pub timestamp: DateTime<Utc>,
}

/// Handle to a MUC session.
///
/// Outbound stanzas are written as serialized bytes to the wire channel
/// given to [`MucClient::new`]; inbound bytes are fed through
/// [`MucClient::run`] or [`MucClient::handle_inbound`]. Clones share the
/// same session.
#[derive(Clone)]
pub struct MucClient {
    state: Arc<Mutex<SessionState>>,
    wire: mpsc::Sender<Vec<u8>>,
    sweep_interval: Duration,
    default_history: Option<HistoryOptions>,
}

impl MucClient {
    /// A zero sweep interval is raised to [`MIN_SWEEP_INTERVAL`].
    pub fn new(config: &SessionConfig, wire: mpsc::Sender<Vec<u8>>) -> Self {
        let mut sweep_interval = config.sweep_interval();
        if sweep_interval.is_zero() {
            warn!(
                sweep_interval_ms = config.sweep_interval_ms,
                "Sweep interval must be positive, using the minimum"
            );
            sweep_interval = MIN_SWEEP_INTERVAL;
        }
        Self {
            state: Arc::new(Mutex::new(SessionState::new(config.request_timeout()))),
            wire,
            sweep_interval,
            default_history: config.history.as_ref().map(HistoryOptions::from),
        }
    }

    /// Create a client along with the receiving end of its wire channel,
    /// sized by `config.wire_buffer` (at least one stanza).
    pub fn with_wire_channel(config: &SessionConfig) -> (Self, mpsc::Receiver<Vec<u8>>) {
        if config.wire_buffer == 0 {
            warn!("Wire buffer must hold at least one stanza, using 1");
        }
        let (wire, outbound) = mpsc::channel(config.wire_buffer.max(1));
        (Self::new(config, wire), outbound)
    }

    /// Register a hook, replacing any earlier hook of the same kind.
    pub async fn register_hook(&self, hook: Hook) {
        debug!(hook = ?hook, "Registering room event hook");
        self.state.lock().await.hooks.register(hook);
    }

    /// Snapshot of a room the session knows about.
    pub async fn room(&self, room_jid: &BareJid) -> Option<Room> {
        self.state.lock().await.registry.get_room(room_jid).cloned()
    }

    pub async fn rooms(&self) -> Vec<Room> {
        self.state.lock().await.registry.rooms().cloned().collect()
    }

    pub async fn pending_requests(&self) -> usize {
        self.state.lock().await.pending_count()
    }

    async fn send(&self, stanza: Stanza) -> Result<(), MucError> {
        let payload = stanza.to_bytes()?;
        self.wire
            .send(payload)
            .await
            .map_err(|_| MucError::WireSendFailed)
    }

    async fn send_iq(&self, iq: Iq, responder: IqResponder) -> Result<(), MucError> {
        let id = iq.id().to_string();
        self.state.lock().await.track_iq(id.clone(), responder);
        debug!(iq_id = %id, "Sending MUC IQ");
        if let Err(error) = self.send(iq.into()).await {
            self.state.lock().await.cancel_iq(&id);
            return Err(error);
        }
        Ok(())
    }

    /// Claim the room's transition slot and send the presence that starts
    /// it. The slot, and a room created for a join, are released again if
    /// the presence never reaches the wire.
    async fn send_transition(
        &self,
        room_jid: &BareJid,
        presence: Presence,
        transition: Transition,
        create_room: Option<Room>,
    ) -> Result<(), MucError> {
        let mut transition = transition;
        let kind = transition.kind();
        let created = {
            let mut state = self.state.lock().await;
            if state.has_transition(room_jid) {
                return Err(MucError::TransitionPending(room_jid.clone()));
            }
            let created = match create_room {
                Some(room) if !state.registry.contains(room_jid) => {
                    state.registry.add_room(room);
                    true
                }
                _ => false,
            };
            transition.set_created(created);
            state.begin_transition(room_jid, transition)?;
            created
        };

        debug!(room = %room_jid, transition = kind, "Sending room presence");
        if let Err(error) = self.send(presence.into()).await {
            let mut state = self.state.lock().await;
            state.cancel_transition(room_jid);
            if created {
                state.registry.remove_room(room_jid);
            }
            return Err(error);
        }
        Ok(())
    }

    async fn own_occupant(&self, room_jid: &BareJid) -> Result<Jid, MucError> {
        let state = self.state.lock().await;
        let room = state
            .registry
            .get_room(room_jid)
            .ok_or_else(|| MucError::UnknownRoom(room_jid.clone()))?;
        if state.has_transition(room_jid) {
            return Err(MucError::TransitionPending(room_jid.clone()));
        }
        room.own_occupant_jid()
    }

    /// Join `room@service` as `nick`. Resolves with the room once the
    /// service confirms our presence, or with the service's error.
    pub async fn join(
        &self,
        service: &str,
        room_identifier: &str,
        nick: &str,
        password: Option<&str>,
        history: Option<HistoryOptions>,
    ) -> Result<PendingRequest<Room>, MucError> {
        let room_jid = room_jid(room_identifier, service)?;
        let history = history.or_else(|| self.default_history.clone());

        let mut presence = Presence::new(PresenceType::None);
        presence.to = Some(occupant_jid(&room_jid, nick)?);
        presence
            .payloads
            .push(elements::muc_join(password, history.as_ref()));

        let (done, pending) = PendingRequest::channel();
        let transition = Transition::Join {
            nick: nick.to_string(),
            created: false,
            done,
        };
        let room = Room::new(room_jid.clone(), nick);
        self.send_transition(&room_jid, presence, transition, Some(room))
            .await?;
        Ok(pending)
    }

    /// Resolves `true` once the service echoes our unavailable presence.
    pub async fn leave(&self, room_jid: &BareJid) -> Result<PendingRequest<bool>, MucError> {
        let occupant = self.own_occupant(room_jid).await?;
        let mut presence = Presence::new(PresenceType::Unavailable);
        presence.to = Some(occupant);

        let (done, pending) = PendingRequest::channel();
        self.send_transition(room_jid, presence, Transition::Leave { done }, None)
            .await?;
        Ok(pending)
    }

    /// Change our nick in a joined room.
    pub async fn nick(
        &self,
        room_jid: &BareJid,
        new_nick: &str,
    ) -> Result<PendingRequest<Room>, MucError> {
        self.own_occupant(room_jid).await?;
        let mut presence = Presence::new(PresenceType::None);
        presence.to = Some(occupant_jid(room_jid, new_nick)?);
        presence.payloads.push(elements::muc_join(None, None));

        let (done, pending) = PendingRequest::channel();
        let transition = Transition::NickChange {
            nick: new_nick.to_string(),
            done,
        };
        self.send_transition(room_jid, presence, transition, None)
            .await?;
        Ok(pending)
    }

    /// Change our presence show and status text in a joined room.
    pub async fn status(
        &self,
        room_jid: &BareJid,
        show: Option<Show>,
        status: Option<&str>,
    ) -> Result<PendingRequest<Room>, MucError> {
        let occupant = self.own_occupant(room_jid).await?;
        let mut presence = Presence::new(PresenceType::None);
        presence.to = Some(occupant);
        presence.show = show;
        if let Some(status) = status {
            presence.statuses.insert(xmpp_parsers::message::Lang(String::new()), status.to_string());
        }
        presence.payloads.push(elements::muc_join(None, None));

        let (done, pending) = PendingRequest::channel();
        self.send_transition(room_jid, presence, Transition::Status { done }, None)
            .await?;
        Ok(pending)
    }

    /// Send a room password to `occupant`, e.g. after a join was refused
    /// with `not-authorized`.
    pub async fn password(&self, occupant: &Jid, password: &str) -> Result<(), MucError> {
        occupant_nick(occupant)?;
        let mut presence = Presence::new(PresenceType::None);
        presence.to = Some(occupant.clone());
        presence
            .payloads
            .push(elements::muc_join(Some(password), None));
        self.send(presence.into()).await
    }

    async fn admin_set(
        &self,
        room_jid: &BareJid,
        item: AdminItem,
        sender: Option<Jid>,
    ) -> Result<PendingRequest<bool>, MucError> {
        let iq = Iq::Set {
            from: sender,
            to: Some(Jid::from(room_jid.clone())),
            id: new_iq_id(),
            payload: elements::admin_query(&[item])?,
        };
        let (tx, pending) = PendingRequest::channel();
        self.send_iq(iq, IqResponder::Ack(tx)).await?;
        Ok(pending)
    }

    /// Remove an occupant from the room.
    pub async fn kick(
        &self,
        room_jid: &BareJid,
        nick: &str,
        reason: Option<&str>,
        sender: Option<Jid>,
    ) -> Result<PendingRequest<bool>, MucError> {
        let item = AdminItem {
            nick: Some(nick.to_string()),
            affiliation: Some(Affiliation::None),
            role: Some(Role::None),
            reason: reason.map(str::to_string),
            ..AdminItem::default()
        };
        self.admin_set(room_jid, item, sender).await
    }

    /// Ban the bare JID of `entity` from the room.
    pub async fn ban(
        &self,
        room_jid: &BareJid,
        entity: &Jid,
        reason: Option<&str>,
        sender: Option<Jid>,
    ) -> Result<PendingRequest<bool>, MucError> {
        self.set_affiliation(room_jid, entity, Affiliation::Outcast, reason, sender)
            .await
    }

    pub async fn grant_voice(
        &self,
        room_jid: &BareJid,
        nick: &str,
        sender: Option<Jid>,
    ) -> Result<PendingRequest<bool>, MucError> {
        self.set_role(room_jid, nick, Role::Participant, None, sender)
            .await
    }

    pub async fn revoke_voice(
        &self,
        room_jid: &BareJid,
        nick: &str,
        sender: Option<Jid>,
    ) -> Result<PendingRequest<bool>, MucError> {
        self.set_role(room_jid, nick, Role::Visitor, None, sender)
            .await
    }

    pub async fn grant_moderator(
        &self,
        room_jid: &BareJid,
        nick: &str,
        sender: Option<Jid>,
    ) -> Result<PendingRequest<bool>, MucError> {
        self.set_role(room_jid, nick, Role::Moderator, None, sender)
            .await
    }

    pub async fn revoke_moderator(
        &self,
        room_jid: &BareJid,
        nick: &str,
        sender: Option<Jid>,
    ) -> Result<PendingRequest<bool>, MucError> {
        self.set_role(room_jid, nick, Role::Participant, None, sender)
            .await
    }

    /// Change the role of the occupant with `nick`.
    pub async fn set_role(
        &self,
        room_jid: &BareJid,
        nick: &str,
        role: Role,
        reason: Option<&str>,
        sender: Option<Jid>,
    ) -> Result<PendingRequest<bool>, MucError> {
        let item = AdminItem {
            nick: Some(nick.to_string()),
            role: Some(role),
            reason: reason.map(str::to_string),
            ..AdminItem::default()
        };
        self.admin_set(room_jid, item, sender).await
    }

    pub async fn grant_membership(
        &self,
        room_jid: &BareJid,
        entity: &Jid,
        sender: Option<Jid>,
    ) -> Result<PendingRequest<bool>, MucError> {
        self.set_affiliation(room_jid, entity, Affiliation::Member, None, sender)
            .await
    }

    pub async fn revoke_membership(
        &self,
        room_jid: &BareJid,
        entity: &Jid,
        sender: Option<Jid>,
    ) -> Result<PendingRequest<bool>, MucError> {
        self.set_affiliation(room_jid, entity, Affiliation::None, None, sender)
            .await
    }

    pub async fn grant_admin(
        &self,
        room_jid: &BareJid,
        entity: &Jid,
        sender: Option<Jid>,
    ) -> Result<PendingRequest<bool>, MucError> {
        self.set_affiliation(room_jid, entity, Affiliation::Admin, None, sender)
            .await
    }

    pub async fn grant_owner(
        &self,
        room_jid: &BareJid,
        entity: &Jid,
        sender: Option<Jid>,
    ) -> Result<PendingRequest<bool>, MucError> {
        self.set_affiliation(room_jid, entity, Affiliation::Owner, None, sender)
            .await
    }

    /// Change the affiliation of the bare JID of `entity`.
    pub async fn set_affiliation(
        &self,
        room_jid: &BareJid,
        entity: &Jid,
        affiliation: Affiliation,
        reason: Option<&str>,
        sender: Option<Jid>,
    ) -> Result<PendingRequest<bool>, MucError> {
        let item = AdminItem {
            jid: Some(entity.to_bare()),
            affiliation: Some(affiliation),
            reason: reason.map(str::to_string),
            ..AdminItem::default()
        };
        self.admin_set(room_jid, item, sender).await
    }

    /// Ask the room moderators for voice.
    pub async fn voice(&self, room_jid: &BareJid) -> Result<(), MucError> {
        let mut message = Message::new(Some(Jid::from(room_jid.clone())));
        message.type_ = MessageType::Normal;
        message.payloads.push(elements::voice_request());
        self.send(message.into()).await
    }

    /// Invite `invitee` through the room.
    pub async fn invite(
        &self,
        room_jid: &BareJid,
        reason: Option<&str>,
        invitee: &Jid,
    ) -> Result<(), MucError> {
        let mut message = Message::new(Some(Jid::from(room_jid.clone())));
        message.type_ = MessageType::Normal;
        message.payloads.push(elements::invite(invitee, reason));
        self.send(message.into()).await
    }

    /// Send a private message to one occupant. In a joined room the nick
    /// must be in the roster.
    pub async fn chat(&self, occupant: &Jid, body: &str) -> Result<(), MucError> {
        let nick = occupant_nick(occupant)?;
        let room_jid = occupant.to_bare();
        let unknown = {
            let state = self.state.lock().await;
            state
                .registry
                .get_room(&room_jid)
                .is_some_and(|room| room.get_user(nick).is_none())
        };
        if unknown {
            return Err(MucError::UnknownUser {
                room: room_jid,
                nick: nick.to_string(),
            });
        }

        let mut message = Message::new(Some(occupant.clone()));
        message.type_ = MessageType::Chat;
        message.bodies.insert(xmpp_parsers::message::Lang(String::new()), body.to_string());
        self.send(message.into()).await
    }

    /// Send a message to everyone in the room.
    pub async fn groupchat(&self, room_jid: &BareJid, body: &str) -> Result<(), MucError> {
        let mut message = Message::new(Some(Jid::from(room_jid.clone())));
        message.type_ = MessageType::Groupchat;
        message.bodies.insert(xmpp_parsers::message::Lang(String::new()), body.to_string());
        self.send(message.into()).await
    }

    pub async fn subject(&self, room_jid: &BareJid, subject: &str) -> Result<(), MucError> {
        let mut message = Message::new(Some(Jid::from(room_jid.clone())));
        message.type_ = MessageType::Groupchat;
        message.payloads.push(elements::subject(subject));
        self.send(message.into()).await
    }

    /// Request registration with the room. Resolves with the raw reply,
    /// which carries the registration form.
    pub async fn register(&self, room_jid: &BareJid) -> Result<PendingRequest<Iq>, MucError> {
        let iq = Iq::Get {
            from: None,
            to: Some(Jid::from(room_jid.clone())),
            id: new_iq_id(),
            payload: elements::register_query(),
        };
        let (tx, pending) = PendingRequest::channel();
        self.send_iq(iq, IqResponder::Iq(tx)).await?;
        Ok(pending)
    }

    pub async fn get_configuration_form(
        &self,
        room_jid: &BareJid,
    ) -> Result<PendingRequest<Iq>, MucError> {
        let iq = Iq::Get {
            from: None,
            to: Some(Jid::from(room_jid.clone())),
            id: new_iq_id(),
            payload: elements::owner_config_request(),
        };
        let (tx, pending) = PendingRequest::channel();
        self.send_iq(iq, IqResponder::Iq(tx)).await?;
        Ok(pending)
    }

    /// Submit a room configuration form. A successful reply unlocks a room
    /// the service created for us.
    pub async fn configure(
        &self,
        room_jid: &BareJid,
        fields: &[ConfigField],
    ) -> Result<PendingRequest<Iq>, MucError> {
        let iq = Iq::Set {
            from: None,
            to: Some(Jid::from(room_jid.clone())),
            id: new_iq_id(),
            payload: elements::owner_config_submit(fields)?,
        };
        let (done, pending) = PendingRequest::channel();
        let responder = IqResponder::Configure {
            room: room_jid.clone(),
            done,
        };
        self.send_iq(iq, responder).await?;
        Ok(pending)
    }

    /// Destroy the room, optionally pointing occupants at an alternate venue.
    pub async fn destroy(
        &self,
        room_jid: &BareJid,
        reason: Option<&str>,
        alternate: Option<&BareJid>,
    ) -> Result<PendingRequest<bool>, MucError> {
        let iq = Iq::Set {
            from: None,
            to: Some(Jid::from(room_jid.clone())),
            id: new_iq_id(),
            payload: elements::owner_destroy(reason, alternate)?,
        };
        let (tx, pending) = PendingRequest::channel();
        self.send_iq(iq, IqResponder::Ack(tx)).await?;
        Ok(pending)
    }

    /// List the users holding `affiliation` in the room. The room need not
    /// be joined.
    pub async fn get_affiliation_list(
        &self,
        room_jid: &BareJid,
        affiliation: Affiliation,
    ) -> Result<PendingRequest<Vec<User>>, MucError> {
        let item = AdminItem {
            affiliation: Some(affiliation),
            ..AdminItem::default()
        };
        let iq = Iq::Get {
            from: None,
            to: Some(Jid::from(room_jid.clone())),
            id: new_iq_id(),
            payload: elements::admin_query(&[item])?,
        };
        let (tx, pending) = PendingRequest::channel();
        self.send_iq(iq, IqResponder::Members(tx)).await?;
        Ok(pending)
    }

    pub async fn get_member_list(
        &self,
        room_jid: &BareJid,
    ) -> Result<PendingRequest<Vec<User>>, MucError> {
        self.get_affiliation_list(room_jid, Affiliation::Member)
            .await
    }

    /// Replay one-to-one messages into the room as delayed groupchat.
    pub async fn history(
        &self,
        room_jid: &BareJid,
        archive: &[ArchivedMessage],
    ) -> Result<(), MucError> {
        for archived in archive {
            let mut message = archived.stanza.clone();
            message.to = Some(Jid::from(room_jid.clone()));
            message.type_ = MessageType::Groupchat;
            message
                .payloads
                .push(elements::delay(&archived.timestamp, None));
            self.send(message.into()).await?;
        }
        debug!(room = %room_jid, count = archive.len(), "Replayed history into room");
        Ok(())
    }

    /// Parse and dispatch one inbound stanza.
    pub async fn handle_inbound(&self, payload: &[u8]) -> Result<(), MucError> {
        let stanza = Stanza::parse(payload)?;
        self.handle_stanza(stanza).await;
        Ok(())
    }

    pub async fn handle_stanza(&self, stanza: Stanza) {
        let (events, hooks) = {
            let mut state = self.state.lock().await;
            let events = state.handle_stanza(stanza);
            (events, state.hooks.clone())
        };
        for event in &events {
            hooks.dispatch(event);
        }
    }

    /// Fail requests whose deadline is at or before `now`.
    pub async fn expire_requests(&self, now: Instant) -> usize {
        self.state.lock().await.expire(now)
    }

    /// A new stream is up. Rooms and requests left over from an earlier
    /// stream are dropped, since the service no longer knows about them.
    pub async fn connection_initialized(&self) {
        let failed = self.state.lock().await.teardown();
        debug!(failed, "MUC session initialized");
    }

    /// The stream went away: every pending request fails with
    /// [`MucError::Disconnected`] and all rooms are forgotten.
    pub async fn connection_lost(&self) {
        let failed = self.state.lock().await.teardown();
        if failed > 0 {
            warn!(failed, "Connection lost with MUC requests pending");
        } else {
            debug!("Connection lost");
        }
    }

    /// Dispatch inbound stanzas until the channel closes, expiring stale
    /// requests along the way.
    pub async fn run(&self, mut inbound: mpsc::Receiver<Vec<u8>>) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = inbound.recv() => {
                    let Some(payload) = received else {
                        break;
                    };
                    if let Err(error) = self.handle_inbound(&payload).await {
                        warn!(%error, "Dropping inbound stanza");
                    }
                }
                _ = sweep.tick() => {
                    self.expire_requests(Instant::now()).await;
                }
            }
        }

        self.connection_lost().await;
    }
}

/// Floor applied to a zero sweep interval, which `tokio::time::interval`
/// rejects.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

fn new_iq_id() -> String {
    Uuid::new_v4().to_string()
}

/// The nick of an occupant JID (`room@service/nick`).
fn occupant_nick(occupant: &Jid) -> Result<&str, MucError> {
    occupant
        .resource()
        .map(|resource| resource.as_str())
        .ok_or_else(|| MucError::InvalidJid(format!("{occupant} is not an occupant JID")))
}
