//! Correlation of outbound requests with their asynchronous replies.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::time::Instant;
use xmpp_parsers::iq::Iq;
use xmpp_parsers::jid::BareJid;
use xmpp_parsers::minidom::Element;

use crate::elements::{parse_admin_items, parse_stanza_error};
use crate::error::{MucError, StanzaFailure};
use crate::room::{Room, User};

/// A reply that has not arrived yet.
///
/// Resolves exactly once: with the reply, with the error the service
/// returned, or with [`MucError::Timeout`] / [`MucError::Disconnected`].
#[must_use = "a pending request does nothing unless awaited"]
#[derive(Debug)]
pub struct PendingRequest<T> {
    rx: oneshot::Receiver<Result<T, MucError>>,
}

impl<T> PendingRequest<T> {
    pub(crate) fn channel() -> (oneshot::Sender<Result<T, MucError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl<T> Future for PendingRequest<T> {
    type Output = Result<T, MucError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(MucError::Disconnected)))
    }
}

/// How the reply to a tracked IQ is turned into a result.
#[derive(Debug)]
pub(crate) enum IqResponder {
    /// Any `result` counts as success.
    Ack(oneshot::Sender<Result<bool, MucError>>),
    /// The caller gets the raw reply.
    Iq(oneshot::Sender<Result<Iq, MucError>>),
    /// The reply carries an admin item list.
    Members(oneshot::Sender<Result<Vec<User>, MucError>>),
    /// An owner configuration submit; a `result` unlocks the room.
    Configure {
        room: BareJid,
        done: oneshot::Sender<Result<Iq, MucError>>,
    },
}

impl IqResponder {
    /// The room a successful reply to this request unlocks.
    pub(crate) fn unlocks(&self, iq: &Iq) -> Option<&BareJid> {
        match (self, iq) {
            (IqResponder::Configure { room, .. }, Iq::Result { .. }) => Some(room),
            _ => None,
        }
    }

    pub(crate) fn resolve(self, iq: Iq) {
        if matches!(iq, Iq::Error { .. }) {
            let element = Element::from(iq);
            self.fail(MucError::Protocol(failure_of(&element)));
            return;
        }

        match self {
            IqResponder::Ack(tx) => {
                let _ = tx.send(Ok(true));
            }
            IqResponder::Iq(tx) | IqResponder::Configure { done: tx, .. } => {
                let _ = tx.send(Ok(iq));
            }
            IqResponder::Members(tx) => {
                let members = match iq {
                    Iq::Result {
                        payload: Some(query),
                        ..
                    } => parse_admin_items(&query),
                    _ => Ok(Vec::new()),
                };
                let _ = tx.send(members);
            }
        }
    }

    pub(crate) fn fail(self, error: MucError) {
        match self {
            IqResponder::Ack(tx) => {
                let _ = tx.send(Err(error));
            }
            IqResponder::Iq(tx) | IqResponder::Configure { done: tx, .. } => {
                let _ = tx.send(Err(error));
            }
            IqResponder::Members(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct PendingIq {
    pub responder: IqResponder,
    pub deadline: Instant,
}

/// An in-flight presence change on one room. Only one may be pending per
/// room, since replies are correlated by the room JID alone.
#[derive(Debug)]
pub(crate) enum Transition {
    Join {
        nick: String,
        /// Set when the join registered the room; a failed join only
        /// drops rooms it created.
        created: bool,
        done: oneshot::Sender<Result<Room, MucError>>,
    },
    NickChange {
        nick: String,
        done: oneshot::Sender<Result<Room, MucError>>,
    },
    Status {
        done: oneshot::Sender<Result<Room, MucError>>,
    },
    Leave {
        done: oneshot::Sender<Result<bool, MucError>>,
    },
}

impl Transition {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Transition::Join { .. } => "join",
            Transition::NickChange { .. } => "nick",
            Transition::Status { .. } => "status",
            Transition::Leave { .. } => "leave",
        }
    }

    /// The nick the reply presence is expected from, when it differs from
    /// the room's current nick.
    pub(crate) fn expected_nick(&self) -> Option<&str> {
        match self {
            Transition::Join { nick, .. } | Transition::NickChange { nick, .. } => Some(nick),
            Transition::Status { .. } | Transition::Leave { .. } => None,
        }
    }

    pub(crate) fn set_created(&mut self, value: bool) {
        if let Transition::Join { created, .. } = self {
            *created = value;
        }
    }

    /// Whether failing this transition should drop the room again.
    pub(crate) fn created_room(&self) -> bool {
        matches!(self, Transition::Join { created: true, .. })
    }

    pub(crate) fn fail(self, error: MucError) {
        match self {
            Transition::Join { done, .. }
            | Transition::NickChange { done, .. }
            | Transition::Status { done } => {
                let _ = done.send(Err(error));
            }
            Transition::Leave { done } => {
                let _ = done.send(Err(error));
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct PendingTransition {
    pub transition: Transition,
    pub deadline: Instant,
}

/// The error carried by an error stanza, or a generic one if it has none.
pub(crate) fn failure_of(stanza: &Element) -> StanzaFailure {
    parse_stanza_error(stanza).unwrap_or_else(|| StanzaFailure {
        error_type: "cancel".to_string(),
        condition: "undefined-condition".to_string(),
        text: None,
    })
}
