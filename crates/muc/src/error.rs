use std::fmt;
use std::time::Duration;

use thiserror::Error;
use xmpp_parsers::jid::BareJid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stanza parse failed: {0}")]
    ParseFailed(String),

    #[error("stanza serialization failed: {0}")]
    SerializeFailed(String),
}

/// An error condition carried by an inbound `type='error'` stanza.
///
/// `error_type` is the stanza-level `type` attribute of `<error/>` (`auth`,
/// `modify`, `cancel`, `wait`, `continue`); `condition` is the local name of
/// the defined-condition child, e.g. `forbidden` or `jid-malformed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaFailure {
    pub error_type: String,
    pub condition: String,
    pub text: Option<String>,
}

impl fmt::Display for StanzaFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.condition, self.error_type)?;
        if let Some(text) = &self.text {
            write!(f, ": {text}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MucError {
    #[error("room service returned an error: {0}")]
    Protocol(StanzaFailure),

    #[error("connection closed before a reply arrived")]
    Disconnected,

    #[error("no reply received within {0:?}")]
    Timeout(Duration),

    #[error("not joined to room {0}")]
    UnknownRoom(BareJid),

    #[error("no occupant '{nick}' in room {room}")]
    UnknownUser { room: BareJid, nick: String },

    #[error("a presence change for room {0} is already in flight")]
    TransitionPending(BareJid),

    #[error("invalid JID: {0}")]
    InvalidJid(String),

    #[error(transparent)]
    Stanza(#[from] PipelineError),

    #[error("wire send failed: transport channel closed")]
    WireSendFailed,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl MucError {
    /// The defined condition of a protocol failure (`forbidden`,
    /// `jid-malformed`, ...), if this error came from the room service.
    pub fn muc_condition(&self) -> Option<&str> {
        match self {
            MucError::Protocol(failure) => Some(failure.condition.as_str()),
            _ => None,
        }
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, MucError::Disconnected)
    }
}
