//! Multi-User Chat (XEP-0045) client session engine.
//!
//! [`MucClient`] tracks the rooms the local entity has joined and their
//! occupants, correlates room requests with their replies and dispatches
//! unsolicited room events to registered [`Hook`]s. It speaks serialized
//! stanzas over channels and leaves the XMPP connection itself to the
//! caller.

pub mod client;
pub mod elements;
pub mod error;
pub mod hooks;
pub mod ns;
pub mod pending;
pub mod registry;
pub mod room;
mod session;
pub mod stanza;

pub use client::{ArchivedMessage, MucClient};
pub use elements::{ConfigField, HistoryOptions};
pub use error::{MucError, PipelineError, StanzaFailure};
pub use hooks::{Hook, HookEvent};
pub use pending::PendingRequest;
pub use registry::RoomRegistry;
pub use room::{Affiliation, Role, Room, User};
pub use stanza::Stanza;
