//! XML namespaces used by the MUC protocol (XEP-0045) and its helpers.

pub const MUC: &str = "http://jabber.org/protocol/muc";
pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
pub const MUC_ADMIN: &str = "http://jabber.org/protocol/muc#admin";
pub const MUC_OWNER: &str = "http://jabber.org/protocol/muc#owner";
/// Value of the `FORM_TYPE` field in a voice request.
pub const MUC_REQUEST: &str = "http://jabber.org/protocol/muc#request";
pub const MUC_ROOMCONFIG: &str = "http://jabber.org/protocol/muc#roomconfig";

/// In-band registration, used for room registration (XEP-0045 §7.10).
pub const REGISTER: &str = "jabber:iq:register";
pub const DATA_FORMS: &str = "jabber:x:data";

pub const DELAY: &str = "urn:xmpp:delay";
/// Legacy delayed delivery (XEP-0091), still sent by older services.
pub const LEGACY_DELAY: &str = "jabber:x:delay";

pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
pub const CLIENT: &str = "jabber:client";
