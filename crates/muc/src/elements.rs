//! Builders and parsers for the MUC extension elements carried inside
//! presence, message and IQ stanzas.
//!
//! Payloads with an `xmpp_parsers` model go through it; the `muc#admin`
//! and `muc#owner` queries are assembled with [`Element::builder`].

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use xmpp_parsers::data_forms::{DataForm, DataFormType, Field, FieldType};
use xmpp_parsers::date::DateTime as XmppDateTime;
use xmpp_parsers::delay::Delay;
use xmpp_parsers::jid::{BareJid, Jid};
use xmpp_parsers::minidom::rxml::NcName;
use xmpp_parsers::minidom::{Element, ElementBuilder, IntoAttributeValue};
use xmpp_parsers::muc::user::{Invite, MucUser, Status};
use xmpp_parsers::muc::Muc;
use xmpp_parsers::muc::muc::History;

use waddle_muc_core::HistoryConfig;

use crate::error::{MucError, PipelineError, StanzaFailure};
use crate::ns;
use crate::room::{Affiliation, Role, User};

/// Limits on the discussion history replayed when joining a room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryOptions {
    pub max_chars: Option<u32>,
    pub max_stanzas: Option<u32>,
    pub seconds: Option<u32>,
    pub since: Option<DateTime<Utc>>,
}

impl HistoryOptions {
    pub fn max_stanzas(count: u32) -> Self {
        Self {
            max_stanzas: Some(count),
            ..Self::default()
        }
    }

    pub fn since(stamp: DateTime<Utc>) -> Self {
        Self {
            since: Some(stamp),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.max_chars.is_none()
            && self.max_stanzas.is_none()
            && self.seconds.is_none()
            && self.since.is_none()
    }

    fn to_history(&self) -> History {
        History {
            maxchars: self.max_chars,
            maxstanzas: self.max_stanzas,
            seconds: self.seconds,
            since: self.since.map(|stamp| XmppDateTime(stamp.fixed_offset())),
        }
    }
}

impl From<&HistoryConfig> for HistoryOptions {
    fn from(config: &HistoryConfig) -> Self {
        Self {
            max_chars: config.max_chars,
            max_stanzas: config.max_stanzas,
            seconds: config.seconds,
            since: None,
        }
    }
}

/// One `<item/>` of an admin request changing a role or an affiliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdminItem {
    pub nick: Option<String>,
    pub jid: Option<BareJid>,
    pub affiliation: Option<Affiliation>,
    pub role: Option<Role>,
    pub reason: Option<String>,
}

/// A single field of a room configuration form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigField {
    pub var: String,
    pub label: Option<String>,
    pub field_type: Option<String>,
    pub values: Vec<String>,
}

impl ConfigField {
    pub fn new(var: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            label: None,
            field_type: None,
            values: vec![value.into()],
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_type(mut self, field_type: impl Into<String>) -> Self {
        self.field_type = Some(field_type.into());
        self
    }

    fn to_field(&self) -> Result<Field, PipelineError> {
        let type_ = match self.field_type.as_deref() {
            Some(raw) => raw.parse::<FieldType>().map_err(|error| {
                PipelineError::SerializeFailed(format!(
                    "field {} has invalid type '{raw}': {error}",
                    self.var
                ))
            })?,
            None => FieldType::default(),
        };
        let mut field = Field::new(&self.var, type_);
        field.label = self.label.clone();
        field.values = self.values.clone();
        Ok(field)
    }
}

/// What a `muc#user` presence child says about an occupant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MucUserInfo {
    pub affiliation: Affiliation,
    pub role: Role,
    pub entity: Option<Jid>,
    /// New nick announced alongside [`Status::NewNick`].
    pub new_nick: Option<String>,
    pub statuses: Vec<Status>,
}

impl MucUserInfo {
    pub fn has_status(&self, status: Status) -> bool {
        self.statuses.contains(&status)
    }
}

impl From<MucUser> for MucUserInfo {
    fn from(muc_user: MucUser) -> Self {
        let mut info = MucUserInfo {
            statuses: muc_user.status,
            ..MucUserInfo::default()
        };
        if let Some(item) = muc_user.items.into_iter().next() {
            info.affiliation = Affiliation::from(&item.affiliation);
            info.role = Role::from(&item.role);
            info.entity = item.jid.map(Jid::from);
            info.new_nick = item.nick;
        }
        info
    }
}

/// A `<delay/>` marker on a replayed message.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayInfo {
    pub stamp: DateTime<FixedOffset>,
    pub from: Option<Jid>,
}

fn attr_name(name: &str) -> Result<NcName, PipelineError> {
    NcName::try_from(name).map_err(|error| {
        PipelineError::SerializeFailed(format!("invalid attribute name '{name}': {error}"))
    })
}

fn with_attr<V: IntoAttributeValue>(
    builder: ElementBuilder,
    name: &str,
    value: V,
) -> Result<ElementBuilder, PipelineError> {
    Ok(builder.attr(attr_name(name)?, value))
}

fn text_element(name: &str, namespace: &str, text: &str) -> Element {
    Element::builder(name, namespace).append(text).build()
}

/// `<x xmlns='http://jabber.org/protocol/muc'/>` for a join or
/// password presence.
pub fn muc_join(password: Option<&str>, history: Option<&HistoryOptions>) -> Element {
    let mut muc = Muc::new();
    if let Some(password) = password {
        muc = muc.with_password(password.to_string());
    }
    if let Some(history) = history.filter(|h| !h.is_empty()) {
        muc = muc.with_history(history.to_history());
    }
    muc.into()
}

fn admin_item(item: &AdminItem) -> Result<Element, PipelineError> {
    let mut builder = Element::builder("item", ns::MUC_ADMIN);
    builder = with_attr(builder, "affiliation", item.affiliation.map(|a| a.as_str()))?;
    builder = with_attr(builder, "jid", item.jid.as_ref().map(|j| j.to_string()))?;
    builder = with_attr(builder, "nick", item.nick.as_deref())?;
    builder = with_attr(builder, "role", item.role.map(|r| r.as_str()))?;
    if let Some(reason) = &item.reason {
        builder = builder.append(text_element("reason", ns::MUC_ADMIN, reason));
    }
    Ok(builder.build())
}

/// `<query xmlns='…muc#admin'/>` with the given items.
pub fn admin_query(items: &[AdminItem]) -> Result<Element, PipelineError> {
    let items = items
        .iter()
        .map(admin_item)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Element::builder("query", ns::MUC_ADMIN)
        .append_all(items)
        .build())
}

/// Owner query submitting a filled-in room configuration form.
pub fn owner_config_submit(fields: &[ConfigField]) -> Result<Element, PipelineError> {
    let fields = fields
        .iter()
        .map(ConfigField::to_field)
        .collect::<Result<Vec<_>, _>>()?;
    let form = DataForm::new(DataFormType::Submit, ns::MUC_ROOMCONFIG, fields);
    Ok(Element::builder("query", ns::MUC_OWNER)
        .append(Element::from(form))
        .build())
}

/// Owner query requesting the room configuration form.
pub fn owner_config_request() -> Element {
    Element::builder("query", ns::MUC_OWNER).build()
}

pub fn owner_destroy(
    reason: Option<&str>,
    alternate: Option<&BareJid>,
) -> Result<Element, PipelineError> {
    let mut destroy = Element::builder("destroy", ns::MUC_OWNER);
    destroy = with_attr(destroy, "jid", alternate.map(|j| j.to_string()))?;
    if let Some(reason) = reason {
        destroy = destroy.append(text_element("reason", ns::MUC_OWNER, reason));
    }
    Ok(Element::builder("query", ns::MUC_OWNER)
        .append(destroy.build())
        .build())
}

pub fn register_query() -> Element {
    Element::builder("query", ns::REGISTER).build()
}

/// Mediated invitation sent through the room (XEP-0045 §7.8.2).
pub fn invite(invitee: &Jid, reason: Option<&str>) -> Element {
    let mut muc_user = MucUser::new();
    muc_user.invite = Some(Invite {
        from: None,
        to: Some(invitee.clone()),
        reason: reason.map(str::to_string),
    });
    muc_user.into()
}

/// Data form asking the moderators for voice (XEP-0045 §7.13).
pub fn voice_request() -> Element {
    let mut role = Field::text_single("muc#role", "participant");
    role.label = Some("Requested role".to_string());
    DataForm::new(DataFormType::Submit, ns::MUC_REQUEST, vec![role]).into()
}

/// `<subject/>` for a groupchat message changing the room subject.
pub fn subject(text: &str) -> Element {
    text_element("subject", ns::CLIENT, text)
}

pub fn delay(stamp: &DateTime<Utc>, from: Option<&Jid>) -> Element {
    Delay {
        from: from.cloned(),
        stamp: XmppDateTime(stamp.fixed_offset()),
        data: None,
    }
    .into()
}

/// Extract the error condition of an error stanza.
pub fn parse_stanza_error(stanza: &Element) -> Option<StanzaFailure> {
    let error = stanza.children().find(|child| child.name() == "error")?;
    let error_type = error.attr("type").unwrap_or("cancel").to_string();

    let mut condition = None;
    let mut text = None;
    for child in error.children() {
        if child.ns() != ns::STANZAS {
            continue;
        }
        if child.name() == "text" {
            text = Some(child.text());
        } else if condition.is_none() {
            condition = Some(child.name().to_string());
        }
    }

    Some(StanzaFailure {
        error_type,
        condition: condition.unwrap_or_else(|| "undefined-condition".to_string()),
        text,
    })
}

/// Parse an `<item/>` from a `muc#user` or `muc#admin` payload.
pub fn parse_item(item: &Element) -> Result<User, MucError> {
    let affiliation = match item.attr("affiliation") {
        Some(value) => value.parse()?,
        None => Affiliation::None,
    };
    let role = match item.attr("role") {
        Some(value) => value.parse()?,
        None => Role::None,
    };
    let entity = match item.attr("jid") {
        Some(value) => Some(
            value
                .parse::<Jid>()
                .map_err(|_| MucError::InvalidJid(value.to_string()))?,
        ),
        None => None,
    };

    Ok(User {
        nick: item.attr("nick").unwrap_or_default().to_string(),
        entity,
        affiliation,
        role,
        ..User::default()
    })
}

/// Items of an admin query result, in document order.
pub fn parse_admin_items(query: &Element) -> Result<Vec<User>, MucError> {
    if !query.is("query", ns::MUC_ADMIN) {
        return Err(MucError::UnexpectedResponse(format!(
            "expected <query xmlns='{}'/>, got <{}/>",
            ns::MUC_ADMIN,
            query.name()
        )));
    }

    query
        .children()
        .filter(|child| child.name() == "item")
        .map(parse_item)
        .collect()
}

/// Find and parse the `muc#user` child among presence payloads.
pub fn parse_muc_user(payloads: &[Element]) -> Option<MucUserInfo> {
    payloads
        .iter()
        .filter(|el| el.is("x", ns::MUC_USER))
        .find_map(|el| MucUser::try_from(el.clone()).ok())
        .map(MucUserInfo::from)
}

/// Find the delayed-delivery marker among message payloads.
pub fn parse_delay(payloads: &[Element]) -> Option<DelayInfo> {
    let modern = payloads
        .iter()
        .filter(|el| el.is("delay", ns::DELAY))
        .find_map(|el| Delay::try_from(el.clone()).ok());
    if let Some(delay) = modern {
        return Some(DelayInfo {
            stamp: delay.stamp.0,
            from: delay.from,
        });
    }

    // jabber:x:delay stamps are UTC without separators or offset.
    let legacy = payloads.iter().find(|el| el.is("x", ns::LEGACY_DELAY))?;
    let naive = NaiveDateTime::parse_from_str(legacy.attr("stamp")?, "%Y%m%dT%H:%M:%S").ok()?;
    Some(DelayInfo {
        stamp: naive.and_utc().fixed_offset(),
        from: legacy.attr("from").and_then(|f| f.parse().ok()),
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn child<'a>(el: &'a Element, name: &str) -> &'a Element {
        el.children()
            .find(|c| c.name() == name)
            .unwrap_or_else(|| panic!("missing <{name}/>"))
    }

    #[test]
    fn join_element_is_bare_without_options() {
        let x = muc_join(None, None);
        assert!(x.is("x", ns::MUC));
        assert_eq!(x.children().count(), 0);
    }

    #[test]
    fn join_element_carries_password_and_history() {
        let history = HistoryOptions {
            max_stanzas: Some(20),
            since: Some(Utc.with_ymd_and_hms(2002, 10, 13, 23, 58, 37).unwrap()),
            ..HistoryOptions::default()
        };
        let x = muc_join(Some("s3cr<t"), Some(&history));

        assert_eq!(child(&x, "password").text(), "s3cr<t");
        let history = child(&x, "history");
        assert_eq!(history.attr("maxstanzas"), Some("20"));
        let since = history.attr("since").unwrap();
        assert_eq!(
            DateTime::parse_from_rfc3339(since).unwrap(),
            Utc.with_ymd_and_hms(2002, 10, 13, 23, 58, 37).unwrap()
        );
        assert_eq!(history.attr("maxchars"), None);
    }

    #[test]
    fn empty_history_options_are_omitted() {
        let x = muc_join(None, Some(&HistoryOptions::default()));
        assert!(x.get_child("history", ns::MUC).is_none());
    }

    #[test]
    fn admin_query_renders_items_with_reason() {
        let query = admin_query(&[AdminItem {
            nick: Some("TroubleMakger".to_string()),
            affiliation: Some(Affiliation::None),
            role: Some(Role::None),
            reason: Some("Spam & eggs".to_string()),
            ..AdminItem::default()
        }])
        .unwrap();

        assert!(query.is("query", ns::MUC_ADMIN));
        let item = child(&query, "item");
        assert_eq!(item.attr("nick"), Some("TroubleMakger"));
        assert_eq!(item.attr("affiliation"), Some("none"));
        assert_eq!(item.attr("role"), Some("none"));
        assert_eq!(child(item, "reason").text(), "Spam & eggs");
    }

    #[test]
    fn config_submit_includes_form_type_and_fields() {
        let query = owner_config_submit(&[ConfigField::new("muc#roomconfig_roomname", "test")
            .with_label("Natural-Language Room Name")])
        .unwrap();

        let x = child(&query, "x");
        assert!(x.is("x", ns::DATA_FORMS));
        assert_eq!(x.attr("type"), Some("submit"));
        let vars: Vec<&str> = x.children().filter_map(|f| f.attr("var")).collect();
        assert_eq!(vars, ["FORM_TYPE", "muc#roomconfig_roomname"]);
    }

    #[test]
    fn destroy_carries_alternate_venue() {
        let alternate: BareJid = "coven@chat.shakespeare.lit".parse().unwrap();
        let query = owner_destroy(Some("Macbeth doth come."), Some(&alternate)).unwrap();
        let destroy = child(&query, "destroy");
        assert_eq!(destroy.attr("jid"), Some("coven@chat.shakespeare.lit"));
        assert_eq!(child(destroy, "reason").text(), "Macbeth doth come.");
    }

    #[test]
    fn voice_request_names_request_form() {
        let x = voice_request();
        assert_eq!(x.attr("type"), Some("submit"));
        let form_type = x
            .children()
            .find(|f| f.attr("var") == Some("FORM_TYPE"))
            .unwrap();
        assert_eq!(child(form_type, "value").text(), ns::MUC_REQUEST);
    }

    #[test]
    fn parses_stanza_error_condition() {
        let presence: Element = "<presence xmlns='jabber:client' type='error' \
            from='test@conference.example.org/Nick'>\
            <error type='modify'>\
            <jid-malformed xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
            <text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>bad nick</text>\
            </error></presence>"
            .parse()
            .unwrap();

        let failure = parse_stanza_error(&presence).unwrap();
        assert_eq!(failure.error_type, "modify");
        assert_eq!(failure.condition, "jid-malformed");
        assert_eq!(failure.text.as_deref(), Some("bad nick"));
    }

    #[test]
    fn stanza_without_error_child_has_no_failure() {
        let presence: Element = "<presence xmlns='jabber:client'/>".parse().unwrap();
        assert!(parse_stanza_error(&presence).is_none());
    }

    #[test]
    fn parses_admin_items() {
        let query: Element = "<query xmlns='http://jabber.org/protocol/muc#admin'>\
            <item affiliation='member' jid='hag66@shakespeare.lit' nick='thirdwitch' role='participant'/>\
            </query>"
            .parse()
            .unwrap();

        let users = parse_admin_items(&query).unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].nick, "thirdwitch");
        assert_eq!(users[0].affiliation, Affiliation::Member);
        assert_eq!(users[0].role, Role::Participant);
        assert_eq!(
            users[0].entity.as_ref().map(|j| j.to_string()),
            Some("hag66@shakespeare.lit".to_string())
        );
    }

    #[test]
    fn rejects_admin_items_with_unknown_affiliation() {
        let query: Element = "<query xmlns='http://jabber.org/protocol/muc#admin'>\
            <item affiliation='friend'/></query>"
            .parse()
            .unwrap();
        assert!(parse_admin_items(&query).is_err());
    }

    #[test]
    fn parses_muc_user_status_codes() {
        let x: Element = "<x xmlns='http://jabber.org/protocol/muc#user'>\
            <item affiliation='owner' role='moderator'/>\
            <status code='110'/><status code='201'/></x>"
            .parse()
            .unwrap();

        let info = parse_muc_user(&[x]).unwrap();
        assert_eq!(info.affiliation, Affiliation::Owner);
        assert_eq!(info.role, Role::Moderator);
        assert!(info.has_status(Status::SelfPresence));
        assert!(info.has_status(Status::RoomHasBeenCreated));
        assert!(!info.has_status(Status::Kicked));
    }

    #[test]
    fn parses_modern_and_legacy_delay() {
        let modern: Element =
            "<delay xmlns='urn:xmpp:delay' stamp='2002-10-13T23:58:37Z' from='crone1@shakespeare.lit/desktop'/>"
                .parse()
                .unwrap();
        let delay = parse_delay(&[modern]).unwrap();
        assert_eq!(delay.stamp.to_rfc3339(), "2002-10-13T23:58:37+00:00");
        assert_eq!(
            delay.from.map(|j| j.to_string()),
            Some("crone1@shakespeare.lit/desktop".to_string())
        );

        let legacy: Element = "<x xmlns='jabber:x:delay' stamp='20021013T23:58:37'/>"
            .parse()
            .unwrap();
        let delay = parse_delay(&[legacy]).unwrap();
        assert_eq!(delay.stamp.to_rfc3339(), "2002-10-13T23:58:37+00:00");
    }

    #[test]
    fn delay_round_trips_through_parser() {
        let stamp = Utc.with_ymd_and_hms(2002, 10, 13, 23, 58, 43).unwrap();
        let element = delay(&stamp, None);
        let parsed = parse_delay(&[element]).unwrap();
        assert_eq!(parsed.stamp, stamp.fixed_offset());
        assert!(parsed.from.is_none());
    }

    #[test]
    fn nick_change_item_carries_new_nick() {
        let x: Element = "<x xmlns='http://jabber.org/protocol/muc#user'>\
            <item affiliation='member' role='participant' nick='oldhag2' \
            jid='hag66@shakespeare.lit/pda'/>\
            <status code='303'/></x>"
            .parse()
            .unwrap();

        let info = parse_muc_user(&[x]).unwrap();
        assert!(info.has_status(Status::NewNick));
        assert_eq!(info.new_nick.as_deref(), Some("oldhag2"));
        assert_eq!(
            info.entity.map(|j| j.to_string()),
            Some("hag66@shakespeare.lit/pda".to_string())
        );
    }

    #[test]
    fn malformed_muc_user_is_ignored() {
        let x: Element = "<x xmlns='http://jabber.org/protocol/muc#user'>\
            <status code='999'/></x>"
            .parse()
            .unwrap();
        assert!(parse_muc_user(&[x]).is_none());
    }

    #[test]
    fn invite_names_invitee_and_reason() {
        let invitee: Jid = "hecate@shakespeare.lit".parse().unwrap();
        let x = invite(&invitee, Some("Hey Hecate & co"));

        assert!(x.is("x", ns::MUC_USER));
        let invite = child(&x, "invite");
        assert_eq!(invite.attr("to"), Some("hecate@shakespeare.lit"));
        assert_eq!(child(invite, "reason").text(), "Hey Hecate & co");
    }

    #[test]
    fn config_field_with_unknown_type_is_rejected() {
        let field = ConfigField::new("muc#roomconfig_roomname", "test").with_type("text-fancy");
        assert!(matches!(
            owner_config_submit(&[field]),
            Err(PipelineError::SerializeFailed(_))
        ));
    }

    #[test]
    fn subject_keeps_markup_as_text() {
        let subject = subject("Fire <Burn>");
        assert!(subject.is("subject", ns::CLIENT));
        assert_eq!(subject.text(), "Fire <Burn>");
    }
}
