use std::str::FromStr;

use xmpp_parsers::{iq::Iq, jid::Jid, message::Message, minidom::Element, presence::Presence};

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    Message(Box<Message>),
    Presence(Box<Presence>),
    Iq(Box<Iq>),
}

impl Stanza {
    pub fn parse(raw: &[u8]) -> Result<Self, PipelineError> {
        parse_stanza(raw)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        serialize_stanza(self)
    }

    pub fn to_element(&self) -> Element {
        match self {
            Stanza::Message(message) => (**message).clone().into(),
            Stanza::Presence(presence) => (**presence).clone().into(),
            Stanza::Iq(iq) => (**iq).clone().into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
            Stanza::Iq(_) => "iq",
        }
    }

    pub fn from(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(message) => message.from.as_ref(),
            Stanza::Presence(presence) => presence.from.as_ref(),
            Stanza::Iq(iq) => iq_from(iq),
        }
    }
}

fn iq_from(iq: &Iq) -> Option<&Jid> {
    match iq {
        Iq::Get { from, .. }
        | Iq::Set { from, .. }
        | Iq::Result { from, .. }
        | Iq::Error { from, .. } => from.as_ref(),
    }
}

impl TryFrom<Element> for Stanza {
    type Error = PipelineError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        parse_stanza_element(element)
    }
}

impl From<Stanza> for Element {
    fn from(value: Stanza) -> Self {
        match value {
            Stanza::Message(message) => (*message).into(),
            Stanza::Presence(presence) => (*presence).into(),
            Stanza::Iq(iq) => (*iq).into(),
        }
    }
}

impl From<&Stanza> for Element {
    fn from(value: &Stanza) -> Self {
        value.to_element()
    }
}

impl From<Message> for Stanza {
    fn from(value: Message) -> Self {
        Stanza::Message(Box::new(value))
    }
}

impl From<Presence> for Stanza {
    fn from(value: Presence) -> Self {
        Stanza::Presence(Box::new(value))
    }
}

impl From<Iq> for Stanza {
    fn from(value: Iq) -> Self {
        Stanza::Iq(Box::new(value))
    }
}

pub fn parse_stanza(raw: &[u8]) -> Result<Stanza, PipelineError> {
    let xml = std::str::from_utf8(raw).map_err(|error| {
        PipelineError::ParseFailed(format!("invalid UTF-8 stanza bytes: {error}"))
    })?;
    let trimmed = xml.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::ParseFailed(
            "stanza payload is empty".to_string(),
        ));
    }

    let element = Element::from_str(trimmed).map_err(|error| {
        PipelineError::ParseFailed(format!("failed to parse stanza XML: {error}"))
    })?;
    parse_stanza_element(element)
}

pub fn serialize_stanza(stanza: &Stanza) -> Result<Vec<u8>, PipelineError> {
    let element = stanza.to_element();
    let mut payload = Vec::new();
    element.write_to(&mut payload).map_err(|error| {
        PipelineError::SerializeFailed(format!(
            "failed to serialize <{}/> stanza: {error}",
            stanza.name()
        ))
    })?;
    Ok(payload)
}

fn parse_stanza_element(element: Element) -> Result<Stanza, PipelineError> {
    match element.name() {
        "message" => Message::try_from(element)
            .map(|message| Stanza::Message(Box::new(message)))
            .map_err(|error| {
                PipelineError::ParseFailed(format!("failed to parse <message/> stanza: {error}"))
            }),
        "presence" => Presence::try_from(element)
            .map(|presence| Stanza::Presence(Box::new(presence)))
            .map_err(|error| {
                PipelineError::ParseFailed(format!("failed to parse <presence/> stanza: {error}"))
            }),
        "iq" => Iq::try_from(element)
            .map(|iq| Stanza::Iq(Box::new(iq)))
            .map_err(|error| {
                PipelineError::ParseFailed(format!("failed to parse <iq/> stanza: {error}"))
            }),
        other => Err(PipelineError::ParseFailed(format!(
            "unsupported stanza element <{other}/>"
        ))),
    }
}
