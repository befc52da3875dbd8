/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

mod error;

use serde::Deserialize;
use serde::Serialize;

pub use error::ErrorType;
pub use error::InvalidStanza;
pub use error::StanzaError;

use crate::Element;
use crate::Jid;
use crate::constants::CLIENT_NS;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum MessageType {
    Chat,
    Error,
    Groupchat,
    Headline,
    #[default]
    Normal,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Chat => "chat",
            MessageType::Error => "error",
            MessageType::Groupchat => "groupchat",
            MessageType::Headline => "headline",
            MessageType::Normal => "normal",
        }
    }

    fn parse(value: Option<&str>) -> Result<Self, InvalidStanza> {
        match value {
            None | Some("normal") => Ok(MessageType::Normal),
            Some("chat") => Ok(MessageType::Chat),
            Some("error") => Ok(MessageType::Error),
            Some("groupchat") => Ok(MessageType::Groupchat),
            Some("headline") => Ok(MessageType::Headline),
            Some(other) => Err(InvalidStanza::Type {
                kind: "message",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum PresenceType {
    #[default]
    Available,
    Error,
    Probe,
    Subscribe,
    Subscribed,
    Unavailable,
    Unsubscribe,
    Unsubscribed,
}

impl PresenceType {
    /// The attribute value, available presence has none.
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            PresenceType::Available => None,
            PresenceType::Error => Some("error"),
            PresenceType::Probe => Some("probe"),
            PresenceType::Subscribe => Some("subscribe"),
            PresenceType::Subscribed => Some("subscribed"),
            PresenceType::Unavailable => Some("unavailable"),
            PresenceType::Unsubscribe => Some("unsubscribe"),
            PresenceType::Unsubscribed => Some("unsubscribed"),
        }
    }

    fn parse(value: Option<&str>) -> Result<Self, InvalidStanza> {
        match value {
            None => Ok(PresenceType::Available),
            Some("error") => Ok(PresenceType::Error),
            Some("probe") => Ok(PresenceType::Probe),
            Some("subscribe") => Ok(PresenceType::Subscribe),
            Some("subscribed") => Ok(PresenceType::Subscribed),
            Some("unavailable") => Ok(PresenceType::Unavailable),
            Some("unsubscribe") => Ok(PresenceType::Unsubscribe),
            Some("unsubscribed") => Ok(PresenceType::Unsubscribed),
            Some(other) => Err(InvalidStanza::Type {
                kind: "presence",
                value: other.to_string(),
            }),
        }
    }
}

/// Availability sub-state of an available presence.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Show {
    Away,
    Chat,
    Dnd,
    Xa,
}

impl Show {
    pub fn as_str(&self) -> &'static str {
        match self {
            Show::Away => "away",
            Show::Chat => "chat",
            Show::Dnd => "dnd",
            Show::Xa => "xa",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "away" => Some(Show::Away),
            "chat" => Some(Show::Chat),
            "dnd" => Some(Show::Dnd),
            "xa" => Some(Show::Xa),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    fn parse(value: Option<&str>) -> Result<Self, InvalidStanza> {
        match value {
            Some("get") => Ok(IqType::Get),
            Some("set") => Ok(IqType::Set),
            Some("result") => Ok(IqType::Result),
            Some("error") => Ok(IqType::Error),
            other => Err(InvalidStanza::Type {
                kind: "iq",
                value: other.unwrap_or_default().to_string(),
            }),
        }
    }

    /// True for request types, which always deserve an answer.
    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

fn jid_attr(element: &Element, name: &str) -> Result<Option<Jid>, InvalidStanza> {
    match element.attr(name) {
        Some(value) => Ok(Some(Jid::new(value)?)),
        None => Ok(None),
    }
}

/// Copies the payload with its routing attributes taken from the fields.
fn stamp(
    payload: &Element,
    from: Option<&Jid>,
    to: Option<&Jid>,
    id: Option<&str>,
    kind: Option<&str>,
) -> Element {
    let mut element = payload.clone();
    for (name, value) in [
        ("from", from.map(Jid::full)),
        ("to", to.map(Jid::full)),
        ("id", id),
        ("type", kind),
    ] {
        match value {
            Some(value) => element.set_attr(name, value),
            None => {
                element.remove_attr(name);
            }
        }
    }
    element
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: Option<String>,
    pub kind: MessageType,
    pub payload: Element,
}

impl Message {
    pub fn new(kind: MessageType) -> Self {
        Message {
            from: None,
            to: None,
            id: None,
            kind,
            payload: Element::with_ns("message", CLIENT_NS),
        }
    }

    /// A one-to-one chat message with a text body.
    pub fn chat(to: Jid, body: &str) -> Self {
        let mut message = Message::new(MessageType::Chat).with_body(body);
        message.to = Some(to);
        message
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.payload.push_child(Element::new("body").with_text(body));
        self
    }

    pub fn body(&self) -> Option<String> {
        self.payload.child_text("body", CLIENT_NS)
    }

    pub fn error(&self) -> Option<StanzaError> {
        match self.kind {
            MessageType::Error => StanzaError::from_stanza(&self.payload),
            _ => None,
        }
    }

    pub fn from_element(element: Element) -> Result<Self, InvalidStanza> {
        Ok(Message {
            from: jid_attr(&element, "from")?,
            to: jid_attr(&element, "to")?,
            id: element.attr("id").map(str::to_string),
            kind: MessageType::parse(element.attr("type"))?,
            payload: element,
        })
    }

    pub fn to_element(&self) -> Element {
        let kind = match self.kind {
            MessageType::Normal => None,
            kind => Some(kind.as_str()),
        };
        stamp(
            &self.payload,
            self.from.as_ref(),
            self.to.as_ref(),
            self.id.as_deref(),
            kind,
        )
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Presence {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: Option<String>,
    pub kind: PresenceType,
    pub payload: Element,
}

impl Presence {
    pub fn new(kind: PresenceType) -> Self {
        Presence {
            from: None,
            to: None,
            id: None,
            kind,
            payload: Element::with_ns("presence", CLIENT_NS),
        }
    }

    pub fn available() -> Self {
        Self::new(PresenceType::Available)
    }

    pub fn unavailable() -> Self {
        Self::new(PresenceType::Unavailable)
    }

    /// Subscription management presence (subscribe, subscribed, ...) to a contact.
    pub fn subscription(kind: PresenceType, to: Jid) -> Self {
        let mut presence = Self::new(kind);
        presence.to = Some(to);
        presence
    }

    pub fn with_show(mut self, show: Show) -> Self {
        self.payload.push_child(Element::new("show").with_text(show.as_str()));
        self
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.payload.push_child(Element::new("status").with_text(status));
        self
    }

    pub fn with_priority(mut self, priority: i8) -> Self {
        self.payload
            .push_child(Element::new("priority").with_text(priority.to_string()));
        self
    }

    pub fn show(&self) -> Option<Show> {
        self.payload
            .child_text("show", CLIENT_NS)
            .and_then(|show| Show::parse(&show))
    }

    pub fn status(&self) -> Option<String> {
        self.payload.child_text("status", CLIENT_NS)
    }

    pub fn priority(&self) -> i8 {
        self.payload
            .child_text("priority", CLIENT_NS)
            .and_then(|priority| priority.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn from_element(element: Element) -> Result<Self, InvalidStanza> {
        Ok(Presence {
            from: jid_attr(&element, "from")?,
            to: jid_attr(&element, "to")?,
            id: element.attr("id").map(str::to_string),
            kind: PresenceType::parse(element.attr("type"))?,
            payload: element,
        })
    }

    pub fn to_element(&self) -> Element {
        stamp(
            &self.payload,
            self.from.as_ref(),
            self.to.as_ref(),
            self.id.as_deref(),
            self.kind.as_str(),
        )
    }
}

/// Info/query request or response.
///
/// Requests built locally may leave `id` empty; the session assigns a
/// unique one when the request is sent.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Iq {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: String,
    pub kind: IqType,
    pub payload: Element,
}

impl Iq {
    pub fn new(kind: IqType, id: impl Into<String>, child: Option<Element>) -> Self {
        let mut payload = Element::with_ns("iq", CLIENT_NS);
        if let Some(child) = child {
            payload.push_child(child);
        }
        Iq {
            from: None,
            to: None,
            id: id.into(),
            kind,
            payload,
        }
    }

    pub fn get(child: Element) -> Self {
        Self::new(IqType::Get, "", Some(child))
    }

    pub fn set(child: Element) -> Self {
        Self::new(IqType::Set, "", Some(child))
    }

    pub fn with_to(mut self, to: Jid) -> Self {
        self.to = Some(to);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Successful answer to a request.
    pub fn result(request: &Iq, child: Option<Element>) -> Self {
        let mut iq = Self::new(IqType::Result, request.id.clone(), child);
        iq.to = request.from.clone();
        iq
    }

    /// Error answer to a request, echoing the request payload.
    pub fn error(request: &Iq, error: &StanzaError) -> Self {
        let mut iq = Self::new(IqType::Error, request.id.clone(), request.child().cloned());
        iq.payload.push_child(error.to_element());
        iq.to = request.from.clone();
        iq
    }

    /// The payload child: the first child which is not an error.
    pub fn child(&self) -> Option<&Element> {
        self.payload.children().find(|child| child.name() != "error")
    }

    pub fn stanza_error(&self) -> Option<StanzaError> {
        match self.kind {
            IqType::Error => StanzaError::from_stanza(&self.payload),
            _ => None,
        }
    }

    pub fn from_element(element: Element) -> Result<Self, InvalidStanza> {
        let id = element.attr("id").ok_or(InvalidStanza::MissingId)?.to_string();
        Ok(Iq {
            from: jid_attr(&element, "from")?,
            to: jid_attr(&element, "to")?,
            id,
            kind: IqType::parse(element.attr("type"))?,
            payload: element,
        })
    }

    pub fn to_element(&self) -> Element {
        stamp(
            &self.payload,
            self.from.as_ref(),
            self.to.as_ref(),
            Some(&self.id),
            Some(self.kind.as_str()),
        )
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

/// One of the three XMPP stanza types.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Stanza {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
}

impl Stanza {
    pub fn from_element(element: Element) -> Result<Self, InvalidStanza> {
        if !matches!(element.ns(), None | Some(CLIENT_NS)) {
            return Err(InvalidStanza::NotStanza(element.name().to_string()));
        }
        match element.name() {
            "message" => Ok(Stanza::Message(Message::from_element(element)?)),
            "presence" => Ok(Stanza::Presence(Presence::from_element(element)?)),
            "iq" => Ok(Stanza::Iq(Iq::from_element(element)?)),
            other => Err(InvalidStanza::NotStanza(other.to_string())),
        }
    }

    pub fn to_element(&self) -> Element {
        match self {
            Stanza::Message(message) => message.to_element(),
            Stanza::Presence(presence) => presence.to_element(),
            Stanza::Iq(iq) => iq.to_element(),
        }
    }

    pub fn kind(&self) -> StanzaKind {
        match self {
            Stanza::Message(_) => StanzaKind::Message,
            Stanza::Presence(_) => StanzaKind::Presence,
            Stanza::Iq(_) => StanzaKind::Iq,
        }
    }

    pub fn from(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(message) => message.from.as_ref(),
            Stanza::Presence(presence) => presence.from.as_ref(),
            Stanza::Iq(iq) => iq.from.as_ref(),
        }
    }
}

impl From<Message> for Stanza {
    fn from(message: Message) -> Self {
        Stanza::Message(message)
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        Stanza::Presence(presence)
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(iq)
    }
}

#[cfg(test)]
mod tests;
