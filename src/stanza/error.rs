/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use thiserror::Error;

use crate::BadJid;
use crate::Element;
use crate::constants::STANZAS_ERROR_NS;

/// Why a top-level element could not be read as a stanza.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum InvalidStanza {
    #[error("<{0}/> is not a stanza")]
    NotStanza(String),
    #[error(transparent)]
    Jid(#[from] BadJid),
    #[error("unknown {kind} type '{value}'")]
    Type { kind: &'static str, value: String },
    #[error("iq stanza without an id")]
    MissingId,
}

/// The `type` attribute of a stanza error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorType {
    Auth,
    Cancel,
    Continue,
    Modify,
    Wait,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Auth => "auth",
            ErrorType::Cancel => "cancel",
            ErrorType::Continue => "continue",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "auth" => Some(ErrorType::Auth),
            "cancel" => Some(ErrorType::Cancel),
            "continue" => Some(ErrorType::Continue),
            "modify" => Some(ErrorType::Modify),
            "wait" => Some(ErrorType::Wait),
            _ => None,
        }
    }
}

/// An error carried inside a stanza of type `error`.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("{condition} ({})", .kind.as_str())]
pub struct StanzaError {
    pub kind: ErrorType,
    pub condition: String,
    pub text: Option<String>,
}

impl StanzaError {
    pub fn new(kind: ErrorType, condition: impl Into<String>) -> Self {
        StanzaError {
            kind,
            condition: condition.into(),
            text: None,
        }
    }

    pub fn service_unavailable() -> Self {
        Self::new(ErrorType::Cancel, "service-unavailable")
    }

    pub fn feature_not_implemented() -> Self {
        Self::new(ErrorType::Cancel, "feature-not-implemented")
    }

    pub fn bad_request() -> Self {
        Self::new(ErrorType::Modify, "bad-request")
    }

    /// Reads the `<error/>` child of a stanza.
    pub fn from_stanza(stanza: &Element) -> Option<Self> {
        let error = stanza.children().find(|child| child.name() == "error")?;
        let kind = error
            .attr("type")
            .and_then(ErrorType::parse)
            .unwrap_or(ErrorType::Cancel);
        let condition = error
            .children()
            .find(|child| child.ns() == Some(STANZAS_ERROR_NS) && child.name() != "text")
            .map(|child| child.name().to_string())
            .unwrap_or_else(|| "undefined-condition".to_string());
        let text = error.child_text("text", STANZAS_ERROR_NS);
        Some(StanzaError {
            kind,
            condition,
            text,
        })
    }

    pub fn to_element(&self) -> Element {
        let mut error = Element::new("error")
            .with_attr("type", self.kind.as_str())
            .with_child(Element::with_ns(self.condition.as_str(), STANZAS_ERROR_NS));
        if let Some(text) = &self.text {
            error.push_child(Element::with_ns("text", STANZAS_ERROR_NS).with_text(text.as_str()));
        }
        error
    }
}
