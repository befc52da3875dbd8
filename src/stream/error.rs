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

use crate::constants::STREAMS_ERROR_NS;
use crate::xml::Element;

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum StreamError {
    #[error("more than {limit} bytes buffered without a complete stanza")]
    ParseOverflow { limit: usize },
    #[error("malformed stanza: {0}")]
    MalformedStanza(String),
    #[error("invalid stream protocol: {0}")]
    BadStream(&'static str),
    #[error("stream error from server: {condition}")]
    Server {
        condition: String,
        text: Option<String>,
    },
}

impl StreamError {
    /// Reads the condition out of a `<stream:error/>` element.
    pub fn from_element(element: &Element) -> StreamError {
        let condition = element
            .children()
            .find(|child| child.ns() == Some(STREAMS_ERROR_NS) && child.name() != "text")
            .map(|child| child.name().to_string())
            .unwrap_or_else(|| "undefined-condition".to_string());
        StreamError::Server {
            condition,
            text: element.child_text("text", STREAMS_ERROR_NS),
        }
    }
}

impl From<quick_xml::Error> for StreamError {
    fn from(err: quick_xml::Error) -> Self {
        StreamError::MalformedStanza(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for StreamError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        StreamError::MalformedStanza(err.to_string())
    }
}

impl From<std::str::Utf8Error> for StreamError {
    fn from(err: std::str::Utf8Error) -> Self {
        StreamError::MalformedStanza(err.to_string())
    }
}

pub(super) mod description {
    pub(in super::super) const TEXT_OUTSIDE_STANZA: &str = "character data outside of a stanza";
    pub(in super::super) const UNEXPECTED_END_TAG: &str = "end tag without a matching start tag";
    pub(in super::super) const MISMATCHED_END_TAG: &str = "end tag does not match the start tag";
}
