/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

mod boundary;
mod error;

use quick_xml::Reader;
use quick_xml::errors::SyntaxError;
use quick_xml::events::BytesStart;
use quick_xml::events::Event;

use boundary::Boundary;
pub use error::StreamError;
use error::description;

use crate::Element;
use crate::constants::FRAMING_NS;
use crate::constants::STREAM_NS;
use crate::constants::STREAM_TAG;

/// Default cap on bytes held while waiting for a stanza to complete.
pub const DEFAULT_BUFFER_LIMIT: usize = 1024 * 1024;

/// Attributes of the stream root sent by the server.
///
/// Over a WebSocket the root is the framing `<open/>` element, which carries
/// the same attributes.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct StreamHeader {
    pub from: Option<String>,
    pub to: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
}

/// Items produced from the incoming byte stream.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StreamEvent {
    /// The stream root was opened (or reopened after a restart).
    Header(StreamHeader),
    /// A complete top-level element.
    Element(Element),
    /// The peer closed the stream.
    End,
}

#[derive(Debug, Clone, Default)]
struct Scope {
    default: Option<String>,
    prefixes: Vec<(String, String)>,
}

impl Scope {
    fn base() -> Self {
        Scope {
            default: None,
            prefixes: vec![(STREAM_TAG.to_string(), STREAM_NS.to_string())],
        }
    }
}

fn resolve(scopes: &[Scope], prefix: Option<&str>) -> Option<String> {
    for scope in scopes.iter().rev() {
        match prefix {
            None => {
                if let Some(ns) = &scope.default {
                    return Some(ns.clone());
                }
            }
            Some(prefix) => {
                if let Some((_, ns)) = scope.prefixes.iter().find(|(p, _)| p == prefix) {
                    return Some(ns.clone());
                }
            }
        }
    }
    None
}

fn split_name(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

/// Builds an element from a start tag, pushing the namespace declarations it
/// carries onto `scopes`.
fn open_element(start: &BytesStart, scopes: &mut Vec<Scope>) -> Result<(Element, String), StreamError> {
    let qname = std::str::from_utf8(start.name().as_ref())?.to_string();
    let mut scope = Scope::default();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr?;
        let key = std::str::from_utf8(attr.key.as_ref())?;
        let value = attr.unescape_value()?.into_owned();
        if key == "xmlns" {
            scope.default = Some(value);
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.prefixes.push((prefix.to_string(), value));
        } else {
            attributes.push((key.to_string(), value));
        }
    }
    scopes.push(scope);
    let (prefix, local) = split_name(&qname);
    let ns = resolve(scopes, prefix);
    let element = Element::from_parts(local.to_string(), ns, attributes);
    Ok((element, qname))
}

fn header_from(element: &Element) -> StreamHeader {
    let get = |name: &str| element.attr(name).map(str::to_string);
    StreamHeader {
        from: get("from"),
        to: get("to"),
        id: get("id"),
        version: get("version"),
        lang: get("xml:lang"),
    }
}

/// Whether the input ends inside the opening of a comment or CDATA section.
fn unfinished_bang(bytes: &[u8]) -> bool {
    let Some(start) = bytes.windows(2).rposition(|pair| pair == b"<!") else {
        return false;
    };
    let tail = &bytes[start..];
    [&b"<![CDATA["[..], &b"<!--"[..]]
        .iter()
        .any(|opening| tail.len() < opening.len() && opening.starts_with(tail))
}

enum Scanned {
    /// Only whitespace was seen, this many bytes can be dropped.
    Idle(usize),
    /// More bytes are needed to complete the current item.
    Incomplete,
    Header(StreamHeader, Scope, usize),
    Element(Element, usize),
    End(usize),
}

/// Incremental parser for an XMPP stream.
///
/// Bytes are pushed with [feed](StreamParser::feed) in whatever pieces the
/// network delivers them, and complete top-level elements are pulled out with
/// [next_event](StreamParser::next_event). An element is never produced
/// until its end tag has been received. Whitespace between stanzas is
/// treated as a keep-alive and dropped.
///
/// The buffered bytes are only parsed once a top-level item may be
/// complete, so a large stanza arriving in many small reads costs a single
/// parse.
///
/// Both framings are understood: a TCP stream wraps stanzas in a single
/// `<stream:stream>` root, while a WebSocket sends `<open/>`, stanzas and
/// `<close/>` as standalone elements.
///
/// ```
/// use iksclient::{StreamEvent, StreamParser};
///
/// let mut parser = StreamParser::new();
/// parser.feed(b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'><mess");
/// assert!(matches!(parser.next_event(), Some(Ok(StreamEvent::Header(_)))));
/// assert!(parser.next_event().is_none());
/// parser.feed(b"age><body>Hi</body></message>");
/// match parser.next_event() {
///     Some(Ok(StreamEvent::Element(message))) => assert_eq!(message.name(), "message"),
///     _ => unreachable!(),
/// }
/// ```
pub struct StreamParser {
    buffer: Vec<u8>,
    consumed: usize,
    limit: usize,
    root: Option<Scope>,
    boundary: Boundary,
    ended: bool,
    failed: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_BUFFER_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        StreamParser {
            buffer: Vec::new(),
            consumed: 0,
            limit,
            root: None,
            boundary: Boundary::default(),
            ended: false,
            failed: false,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Feeds the bytes and iterates over the events they complete.
    pub fn elements<'a>(&'a mut self, bytes: &[u8]) -> StreamEvents<'a> {
        self.feed(bytes);
        StreamEvents { parser: self }
    }

    /// Iterates over the events completed by the bytes fed so far.
    pub fn events(&mut self) -> StreamEvents<'_> {
        StreamEvents { parser: self }
    }

    /// Bytes received but not yet turned into events.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    /// Expects a new stream root on the same connection, as happens after
    /// authentication. Bytes already buffered belong to the new stream.
    pub fn restart(&mut self) {
        self.root = None;
        self.boundary.reset();
        self.ended = false;
    }

    /// Forgets everything, as needed when the byte stream itself is replaced
    /// by a TLS layer.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.consumed = 0;
        self.root = None;
        self.boundary.reset();
        self.ended = false;
        self.failed = false;
    }

    pub fn next_event(&mut self) -> Option<Result<StreamEvent, StreamError>> {
        if self.ended || self.failed {
            return None;
        }
        loop {
            let expect_root = self.root.is_none();
            if !self.boundary.advance(&self.buffer[self.consumed..], expect_root) {
                return self.wait_for_more();
            }
            let scanned = match self.scan() {
                Ok(scanned) => scanned,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            };
            match scanned {
                Scanned::Idle(0) => return None,
                Scanned::Idle(used) => {
                    self.consumed += used;
                    self.boundary.reset();
                    self.compact();
                }
                // Keep tracking from where the last boundary was found
                Scanned::Incomplete => {}
                Scanned::Header(header, scope, used) => {
                    self.consumed += used;
                    self.boundary.reset();
                    self.root = Some(scope);
                    return Some(Ok(StreamEvent::Header(header)));
                }
                Scanned::Element(element, used) => {
                    self.consumed += used;
                    self.boundary.reset();
                    return Some(Ok(StreamEvent::Element(element)));
                }
                Scanned::End(used) => {
                    self.consumed += used;
                    self.boundary.reset();
                    self.ended = true;
                    return Some(Ok(StreamEvent::End));
                }
            }
        }
    }

    fn wait_for_more(&mut self) -> Option<Result<StreamEvent, StreamError>> {
        self.compact();
        if self.pending_bytes() > self.limit {
            self.failed = true;
            return Some(Err(StreamError::ParseOverflow { limit: self.limit }));
        }
        None
    }

    fn compact(&mut self) {
        if self.consumed > 0 {
            self.buffer.drain(..self.consumed);
            self.consumed = 0;
        }
    }

    fn is_root_start(&self, element: &Element) -> bool {
        self.root.is_none() && element.is(STREAM_TAG, STREAM_NS)
    }

    fn scan(&self) -> Result<Scanned, StreamError> {
        let bytes = &self.buffer[self.consumed..];
        let mut reader = Reader::from_reader(bytes);
        reader.config_mut().trim_text(false);
        reader.config_mut().check_end_names = false;
        // The stream root was opened by an earlier scan
        reader.config_mut().allow_unmatched_ends = true;

        let base = self.root.clone().unwrap_or_else(Scope::base);
        let mut scopes = vec![base];
        let mut open: Vec<(Element, String)> = Vec::new();

        loop {
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(quick_xml::Error::Syntax(SyntaxError::InvalidBangMarkup))
                    if unfinished_bang(bytes) =>
                {
                    return Ok(Scanned::Incomplete);
                }
                Err(quick_xml::Error::Syntax(SyntaxError::InvalidBangMarkup)) => {
                    return Err(StreamError::MalformedStanza("invalid markup".into()));
                }
                // Expected while streaming: the construct is completed by a later read
                Err(quick_xml::Error::Syntax(_)) => return Ok(Scanned::Incomplete),
                Err(err) => return Err(err.into()),
            };
            let used = reader.buffer_position() as usize;
            match event {
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
                Event::Start(start) => {
                    let (element, qname) = open_element(&start, &mut scopes)?;
                    if open.is_empty() && self.is_root_start(&element) {
                        let scope = scopes.pop().unwrap_or_default();
                        let mut root = scopes.pop().unwrap_or_else(Scope::base);
                        root.default = scope.default.or(root.default);
                        root.prefixes.extend(scope.prefixes);
                        return Ok(Scanned::Header(header_from(&element), root, used));
                    }
                    open.push((element, qname));
                }
                Event::Empty(start) => {
                    let (element, _) = open_element(&start, &mut scopes)?;
                    scopes.pop();
                    if open.is_empty() {
                        if element.is("open", FRAMING_NS) || self.is_root_start(&element) {
                            return Ok(Scanned::Header(header_from(&element), Scope::base(), used));
                        }
                        if element.is("close", FRAMING_NS) {
                            return Ok(Scanned::End(used));
                        }
                        return Ok(Scanned::Element(element, used));
                    }
                    if let Some((parent, _)) = open.last_mut() {
                        parent.push_child(element);
                    }
                }
                Event::End(end) => {
                    let end_name = end.name();
                    let qname = std::str::from_utf8(end_name.as_ref())?;
                    let Some((element, start_name)) = open.pop() else {
                        if self.root.is_some() && split_name(qname).1 == STREAM_TAG {
                            return Ok(Scanned::End(used));
                        }
                        return Err(StreamError::MalformedStanza(
                            description::UNEXPECTED_END_TAG.into(),
                        ));
                    };
                    if start_name != qname {
                        return Err(StreamError::MalformedStanza(
                            description::MISMATCHED_END_TAG.into(),
                        ));
                    }
                    scopes.pop();
                    match open.last_mut() {
                        Some((parent, _)) => parent.push_child(element),
                        None => return Ok(Scanned::Element(element, used)),
                    }
                }
                Event::Text(text) => match open.last_mut() {
                    Some((parent, _)) => match text.unescape() {
                        Ok(text) => parent.push_text(text.into_owned()),
                        // A multibyte character or a reference cut by the read
                        Err(_) if used == bytes.len() => return Ok(Scanned::Incomplete),
                        Err(err) => return Err(err.into()),
                    },
                    None => {
                        if !text.iter().all(u8::is_ascii_whitespace) {
                            return Err(StreamError::MalformedStanza(
                                description::TEXT_OUTSIDE_STANZA.into(),
                            ));
                        }
                    }
                },
                Event::CData(data) => match open.last_mut() {
                    Some((parent, _)) => {
                        parent.push_text(std::str::from_utf8(&data.into_inner())?.to_string())
                    }
                    None => {
                        return Err(StreamError::MalformedStanza(
                            description::TEXT_OUTSIDE_STANZA.into(),
                        ));
                    }
                },
                Event::Eof => {
                    if open.is_empty() {
                        return Ok(Scanned::Idle(used));
                    }
                    return Ok(Scanned::Incomplete);
                }
            }
        }
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the events a [StreamParser] can produce from its buffer.
pub struct StreamEvents<'a> {
    parser: &'a mut StreamParser,
}

impl Iterator for StreamEvents<'_> {
    type Item = Result<StreamEvent, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.parser.next_event()
    }
}
