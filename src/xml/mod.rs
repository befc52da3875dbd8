/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::fmt::Display;
use std::str::FromStr;

use quick_xml::escape::escape;

use crate::stream::StreamError;
use crate::stream::StreamEvent;
use crate::stream::StreamParser;

/// A child of an element: either a nested element or character data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An owned XML element with its namespace resolved.
///
/// Stanzas received from the stream keep their whole tree in this form, and
/// outgoing stanzas are built with the `with_*` methods. Children appended
/// without a namespace inherit the namespace of their parent, so the
/// serialized form only declares `xmlns` where it changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    ns: Option<String>,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Element {
            name: name.into(),
            ns: None,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_ns(name: impl Into<String>, ns: impl Into<String>) -> Self {
        Element {
            name: name.into(),
            ns: Some(ns.into()),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub(crate) fn from_parts(
        name: String,
        ns: Option<String>,
        attributes: Vec<(String, String)>,
    ) -> Self {
        Element {
            name,
            ns,
            attributes,
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Sets the attribute only when a value is given.
    pub fn with_opt_attr(self, name: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.with_attr(name, value),
            None => self,
        }
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.push_child(child);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.push_text(text);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ns(&self) -> Option<&str> {
        self.ns.as_deref()
    }

    /// True if the element has the given local name and namespace.
    pub fn is(&self, name: &str, ns: &str) -> bool {
        self.name == name && self.ns.as_deref() == Some(ns)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let pos = self.attributes.iter().position(|(key, _)| key == name)?;
        Some(self.attributes.remove(pos).1)
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn push_child(&mut self, mut child: Element) {
        if let Some(ns) = &self.ns {
            child.inherit_ns(ns);
        }
        self.children.push(Node::Element(child));
    }

    pub fn push_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        if let Some(Node::Text(last)) = self.children.last_mut() {
            last.push_str(&text);
        } else if !text.is_empty() {
            self.children.push(Node::Text(text));
        }
    }

    fn inherit_ns(&mut self, ns: &str) {
        if self.ns.is_some() {
            return;
        }
        self.ns = Some(ns.to_string());
        for node in self.children.iter_mut() {
            if let Node::Element(child) = node {
                child.inherit_ns(ns);
            }
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Child elements in document order.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    pub fn first_child(&self) -> Option<&Element> {
        self.children().next()
    }

    pub fn child(&self, name: &str, ns: &str) -> Option<&Element> {
        self.children().find(|child| child.is(name, ns))
    }

    pub fn has_child(&self, name: &str, ns: &str) -> bool {
        self.child(name, ns).is_some()
    }

    /// Text content of the named child, if that child exists.
    pub fn child_text(&self, name: &str, ns: &str) -> Option<String> {
        self.child(name, ns).map(Element::text)
    }

    /// Concatenated character data directly under this element.
    pub fn text(&self) -> String {
        let mut text = String::new();
        for node in &self.children {
            if let Node::Text(part) = node {
                text.push_str(part);
            }
        }
        text
    }

    fn write(&self, out: &mut std::fmt::Formatter<'_>, parent_ns: Option<&str>) -> std::fmt::Result {
        write!(out, "<{}", self.name)?;
        if let Some(ns) = self.ns.as_deref() {
            if parent_ns != Some(ns) {
                write!(out, " xmlns='{}'", escape(ns))?;
            }
        }
        for (key, value) in &self.attributes {
            write!(out, " {}='{}'", key, escape(value.as_str()))?;
        }
        if self.children.is_empty() {
            return out.write_str("/>");
        }
        out.write_str(">")?;
        for node in &self.children {
            match node {
                Node::Element(child) => child.write(out, self.ns.as_deref())?,
                Node::Text(text) => out.write_str(&escape(text.as_str()))?,
            }
        }
        write!(out, "</{}>", self.name)
    }
}

impl Display for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.write(f, None)
    }
}

impl FromStr for Element {
    type Err = StreamError;

    /// Parses a single standalone element, as found in a WebSocket frame.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = StreamParser::new();
        match parser.elements(s.as_bytes()).next() {
            Some(Ok(StreamEvent::Element(element))) => Ok(element),
            Some(Err(err)) => Err(err),
            _ => Err(StreamError::MalformedStanza("no complete element".into())),
        }
    }
}

#[cfg(test)]
mod tests;
