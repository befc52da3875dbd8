/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use super::*;

#[test]
fn build_and_serialize() {
    let iq = Element::with_ns("iq", "jabber:client")
        .with_attr("type", "set")
        .with_attr("id", "a1")
        .with_child(
            Element::with_ns("query", "jabber:iq:roster")
                .with_child(Element::new("item").with_attr("jid", "nurse@example.com")),
        );
    assert_eq!(
        iq.to_string(),
        "<iq xmlns='jabber:client' type='set' id='a1'>\
         <query xmlns='jabber:iq:roster'><item jid='nurse@example.com'/></query></iq>"
    );
    let item = iq
        .child("query", "jabber:iq:roster")
        .and_then(|query| query.child("item", "jabber:iq:roster"))
        .unwrap();
    assert_eq!(item.attr("jid"), Some("nurse@example.com"));
}

#[test]
fn children_inherit_namespace() {
    let inner = Element::new("error").with_child(Element::new("text").with_text("oops"));
    let message = Element::with_ns("message", "jabber:client").with_child(inner);
    let error = message.child("error", "jabber:client").unwrap();
    assert!(error.has_child("text", "jabber:client"));
}

#[test]
fn escaping() {
    let message = Element::new("message")
        .with_attr("to", "a'b@example.com")
        .with_child(Element::new("body").with_text("1 < 2 & \"3\""));
    let text = message.to_string();
    assert_eq!(
        text,
        "<message to='a&apos;b@example.com'><body>1 &lt; 2 &amp; &quot;3&quot;</body></message>"
    );
    let parsed: Element = text.parse().unwrap();
    assert_eq!(parsed.attr("to"), Some("a'b@example.com"));
    assert_eq!(parsed.children().next().unwrap().text(), "1 < 2 & \"3\"");
}

#[test]
fn attributes() {
    let mut element = Element::new("presence").with_opt_attr("type", None::<&str>);
    assert_eq!(element.attr("type"), None);
    element.set_attr("type", "unavailable");
    element.set_attr("type", "subscribe");
    assert_eq!(element.attrs().count(), 1);
    assert_eq!(element.remove_attr("type").as_deref(), Some("subscribe"));
    assert_eq!(element.to_string(), "<presence/>");
}

#[test]
fn text_is_joined() {
    let mut body = Element::new("body");
    body.push_text("Hello, ");
    body.push_text("world");
    assert_eq!(body.nodes().len(), 1);
    assert_eq!(body.text(), "Hello, world");
}

#[test]
fn parse_rejects_partial() {
    assert!("<message><body>".parse::<Element>().is_err());
}
