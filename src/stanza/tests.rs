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
use crate::constants::ROSTER_NS;

fn parse(text: &str) -> Stanza {
    Stanza::from_element(text.parse().unwrap()).unwrap()
}

#[test]
fn incoming_message() {
    let stanza = parse(
        "<message xmlns='jabber:client' from='juliet@example.com/balcony' \
         to='romeo@example.net' id='m1' type='chat'><body>Wherefore?</body></message>",
    );
    let Stanza::Message(message) = stanza else {
        panic!("message expected");
    };
    assert_eq!(message.kind, MessageType::Chat);
    assert_eq!(message.from.as_ref().map(Jid::full), Some("juliet@example.com/balcony"));
    assert_eq!(message.id.as_deref(), Some("m1"));
    assert_eq!(message.body().as_deref(), Some("Wherefore?"));
}

#[test]
fn outgoing_chat() {
    let message = Message::chat(Jid::new("juliet@example.com").unwrap(), "Hi & bye");
    assert_eq!(
        message.to_element().to_string(),
        "<message xmlns='jabber:client' to='juliet@example.com' type='chat'>\
         <body>Hi &amp; bye</body></message>"
    );
}

#[test]
fn presence_details() {
    let presence = Presence::available()
        .with_show(Show::Dnd)
        .with_status("Busy")
        .with_priority(5);
    assert_eq!(
        presence.to_element().to_string(),
        "<presence xmlns='jabber:client'><show>dnd</show><status>Busy</status>\
         <priority>5</priority></presence>"
    );
    let Stanza::Presence(parsed) = parse(&presence.to_element().to_string()) else {
        panic!("presence expected");
    };
    assert_eq!(parsed.kind, PresenceType::Available);
    assert_eq!(parsed.show(), Some(Show::Dnd));
    assert_eq!(parsed.status().as_deref(), Some("Busy"));
    assert_eq!(parsed.priority(), 5);

    let subscribe = Presence::subscription(
        PresenceType::Subscribe,
        Jid::new("nurse@example.com").unwrap(),
    );
    assert_eq!(
        subscribe.to_element().to_string(),
        "<presence xmlns='jabber:client' to='nurse@example.com' type='subscribe'/>"
    );
}

#[test]
fn iq_replies() {
    let Stanza::Iq(request) = parse(
        "<iq xmlns='jabber:client' from='example.com' id='p1' type='get'>\
         <ping xmlns='urn:xmpp:ping'/></iq>",
    ) else {
        panic!("iq expected");
    };
    assert!(request.kind.is_request());
    assert!(request.child().unwrap().is("ping", "urn:xmpp:ping"));

    let result = Iq::result(&request, None);
    assert_eq!(
        result.to_element().to_string(),
        "<iq xmlns='jabber:client' to='example.com' id='p1' type='result'/>"
    );

    let error = Iq::error(&request, &StanzaError::service_unavailable());
    let Stanza::Iq(parsed) = parse(&error.to_element().to_string()) else {
        panic!("iq expected");
    };
    assert_eq!(parsed.kind, IqType::Error);
    assert!(parsed.child().unwrap().is("ping", "urn:xmpp:ping"));
    let stanza_error = parsed.stanza_error().unwrap();
    assert_eq!(stanza_error.kind, ErrorType::Cancel);
    assert_eq!(stanza_error.condition, "service-unavailable");
}

#[test]
fn invalid_stanzas() {
    let element: Element = "<iq xmlns='jabber:client' type='get'/>".parse().unwrap();
    assert_eq!(Stanza::from_element(element), Err(InvalidStanza::MissingId));

    let element: Element = "<presence xmlns='jabber:client' type='sleepy'/>".parse().unwrap();
    assert!(matches!(
        Stanza::from_element(element),
        Err(InvalidStanza::Type { kind: "presence", .. })
    ));

    let element: Element = "<message xmlns='jabber:client' from='@bad'/>".parse().unwrap();
    assert!(matches!(Stanza::from_element(element), Err(InvalidStanza::Jid(_))));

    let element: Element = "<query xmlns='jabber:iq:roster'/>".parse().unwrap();
    assert_eq!(
        Stanza::from_element(element),
        Err(InvalidStanza::NotStanza("query".into()))
    );
    assert_eq!(Element::with_ns("query", ROSTER_NS).name(), "query");
}
