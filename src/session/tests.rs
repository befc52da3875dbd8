/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::sync::Arc;
use std::sync::Mutex;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::DuplexStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

use super::*;
use crate::event::EventKind;
use crate::stanza::Show;
use crate::transport::StreamTransport;

const SERVER_HEADER: &str = "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='s2' from='example.com' version='1.0'>";

struct Harness {
    session: Session,
    server: DuplexStream,
    events: UnboundedReceiver<Event>,
    handlers: HandlerRegistry,
}

impl Harness {
    async fn start(options: SessionOptions) -> Harness {
        let (client, mut server) = tokio::io::duplex(65536);
        server.write_all(SERVER_HEADER.as_bytes()).await.unwrap();
        let connection = Connection::new(Box::new(StreamTransport::plain(client)), 65536, false);
        let bus = EventBus::new();
        let events = bus.subscribe();
        let handlers = HandlerRegistry::new();
        let (state, _) = watch::channel(StreamState::BindingResource);
        let session = Session::spawn(
            Jid::new("juliet@example.com/balcony").unwrap(),
            connection,
            handlers.clone(),
            bus,
            options,
            state,
        );
        Harness {
            session,
            server,
            events,
            handlers,
        }
    }

    async fn send(&mut self, xml: &str) {
        self.server.write_all(xml.as_bytes()).await.unwrap();
    }

    /// Reads what the client wrote until `needle` shows up.
    async fn read_until(&mut self, needle: &str) -> String {
        let mut seen = String::new();
        let mut buf = [0u8; 4096];
        while !seen.contains(needle) {
            let count = self.server.read(&mut buf).await.unwrap();
            assert!(count > 0, "connection closed before {needle:?}, got {seen:?}");
            seen.push_str(std::str::from_utf8(&buf[..count]).unwrap());
        }
        seen
    }

    async fn event(&mut self, kind: EventKind) -> Event {
        loop {
            let event = self.events.recv().await.unwrap();
            if event.kind() == kind {
                return event;
            }
        }
    }

    async fn terminated(&mut self) -> String {
        match self.event(EventKind::SessionTerminated).await {
            Event::SessionTerminated { reason } => reason,
            _ => unreachable!(),
        }
    }
}

#[tokio::test]
async fn presence_and_roster_on_start() {
    let mut h = Harness::start(SessionOptions {
        initial_priority: Some(5),
        ..Default::default()
    })
    .await;
    assert_eq!(h.session.state(), StreamState::Established);
    assert_eq!(h.session.jid().full(), "juliet@example.com/balcony");

    let written = h.read_until("jabber:iq:roster").await;
    assert!(written.starts_with("<presence xmlns='jabber:client'><priority>5</priority></presence>"));
    assert!(written.contains("<iq xmlns='jabber:client' id='iks-1' type='get'>"));

    h.send(
        "<iq type='result' id='iks-1'><query xmlns='jabber:iq:roster'><item jid='romeo@example.net' name='Romeo' subscription='both'/></query></iq>",
    )
    .await;
    match h.event(EventKind::RosterUpdated).await {
        Event::RosterUpdated { items } => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].name.as_deref(), Some("Romeo"));
        }
        _ => unreachable!(),
    }
    let roster = h.session.roster().await.unwrap();
    assert_eq!(roster[0].jid.full(), "romeo@example.net");
}

#[tokio::test]
async fn roster_pushes() {
    let mut h = Harness::start(SessionOptions::default()).await;
    h.read_until("jabber:iq:roster").await;
    h.send(
        "<iq type='set' id='push1' from='mallory@evil.example'><query xmlns='jabber:iq:roster'><item jid='mallory@evil.example' subscription='both'/></query></iq>",
    )
    .await;
    h.send(
        "<iq type='set' id='push2' from='juliet@example.com'><query xmlns='jabber:iq:roster'><item jid='nurse@example.com' subscription='to'/></query></iq>",
    )
    .await;
    match h.event(EventKind::RosterUpdated).await {
        Event::RosterUpdated { items } => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].jid.full(), "nurse@example.com");
        }
        _ => unreachable!(),
    }
    let written = h.read_until("id='push2'").await;
    assert!(written.contains("<iq xmlns='jabber:client' to='mallory@evil.example' id='push1' type='error'>"));
    assert!(written.contains("service-unavailable"));
    assert!(written.contains("<iq xmlns='jabber:client' to='juliet@example.com' id='push2' type='result'/>"));
    let roster = h.session.roster().await.unwrap();
    assert_eq!(roster.len(), 1);
}

#[tokio::test]
async fn roster_result_from_a_stranger_is_ignored() {
    let mut h = Harness::start(SessionOptions::default()).await;
    h.read_until("id='iks-1'").await;
    h.send(
        "<iq type='result' id='iks-1' from='mallory@evil.example/x'><query xmlns='jabber:iq:roster'><item jid='mallory@evil.example' subscription='both'/></query></iq>",
    )
    .await;
    h.send(
        "<iq type='result' id='iks-1' from='juliet@example.com'><query xmlns='jabber:iq:roster'><item jid='romeo@example.net' subscription='both'/></query></iq>",
    )
    .await;
    match h.event(EventKind::RosterUpdated).await {
        Event::RosterUpdated { items } => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].jid.full(), "romeo@example.net");
        }
        _ => unreachable!(),
    }
    let roster = h.session.roster().await.unwrap();
    assert_eq!(roster.len(), 1);
}

#[tokio::test]
async fn messages_keep_arrival_order() {
    let mut h = Harness::start(SessionOptions::default()).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        h.handlers
            .on_message(move |message| seen.lock().unwrap().push(message.body().unwrap_or_default()));
    }
    h.send(
        "<message from='romeo@example.net/orchard' type='chat'><body>one</body></message>\
         <message from='romeo@example.net/orchard' type='chat'><body>two</body></message>\
         <message from='romeo@example.net/orchard' type='error'><body>bounced</body></message>\
         <message from='romeo@example.net/orchard' type='chat'><body>three</body></message>",
    )
    .await;
    let mut bodies = Vec::new();
    for _ in 0..3 {
        match h.event(EventKind::MessageReceived).await {
            Event::MessageReceived { from, body } => {
                assert_eq!(from.full(), "romeo@example.net/orchard");
                bodies.push(body);
            }
            _ => unreachable!(),
        }
    }
    assert_eq!(bodies, ["one", "two", "three"]);
    assert_eq!(*seen.lock().unwrap(), ["one", "two", "bounced", "three"]);
}

#[tokio::test]
async fn presence_events() {
    let mut h = Harness::start(SessionOptions::default()).await;
    h.send(
        "<presence from='romeo@example.net/orchard'><show>away</show><status>Climbing</status></presence>\
         <presence from='nurse@example.com' type='subscribe'/>\
         <presence from='romeo@example.net/orchard' type='unavailable'/>",
    )
    .await;
    assert_eq!(
        h.event(EventKind::PresenceChanged).await,
        Event::PresenceChanged {
            jid: Jid::new("romeo@example.net/orchard").unwrap(),
            state: PresenceState::Away,
            status: Some("Climbing".into()),
        }
    );
    assert_eq!(
        h.events.recv().await.unwrap(),
        Event::SubscriptionRequested {
            from: Jid::new("nurse@example.com").unwrap()
        }
    );
    match h.events.recv().await.unwrap() {
        Event::PresenceChanged { state, .. } => assert_eq!(state, PresenceState::Unavailable),
        other => panic!("unexpected {other:?}"),
    }

    let nurse = Jid::new("nurse@example.com").unwrap();
    h.session.approve_subscription(&nurse).await.unwrap();
    h.session
        .set_presence(Presence::available().with_show(Show::Dnd).with_status("Busy"))
        .await
        .unwrap();
    let written = h.read_until("Busy").await;
    assert!(written.contains("<presence xmlns='jabber:client' to='nurse@example.com' type='subscribed'/>"));
    assert!(written.contains("<show>dnd</show>"));
}

#[tokio::test]
async fn requests_without_handler_are_refused() {
    let mut h = Harness::start(SessionOptions::default()).await;
    h.send("<iq type='get' id='v1' from='romeo@example.net/orchard'><query xmlns='jabber:iq:version'/></iq>")
        .await;
    let written = h.read_until("service-unavailable").await;
    assert!(written.contains("to='romeo@example.net/orchard' id='v1' type='error'"));
}

#[tokio::test]
async fn server_pings_are_answered() {
    let mut h = Harness::start(SessionOptions::default()).await;
    h.send("<iq type='get' id='s1' from='example.com'><ping xmlns='urn:xmpp:ping'/></iq>")
        .await;
    let written = h.read_until("id='s1'").await;
    assert!(written.contains("<iq xmlns='jabber:client' to='example.com' id='s1' type='result'/>"));
}

#[tokio::test]
async fn request_response() {
    let mut h = Harness::start(SessionOptions::default()).await;
    let session = h.session.clone();
    let request = tokio::spawn(async move {
        let iq = Iq::get(Element::with_ns("query", "jabber:iq:version"))
            .with_to(Jid::new("example.com").unwrap());
        session.send_iq(iq).await
    });
    h.read_until("jabber:iq:version").await;
    h.send("<iq type='result' id='iks-2' from='example.com'><query xmlns='jabber:iq:version'><name>srv</name></query></iq>")
        .await;
    let answer = request.await.unwrap().unwrap();
    assert_eq!(
        answer.child().unwrap().child_text("name", "jabber:iq:version").as_deref(),
        Some("srv")
    );
}

#[tokio::test(start_paused = true)]
async fn request_timeout() {
    let h = Harness::start(SessionOptions::default()).await;
    let started = Instant::now();
    let iq = Iq::get(Element::with_ns("query", "jabber:iq:version"))
        .with_to(Jid::new("example.com").unwrap());
    assert_eq!(h.session.send_iq(iq).await, Err(RequestError::Timeout));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(30) && waited < Duration::from_secs(31));
    assert!(h.session.is_established());
}

#[tokio::test(start_paused = true)]
async fn missed_keepalives_fail_the_session() {
    let mut h = Harness::start(SessionOptions::default()).await;
    let started = Instant::now();
    assert_eq!(h.terminated().await, "keepalive-timeout");
    // The stream header counts as traffic for the first interval, then five
    // silent intervals pass
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(360) && waited < Duration::from_secs(361));
    assert_eq!(h.session.state(), StreamState::Failed);
    let written = h.read_until("<presence").await;
    let mut rest = String::new();
    h.server.read_to_string(&mut rest).await.unwrap();
    assert_eq!((written + &rest).matches("urn:xmpp:ping").count(), 4);
}

#[tokio::test(start_paused = true)]
async fn traffic_keeps_the_session_alive() {
    let mut h = Harness::start(SessionOptions::default()).await;
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_secs(50)).await;
        h.send(" ").await;
    }
    assert!(h.session.is_established());
}

#[tokio::test]
async fn logout_is_graceful_and_idempotent() {
    let mut h = Harness::start(SessionOptions::default()).await;
    h.session.logout().await;
    assert_eq!(h.terminated().await, "logout");
    assert_eq!(h.session.state(), StreamState::Disconnected);

    let mut written = String::new();
    h.server.read_to_string(&mut written).await.unwrap();
    assert!(written.ends_with("<presence xmlns='jabber:client' type='unavailable'/></stream:stream>"));

    h.session.logout().await;
    assert!(matches!(
        h.events.try_recv(),
        Err(TryRecvError::Empty | TryRecvError::Disconnected)
    ));
    assert_eq!(
        h.session.send_message(&Jid::new("romeo@example.net").unwrap(), "hi").await,
        Err(SessionError::Closed)
    );
}

#[tokio::test]
async fn disconnect_cancels_requests() {
    let mut h = Harness::start(SessionOptions::default()).await;
    let session = h.session.clone();
    let request = tokio::spawn(async move {
        session
            .send_iq(Iq::get(Element::with_ns("query", "jabber:iq:version")))
            .await
    });
    h.read_until("jabber:iq:version").await;
    h.session.disconnect().await;
    assert_eq!(request.await.unwrap(), Err(RequestError::Timeout));
    assert_eq!(h.terminated().await, "disconnected");

    let mut written = String::new();
    h.server.read_to_string(&mut written).await.unwrap();
    assert!(!written.contains("unavailable"));
    h.session.closed().await;
}

#[tokio::test]
async fn server_closes_the_stream() {
    let mut h = Harness::start(SessionOptions::default()).await;
    h.send("</stream:stream>").await;
    assert_eq!(h.terminated().await, "stream-closed");
    assert_eq!(h.session.state(), StreamState::Disconnected);
}

#[tokio::test]
async fn connection_lost() {
    let mut h = Harness::start(SessionOptions::default()).await;
    h.read_until("jabber:iq:roster").await;
    let Harness {
        session,
        server,
        mut events,
        ..
    } = h;
    drop(server);
    loop {
        if let Event::SessionTerminated { reason } = events.recv().await.unwrap() {
            assert_eq!(reason, "connection-lost");
            break;
        }
    }
    assert_eq!(session.state(), StreamState::Failed);
}

#[tokio::test]
async fn fatal_stream_problems() {
    let mut h = Harness::start(SessionOptions::default()).await;
    h.send("<message><body>x</bogus></message>").await;
    assert_eq!(h.terminated().await, "parse-error");
    assert_eq!(h.session.state(), StreamState::Failed);

    let mut h = Harness::start(SessionOptions::default()).await;
    h.send("<stream:error><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>")
        .await;
    assert_eq!(h.terminated().await, "stream-error:conflict");

    // Semantically broken stanzas are only dropped
    let mut h = Harness::start(SessionOptions::default()).await;
    h.send("<message from='@bad' type='chat'><body>x</body></message><message from='romeo@example.net' type='chat'><body>ok</body></message>")
        .await;
    match h.event(EventKind::MessageReceived).await {
        Event::MessageReceived { body, .. } => assert_eq!(body, "ok"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn account_deletion() {
    let mut h = Harness::start(SessionOptions::default()).await;
    h.read_until("id='iks-1'").await;
    let session = h.session.clone();
    let deletion = tokio::spawn(async move { session.delete_account().await });
    let written = h.read_until("<remove/></query></iq>").await;
    assert!(written.contains(
        "<iq xmlns='jabber:client' id='iks-2' type='set'><query xmlns='jabber:iq:register'><remove/></query></iq>"
    ));
    h.send("<iq type='result' id='iks-2'/>").await;
    assert_eq!(deletion.await.unwrap(), Ok(()));
    assert_eq!(h.terminated().await, "account-deleted");
    assert_eq!(h.session.state(), StreamState::Disconnected);

    let mut rest = String::new();
    h.server.read_to_string(&mut rest).await.unwrap();
    assert!(rest.ends_with("</stream:stream>"));
    assert_eq!(h.session.delete_account().await, Err(RequestError::SessionClosed));
}

#[tokio::test]
async fn refused_account_deletion() {
    let mut h = Harness::start(SessionOptions::default()).await;
    h.read_until("id='iks-1'").await;
    let session = h.session.clone();
    let deletion = tokio::spawn(async move { session.delete_account().await });
    h.read_until("<remove/>").await;
    h.send(
        "<iq type='error' id='iks-2'><error type='cancel'><not-allowed xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
    )
    .await;
    match deletion.await.unwrap() {
        Err(RequestError::Remote(err)) => assert_eq!(err.condition, "not-allowed"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.session.is_established());
    assert_eq!(format!("{:?}", h.session), "Session { jid: Jid(juliet@example.com/balcony), state: Established, .. }");
}
