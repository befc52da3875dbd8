/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

use super::*;
use crate::transport::StreamTransport;

const SERVER_HEADER: &str = "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='s1' from='example.com' version='1.0'>";

fn element(xml: &str) -> StreamEvent {
    StreamEvent::Element(xml.parse().unwrap())
}

fn header() -> StreamEvent {
    StreamEvent::Header(Default::default())
}

fn juliet() -> Jid {
    Jid::new("juliet@example.com").unwrap()
}

fn options(tls: TlsPolicy) -> NegotiationOptions {
    NegotiationOptions {
        tls,
        allow_plain_without_tls: false,
        resource: Some("balcony".into()),
    }
}

fn sent(actions: &[Action]) -> &str {
    match actions {
        [Action::Send(data)] => data,
        other => panic!("expected a single send, got {other:?}"),
    }
}

const PLAIN_FEATURES: &str = "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>";
const BIND_FEATURES: &str = "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>";

#[test]
fn login_with_starttls() {
    let mut neg = Negotiator::new(
        juliet(),
        "secret",
        options(TlsPolicy::Required),
        Framing::Stream,
        false,
        true,
    );
    assert_eq!(neg.state(), StreamState::Connecting);
    let actions = neg.start();
    let open = sent(&actions);
    assert!(open.contains("<stream:stream "));
    assert!(open.contains("to='example.com'"));
    assert!(!open.contains("from="));
    assert_eq!(neg.state(), StreamState::NegotiatingFeatures);

    assert!(neg.handle(header()).unwrap().is_empty());
    let actions = neg
        .handle(element(
            "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>",
        ))
        .unwrap();
    assert_eq!(sent(&actions), "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
    assert_eq!(
        neg.handle(element("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")).unwrap(),
        vec![Action::StartTls]
    );
    let actions = neg.tls_established();
    assert!(sent(&actions).contains("from='juliet@example.com'"));
    assert_eq!(neg.state(), StreamState::NegotiatingFeatures);

    neg.handle(header()).unwrap();
    let actions = neg.handle(element(PLAIN_FEATURES)).unwrap();
    assert_eq!(
        sent(&actions),
        format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            sasl::encode_payload(b"\0juliet\0secret")
        )
    );
    assert_eq!(neg.state(), StreamState::Authenticating);

    let actions = neg
        .handle(element("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>"))
        .unwrap();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0], Action::RestartStream);
    assert!(matches!(&actions[1], Action::Send(open) if open.contains("<stream:stream ")));

    neg.handle(header()).unwrap();
    let actions = neg.handle(element(BIND_FEATURES)).unwrap();
    let bind = sent(&actions);
    assert!(bind.contains("id='bind_1'"));
    assert!(bind.contains("<resource>balcony</resource>"));
    assert_eq!(neg.state(), StreamState::BindingResource);

    // The server picks another resource; that is accepted as is
    let actions = neg
        .handle(element(
            "<iq type='result' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>juliet@example.com/balcony-2</jid></bind></iq>",
        ))
        .unwrap();
    assert_eq!(
        actions,
        vec![Action::Established(Jid::new("juliet@example.com/balcony-2").unwrap())]
    );
    assert_eq!(neg.state(), StreamState::Established);
}

#[test]
fn auth_failure() {
    let mut neg = Negotiator::new(
        juliet(),
        "wrong",
        options(TlsPolicy::Required),
        Framing::Stream,
        true,
        false,
    );
    neg.start();
    neg.handle(header()).unwrap();
    neg.handle(element(PLAIN_FEATURES)).unwrap();
    let err = neg
        .handle(element(
            "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/><text>Wrong password</text></failure>",
        ))
        .unwrap_err();
    match &err {
        LoginError::Auth(AuthError::Failure { condition, text }) => {
            assert_eq!(condition, "not-authorized");
            assert_eq!(text.as_deref(), Some("Wrong password"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.reason(), "invalid-credentials");
    assert_eq!(neg.state(), StreamState::Failed);
}

#[test]
fn tls_policies() {
    let start = |tls: TlsPolicy, allow_plain: bool| {
        let mut options = options(tls);
        options.allow_plain_without_tls = allow_plain;
        let mut neg = Negotiator::new(juliet(), "secret", options, Framing::Stream, false, true);
        neg.start();
        neg.handle(header()).unwrap();
        neg
    };

    let mut neg = start(TlsPolicy::Required, false);
    assert!(matches!(
        neg.handle(element(PLAIN_FEATURES)),
        Err(LoginError::Security(SecurityNegotiationError::NotOffered))
    ));
    assert_eq!(neg.state(), StreamState::Failed);

    let mut neg = start(TlsPolicy::Disabled, false);
    assert!(matches!(
        neg.handle(element(
            "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>"
        )),
        Err(LoginError::Security(SecurityNegotiationError::RequiredByServer))
    ));

    // PLAIN is not used on an unencrypted stream unless allowed
    let mut neg = start(TlsPolicy::Opportunistic, false);
    assert!(matches!(
        neg.handle(element(PLAIN_FEATURES)),
        Err(LoginError::Auth(AuthError::NoMechanism))
    ));
    let mut neg = start(TlsPolicy::Opportunistic, true);
    let actions = neg.handle(element(PLAIN_FEATURES)).unwrap();
    assert!(sent(&actions).contains("mechanism='PLAIN'"));

    let mut neg = start(TlsPolicy::Disabled, false);
    let actions = neg
        .handle(element(
            "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism><mechanism>SCRAM-SHA-1</mechanism></mechanisms></stream:features>",
        ))
        .unwrap();
    assert!(sent(&actions).contains("mechanism='SCRAM-SHA-1'"));

    let mut neg = start(TlsPolicy::Required, false);
    neg.handle(element(
        "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>",
    ))
    .unwrap();
    assert!(matches!(
        neg.handle(element("<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")),
        Err(LoginError::Security(SecurityNegotiationError::Refused))
    ));
}

fn authenticated(session: &str) -> Negotiator {
    let mut neg = Negotiator::new(
        juliet(),
        "secret",
        NegotiationOptions::default(),
        Framing::Stream,
        true,
        false,
    );
    neg.start();
    neg.handle(header()).unwrap();
    neg.handle(element(PLAIN_FEATURES)).unwrap();
    neg.handle(element("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>"))
        .unwrap();
    neg.handle(header()).unwrap();
    let actions = neg
        .handle(element(&format!(
            "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>{session}</stream:features>"
        )))
        .unwrap();
    assert!(!sent(&actions).contains("<resource>"));
    neg
}

const BIND_RESULT: &str = "<iq type='result' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>juliet@example.com/4db06f06</jid></bind></iq>";

#[test]
fn legacy_session() {
    let mut neg = authenticated("<session xmlns='urn:ietf:params:xml:ns:xmpp-session'/>");
    let actions = neg.handle(element(BIND_RESULT)).unwrap();
    assert!(sent(&actions).contains("<session xmlns='urn:ietf:params:xml:ns:xmpp-session'/>"));
    assert_eq!(neg.state(), StreamState::BindingResource);
    let actions = neg
        .handle(element("<iq type='result' id='session_1'/>"))
        .unwrap();
    assert_eq!(
        actions,
        vec![Action::Established(Jid::new("juliet@example.com/4db06f06").unwrap())]
    );

    let mut neg = authenticated(
        "<session xmlns='urn:ietf:params:xml:ns:xmpp-session'><optional/></session>",
    );
    let actions = neg.handle(element(BIND_RESULT)).unwrap();
    assert!(matches!(actions.as_slice(), [Action::Established(_)]));
}

#[test]
fn bind_errors() {
    let mut neg = authenticated("");
    // Unrelated iqs are not bind answers
    assert!(neg.handle(element("<iq type='result' id='x'/>")).unwrap().is_empty());
    let err = neg
        .handle(element(
            "<iq type='error' id='bind_1'><error type='cancel'><not-allowed xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
        ))
        .unwrap_err();
    assert!(matches!(err, LoginError::Bind(_)));
    assert_eq!(neg.state(), StreamState::Failed);
}

#[test]
fn registration() {
    let register = || {
        let mut neg = Negotiator::new(
            juliet(),
            "secret",
            NegotiationOptions::default(),
            Framing::Stream,
            true,
            false,
        )
        .for_registration(Some("Juliet".into()));
        neg.start();
        neg.handle(header()).unwrap();
        let actions = neg.handle(element(PLAIN_FEATURES)).unwrap();
        let iq = sent(&actions);
        assert!(iq.contains("<query xmlns='jabber:iq:register'>"));
        assert!(iq.contains("<username>juliet</username>"));
        assert!(iq.contains("<name>Juliet</name>"));
        neg
    };

    let mut neg = register();
    assert_eq!(
        neg.handle(element("<iq type='result' id='reg_1'/>")).unwrap(),
        vec![Action::Registered]
    );

    let mut neg = register();
    let err = neg
        .handle(element(
            "<iq type='error' id='reg_1'><error type='cancel'><conflict xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
        ))
        .unwrap_err();
    assert_eq!(err.reason(), "username already taken");
}

#[test]
fn stream_errors() {
    let mut neg = Negotiator::new(
        juliet(),
        "secret",
        NegotiationOptions::default(),
        Framing::Stream,
        true,
        false,
    );
    neg.start();
    let err = neg
        .handle(element(
            "<stream:error><host-unknown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>",
        ))
        .unwrap_err();
    assert_eq!(err.reason(), "stream-error:host-unknown");
    assert_eq!(neg.state(), StreamState::Failed);

    let mut neg = Negotiator::new(
        juliet(),
        "secret",
        NegotiationOptions::default(),
        Framing::Stream,
        true,
        false,
    );
    neg.start();
    assert!(matches!(
        neg.handle(StreamEvent::End),
        Err(LoginError::Stream(StreamError::BadStream(_)))
    ));
}

#[test]
fn websocket_open() {
    let mut neg = Negotiator::new(
        juliet(),
        "secret",
        NegotiationOptions::default(),
        Framing::WebSocket,
        true,
        false,
    );
    let actions = neg.start();
    assert!(sent(&actions).starts_with("<open xmlns='urn:ietf:params:xml:ns:xmpp-framing'"));
}

#[test]
fn state_transitions() {
    use StreamState::*;
    let path = [
        Disconnected,
        Connecting,
        NegotiatingFeatures,
        Authenticating,
        BindingResource,
        Established,
        Closing,
        Disconnected,
    ];
    for pair in path.windows(2) {
        assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
    }
    assert!(!Connecting.can_transition_to(Established));
    assert!(!NegotiatingFeatures.can_transition_to(BindingResource));
    assert!(!Authenticating.can_transition_to(Established));
    assert!(!Disconnected.can_transition_to(Failed));
    assert!(Authenticating.can_transition_to(Failed));
    assert!(Failed.can_transition_to(Connecting));
    assert!(!Failed.is_live());
    assert!(Established.is_live());
}

#[tokio::test]
async fn negotiate_over_connection() {
    let (client, mut server) = tokio::io::duplex(8192);
    let mut connection = Connection::new(Box::new(StreamTransport::plain(client)), 65536, false);
    let script = format!(
        "{SERVER_HEADER}{PLAIN_FEATURES}<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>{SERVER_HEADER}{BIND_FEATURES}{BIND_RESULT}<message from='romeo@example.net'><body>hi</body></message>"
    );
    server.write_all(script.as_bytes()).await.unwrap();

    let mut options = options(TlsPolicy::Disabled);
    options.allow_plain_without_tls = true;
    let mut neg = Negotiator::new(juliet(), "secret", options, Framing::Stream, false, true);
    let (state, observed) = watch::channel(StreamState::Connecting);
    let outcome = negotiate(&mut connection, &mut neg, &state).await.unwrap();
    assert_eq!(*observed.borrow(), StreamState::Established);
    assert_eq!(
        outcome,
        Outcome::Established(Jid::new("juliet@example.com/4db06f06").unwrap())
    );

    // Stanzas after the bind result wait for the session
    match connection.next_event() {
        Some(Ok(StreamEvent::Element(message))) => assert_eq!(message.name(), "message"),
        other => panic!("unexpected {other:?}"),
    }

    connection.close().await;
    let mut written = String::new();
    server.read_to_string(&mut written).await.unwrap();
    assert_eq!(written.matches("<stream:stream ").count(), 2);
    assert!(written.contains("mechanism='PLAIN'"));
    assert!(written.contains("id='bind_1'"));
}

#[tokio::test]
async fn negotiate_fails_on_closed_connection() {
    let (client, server) = tokio::io::duplex(1024);
    drop(server);
    let mut connection = Connection::new(Box::new(StreamTransport::plain(client)), 1024, false);
    let mut neg = Negotiator::new(
        juliet(),
        "secret",
        NegotiationOptions::default(),
        Framing::Stream,
        false,
        true,
    );
    let (state, observed) = watch::channel(StreamState::Connecting);
    let err = negotiate(&mut connection, &mut neg, &state).await.unwrap_err();
    assert!(matches!(err, LoginError::Transport(_)));
    assert_eq!(neg.state(), StreamState::Failed);
    assert_eq!(*observed.borrow(), StreamState::Failed);
}
