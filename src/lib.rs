/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

//! Client side of an XMPP connection: stream negotiation over TCP,
//! TLS or WebSocket, SASL authentication, resource binding, and an
//! established session which keeps itself alive and routes stanzas to
//! application handlers.

mod client;
pub mod constants;
mod dispatch;
mod error;
mod event;
mod jid;
pub mod negotiation;
mod roster;
pub mod sasl;
mod session;
pub mod stanza;
pub mod stream;
pub mod transport;
mod xml;

pub use xml::Element;
pub use xml::Node;

pub use jid::BadJid;
pub use jid::Jid;

pub use stream::StreamError;
pub use stream::StreamEvent;
pub use stream::StreamHeader;
pub use stream::StreamParser;

pub use stanza::Iq;
pub use stanza::IqType;
pub use stanza::Message;
pub use stanza::MessageType;
pub use stanza::Presence;
pub use stanza::PresenceType;
pub use stanza::Show;
pub use stanza::Stanza;
pub use stanza::StanzaError;

pub use transport::ConnectError;
pub use transport::Endpoint;
pub use transport::Framing;
pub use transport::Transport;
pub use transport::TransportError;

pub use sasl::AuthError;

pub use negotiation::StreamState;
pub use negotiation::TlsPolicy;

pub use dispatch::HandlerRegistry;
pub use dispatch::IqHandler;
pub use dispatch::MessageHandler;
pub use dispatch::PresenceHandler;

pub use roster::Roster;
pub use roster::RosterItem;
pub use roster::Subscription;

pub use event::Event;
pub use event::EventBus;
pub use event::EventKind;
pub use event::PresenceState;

pub use session::Session;
pub use session::SessionOptions;

pub use client::Client;
pub use client::ClientBuilder;
pub use client::ClientConfig;

pub use error::LoginError;
pub use error::RequestError;
pub use error::SessionError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
