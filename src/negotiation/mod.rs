/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

//! Stream negotiation: STARTTLS, SASL and resource binding.
//!
//! [`Negotiator`] does no I/O. It is fed [`StreamEvent`]s and answers with
//! [`Action`]s; [`negotiate`] drives it over a [`Connection`].

use std::collections::VecDeque;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;
use zeroize::Zeroizing;

use crate::Element;
use crate::Jid;
use crate::constants::BIND_NS;
use crate::constants::CLIENT_NS;
use crate::constants::FEATURES_TAG;
use crate::constants::REGISTER_NS;
use crate::constants::SASL_NS;
use crate::constants::SESSION_NS;
use crate::constants::STREAM_NS;
use crate::constants::TLS_NS;
use crate::error::LoginError;
use crate::sasl;
use crate::sasl::AuthError;
use crate::sasl::Authenticator;
use crate::sasl::Mechanism;
use crate::stanza::StanzaError;
use crate::stream::StreamError;
use crate::stream::StreamEvent;
use crate::transport::Connection;
use crate::transport::Framing;
use crate::transport::SecurityNegotiationError;

const BIND_ID: &str = "bind_1";
const SESSION_ID: &str = "session_1";
const REGISTER_ID: &str = "reg_1";

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamState {
    Disconnected,
    Connecting,
    NegotiatingFeatures,
    Authenticating,
    BindingResource,
    Established,
    Closing,
    Failed,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Disconnected => "disconnected",
            StreamState::Connecting => "connecting",
            StreamState::NegotiatingFeatures => "negotiating-features",
            StreamState::Authenticating => "authenticating",
            StreamState::BindingResource => "binding-resource",
            StreamState::Established => "established",
            StreamState::Closing => "closing",
            StreamState::Failed => "failed",
        }
    }

    /// Whether `next` may follow this state. Established is only reachable
    /// through every negotiation step in order.
    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        match (self, next) {
            (Disconnected | Failed, Connecting) => true,
            (Connecting, NegotiatingFeatures) => true,
            (NegotiatingFeatures, NegotiatingFeatures | Authenticating) => true,
            (Authenticating, BindingResource) => true,
            (BindingResource, Established) => true,
            (Established, Closing) => true,
            (Closing, Disconnected) => true,
            (Disconnected, _) => false,
            (_, Failed | Disconnected) => true,
            _ => false,
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, StreamState::Disconnected | StreamState::Failed)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when the server offers STARTTLS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsPolicy {
    /// Refuse to continue without TLS.
    #[default]
    Required,
    /// Upgrade when offered.
    Opportunistic,
    /// Never upgrade.
    Disabled,
}

#[derive(Debug, Clone, Default)]
pub struct NegotiationOptions {
    pub tls: TlsPolicy,
    pub allow_plain_without_tls: bool,
    pub resource: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(String),
    /// Upgrade the transport, then call [`Negotiator::tls_established`].
    StartTls,
    /// The server opens a new stream on the same bytes.
    RestartStream,
    Established(Jid),
    Registered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Features,
    Proceed,
    Sasl,
    Bind,
    Session,
    Registration,
    Done,
}

enum Goal {
    Login,
    Register { name: Option<String> },
}

/// Client side of stream negotiation.
pub struct Negotiator {
    jid: Jid,
    password: Zeroizing<String>,
    options: NegotiationOptions,
    goal: Goal,
    framing: Framing,
    secure: bool,
    can_start_tls: bool,
    state: StreamState,
    phase: Phase,
    authenticator: Option<Authenticator>,
    authenticated: bool,
    session_required: bool,
    bound: Option<Jid>,
}

impl Negotiator {
    pub fn new(
        jid: Jid,
        password: &str,
        options: NegotiationOptions,
        framing: Framing,
        secure: bool,
        can_start_tls: bool,
    ) -> Negotiator {
        Negotiator {
            jid,
            password: Zeroizing::new(password.to_string()),
            options,
            goal: Goal::Login,
            framing,
            secure,
            can_start_tls,
            state: StreamState::Connecting,
            phase: Phase::Header,
            authenticator: None,
            authenticated: false,
            session_required: false,
            bound: None,
        }
    }

    /// Negotiates only as far as needed to create the account.
    pub fn for_registration(mut self, name: Option<String>) -> Negotiator {
        self.goal = Goal::Register { name };
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn domain(&self) -> &str {
        self.jid.domainpart()
    }

    fn set_state(&mut self, next: StreamState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "unexpected state transition");
        }
        debug!(from = %self.state, to = %next, "stream state");
        self.state = next;
    }

    pub fn fail(&mut self) {
        self.set_state(StreamState::Failed);
    }

    fn header(&self) -> Action {
        let from = self.secure.then(|| self.jid.bare());
        Action::Send(self.framing.open(self.jid.domainpart(), from))
    }

    /// Opens the first stream.
    pub fn start(&mut self) -> Vec<Action> {
        self.set_state(StreamState::NegotiatingFeatures);
        self.phase = Phase::Header;
        vec![self.header()]
    }

    /// The transport is now encrypted; opens a fresh stream over it.
    pub fn tls_established(&mut self) -> Vec<Action> {
        info!(domain = self.jid.domainpart(), "stream secured with TLS");
        self.secure = true;
        self.phase = Phase::Header;
        vec![self.header()]
    }

    pub fn handle(&mut self, event: StreamEvent) -> Result<Vec<Action>, LoginError> {
        let result = self.process(event);
        if result.is_err() {
            self.fail();
        }
        result
    }

    fn process(&mut self, event: StreamEvent) -> Result<Vec<Action>, LoginError> {
        let element = match event {
            StreamEvent::Header(header) => {
                debug!(id = header.id.as_deref(), "stream opened by server");
                if self.phase == Phase::Header {
                    self.phase = Phase::Features;
                }
                return Ok(Vec::new());
            }
            StreamEvent::End => {
                return Err(StreamError::BadStream("stream closed during negotiation").into());
            }
            StreamEvent::Element(element) => element,
        };
        if element.is("error", STREAM_NS) {
            return Err(StreamError::from_element(&element).into());
        }
        match self.phase {
            Phase::Features if element.is(FEATURES_TAG, STREAM_NS) => self.features(&element),
            Phase::Proceed if element.is("proceed", TLS_NS) => Ok(vec![Action::StartTls]),
            Phase::Proceed if element.is("failure", TLS_NS) => {
                Err(SecurityNegotiationError::Refused.into())
            }
            Phase::Sasl if element.ns() == Some(SASL_NS) => self.sasl(&element),
            Phase::Bind | Phase::Session | Phase::Registration if is_iq(&element) => {
                self.iq(&element)
            }
            _ => {
                debug!(name = element.name(), "ignoring element during negotiation");
                Ok(Vec::new())
            }
        }
    }

    fn features(&mut self, features: &Element) -> Result<Vec<Action>, LoginError> {
        if !self.secure {
            let starttls = features.child("starttls", TLS_NS);
            let server_requires = starttls.is_some_and(|tls| tls.has_child("required", TLS_NS));
            match (starttls, self.options.tls) {
                (Some(_), TlsPolicy::Disabled) if server_requires => {
                    return Err(SecurityNegotiationError::RequiredByServer.into());
                }
                (Some(_), TlsPolicy::Required | TlsPolicy::Opportunistic) if self.can_start_tls => {
                    debug!("requesting STARTTLS");
                    self.phase = Phase::Proceed;
                    return Ok(vec![Action::Send(Element::with_ns("starttls", TLS_NS).to_string())]);
                }
                (_, TlsPolicy::Required) => {
                    return Err(SecurityNegotiationError::NotOffered.into());
                }
                _ => {}
            }
        }
        if let Goal::Register { name } = &self.goal {
            return self.register(name.clone());
        }
        if !self.authenticated {
            self.authenticate(features)
        } else {
            self.bind(features)
        }
    }

    fn authenticate(&mut self, features: &Element) -> Result<Vec<Action>, LoginError> {
        self.set_state(StreamState::Authenticating);
        let offered: Vec<String> = features
            .child("mechanisms", SASL_NS)
            .map(|mechanisms| {
                mechanisms
                    .children()
                    .filter(|child| child.is("mechanism", SASL_NS))
                    .map(|child| child.text().trim().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let plain_allowed = self.secure || self.options.allow_plain_without_tls;
        let mechanism = Mechanism::select(&offered, plain_allowed).ok_or(AuthError::NoMechanism)?;
        let username = self
            .jid
            .localpart()
            .ok_or(AuthError::MissingLocalpart)?;
        info!(mechanism = mechanism.name(), "authenticating");
        let mut authenticator = Authenticator::new(mechanism, username, &self.password);
        let initial = authenticator.initial_response();
        self.authenticator = Some(authenticator);
        self.phase = Phase::Sasl;
        let auth = Element::with_ns("auth", SASL_NS)
            .with_attr("mechanism", mechanism.name())
            .with_text(sasl::encode_payload(&initial));
        Ok(vec![Action::Send(auth.to_string())])
    }

    fn sasl(&mut self, element: &Element) -> Result<Vec<Action>, LoginError> {
        let Some(authenticator) = self.authenticator.as_mut() else {
            return Err(StreamError::BadStream("SASL reply without a request").into());
        };
        match element.name() {
            "challenge" => {
                let challenge = sasl::decode_payload(&element.text())?;
                let response = authenticator.respond(&challenge)?;
                let response =
                    Element::with_ns("response", SASL_NS).with_text(sasl::encode_payload(&response));
                Ok(vec![Action::Send(response.to_string())])
            }
            "success" => {
                let additional = sasl::decode_payload(&element.text())?;
                authenticator.finish(&additional)?;
                info!(jid = %self.jid.bare(), "authenticated");
                self.authenticator = None;
                self.authenticated = true;
                self.phase = Phase::Header;
                Ok(vec![Action::RestartStream, self.header()])
            }
            "failure" => {
                let condition = element
                    .children()
                    .find(|child| child.ns() == Some(SASL_NS) && child.name() != "text")
                    .map(|child| child.name().to_string())
                    .unwrap_or_else(|| "not-authorized".to_string());
                let text = element.child_text("text", SASL_NS);
                warn!(%condition, "authentication failed");
                Err(AuthError::Failure { condition, text }.into())
            }
            other => {
                debug!(name = other, "ignoring SASL element");
                Ok(Vec::new())
            }
        }
    }

    fn bind(&mut self, features: &Element) -> Result<Vec<Action>, LoginError> {
        self.set_state(StreamState::BindingResource);
        if !features.has_child("bind", BIND_NS) {
            return Err(LoginError::Bind("resource binding not offered".to_string()));
        }
        self.session_required = features
            .child("session", SESSION_NS)
            .is_some_and(|session| !session.has_child("optional", SESSION_NS));
        let mut bind = Element::with_ns("bind", BIND_NS);
        if let Some(resource) = &self.options.resource {
            bind.push_child(Element::new("resource").with_text(resource.as_str()));
        }
        let iq = Element::with_ns("iq", CLIENT_NS)
            .with_attr("type", "set")
            .with_attr("id", BIND_ID)
            .with_child(bind);
        self.phase = Phase::Bind;
        Ok(vec![Action::Send(iq.to_string())])
    }

    fn register(&mut self, name: Option<String>) -> Result<Vec<Action>, LoginError> {
        let username = self.jid.require_localpart()?;
        let mut query = Element::with_ns("query", REGISTER_NS)
            .with_child(Element::new("username").with_text(username))
            .with_child(Element::new("password").with_text(self.password.as_str()));
        if let Some(name) = name {
            query.push_child(Element::new("name").with_text(name));
        }
        let iq = Element::with_ns("iq", CLIENT_NS)
            .with_attr("type", "set")
            .with_attr("id", REGISTER_ID)
            .with_attr("to", self.jid.domainpart())
            .with_child(query);
        self.phase = Phase::Registration;
        Ok(vec![Action::Send(iq.to_string())])
    }

    fn iq(&mut self, iq: &Element) -> Result<Vec<Action>, LoginError> {
        let expected = match self.phase {
            Phase::Bind => BIND_ID,
            Phase::Session => SESSION_ID,
            _ => REGISTER_ID,
        };
        if iq.attr("id") != Some(expected) {
            debug!(id = iq.attr("id"), "ignoring iq during negotiation");
            return Ok(Vec::new());
        }
        let error = match iq.attr("type") {
            Some("result") => None,
            Some("error") => Some(StanzaError::from_stanza(iq).unwrap_or_else(StanzaError::bad_request)),
            _ => return Ok(Vec::new()),
        };
        match (self.phase, error) {
            (Phase::Bind, Some(error)) => Err(LoginError::Bind(error.to_string())),
            (Phase::Bind, None) => {
                let bound = iq
                    .child("bind", BIND_NS)
                    .and_then(|bind| bind.child_text("jid", BIND_NS))
                    .ok_or_else(|| LoginError::Bind("no JID in bind result".to_string()))?;
                let bound = Jid::new(bound.trim())?;
                if !bound.same_bare(&self.jid) {
                    debug!(requested = %self.jid, %bound, "server assigned a different address");
                }
                info!(jid = %bound, "resource bound");
                if self.session_required {
                    self.bound = Some(bound);
                    self.phase = Phase::Session;
                    let session = Element::with_ns("iq", CLIENT_NS)
                        .with_attr("type", "set")
                        .with_attr("id", SESSION_ID)
                        .with_child(Element::with_ns("session", SESSION_NS));
                    return Ok(vec![Action::Send(session.to_string())]);
                }
                Ok(self.established(bound))
            }
            (Phase::Session, Some(error)) => Err(LoginError::Session(error)),
            (Phase::Session, None) => match self.bound.take() {
                Some(bound) => Ok(self.established(bound)),
                None => Err(LoginError::Bind("session before bind".to_string())),
            },
            (_, Some(error)) => Err(LoginError::Registration(registration_reason(&error))),
            (_, None) => {
                info!(jid = %self.jid.bare(), "account registered");
                self.phase = Phase::Done;
                Ok(vec![Action::Registered])
            }
        }
    }

    fn established(&mut self, bound: Jid) -> Vec<Action> {
        self.set_state(StreamState::Established);
        self.phase = Phase::Done;
        vec![Action::Established(bound)]
    }
}

fn is_iq(element: &Element) -> bool {
    element.name() == "iq" && matches!(element.ns(), None | Some(CLIENT_NS))
}

fn registration_reason(error: &StanzaError) -> String {
    match error.condition.as_str() {
        "conflict" => "username already taken".to_string(),
        "not-acceptable" => "registration data not acceptable".to_string(),
        "not-allowed" | "forbidden" => "registration not allowed".to_string(),
        _ => error.to_string(),
    }
}

/// How a negotiation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Established(Jid),
    Registered,
}

/// Runs the negotiator over a connection until it reaches an outcome,
/// publishing every state change. Bytes that arrive after the outcome stay
/// buffered in the connection.
pub async fn negotiate(
    connection: &mut Connection,
    negotiator: &mut Negotiator,
    state: &watch::Sender<StreamState>,
) -> Result<Outcome, LoginError> {
    let result = drive(connection, negotiator, state).await;
    if result.is_err() {
        negotiator.fail();
    }
    state.send_replace(negotiator.state());
    result
}

async fn drive(
    connection: &mut Connection,
    negotiator: &mut Negotiator,
    state: &watch::Sender<StreamState>,
) -> Result<Outcome, LoginError> {
    let mut actions: VecDeque<Action> = negotiator.start().into();
    loop {
        state.send_replace(negotiator.state());
        while let Some(action) = actions.pop_front() {
            match action {
                Action::Send(data) => connection.send(data.as_bytes()).await?,
                Action::StartTls => {
                    let domain = negotiator.domain().to_string();
                    connection.start_tls(&domain).await?;
                    actions.extend(negotiator.tls_established());
                }
                Action::RestartStream => connection.restart_stream(),
                Action::Established(jid) => return Ok(Outcome::Established(jid)),
                Action::Registered => return Ok(Outcome::Registered),
            }
        }
        match connection.next_event() {
            Some(event) => actions.extend(negotiator.handle(event?)?),
            None => {
                connection.receive().await?;
            }
        }
    }
}

#[cfg(test)]
mod tests;
