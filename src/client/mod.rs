/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

//! Entry point: turns credentials into a [`Session`].
//!
//! ```no_run
//! use iksclient::Client;
//! use iksclient::EventKind;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::builder().resource("laptop").build();
//! client.on(EventKind::MessageReceived, |event| println!("{event:?}"));
//! let session = client.connect("juliet@example.com", "secret").await?;
//! session.closed().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::info;
use tracing::warn;

use crate::Element;
use crate::Jid;
use crate::dispatch::HandlerRegistry;
use crate::error::LoginError;
use crate::error::RequestError;
use crate::error::SessionError;
use crate::event::Event;
use crate::event::EventBus;
use crate::event::EventKind;
use crate::negotiation::Negotiator;
use crate::negotiation::Outcome;
use crate::negotiation::StreamState;
use crate::negotiation::negotiate;
use crate::session::Session;
use crate::stanza::Iq;
use crate::stanza::Message;
use crate::stanza::Presence;
use crate::stanza::StanzaError;
use crate::stream::StreamError;
use crate::transport;
use crate::transport::Connection;
use crate::transport::Transport;

mod config;

pub use config::ClientBuilder;
pub use config::ClientConfig;

struct Inner {
    config: ClientConfig,
    handlers: HandlerRegistry,
    events: EventBus,
    connecting: AtomicBool,
    session: Mutex<Option<Session>>,
    state: Mutex<watch::Receiver<StreamState>>,
}

/// Owns the configuration, the handlers and the event bus, and produces at
/// most one live session at a time. Cloning gives another handle to the
/// same client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

/// Marks a connection attempt in flight until dropped.
struct ConnectGuard<'a>(&'a AtomicBool);

impl<'a> ConnectGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, LoginError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| LoginError::AlreadyConnecting)?;
        Ok(ConnectGuard(flag))
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum Goal<'a> {
    Login,
    Register(Option<&'a str>),
}

impl Default for Client {
    fn default() -> Self {
        Client::new(ClientConfig::default())
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Client {
        let (_, state) = watch::channel(StreamState::Disconnected);
        Client {
            inner: Arc::new(Inner {
                config,
                handlers: HandlerRegistry::new(),
                events: EventBus::new(),
                connecting: AtomicBool::new(false),
                session: Mutex::new(None),
                state: Mutex::new(state),
            }),
        }
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.inner.handlers
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler);
    }

    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.on_any(handler);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.handlers.on_message(handler);
    }

    pub fn on_presence<F>(&self, handler: F)
    where
        F: Fn(&Presence) + Send + Sync + 'static,
    {
        self.inner.handlers.on_presence(handler);
    }

    pub fn handle_iq<F>(&self, name: &str, ns: &str, handler: F)
    where
        F: Fn(&Iq) -> Result<Option<Element>, StanzaError> + Send + Sync + 'static,
    {
        self.inner.handlers.handle_iq(name, ns, handler);
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.connecting.load(Ordering::Acquire)
    }

    /// State of the current or most recent stream.
    pub fn state(&self) -> StreamState {
        let state = lock(&self.inner.state);
        *state.borrow()
    }

    /// The session, while it is alive.
    pub fn session(&self) -> Option<Session> {
        lock(&self.inner.session)
            .as_ref()
            .filter(|session| session.state().is_live())
            .cloned()
    }

    /// Connects to the configured endpoint, or the JID's domain, and logs
    /// in. Emits `login-succeeded` and `session-established` on success,
    /// `login-failed` otherwise.
    pub async fn connect(&self, jid: &str, password: &str) -> Result<Session, LoginError> {
        self.login(jid, password, None).await
    }

    /// Logs in over an already open transport.
    pub async fn connect_over(
        &self,
        jid: &str,
        password: &str,
        transport: Box<dyn Transport>,
    ) -> Result<Session, LoginError> {
        self.login(jid, password, Some(transport)).await
    }

    /// Creates an account through in-band registration, then closes the
    /// stream. No session is established.
    pub async fn register(
        &self,
        jid: &str,
        password: &str,
        name: Option<&str>,
    ) -> Result<(), LoginError> {
        self.create_account(jid, password, name, None).await
    }

    pub async fn register_over(
        &self,
        jid: &str,
        password: &str,
        name: Option<&str>,
        transport: Box<dyn Transport>,
    ) -> Result<(), LoginError> {
        self.create_account(jid, password, name, Some(transport))
            .await
    }

    pub async fn send_message(&self, to: &Jid, body: &str) -> Result<(), SessionError> {
        self.session()
            .ok_or(SessionError::Closed)?
            .send_message(to, body)
            .await
    }

    pub async fn set_presence(&self, presence: Presence) -> Result<(), SessionError> {
        self.session()
            .ok_or(SessionError::Closed)?
            .set_presence(presence)
            .await
    }

    /// Removes the logged in account from the server, ending its session.
    pub async fn delete_account(&self) -> Result<(), RequestError> {
        self.session()
            .ok_or(RequestError::SessionClosed)?
            .delete_account()
            .await
    }

    /// Ends the session gracefully. Does nothing without one.
    pub async fn logout(&self) {
        if let Some(session) = self.session() {
            session.logout().await;
        }
    }

    /// Drops the connection without the closing handshake.
    pub async fn disconnect(&self) {
        if let Some(session) = self.session() {
            session.disconnect().await;
        }
    }

    async fn login(
        &self,
        jid: &str,
        password: &str,
        transport: Option<Box<dyn Transport>>,
    ) -> Result<Session, LoginError> {
        let _guard = ConnectGuard::acquire(&self.inner.connecting)?;
        if self.session().is_some() {
            return Err(LoginError::AlreadyConnected);
        }
        let state = self.track_state();
        let events = &self.inner.events;
        match self.establish(jid, password, transport, &state).await {
            Ok((bound, connection)) => {
                info!(jid = %bound, "logged in");
                events.emit(Event::LoginSucceeded { jid: bound.clone() });
                events.emit(Event::SessionEstablished { jid: bound.clone() });
                let session = Session::spawn(
                    bound,
                    connection,
                    self.inner.handlers.clone(),
                    events.clone(),
                    self.inner.config.session_options(),
                    state,
                );
                *lock(&self.inner.session) = Some(session.clone());
                Ok(session)
            }
            Err(err) => {
                warn!(%err, "login failed");
                state.send_replace(StreamState::Failed);
                events.emit(Event::LoginFailed {
                    reason: err.reason(),
                });
                Err(err)
            }
        }
    }

    async fn establish(
        &self,
        jid: &str,
        password: &str,
        transport: Option<Box<dyn Transport>>,
        state: &watch::Sender<StreamState>,
    ) -> Result<(Jid, Connection), LoginError> {
        let jid = Jid::new(jid)?;
        let mut connection = self.open(&jid, transport).await?;
        match self
            .handshake(&mut connection, &jid, password, Goal::Login, state)
            .await?
        {
            Outcome::Established(bound) => Ok((bound, connection)),
            Outcome::Registered => {
                connection.close().await;
                Err(StreamError::BadStream("unexpected registration result").into())
            }
        }
    }

    async fn create_account(
        &self,
        jid: &str,
        password: &str,
        name: Option<&str>,
        transport: Option<Box<dyn Transport>>,
    ) -> Result<(), LoginError> {
        let _guard = ConnectGuard::acquire(&self.inner.connecting)?;
        if self.session().is_some() {
            return Err(LoginError::AlreadyConnected);
        }
        let state = self.track_state();
        let result = self
            .register_once(jid, password, name, transport, &state)
            .await;
        match &result {
            Ok(()) => {
                info!(%jid, "account created");
                state.send_replace(StreamState::Disconnected);
            }
            Err(err) => {
                warn!(%err, "registration failed");
                state.send_replace(StreamState::Failed);
            }
        }
        result
    }

    async fn register_once(
        &self,
        jid: &str,
        password: &str,
        name: Option<&str>,
        transport: Option<Box<dyn Transport>>,
        state: &watch::Sender<StreamState>,
    ) -> Result<(), LoginError> {
        let jid = Jid::new(jid)?;
        let mut connection = self.open(&jid, transport).await?;
        let outcome = self
            .handshake(&mut connection, &jid, password, Goal::Register(name), state)
            .await?;
        let close = connection.framing().close();
        let _ = connection.send(close.as_bytes()).await;
        connection.close().await;
        match outcome {
            Outcome::Registered => Ok(()),
            Outcome::Established(_) => Err(StreamError::BadStream("unexpected login result").into()),
        }
    }

    /// Starts a fresh state channel for a new attempt.
    fn track_state(&self) -> watch::Sender<StreamState> {
        let (sender, receiver) = watch::channel(StreamState::Connecting);
        *lock(&self.inner.state) = receiver;
        sender
    }

    async fn open(
        &self,
        jid: &Jid,
        transport: Option<Box<dyn Transport>>,
    ) -> Result<Connection, LoginError> {
        let config = &self.inner.config;
        let transport = match transport {
            Some(transport) => transport,
            None => {
                let endpoint = config.endpoint_for(jid.domainpart());
                transport::open(&endpoint, jid.domainpart(), config.connect_timeout).await?
            }
        };
        Ok(Connection::new(
            transport,
            config.max_buffer_size,
            config.log_traffic,
        ))
    }

    /// Negotiates within the configured deadline. The connection is closed
    /// when negotiation fails.
    async fn handshake(
        &self,
        connection: &mut Connection,
        jid: &Jid,
        password: &str,
        goal: Goal<'_>,
        state: &watch::Sender<StreamState>,
    ) -> Result<Outcome, LoginError> {
        let config = &self.inner.config;
        let mut negotiator = Negotiator::new(
            jid.clone(),
            password,
            config.negotiation_options(),
            connection.framing(),
            connection.is_secure(),
            connection.can_start_tls(),
        );
        if let Goal::Register(name) = goal {
            negotiator = negotiator.for_registration(name.map(str::to_string));
        }
        let result = match tokio::time::timeout(
            config.negotiation_timeout,
            negotiate(connection, &mut negotiator, state),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                negotiator.fail();
                state.send_replace(StreamState::Failed);
                Err(LoginError::Timeout)
            }
        };
        if result.is_err() {
            connection.close().await;
        }
        result
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
