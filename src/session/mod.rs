/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

//! The established session.
//!
//! Each session runs on its own task: a single loop reads, parses and
//! dispatches stanzas strictly in arrival order, and serializes the
//! application's commands onto the same stream. [`Session`] is the cheap,
//! cloneable handle to that task.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::Element;
use crate::Jid;
use crate::constants::PING_NS;
use crate::constants::REGISTER_NS;
use crate::constants::ROSTER_NS;
use crate::constants::STREAM_NS;
use crate::dispatch::Dispatched;
use crate::dispatch::Dispatcher;
use crate::dispatch::HandlerRegistry;
use crate::dispatch::InternalRequest;
use crate::dispatch::Responder;
use crate::error::RequestError;
use crate::error::SessionError;
use crate::event::Event;
use crate::event::EventBus;
use crate::event::PresenceState;
use crate::negotiation::StreamState;
use crate::roster::Roster;
use crate::roster::RosterItem;
use crate::stanza::Iq;
use crate::stanza::IqType;
use crate::stanza::Message;
use crate::stanza::MessageType;
use crate::stanza::Presence;
use crate::stanza::PresenceType;
use crate::stanza::Stanza;
use crate::stanza::StanzaError;
use crate::stream::StreamError;
use crate::stream::StreamEvent;
use crate::transport::Connection;

const COMMAND_QUEUE: usize = 64;

/// Timing of an established session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_max_missed: u32,
    pub initial_priority: Option<i8>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            request_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(60),
            keepalive_max_missed: 5,
            initial_priority: None,
        }
    }
}

enum Command {
    Send(Stanza),
    Request {
        iq: Iq,
        reply: oneshot::Sender<Result<Iq, RequestError>>,
    },
    Roster(oneshot::Sender<Vec<RosterItem>>),
    DeleteAccount(oneshot::Sender<Result<(), RequestError>>),
    Logout(oneshot::Sender<()>),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to a running session.
#[derive(Clone)]
pub struct Session {
    jid: Jid,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<StreamState>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("jid", &self.jid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Starts the session loop on a negotiated connection.
    pub(crate) fn spawn(
        jid: Jid,
        connection: Connection,
        handlers: HandlerRegistry,
        events: EventBus,
        options: SessionOptions,
        state: watch::Sender<StreamState>,
    ) -> Session {
        let (commands, queue) = mpsc::channel(COMMAND_QUEUE);
        state.send_replace(StreamState::Established);
        let session = Session {
            jid: jid.clone(),
            commands,
            state: state.subscribe(),
        };
        let worker = Worker {
            dispatcher: Dispatcher::new(handlers, jid.clone()),
            jid,
            connection,
            roster: Roster::new(),
            events,
            options,
            state,
            commands: queue,
            next_id: 0,
            missed: 0,
            heard: false,
            deletion: Vec::new(),
        };
        tokio::spawn(worker.run());
        session
    }

    /// The address the server bound for this session.
    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn is_established(&self) -> bool {
        self.state() == StreamState::Established
    }

    /// Waits until the session has ended, for whatever reason.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|state| !state.is_live()).await;
    }

    async fn command(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub async fn send(&self, stanza: impl Into<Stanza>) -> Result<(), SessionError> {
        self.command(Command::Send(stanza.into())).await
    }

    /// Sends a chat message.
    pub async fn send_message(&self, to: &Jid, body: &str) -> Result<(), SessionError> {
        self.send(Message::chat(to.clone(), body)).await
    }

    /// Broadcasts the user's presence.
    pub async fn set_presence(&self, presence: Presence) -> Result<(), SessionError> {
        self.send(presence).await
    }

    pub async fn subscribe(&self, jid: &Jid) -> Result<(), SessionError> {
        self.send(Presence::subscription(PresenceType::Subscribe, jid.to_bare()))
            .await
    }

    pub async fn approve_subscription(&self, jid: &Jid) -> Result<(), SessionError> {
        self.send(Presence::subscription(PresenceType::Subscribed, jid.to_bare()))
            .await
    }

    pub async fn deny_subscription(&self, jid: &Jid) -> Result<(), SessionError> {
        self.send(Presence::subscription(PresenceType::Unsubscribed, jid.to_bare()))
            .await
    }

    pub async fn unsubscribe(&self, jid: &Jid) -> Result<(), SessionError> {
        self.send(Presence::subscription(PresenceType::Unsubscribe, jid.to_bare()))
            .await
    }

    /// Sends a request and waits for its answer. An empty id is replaced by a
    /// unique one.
    pub async fn send_iq(&self, iq: Iq) -> Result<Iq, RequestError> {
        let (reply, answer) = oneshot::channel();
        self.command(Command::Request { iq, reply }).await?;
        answer.await.map_err(|_| RequestError::SessionClosed)?
    }

    /// Adds the contact to the roster and asks for its presence.
    pub async fn add_contact(&self, jid: &Jid, name: Option<&str>) -> Result<(), RequestError> {
        let mut item = RosterItem::new(jid.to_bare());
        item.name = name.map(str::to_string);
        self.send_iq(Iq::set(Roster::set_query(&item))).await?;
        self.subscribe(jid).await?;
        Ok(())
    }

    pub async fn remove_contact(&self, jid: &Jid) -> Result<(), RequestError> {
        self.send_iq(Iq::set(Roster::remove_query(jid))).await?;
        Ok(())
    }

    /// Snapshot of the roster cache.
    pub async fn roster(&self) -> Result<Vec<RosterItem>, SessionError> {
        let (reply, answer) = oneshot::channel();
        self.command(Command::Roster(reply)).await?;
        answer.await.map_err(|_| SessionError::Closed)
    }

    /// Removes the account from the server. Once the server confirms, the
    /// session ends with the reason `account-deleted`. A refusal leaves the
    /// session running.
    pub async fn delete_account(&self) -> Result<(), RequestError> {
        let (reply, answer) = oneshot::channel();
        self.command(Command::DeleteAccount(reply)).await?;
        answer.await.map_err(|_| RequestError::SessionClosed)?
    }

    /// Announces unavailability, closes the stream and the transport. Does
    /// nothing on a session which has already ended.
    pub async fn logout(&self) {
        let (reply, done) = oneshot::channel();
        if self.command(Command::Logout(reply)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Drops the connection without saying goodbye.
    pub async fn disconnect(&self) {
        let (reply, done) = oneshot::channel();
        if self.command(Command::Disconnect(reply)).await.is_ok() {
            let _ = done.await;
        }
    }
}

/// Why the session loop stopped.
enum Exit {
    Logout(oneshot::Sender<()>),
    Disconnect(Option<oneshot::Sender<()>>),
    StreamClosed,
    AccountDeleted(Vec<DeletionReply>),
    Failed(String),
}

type DeletionReply = oneshot::Sender<Result<(), RequestError>>;

type Step = Result<(), Exit>;

fn connection_lost() -> Exit {
    Exit::Failed("connection-lost".to_string())
}

struct Worker {
    jid: Jid,
    connection: Connection,
    dispatcher: Dispatcher,
    roster: Roster,
    events: EventBus,
    options: SessionOptions,
    state: watch::Sender<StreamState>,
    commands: mpsc::Receiver<Command>,
    next_id: u64,
    missed: u32,
    heard: bool,
    /// Callers waiting for the account removal request.
    deletion: Vec<DeletionReply>,
}

impl Worker {
    async fn run(mut self) {
        info!(jid = %self.jid, "session established");
        let exit = match self.open().await {
            Ok(()) => self.serve().await,
            Err(exit) => exit,
        };
        self.teardown(exit).await;
    }

    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("iks-{}", self.next_id)
    }

    async fn write(&mut self, element: &Element) -> Step {
        self.connection.send_element(element).await.map_err(|err| {
            warn!(%err, "write failed");
            connection_lost()
        })
    }

    async fn request(&mut self, mut iq: Iq, responder: Responder) -> Step {
        if iq.id.is_empty() {
            iq.id = self.next_id();
        }
        let deadline = Instant::now() + self.options.request_timeout;
        self.dispatcher
            .register_pending(iq.id.clone(), iq.to.clone(), responder, deadline);
        self.write(&iq.to_element()).await
    }

    /// Initial presence and roster request.
    async fn open(&mut self) -> Step {
        let mut presence = Presence::available();
        if let Some(priority) = self.options.initial_priority {
            presence = presence.with_priority(priority);
        }
        self.write(&presence.to_element()).await?;
        let get = Iq::get(Roster::query());
        self.request(get, Responder::Internal(InternalRequest::RosterGet))
            .await
    }

    async fn serve(&mut self) -> Exit {
        let period = self.options.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            while let Some(event) = self.connection.next_event() {
                if let Err(exit) = self.incoming(event).await {
                    return exit;
                }
            }
            let deadline = self.dispatcher.next_deadline();
            let step = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.command(command).await,
                    // Every handle is gone
                    None => Err(Exit::Disconnect(None)),
                },
                received = self.connection.receive() => match received {
                    Ok(_) => {
                        self.heard = true;
                        Ok(())
                    }
                    Err(err) => {
                        warn!(%err, "connection lost");
                        Err(connection_lost())
                    }
                },
                _ = keepalive.tick() => self.keepalive().await,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire();
                    Ok(())
                }
            };
            if let Err(exit) = step {
                return exit;
            }
        }
    }

    async fn command(&mut self, command: Command) -> Step {
        match command {
            Command::Send(stanza) => self.write(&stanza.to_element()).await,
            Command::Request { iq, reply } => self.request(iq, Responder::Caller(reply)).await,
            Command::Roster(reply) => {
                let _ = reply.send(self.roster.items().cloned().collect());
                Ok(())
            }
            Command::DeleteAccount(reply) => {
                self.deletion.push(reply);
                if self.deletion.len() > 1 {
                    return Ok(());
                }
                info!(jid = %self.jid, "deleting account");
                let remove =
                    Element::with_ns("query", REGISTER_NS).with_child(Element::new("remove"));
                self.request(
                    Iq::set(remove),
                    Responder::Internal(InternalRequest::DeleteAccount),
                )
                .await
            }
            Command::Logout(reply) => Err(Exit::Logout(reply)),
            Command::Disconnect(reply) => Err(Exit::Disconnect(Some(reply))),
        }
    }

    async fn keepalive(&mut self) -> Step {
        if std::mem::take(&mut self.heard) {
            self.missed = 0;
            return Ok(());
        }
        self.missed += 1;
        if self.missed >= self.options.keepalive_max_missed {
            warn!(missed = self.missed, "server stopped responding");
            return Err(Exit::Failed("keepalive-timeout".to_string()));
        }
        debug!(missed = self.missed, "connection idle, pinging server");
        let mut ping = Iq::get(Element::with_ns("ping", PING_NS));
        ping.to = Jid::new(self.jid.domainpart()).ok();
        self.request(ping, Responder::Internal(InternalRequest::Ping))
            .await
    }

    fn expire(&mut self) {
        for kind in self.dispatcher.expire(Instant::now()) {
            match kind {
                InternalRequest::Ping => debug!("keepalive ping unanswered"),
                InternalRequest::RosterGet => warn!("roster request timed out"),
                InternalRequest::DeleteAccount => {
                    warn!("account removal timed out");
                    self.answer_deletion(Err(RequestError::Timeout));
                }
            }
        }
    }

    async fn incoming(&mut self, event: Result<StreamEvent, StreamError>) -> Step {
        let element = match event {
            Ok(StreamEvent::Element(element)) => element,
            Ok(StreamEvent::Header(_)) => {
                debug!("stream header after negotiation");
                return Ok(());
            }
            Ok(StreamEvent::End) => {
                info!("server closed the stream");
                return Err(Exit::StreamClosed);
            }
            Err(err) => {
                error!(%err, "stream failed");
                return Err(Exit::Failed("parse-error".to_string()));
            }
        };
        if element.is("error", STREAM_NS) {
            let reason = match StreamError::from_element(&element) {
                StreamError::Server { condition, text } => {
                    error!(%condition, text = text.as_deref(), "stream error from server");
                    format!("stream-error:{condition}")
                }
                other => other.to_string(),
            };
            return Err(Exit::Failed(reason));
        }
        match Stanza::from_element(element) {
            Ok(stanza) => self.stanza(stanza).await,
            Err(err) => {
                warn!(%err, "dropping invalid stanza");
                Ok(())
            }
        }
    }

    async fn stanza(&mut self, stanza: Stanza) -> Step {
        match &stanza {
            Stanza::Iq(iq) if iq.kind == IqType::Set && has_payload(iq, "query", ROSTER_NS) => {
                return self.roster_push(iq).await;
            }
            Stanza::Iq(iq) if iq.kind == IqType::Get && has_payload(iq, "ping", PING_NS) => {
                return self.write(&Iq::result(iq, None).to_element()).await;
            }
            Stanza::Message(message) => self.message_event(message),
            Stanza::Presence(presence) => self.presence_event(presence),
            Stanza::Iq(_) => {}
        }
        match self.dispatcher.dispatch(stanza) {
            Dispatched::Reply(reply) => self.write(&reply.to_element()).await,
            Dispatched::Internal(kind, result) => self.internal(kind, result),
            Dispatched::Handled | Dispatched::Dropped => Ok(()),
        }
    }

    fn message_event(&self, message: &Message) {
        if message.kind == MessageType::Error {
            debug!(error = ?message.error(), "message bounced");
            return;
        }
        if let (Some(from), Some(body)) = (&message.from, message.body()) {
            self.events.emit(Event::MessageReceived {
                from: from.clone(),
                body,
            });
        }
    }

    fn presence_event(&self, presence: &Presence) {
        let Some(from) = &presence.from else {
            return;
        };
        if presence.kind == PresenceType::Subscribe {
            info!(%from, "subscription request");
            self.events.emit(Event::SubscriptionRequested {
                from: from.to_bare(),
            });
        } else if let Some(state) = PresenceState::of(presence) {
            self.events.emit(Event::PresenceChanged {
                jid: from.clone(),
                state,
                status: presence.status(),
            });
        }
    }

    async fn roster_push(&mut self, iq: &Iq) -> Step {
        if let Some(from) = &iq.from {
            if from.bare() != self.jid.bare() {
                warn!(%from, "refusing roster push from a third party");
                let refusal = Iq::error(iq, &StanzaError::service_unavailable());
                return self.write(&refusal.to_element()).await;
            }
        }
        let items = match iq.child() {
            Some(query) => self.roster.apply_push(query),
            None => Vec::new(),
        };
        self.write(&Iq::result(iq, None).to_element()).await?;
        self.events.emit(Event::RosterUpdated { items });
        Ok(())
    }

    fn internal(&mut self, kind: InternalRequest, result: Result<Iq, RequestError>) -> Step {
        match (kind, result) {
            (InternalRequest::RosterGet, Ok(iq)) => {
                if let Some(query) = iq.child() {
                    self.roster.replace(query);
                }
                self.events.emit(Event::RosterUpdated {
                    items: self.roster.items().cloned().collect(),
                });
            }
            (InternalRequest::RosterGet, Err(err)) => warn!(%err, "roster request failed"),
            (InternalRequest::Ping, _) => debug!("keepalive answered"),
            (InternalRequest::DeleteAccount, Ok(_)) => {
                return Err(Exit::AccountDeleted(std::mem::take(&mut self.deletion)));
            }
            (InternalRequest::DeleteAccount, Err(err)) => {
                warn!(%err, "account removal refused");
                self.answer_deletion(Err(err));
            }
        }
        Ok(())
    }

    fn answer_deletion(&mut self, result: Result<(), RequestError>) {
        for reply in self.deletion.drain(..) {
            let _ = reply.send(result.clone());
        }
    }

    async fn teardown(mut self, exit: Exit) {
        match exit {
            Exit::Logout(reply) => {
                info!(jid = %self.jid, "logging out");
                self.state.send_replace(StreamState::Closing);
                let _ = self
                    .connection
                    .send_element(&Presence::unavailable().to_element())
                    .await;
                let close = self.connection.framing().close();
                let _ = self.connection.send(close.as_bytes()).await;
                self.finish(StreamState::Disconnected, "logout").await;
                let _ = reply.send(());
            }
            Exit::Disconnect(reply) => {
                self.finish(StreamState::Disconnected, "disconnected").await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Exit::StreamClosed => {
                let close = self.connection.framing().close();
                let _ = self.connection.send(close.as_bytes()).await;
                self.finish(StreamState::Disconnected, "stream-closed").await;
            }
            Exit::AccountDeleted(replies) => {
                let close = self.connection.framing().close();
                let _ = self.connection.send(close.as_bytes()).await;
                self.finish(StreamState::Disconnected, "account-deleted").await;
                for reply in replies {
                    let _ = reply.send(Ok(()));
                }
            }
            Exit::Failed(reason) => self.finish(StreamState::Failed, &reason).await,
        }
    }

    async fn finish(&mut self, state: StreamState, reason: &str) {
        self.connection.close().await;
        let abandoned = self.dispatcher.pending_count();
        self.dispatcher.cancel_all();
        self.state.send_replace(state);
        info!(jid = %self.jid, %reason, abandoned, "session ended");
        self.events.emit(Event::SessionTerminated {
            reason: reason.to_string(),
        });
    }
}

fn has_payload(iq: &Iq, name: &str, ns: &str) -> bool {
    iq.child().is_some_and(|child| child.is(name, ns))
}

#[cfg(test)]
mod tests;
