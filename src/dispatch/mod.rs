/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

//! Routing of incoming stanzas to application handlers and waiting requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::Element;
use crate::Jid;
use crate::error::RequestError;
use crate::stanza::Iq;
use crate::stanza::IqType;
use crate::stanza::Message;
use crate::stanza::Presence;
use crate::stanza::Stanza;
use crate::stanza::StanzaError;

pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;
pub type PresenceHandler = Arc<dyn Fn(&Presence) + Send + Sync>;
/// Answers an IQ request: `Ok` becomes a result reply carrying the element,
/// `Err` an error reply.
pub type IqHandler = Arc<dyn Fn(&Iq) -> Result<Option<Element>, StanzaError> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    message: Vec<MessageHandler>,
    presence: Vec<PresenceHandler>,
    iq: HashMap<(String, String), IqHandler>,
}

/// Application handlers, shared between a client and its sessions.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<Mutex<Handlers>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Handlers) -> T) -> T {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut handlers)
    }

    /// Message handlers run in registration order.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.with(|handlers| handlers.message.push(Arc::new(handler)));
    }

    pub fn on_presence<F>(&self, handler: F)
    where
        F: Fn(&Presence) + Send + Sync + 'static,
    {
        self.with(|handlers| handlers.presence.push(Arc::new(handler)));
    }

    /// Handles get and set requests whose payload is `<name xmlns=ns>`.
    /// Replaces an earlier handler for the same payload.
    pub fn handle_iq<F>(&self, name: &str, ns: &str, handler: F)
    where
        F: Fn(&Iq) -> Result<Option<Element>, StanzaError> + Send + Sync + 'static,
    {
        self.with(|handlers| {
            handlers
                .iq
                .insert((name.to_string(), ns.to_string()), Arc::new(handler))
        });
    }

    fn message_handlers(&self) -> Vec<MessageHandler> {
        self.with(|handlers| handlers.message.clone())
    }

    fn presence_handlers(&self) -> Vec<PresenceHandler> {
        self.with(|handlers| handlers.presence.clone())
    }

    fn iq_handler(&self, name: &str, ns: &str) -> Option<IqHandler> {
        self.with(|handlers| handlers.iq.get(&(name.to_string(), ns.to_string())).cloned())
    }
}

/// Requests the session makes on its own behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalRequest {
    RosterGet,
    Ping,
    DeleteAccount,
}

pub enum Responder {
    Caller(oneshot::Sender<Result<Iq, RequestError>>),
    Internal(InternalRequest),
}

pub struct PendingRequest {
    /// Where the request was sent, `None` for the account's own server.
    to: Option<Jid>,
    responder: Responder,
    deadline: Instant,
}

/// What the session has to do after a stanza was dispatched.
#[derive(Debug)]
pub enum Dispatched {
    Handled,
    /// Send this answer back.
    Reply(Iq),
    /// A response to one of the session's own requests.
    Internal(InternalRequest, Result<Iq, RequestError>),
    Dropped,
}

pub struct Dispatcher {
    account: Jid,
    registry: HandlerRegistry,
    pending: HashMap<String, PendingRequest>,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry, account: Jid) -> Self {
        Dispatcher {
            account,
            registry,
            pending: HashMap::new(),
        }
    }

    pub fn register_pending(
        &mut self,
        id: impl Into<String>,
        to: Option<Jid>,
        responder: Responder,
        deadline: Instant,
    ) {
        let id = id.into();
        let pending = PendingRequest {
            to,
            responder,
            deadline,
        };
        if let Some(old) = self.pending.insert(id.clone(), pending) {
            warn!(%id, "replacing a pending request with the same id");
            resolve(old.responder, Err(RequestError::Timeout));
        }
    }

    #[cfg(test)]
    pub fn has_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|pending| pending.deadline).min()
    }

    /// Fails every request whose deadline has passed. Returns the internal
    /// ones, callers are told directly.
    pub fn expire(&mut self, now: Instant) -> Vec<InternalRequest> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let mut internal = Vec::new();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                debug!(%id, "request timed out");
                match pending.responder {
                    Responder::Internal(kind) => internal.push(kind),
                    responder => resolve(responder, Err(RequestError::Timeout)),
                }
            }
        }
        internal
    }

    /// Fails everything still waiting, as the connection is gone.
    pub fn cancel_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            resolve(pending.responder, Err(RequestError::Timeout));
        }
    }

    pub fn dispatch(&mut self, stanza: Stanza) -> Dispatched {
        match stanza {
            Stanza::Message(message) => {
                for handler in self.registry.message_handlers() {
                    handler(&message);
                }
                Dispatched::Handled
            }
            Stanza::Presence(presence) => {
                for handler in self.registry.presence_handlers() {
                    handler(&presence);
                }
                Dispatched::Handled
            }
            Stanza::Iq(iq) if iq.kind.is_request() => self.request(iq),
            Stanza::Iq(iq) => self.response(iq),
        }
    }

    fn request(&self, iq: Iq) -> Dispatched {
        let handler = iq
            .child()
            .and_then(|child| self.registry.iq_handler(child.name(), child.ns().unwrap_or_default()));
        let Some(handler) = handler else {
            debug!(id = %iq.id, "no handler for request");
            return Dispatched::Reply(Iq::error(&iq, &StanzaError::service_unavailable()));
        };
        match handler(&iq) {
            Ok(child) => Dispatched::Reply(Iq::result(&iq, child)),
            Err(err) => Dispatched::Reply(Iq::error(&iq, &err)),
        }
    }

    /// The account itself, or its server answering on its behalf.
    fn is_own(&self, jid: &Jid) -> bool {
        jid.same_bare(&self.account) || jid.full() == self.account.domainpart()
    }

    /// Whether a response with this sender may answer a request sent to `to`.
    fn answers(&self, to: Option<&Jid>, from: Option<&Jid>) -> bool {
        match (to, from) {
            (Some(to), Some(from)) if to == from => true,
            (Some(to), _) if !self.is_own(to) => false,
            (_, None) => true,
            (_, Some(from)) => self.is_own(from),
        }
    }

    fn response(&mut self, iq: Iq) -> Dispatched {
        let Some(pending) = self.pending.get(&iq.id) else {
            warn!(id = %iq.id, "dropping response to an unknown request");
            return Dispatched::Dropped;
        };
        if !self.answers(pending.to.as_ref(), iq.from.as_ref()) {
            warn!(
                id = %iq.id,
                from = iq.from.as_ref().map(Jid::full).unwrap_or_default(),
                "dropping response from an unexpected sender"
            );
            return Dispatched::Dropped;
        }
        let Some(pending) = self.pending.remove(&iq.id) else {
            return Dispatched::Dropped;
        };
        let result = match iq.kind {
            IqType::Error => Err(RequestError::Remote(
                iq.stanza_error().unwrap_or_else(StanzaError::bad_request),
            )),
            _ => Ok(iq),
        };
        match pending.responder {
            Responder::Internal(kind) => Dispatched::Internal(kind, result),
            responder => {
                resolve(responder, result);
                Dispatched::Handled
            }
        }
    }
}

fn resolve(responder: Responder, result: Result<Iq, RequestError>) {
    if let Responder::Caller(sender) = responder {
        // The caller may have stopped waiting
        let _ = sender.send(result);
    }
}
