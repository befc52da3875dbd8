/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

//! Events reported to the application, and the registry delivering them.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::Jid;
use crate::roster::RosterItem;
use crate::stanza::Presence;
use crate::stanza::PresenceType;
use crate::stanza::Show;

/// Presence state of a contact as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Available,
    Away,
    Chat,
    Dnd,
    Xa,
    Unavailable,
}

impl PresenceState {
    /// `None` for presence that is not about availability.
    pub fn of(presence: &Presence) -> Option<Self> {
        match presence.kind {
            PresenceType::Unavailable => Some(PresenceState::Unavailable),
            PresenceType::Available => Some(match presence.show() {
                None => PresenceState::Available,
                Some(Show::Away) => PresenceState::Away,
                Some(Show::Chat) => PresenceState::Chat,
                Some(Show::Dnd) => PresenceState::Dnd,
                Some(Show::Xa) => PresenceState::Xa,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    LoginSucceeded {
        jid: Jid,
    },
    LoginFailed {
        reason: String,
    },
    MessageReceived {
        from: Jid,
        body: String,
    },
    PresenceChanged {
        jid: Jid,
        state: PresenceState,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    SessionEstablished {
        jid: Jid,
    },
    SessionTerminated {
        reason: String,
    },
    RosterUpdated {
        items: Vec<RosterItem>,
    },
    SubscriptionRequested {
        from: Jid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LoginSucceeded,
    LoginFailed,
    MessageReceived,
    PresenceChanged,
    SessionEstablished,
    SessionTerminated,
    RosterUpdated,
    SubscriptionRequested,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::LoginSucceeded { .. } => EventKind::LoginSucceeded,
            Event::LoginFailed { .. } => EventKind::LoginFailed,
            Event::MessageReceived { .. } => EventKind::MessageReceived,
            Event::PresenceChanged { .. } => EventKind::PresenceChanged,
            Event::SessionEstablished { .. } => EventKind::SessionEstablished,
            Event::SessionTerminated { .. } => EventKind::SessionTerminated,
            Event::RosterUpdated { .. } => EventKind::RosterUpdated,
            Event::SubscriptionRequested { .. } => EventKind::SubscriptionRequested,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    handlers: Vec<(Option<EventKind>, EventHandler)>,
    channels: Vec<mpsc::UnboundedSender<Event>>,
}

/// Publish/subscribe registry. Handlers are called in registration order
/// on the task emitting the event.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.lock().handlers.push((Some(kind), Arc::new(handler)));
    }

    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.lock().handlers.push((None, Arc::new(handler)));
    }

    /// A channel receiving every event from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().channels.push(tx);
        rx
    }

    pub fn emit(&self, event: Event) {
        let handlers: Vec<EventHandler> = {
            let mut subscribers = self.lock();
            subscribers
                .channels
                .retain(|channel| channel.send(event.clone()).is_ok());
            subscribers
                .handlers
                .iter()
                .filter(|(kind, _)| kind.is_none_or(|kind| kind == event.kind()))
                .map(|(_, handler)| handler.clone())
                .collect()
        };
        for handler in handlers {
            handler(&event);
        }
    }
}
