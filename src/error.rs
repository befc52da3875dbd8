/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use thiserror::Error;

use crate::jid::BadJid;
use crate::sasl::AuthError;
use crate::stanza::StanzaError;
use crate::stream::StreamError;
use crate::transport::ConnectError;
use crate::transport::SecurityNegotiationError;
use crate::transport::TransportError;

/// Why a login attempt did not produce a session.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Security(#[from] SecurityNegotiationError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Jid(#[from] BadJid),
    #[error("resource binding failed: {0}")]
    Bind(String),
    #[error("session establishment failed: {0}")]
    Session(StanzaError),
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("stream negotiation timed out")]
    Timeout,
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,
    #[error("already connected")]
    AlreadyConnected,
}

impl LoginError {
    /// Short reason for a login-failed event.
    pub fn reason(&self) -> String {
        match self {
            LoginError::Connect(_) => "connection-failed".to_string(),
            LoginError::Security(_) => "tls-failed".to_string(),
            LoginError::Auth(err) => err.reason(),
            LoginError::Stream(StreamError::Server { condition, .. }) => {
                format!("stream-error:{condition}")
            }
            LoginError::Stream(_) => "parse-error".to_string(),
            LoginError::Transport(_) => "connection-lost".to_string(),
            LoginError::Jid(_) => "invalid-jid".to_string(),
            LoginError::Bind(_) => "bind-failed".to_string(),
            LoginError::Session(_) => "session-failed".to_string(),
            LoginError::Registration(reason) => reason.clone(),
            LoginError::Timeout => "timeout".to_string(),
            LoginError::AlreadyConnecting => "already-connecting".to_string(),
            LoginError::AlreadyConnected => "already-connected".to_string(),
        }
    }
}

/// Failure of one IQ request. The session itself stays up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,
    #[error("remote error: {0}")]
    Remote(StanzaError),
    #[error("session closed")]
    SessionClosed,
}

/// An operation on a session which has already ended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
}

impl From<SessionError> for RequestError {
    fn from(_: SessionError) -> Self {
        RequestError::SessionClosed
    }
}
