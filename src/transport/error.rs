/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::io;

use thiserror::Error;

/// Failure to open a connection to the server.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("cannot connect to {host}:{port}: {source}")]
    Io {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("connecting to {0} timed out")]
    Timeout(String),
    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid server name '{0}'")]
    InvalidServerName(String),
    #[error("cannot set up TLS: {0}")]
    TlsConfig(#[from] rustls::Error),
    #[error("websocket connection failed: {0}")]
    WebSocket(String),
    #[error("websocket transport is not available in this build")]
    WebSocketUnsupported,
}

/// Failure on an open connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("connection closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// Failure to secure the stream with TLS.
#[derive(Debug, Error)]
pub enum SecurityNegotiationError {
    #[error("TLS is required but the server does not offer STARTTLS")]
    NotOffered,
    #[error("server requires STARTTLS but TLS is disabled")]
    RequiredByServer,
    #[error("server refused STARTTLS")]
    Refused,
    #[error("transport cannot be upgraded to TLS")]
    Unsupported,
    #[error("invalid server name '{0}'")]
    InvalidServerName(String),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),
    #[error("cannot set up TLS: {0}")]
    Config(#[from] rustls::Error),
}
