/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

//! Byte transports carrying an XMPP stream.
//!
//! A [`Transport`] moves raw fragments. It knows nothing about XML; the
//! [`Connection`] pairs one with a [`StreamParser`] and is what the
//! negotiation and session layers drive.

mod error;
mod tcp;
pub(crate) mod tls;
#[cfg(feature = "websocket")]
mod websocket;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::debug;
use tracing::trace;

pub use error::ConnectError;
pub use error::SecurityNegotiationError;
pub use error::TransportError;
pub use tcp::StreamTransport;
pub use tcp::TcpTransport;
#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;

use crate::constants::CLIENT_NS;
use crate::constants::CLIENT_PORT;
use crate::constants::FRAMING_NS;
use crate::constants::STREAM_NS;
use crate::stream::StreamError;
use crate::stream::StreamEvent;
use crate::stream::StreamParser;
use crate::xml::Element;

/// How stream headers and closes are written on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Classic `<stream:stream>` over a byte stream.
    Stream,
    /// RFC 7395 `<open/>` and `<close/>` elements, one per frame.
    WebSocket,
}

impl Framing {
    pub fn open(&self, to: &str, from: Option<&str>) -> String {
        let from = from
            .map(|from| format!(" from='{}'", quick_xml::escape::escape(from)))
            .unwrap_or_default();
        let to = quick_xml::escape::escape(to);
        match self {
            Framing::Stream => format!(
                "<?xml version='1.0'?><stream:stream xmlns='{CLIENT_NS}' xmlns:stream='{STREAM_NS}' to='{to}'{from} version='1.0' xml:lang='en'>"
            ),
            Framing::WebSocket => {
                format!("<open xmlns='{FRAMING_NS}' to='{to}'{from} version='1.0' xml:lang='en'/>")
            }
        }
    }

    pub fn close(&self) -> String {
        match self {
            Framing::Stream => "</stream:stream>".to_string(),
            Framing::WebSocket => format!("<close xmlns='{FRAMING_NS}'/>"),
        }
    }
}

/// A bidirectional byte channel to the server.
#[async_trait]
pub trait Transport: Send {
    fn framing(&self) -> Framing;

    fn is_secure(&self) -> bool;

    fn can_start_tls(&self) -> bool {
        false
    }

    /// Waits for the next chunk of bytes. End of input is
    /// [`TransportError::Closed`].
    async fn read_fragment(&mut self) -> Result<Vec<u8>, TransportError>;

    async fn write_fragment(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    async fn start_tls(&mut self, _domain: &str) -> Result<(), SecurityNegotiationError> {
        Err(SecurityNegotiationError::Unsupported)
    }

    /// Shuts the channel down. Calling it again does nothing.
    async fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Where to reach the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    DirectTls { host: String, port: u16 },
    WebSocket { url: String },
}

impl Endpoint {
    /// Parses `host`, `host:port`, `[v6addr]:port` or a `ws://` / `wss://` URL.
    pub fn from_server(server: &str) -> Result<Endpoint, ConnectError> {
        if server.starts_with("ws://") || server.starts_with("wss://") {
            return Ok(Endpoint::WebSocket {
                url: server.to_string(),
            });
        }
        let bad = || ConnectError::InvalidServerName(server.to_string());
        let (host, port) = if let Some(rest) = server.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(bad)?;
            match after {
                "" => (host, None),
                _ => (host, Some(after.strip_prefix(':').ok_or_else(bad)?)),
            }
        } else {
            match server.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => (host, Some(port)),
                _ => (server, None),
            }
        };
        if host.is_empty() {
            return Err(bad());
        }
        let port = match port {
            Some(port) => port.parse().map_err(|_| bad())?,
            None => CLIENT_PORT,
        };
        Ok(Endpoint::Tcp {
            host: host.to_string(),
            port,
        })
    }

    /// The default endpoint for a domain.
    pub fn for_domain(domain: &str) -> Endpoint {
        Endpoint::Tcp {
            host: domain.to_string(),
            port: CLIENT_PORT,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::DirectTls { host, port } => write!(f, "tls://{host}:{port}"),
            Endpoint::WebSocket { url } => f.write_str(url),
        }
    }
}

async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ConnectError> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(source)) => Err(ConnectError::Io {
            host: host.to_string(),
            port,
            source,
        }),
        Err(_) => Err(ConnectError::Timeout(format!("{host}:{port}"))),
    }
}

/// Opens a transport to `endpoint`. `domain` is the XMPP domain used to
/// verify certificates.
pub async fn open(
    endpoint: &Endpoint,
    domain: &str,
    timeout: Duration,
) -> Result<Box<dyn Transport>, ConnectError> {
    debug!(%endpoint, "connecting");
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = connect_tcp(host, *port, timeout).await?;
            Ok(Box::new(StreamTransport::plain(stream)))
        }
        Endpoint::DirectTls { host, port } => {
            let stream = connect_tcp(host, *port, timeout).await?;
            let transport = StreamTransport::direct_tls(stream, domain)
                .await
                .map_err(|err| match err {
                    SecurityNegotiationError::Handshake(source) => ConnectError::Tls {
                        host: host.clone(),
                        source,
                    },
                    SecurityNegotiationError::Config(err) => ConnectError::TlsConfig(err),
                    _ => ConnectError::InvalidServerName(domain.to_string()),
                })?;
            Ok(Box::new(transport))
        }
        #[cfg(feature = "websocket")]
        Endpoint::WebSocket { url } => {
            let transport = WebSocketTransport::connect(url, timeout).await?;
            Ok(Box::new(transport))
        }
        #[cfg(not(feature = "websocket"))]
        Endpoint::WebSocket { .. } => Err(ConnectError::WebSocketUnsupported),
    }
}

/// A transport paired with the parser for the bytes it delivers.
pub struct Connection {
    transport: Box<dyn Transport>,
    parser: StreamParser,
    log_traffic: bool,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, buffer_limit: usize, log_traffic: bool) -> Connection {
        Connection {
            transport,
            parser: StreamParser::with_limit(buffer_limit),
            log_traffic,
        }
    }

    pub fn framing(&self) -> Framing {
        self.transport.framing()
    }

    pub fn is_secure(&self) -> bool {
        self.transport.is_secure()
    }

    pub fn can_start_tls(&self) -> bool {
        self.transport.can_start_tls()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.log_traffic {
            trace!(target: "iksclient::traffic", "SEND {}", String::from_utf8_lossy(bytes));
        }
        self.transport.write_fragment(bytes).await
    }

    pub async fn send_element(&mut self, element: &Element) -> Result<(), TransportError> {
        self.send(element.to_string().as_bytes()).await
    }

    /// Reads one fragment into the parser. Returns the number of bytes read.
    pub async fn receive(&mut self) -> Result<usize, TransportError> {
        let bytes = self.transport.read_fragment().await?;
        if self.log_traffic {
            trace!(target: "iksclient::traffic", "RECV {}", String::from_utf8_lossy(&bytes));
        }
        self.parser.feed(&bytes);
        Ok(bytes.len())
    }

    /// Next complete event from the bytes received so far.
    pub fn next_event(&mut self) -> Option<Result<StreamEvent, StreamError>> {
        self.parser.next_event()
    }

    /// Forgets the current stream but keeps unread bytes.
    pub fn restart_stream(&mut self) {
        self.parser.restart();
    }

    pub async fn start_tls(&mut self, domain: &str) -> Result<(), SecurityNegotiationError> {
        self.parser.reset();
        self.transport.start_tls(domain).await
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}
