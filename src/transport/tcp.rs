/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use super::Framing;
use super::SecurityNegotiationError;
use super::Transport;
use super::TransportError;
use super::tls;

const READ_CHUNK: usize = 4096;

enum Inner<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
    Closed,
}

/// XMPP over a byte stream, optionally upgraded to TLS in place.
pub struct StreamTransport<S> {
    inner: Inner<S>,
    buffer: Box<[u8]>,
}

pub type TcpTransport = StreamTransport<TcpStream>;

async fn handshake<S>(stream: S, domain: &str) -> Result<TlsStream<S>, SecurityNegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = tls::client_config()?;
    let name = tls::server_name(domain)
        .ok_or_else(|| SecurityNegotiationError::InvalidServerName(domain.to_string()))?;
    let connector = TlsConnector::from(config);
    let stream = connector
        .connect(name, stream)
        .await
        .map_err(SecurityNegotiationError::Handshake)?;
    debug!(domain, "TLS established");
    Ok(stream)
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn plain(stream: S) -> Self {
        StreamTransport {
            inner: Inner::Plain(stream),
            buffer: vec![0; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Wraps the stream in TLS before any XMPP traffic.
    pub async fn direct_tls(stream: S, domain: &str) -> Result<Self, SecurityNegotiationError> {
        let stream = handshake(stream, domain).await?;
        Ok(StreamTransport {
            inner: Inner::Tls(Box::new(stream)),
            buffer: vec![0; READ_CHUNK].into_boxed_slice(),
        })
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn framing(&self) -> Framing {
        Framing::Stream
    }

    fn is_secure(&self) -> bool {
        matches!(self.inner, Inner::Tls(_))
    }

    fn can_start_tls(&self) -> bool {
        matches!(self.inner, Inner::Plain(_))
    }

    async fn read_fragment(&mut self) -> Result<Vec<u8>, TransportError> {
        let count = match &mut self.inner {
            Inner::Plain(stream) => stream.read(&mut self.buffer).await,
            Inner::Tls(stream) => stream.read(&mut self.buffer).await,
            Inner::Closed => return Err(TransportError::Closed),
        }
        .map_err(TransportError::Read)?;
        if count == 0 {
            return Err(TransportError::Closed);
        }
        Ok(self.buffer[..count].to_vec())
    }

    async fn write_fragment(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        match &mut self.inner {
            Inner::Plain(stream) => {
                stream.write_all(bytes).await.map_err(TransportError::Write)?;
                stream.flush().await.map_err(TransportError::Write)
            }
            Inner::Tls(stream) => {
                stream.write_all(bytes).await.map_err(TransportError::Write)?;
                stream.flush().await.map_err(TransportError::Write)
            }
            Inner::Closed => Err(TransportError::Closed),
        }
    }

    async fn start_tls(&mut self, domain: &str) -> Result<(), SecurityNegotiationError> {
        let stream = match std::mem::replace(&mut self.inner, Inner::Closed) {
            Inner::Plain(stream) => stream,
            other => {
                self.inner = other;
                return Err(SecurityNegotiationError::Unsupported);
            }
        };
        // A failed handshake leaves the transport closed
        let stream = handshake(stream, domain).await?;
        self.inner = Inner::Tls(Box::new(stream));
        Ok(())
    }

    async fn close(&mut self) {
        match std::mem::replace(&mut self.inner, Inner::Closed) {
            Inner::Plain(mut stream) => {
                let _ = stream.shutdown().await;
            }
            Inner::Tls(mut stream) => {
                let _ = stream.shutdown().await;
            }
            Inner::Closed => {}
        }
    }

    fn is_closed(&self) -> bool {
        matches!(self.inner, Inner::Closed)
    }
}
