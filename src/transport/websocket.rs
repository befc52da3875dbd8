/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::time::Duration;

use async_trait::async_trait;
use futures_util::SinkExt;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::Connector;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::connect_async_tls_with_config;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::debug;

use super::ConnectError;
use super::Framing;
use super::Transport;
use super::TransportError;
use super::tls;

const XMPP_SUBPROTOCOL: &str = "xmpp";

/// XMPP over WebSocket (RFC 7395). Each frame holds one top level element.
pub struct WebSocketTransport {
    stream: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    secure: bool,
}

impl WebSocketTransport {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, ConnectError> {
        let mut request = url
            .into_client_request()
            .map_err(|err| ConnectError::WebSocket(err.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(XMPP_SUBPROTOCOL),
        );
        let connector = Connector::Rustls(tls::client_config()?);
        let connecting = connect_async_tls_with_config(request, None, false, Some(connector));
        let (stream, response) = match tokio::time::timeout(timeout, connecting).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(err)) => return Err(ConnectError::WebSocket(err.to_string())),
            Err(_) => return Err(ConnectError::Timeout(url.to_string())),
        };
        debug!(url, status = %response.status(), "websocket connected");
        Ok(WebSocketTransport {
            stream: Some(stream),
            secure: url.starts_with("wss://"),
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn framing(&self) -> Framing {
        Framing::WebSocket
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    async fn read_fragment(&mut self) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(Message::Binary(data))) => return Ok(data),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Err(err)) => return Err(TransportError::WebSocket(err.to_string())),
            }
        }
    }

    async fn write_fragment(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let text = String::from_utf8_lossy(bytes).into_owned();
        stream
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::WebSocket(err.to_string()))
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}
