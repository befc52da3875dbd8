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

use serde::Deserialize;
use serde::Serialize;

use super::Client;
use crate::negotiation::NegotiationOptions;
use crate::negotiation::TlsPolicy;
use crate::session::SessionOptions;
use crate::transport::ConnectError;
use crate::transport::Endpoint;

const DEFAULT_MAX_BUFFER: usize = 1024 * 1024;

/// Everything a [`Client`] needs besides the credentials.
///
/// Durations are written as whole seconds when serialized. Missing fields
/// take their defaults, so an empty document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Where to connect. Derived from the JID domain when unset.
    pub endpoint: Option<Endpoint>,
    pub tls: TlsPolicy,
    /// Permit PLAIN authentication over an unencrypted stream.
    pub allow_plain_without_tls: bool,
    /// Resource to request at bind time. The server picks one when unset.
    pub resource: Option<String>,
    #[serde(with = "seconds")]
    pub connect_timeout: Duration,
    #[serde(with = "seconds")]
    pub negotiation_timeout: Duration,
    #[serde(with = "seconds")]
    pub request_timeout: Duration,
    #[serde(with = "seconds")]
    pub keepalive_interval: Duration,
    pub keepalive_max_missed: u32,
    /// Upper bound for a single unparsed stanza.
    pub max_buffer_size: usize,
    pub initial_priority: Option<i8>,
    /// Trace raw stream traffic.
    pub log_traffic: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let session = SessionOptions::default();
        ClientConfig {
            endpoint: None,
            tls: TlsPolicy::default(),
            allow_plain_without_tls: false,
            resource: None,
            connect_timeout: Duration::from_secs(30),
            negotiation_timeout: Duration::from_secs(30),
            request_timeout: session.request_timeout,
            keepalive_interval: session.keepalive_interval,
            keepalive_max_missed: session.keepalive_max_missed,
            max_buffer_size: DEFAULT_MAX_BUFFER,
            initial_priority: session.initial_priority,
            log_traffic: false,
        }
    }
}

impl ClientConfig {
    pub(crate) fn endpoint_for(&self, domain: &str) -> Endpoint {
        self.endpoint
            .clone()
            .unwrap_or_else(|| Endpoint::for_domain(domain))
    }

    pub(crate) fn negotiation_options(&self) -> NegotiationOptions {
        NegotiationOptions {
            tls: self.tls,
            allow_plain_without_tls: self.allow_plain_without_tls,
            resource: self.resource.clone(),
        }
    }

    pub(crate) fn session_options(&self) -> SessionOptions {
        SessionOptions {
            request_timeout: self.request_timeout,
            keepalive_interval: self.keepalive_interval,
            keepalive_max_missed: self.keepalive_max_missed,
            initial_priority: self.initial_priority,
        }
    }
}

mod seconds {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

pub struct ClientBuilder {
    config: ClientConfig,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        ClientBuilder {
            config: ClientConfig::default(),
        }
    }

    pub fn from_config(config: ClientConfig) -> Self {
        ClientBuilder { config }
    }

    /// Overrides the endpoint derived from the JID. Accepts `host`,
    /// `host:port`, `[v6]:port` or a `ws://`/`wss://` URL; `None` keeps the
    /// default.
    pub fn server(mut self, server: Option<&str>) -> Result<Self, ConnectError> {
        self.config.endpoint = server.map(Endpoint::from_server).transpose()?;
        Ok(self)
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.config.endpoint = Some(endpoint);
        self
    }

    pub fn tls(mut self, policy: TlsPolicy) -> Self {
        self.config.tls = policy;
        self
    }

    pub fn allow_plain_without_tls(mut self, allow: bool) -> Self {
        self.config.allow_plain_without_tls = allow;
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.config.resource = Some(resource.into());
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.config.negotiation_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Ping after `interval` of silence; give up after `max_missed`
    /// silent intervals.
    pub fn keepalive(mut self, interval: Duration, max_missed: u32) -> Self {
        self.config.keepalive_interval = interval;
        self.config.keepalive_max_missed = max_missed;
        self
    }

    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.config.max_buffer_size = size;
        self
    }

    pub fn initial_priority(mut self, priority: i8) -> Self {
        self.config.initial_priority = Some(priority);
        self
    }

    pub fn log_traffic(mut self, enabled: bool) -> Self {
        self.config.log_traffic = enabled;
        self
    }

    pub fn build(self) -> Client {
        Client::new(self.config)
    }
}
