/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

//! SASL mechanisms for client authentication.

mod error;
mod scram;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use zeroize::Zeroizing;

pub use error::AuthError;
pub use scram::Scram;
pub use scram::ScramHash;

use error::description;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    ScramSha256,
    ScramSha1,
    Plain,
}

impl Mechanism {
    /// Strongest first.
    pub const PREFERENCE: [Mechanism; 3] =
        [Mechanism::ScramSha256, Mechanism::ScramSha1, Mechanism::Plain];

    pub fn name(self) -> &'static str {
        match self {
            Mechanism::ScramSha256 => "SCRAM-SHA-256",
            Mechanism::ScramSha1 => "SCRAM-SHA-1",
            Mechanism::Plain => "PLAIN",
        }
    }

    pub fn parse(name: &str) -> Option<Mechanism> {
        Mechanism::PREFERENCE
            .into_iter()
            .find(|mechanism| mechanism.name() == name)
    }

    /// Picks the strongest offered mechanism. PLAIN is only considered when
    /// `plain_allowed` is set, since it sends the password as is.
    pub fn select<S: AsRef<str>>(offered: &[S], plain_allowed: bool) -> Option<Mechanism> {
        Mechanism::PREFERENCE.into_iter().find(|mechanism| {
            (plain_allowed || *mechanism != Mechanism::Plain)
                && offered.iter().any(|name| name.as_ref() == mechanism.name())
        })
    }
}

enum Inner {
    Plain {
        username: String,
        password: Zeroizing<String>,
    },
    Scram(Scram),
}

/// Client side of one SASL exchange.
pub struct Authenticator {
    mechanism: Mechanism,
    inner: Inner,
}

impl Authenticator {
    pub fn new(mechanism: Mechanism, username: &str, password: &str) -> Authenticator {
        let inner = match mechanism {
            Mechanism::Plain => Inner::Plain {
                username: username.to_string(),
                password: Zeroizing::new(password.to_string()),
            },
            Mechanism::ScramSha1 => Inner::Scram(Scram::new(ScramHash::Sha1, username, password)),
            Mechanism::ScramSha256 => {
                Inner::Scram(Scram::new(ScramHash::Sha256, username, password))
            }
        };
        Authenticator { mechanism, inner }
    }

    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    pub fn initial_response(&mut self) -> Zeroizing<Vec<u8>> {
        match &mut self.inner {
            Inner::Plain { username, password } => {
                let mut response = Vec::with_capacity(username.len() + password.len() + 2);
                response.push(0);
                response.extend_from_slice(username.as_bytes());
                response.push(0);
                response.extend_from_slice(password.as_bytes());
                Zeroizing::new(response)
            }
            Inner::Scram(scram) => Zeroizing::new(scram.client_first()),
        }
    }

    /// Answers a server challenge.
    pub fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        match &mut self.inner {
            Inner::Plain { .. } => Err(AuthError::InvalidChallenge(description::UNEXPECTED)),
            Inner::Scram(scram) if scram.is_verified() => {
                Err(AuthError::InvalidChallenge(description::UNEXPECTED))
            }
            Inner::Scram(scram) => match scram.client_final(challenge) {
                Ok(response) => Ok(response),
                // Some servers send the verifier as a last challenge
                Err(AuthError::InvalidChallenge(description::UNEXPECTED)) => {
                    scram.verify_server_final(challenge)?;
                    Ok(Vec::new())
                }
                Err(err) => Err(err),
            },
        }
    }

    /// Checks the additional data of the server's success.
    pub fn finish(&mut self, additional: &[u8]) -> Result<(), AuthError> {
        match &mut self.inner {
            Inner::Plain { .. } => Ok(()),
            Inner::Scram(scram) if additional.is_empty() => {
                if scram.is_verified() {
                    Ok(())
                } else {
                    Err(AuthError::ServerSignature)
                }
            }
            Inner::Scram(scram) if scram.is_verified() => Ok(()),
            Inner::Scram(scram) => scram.verify_server_final(additional),
        }
    }
}

/// Element text for SASL data, `=` standing for an empty payload.
pub fn encode_payload(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_string()
    } else {
        STANDARD.encode(data)
    }
}

pub fn decode_payload(text: &str) -> Result<Vec<u8>, AuthError> {
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    STANDARD
        .decode(text)
        .map_err(|_| AuthError::InvalidChallenge(description::BAD_BASE64))
}

#[cfg(test)]
mod tests;
