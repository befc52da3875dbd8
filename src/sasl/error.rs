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

/// Failure of a login attempt during SASL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no usable authentication mechanism offered")]
    NoMechanism,
    #[error("authentication failed: {condition}")]
    Failure {
        condition: String,
        text: Option<String>,
    },
    #[error("invalid server challenge: {0}")]
    InvalidChallenge(&'static str),
    #[error("server signature mismatch")]
    ServerSignature,
    #[error("JabberID has no localpart to authenticate with")]
    MissingLocalpart,
}

impl AuthError {
    /// Short reason for a login-failed event.
    pub fn reason(&self) -> String {
        match self {
            AuthError::Failure { condition, .. } if condition == "not-authorized" => {
                "invalid-credentials".to_string()
            }
            AuthError::Failure { condition, .. } => condition.clone(),
            AuthError::NoMechanism => "no-mechanism".to_string(),
            AuthError::InvalidChallenge(_) | AuthError::ServerSignature => {
                "server-authentication-failed".to_string()
            }
            AuthError::MissingLocalpart => "invalid-jid".to_string(),
        }
    }
}

pub(super) mod description {
    pub const NOT_UTF8: &str = "not UTF-8";
    pub const SERVER_ERROR: &str = "server reported an error";
    pub const NONCE_MISMATCH: &str = "nonce does not extend ours";
    pub const BAD_SALT: &str = "bad salt";
    pub const BAD_ITERATIONS: &str = "bad iteration count";
    pub const MISSING_ATTRIBUTE: &str = "missing attribute";
    pub const UNEXPECTED: &str = "unexpected challenge";
    pub const BAD_BASE64: &str = "bad base64";
}
