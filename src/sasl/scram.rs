/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

//! Salted Challenge Response Authentication Mechanism (RFC 5802, RFC 7677).

use std::num::NonZeroU32;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use rand::distributions::Alphanumeric;
use ring::digest;
use ring::hmac;
use ring::pbkdf2;
use zeroize::Zeroizing;

use super::AuthError;
use super::error::description;

const NONCE_LENGTH: usize = 24;
// "n,," base64 encoded, no channel binding
const GS2_HEADER: &str = "biws";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramHash {
    Sha1,
    Sha256,
}

impl ScramHash {
    fn pbkdf2(self) -> pbkdf2::Algorithm {
        match self {
            ScramHash::Sha1 => pbkdf2::PBKDF2_HMAC_SHA1,
            ScramHash::Sha256 => pbkdf2::PBKDF2_HMAC_SHA256,
        }
    }

    fn hmac(self) -> hmac::Algorithm {
        match self {
            ScramHash::Sha1 => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            ScramHash::Sha256 => hmac::HMAC_SHA256,
        }
    }

    fn digest(self) -> &'static digest::Algorithm {
        match self {
            ScramHash::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            ScramHash::Sha256 => &digest::SHA256,
        }
    }
}

enum State {
    Initial,
    ClientFirstSent,
    ClientFinalSent {
        server_key: hmac::Key,
        auth_message: String,
    },
    Verified,
}

pub struct Scram {
    hash: ScramHash,
    username: String,
    password: Zeroizing<String>,
    nonce: String,
    state: State,
}

fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

fn attribute<'a>(message: &'a str, name: char) -> Option<&'a str> {
    message.split(',').find_map(|part| {
        let mut chars = part.chars();
        match (chars.next(), chars.next()) {
            (Some(c), Some('=')) if c == name => Some(&part[2..]),
            _ => None,
        }
    })
}

impl Scram {
    pub fn new(hash: ScramHash, username: &str, password: &str) -> Scram {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LENGTH)
            .map(char::from)
            .collect();
        Scram::with_nonce(hash, username, password, &nonce)
    }

    pub(crate) fn with_nonce(hash: ScramHash, username: &str, password: &str, nonce: &str) -> Scram {
        Scram {
            hash,
            username: escape_username(username),
            password: Zeroizing::new(password.to_string()),
            nonce: nonce.to_string(),
            state: State::Initial,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.username, self.nonce)
    }

    pub fn client_first(&mut self) -> Vec<u8> {
        self.state = State::ClientFirstSent;
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>, AuthError> {
        if !matches!(self.state, State::ClientFirstSent) {
            return Err(AuthError::InvalidChallenge(description::UNEXPECTED));
        }
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| AuthError::InvalidChallenge(description::NOT_UTF8))?;
        if attribute(server_first, 'e').is_some() {
            return Err(AuthError::InvalidChallenge(description::SERVER_ERROR));
        }
        let missing = || AuthError::InvalidChallenge(description::MISSING_ATTRIBUTE);
        let nonce = attribute(server_first, 'r').ok_or_else(missing)?;
        let salt = attribute(server_first, 's').ok_or_else(missing)?;
        let iterations = attribute(server_first, 'i').ok_or_else(missing)?;
        if !nonce.starts_with(&self.nonce) || nonce.len() == self.nonce.len() {
            return Err(AuthError::InvalidChallenge(description::NONCE_MISMATCH));
        }
        let salt = STANDARD
            .decode(salt)
            .map_err(|_| AuthError::InvalidChallenge(description::BAD_SALT))?;
        let iterations: NonZeroU32 = iterations
            .parse()
            .map_err(|_| AuthError::InvalidChallenge(description::BAD_ITERATIONS))?;

        let length = self.hash.digest().output_len();
        let mut salted = Zeroizing::new(vec![0u8; length]);
        pbkdf2::derive(
            self.hash.pbkdf2(),
            iterations,
            &salt,
            self.password.as_bytes(),
            &mut salted,
        );
        let salted_key = hmac::Key::new(self.hash.hmac(), &salted);
        let client_key = hmac::sign(&salted_key, b"Client Key");
        let stored_key = digest::digest(self.hash.digest(), client_key.as_ref());

        let without_proof = format!("c={GS2_HEADER},r={nonce}");
        let auth_message = format!("{},{server_first},{without_proof}", self.client_first_bare());
        let client_signature = hmac::sign(
            &hmac::Key::new(self.hash.hmac(), stored_key.as_ref()),
            auth_message.as_bytes(),
        );
        let proof: Vec<u8> = client_key
            .as_ref()
            .iter()
            .zip(client_signature.as_ref())
            .map(|(key, signature)| key ^ signature)
            .collect();

        let server_key = hmac::sign(&salted_key, b"Server Key");
        self.state = State::ClientFinalSent {
            server_key: hmac::Key::new(self.hash.hmac(), server_key.as_ref()),
            auth_message,
        };
        Ok(format!("{without_proof},p={}", STANDARD.encode(proof)).into_bytes())
    }

    pub fn verify_server_final(&mut self, server_final: &[u8]) -> Result<(), AuthError> {
        let State::ClientFinalSent {
            server_key,
            auth_message,
        } = &self.state
        else {
            return Err(AuthError::InvalidChallenge(description::UNEXPECTED));
        };
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| AuthError::InvalidChallenge(description::NOT_UTF8))?;
        if attribute(server_final, 'e').is_some() {
            return Err(AuthError::InvalidChallenge(description::SERVER_ERROR));
        }
        let signature = attribute(server_final, 'v')
            .ok_or(AuthError::InvalidChallenge(description::MISSING_ATTRIBUTE))?;
        let signature = STANDARD
            .decode(signature)
            .map_err(|_| AuthError::InvalidChallenge(description::BAD_BASE64))?;
        hmac::verify(server_key, auth_message.as_bytes(), &signature)
            .map_err(|_| AuthError::ServerSignature)?;
        self.state = State::Verified;
        Ok(())
    }

    pub fn is_verified(&self) -> bool {
        matches!(self.state, State::Verified)
    }
}
