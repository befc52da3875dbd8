/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use super::*;

#[test]
fn mechanism_selection() {
    let all = ["PLAIN", "SCRAM-SHA-1", "SCRAM-SHA-256"];
    assert_eq!(Mechanism::select(&all, true), Some(Mechanism::ScramSha256));
    assert_eq!(
        Mechanism::select(&["PLAIN", "SCRAM-SHA-1"], true),
        Some(Mechanism::ScramSha1)
    );
    assert_eq!(Mechanism::select(&["PLAIN"], true), Some(Mechanism::Plain));
    assert_eq!(Mechanism::select(&["PLAIN"], false), None);
    assert_eq!(Mechanism::select(&["DIGEST-MD5", "X-OAUTH2"], true), None);
    assert_eq!(Mechanism::parse("SCRAM-SHA-1"), Some(Mechanism::ScramSha1));
    assert_eq!(Mechanism::parse("scram-sha-1"), None);
}

#[test]
fn plain() {
    let mut auth = Authenticator::new(Mechanism::Plain, "juliet", "r0m30");
    assert_eq!(auth.initial_response().as_slice(), b"\0juliet\0r0m30");
    assert!(auth.respond(b"what").is_err());
    assert!(auth.finish(b"").is_ok());
}

#[test]
fn scram_sha1_exchange() {
    let mut scram = Scram::with_nonce(ScramHash::Sha1, "user", "pencil", "fyko+d2lbbFgONRv9qkxdawL");
    assert_eq!(scram.client_first(), b"n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL");
    let response = scram
        .client_final(b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096")
        .unwrap();
    assert_eq!(
        String::from_utf8(response).unwrap(),
        "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
    );
    assert!(!scram.is_verified());
    scram
        .verify_server_final(b"v=rmF9pqV8S7suAoZWja4dJRkFsKQ=")
        .unwrap();
    assert!(scram.is_verified());
}

#[test]
fn scram_sha256_exchange() {
    let mut scram = Scram::with_nonce(ScramHash::Sha256, "user", "pencil", "rOprNGfwEbeRWgbNEkqO");
    scram.client_first();
    let response = scram
        .client_final(
            b"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096",
        )
        .unwrap();
    assert_eq!(
        String::from_utf8(response).unwrap(),
        "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
    );
    scram
        .verify_server_final(b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
        .unwrap();
}

#[test]
fn scram_rejects_bad_server() {
    let mut scram = Scram::with_nonce(ScramHash::Sha1, "user", "pencil", "fyko+d2lbbFgONRv9qkxdawL");
    scram.client_first();
    assert_eq!(
        scram.client_final(b"r=someoneelse,s=QSXCR+Q6sek8bf92,i=4096"),
        Err(AuthError::InvalidChallenge("nonce does not extend ours"))
    );

    let mut scram = Scram::with_nonce(ScramHash::Sha1, "user", "pencil", "fyko+d2lbbFgONRv9qkxdawL");
    scram.client_first();
    assert!(
        scram
            .client_final(b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=0")
            .is_err()
    );

    let mut scram = Scram::with_nonce(ScramHash::Sha1, "user", "pencil", "fyko+d2lbbFgONRv9qkxdawL");
    scram.client_first();
    scram
        .client_final(b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096")
        .unwrap();
    assert_eq!(
        scram.verify_server_final(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAA="),
        Err(AuthError::ServerSignature)
    );
}

#[test]
fn scram_username_is_escaped() {
    let mut scram = Scram::with_nonce(ScramHash::Sha256, "a=b,c", "x", "abc");
    assert_eq!(scram.client_first(), b"n,,n=a=3Db=2Cc,r=abc");
}

#[test]
fn authenticator_verifies_success() {
    let mut auth = Authenticator::new(Mechanism::ScramSha1, "user", "pencil");
    assert_eq!(auth.mechanism(), Mechanism::ScramSha1);
    let first = auth.initial_response();
    assert!(first.starts_with(b"n,,n=user,r="));
    // Without a server-first message the exchange cannot complete
    assert_eq!(auth.finish(b""), Err(AuthError::ServerSignature));
}

#[test]
fn payload_encoding() {
    assert_eq!(encode_payload(b""), "=");
    assert_eq!(encode_payload(b"\0a\0b"), "AGEAYg==");
    assert_eq!(decode_payload("=").unwrap(), b"");
    assert_eq!(decode_payload(" AGEAYg== ").unwrap(), b"\0a\0b");
    assert!(decode_payload("***").is_err());
}

#[test]
fn failure_reasons() {
    let failure = AuthError::Failure {
        condition: "not-authorized".into(),
        text: None,
    };
    assert_eq!(failure.reason(), "invalid-credentials");
    assert_eq!(failure.to_string(), "authentication failed: not-authorized");
    let failure = AuthError::Failure {
        condition: "account-disabled".into(),
        text: Some("bye".into()),
    };
    assert_eq!(failure.reason(), "account-disabled");
    assert_eq!(AuthError::NoMechanism.reason(), "no-mechanism");
}
