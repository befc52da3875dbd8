/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

mod error;

use std::fmt::Debug;
use std::fmt::Display;
use std::hash::Hash;
use std::hash::Hasher;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

pub use error::BadJid;
use error::description;

const MAX_PART_LEN: usize = 1023;

fn check_part(
    part: &str,
    empty: &'static str,
    too_long: &'static str,
) -> Result<(), BadJid> {
    if part.is_empty() {
        return Err(BadJid(empty));
    }
    if part.len() > MAX_PART_LEN {
        return Err(BadJid(too_long));
    }
    Ok(())
}

/// The address of an entity in the XMPP protocol.
///
/// Each JID has three parts:
/// - Local part: Optionally identifies a local entity on the domain.
/// - Domain part: Identifies an XMPP server.
/// - Resource part: Optionally identifies a connected client of the entity.
///
/// Domain parts are compared case-insensitively, so they are stored in
/// lowercase. More details can be found in
/// [RFC7622](https://datatracker.ietf.org/doc/rfc7622/)
#[derive(Clone, Eq)]
pub struct Jid {
    full: String,
    domain_start: usize,
    resource_start: Option<usize>,
}

impl Jid {
    /// Create a JID from a string.
    pub fn new(jid: &str) -> Result<Self, BadJid> {
        let (bare, resource) = match jid.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource)),
            None => (jid, None),
        };
        let (local, domain) = match bare.split_once('@') {
            Some((local, domain)) => (Some(local), domain),
            None => (None, bare),
        };
        // Final dot is not significant as per RFC 7622 section 3.2
        let domain = domain.strip_suffix('.').unwrap_or(domain);
        check_part(domain, description::DOMAIN_EMPTY, description::DOMAIN_TOO_LONG)?;
        if let Some(local) = local {
            check_part(local, description::LOCAL_EMPTY, description::LOCAL_TOO_LONG)?;
        }
        if let Some(resource) = resource {
            check_part(
                resource,
                description::RESOURCE_EMPTY,
                description::RESOURCE_TOO_LONG,
            )?;
        }

        let mut full = String::with_capacity(jid.len());
        if let Some(local) = local {
            full.push_str(local);
            full.push('@');
        }
        let domain_start = full.len();
        full.push_str(&domain.to_ascii_lowercase());
        let resource_start = resource.map(|resource| {
            full.push('/');
            let start = full.len();
            full.push_str(resource);
            start
        });

        Ok(Jid {
            full,
            domain_start,
            resource_start,
        })
    }

    /// Full form of the JID with all the components.
    pub fn full(&self) -> &str {
        &self.full
    }

    /// Bare form of the JID without the resource part.
    pub fn bare(&self) -> &str {
        match self.resource_start {
            Some(start) => &self.full[..start - 1],
            None => &self.full,
        }
    }

    /// Only the local part of the JID.
    pub fn localpart(&self) -> Option<&str> {
        match self.domain_start {
            0 => None,
            start => Some(&self.full[..start - 1]),
        }
    }

    /// Only the domain part of the JID.
    pub fn domainpart(&self) -> &str {
        &self.bare()[self.domain_start..]
    }

    /// Only the resource part of the JID.
    pub fn resourcepart(&self) -> Option<&str> {
        self.resource_start.map(|start| &self.full[start..])
    }

    /// True if the JID does not contain a resource part.
    pub fn is_bare(&self) -> bool {
        self.resource_start.is_none()
    }

    /// The JID with the resource part removed.
    pub fn to_bare(&self) -> Jid {
        Jid {
            full: self.bare().to_string(),
            domain_start: self.domain_start,
            resource_start: None,
        }
    }

    /// True if both JIDs address the same account or service.
    pub fn same_bare(&self, other: &Jid) -> bool {
        self.bare() == other.bare()
    }

    /// Creates another JID by overriding the resource part.
    pub fn with_resource(&self, resource: &str) -> Result<Jid, BadJid> {
        check_part(
            resource,
            description::RESOURCE_EMPTY,
            description::RESOURCE_TOO_LONG,
        )?;
        let bare = self.bare();
        let mut full = String::with_capacity(bare.len() + 1 + resource.len());
        full.push_str(bare);
        full.push('/');
        let resource_start = full.len();
        full.push_str(resource);
        Ok(Jid {
            full,
            domain_start: self.domain_start,
            resource_start: Some(resource_start),
        })
    }

    /// Checks that the JID names an account, which is what a login needs.
    pub fn require_localpart(&self) -> Result<&str, BadJid> {
        self.localpart().ok_or(BadJid(description::LOCAL_MISSING))
    }
}

impl FromStr for Jid {
    type Err = BadJid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Jid::new(s)
    }
}

impl TryFrom<String> for Jid {
    type Error = BadJid;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Jid::new(&value)
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full)
    }
}

impl Debug for Jid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Jid({})", self.full)
    }
}

impl PartialEq for Jid {
    fn eq(&self, other: &Jid) -> bool {
        self.full == other.full
    }
}

impl PartialOrd for Jid {
    fn partial_cmp(&self, other: &Jid) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Jid {
    fn cmp(&self, other: &Jid) -> std::cmp::Ordering {
        self.full.cmp(&other.full)
    }
}

impl Hash for Jid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.full.hash(state)
    }
}

impl Serialize for Jid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.full)
    }
}

impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Jid::new(&text).map_err(serde::de::Error::custom)
    }
}
