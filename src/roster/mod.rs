/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::Element;
use crate::Jid;
use crate::constants::ROSTER_NS;

/// Presence subscription between the user and a contact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
    Remove,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Subscription::None),
            "to" => Some(Subscription::To),
            "from" => Some(Subscription::From),
            "both" => Some(Subscription::Both),
            "remove" => Some(Subscription::Remove),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterItem {
    pub jid: Jid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub subscription: Subscription,
    /// A subscription request to the contact is waiting for approval.
    #[serde(default)]
    pub pending_out: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

impl RosterItem {
    pub fn new(jid: Jid) -> Self {
        RosterItem {
            jid,
            name: None,
            subscription: Subscription::None,
            pending_out: false,
            groups: Vec::new(),
        }
    }

    fn from_element(item: &Element) -> Option<Self> {
        let jid = match item.attr("jid").map(Jid::new) {
            Some(Ok(jid)) => jid.to_bare(),
            Some(Err(err)) => {
                warn!(%err, "ignoring roster item");
                return None;
            }
            None => return None,
        };
        let subscription = item
            .attr("subscription")
            .and_then(Subscription::parse)
            .unwrap_or_default();
        Some(RosterItem {
            jid,
            name: item.attr("name").map(str::to_string),
            subscription,
            pending_out: item.attr("ask") == Some("subscribe"),
            groups: item
                .children()
                .filter(|child| child.is("group", ROSTER_NS))
                .map(|group| group.text())
                .collect(),
        })
    }

    /// The `<item/>` sent to add or update this contact.
    pub fn to_element(&self) -> Element {
        let mut item = Element::with_ns("item", ROSTER_NS)
            .with_attr("jid", self.jid.bare())
            .with_opt_attr("name", self.name.as_deref());
        if self.subscription == Subscription::Remove {
            item.set_attr("subscription", "remove");
        }
        for group in &self.groups {
            item.push_child(Element::new("group").with_text(group.as_str()));
        }
        item
    }
}

/// The user's contact list as last reported by the server.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    items: BTreeMap<Jid, RosterItem>,
    version: Option<String>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `<query/>` payload requesting the whole roster.
    pub fn query() -> Element {
        Element::with_ns("query", ROSTER_NS)
    }

    /// The `<query/>` payload adding or updating one contact.
    pub fn set_query(item: &RosterItem) -> Element {
        Roster::query().with_child(item.to_element())
    }

    pub fn remove_query(jid: &Jid) -> Element {
        let mut item = RosterItem::new(jid.to_bare());
        item.subscription = Subscription::Remove;
        Roster::set_query(&item)
    }

    pub fn get(&self, jid: &Jid) -> Option<&RosterItem> {
        self.items.get(&jid.to_bare())
    }

    pub fn items(&self) -> impl Iterator<Item = &RosterItem> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Replaces the cache with a full roster result.
    pub fn replace(&mut self, query: &Element) {
        self.items.clear();
        self.version = query.attr("ver").map(str::to_string);
        for item in query.children().filter(|child| child.is("item", ROSTER_NS)) {
            if let Some(item) = RosterItem::from_element(item) {
                if item.subscription != Subscription::Remove {
                    self.items.insert(item.jid.clone(), item);
                }
            }
        }
        debug!(count = self.items.len(), "roster received");
    }

    /// Applies a roster push and returns the items it carried.
    pub fn apply_push(&mut self, query: &Element) -> Vec<RosterItem> {
        if let Some(version) = query.attr("ver") {
            self.version = Some(version.to_string());
        }
        let mut changed = Vec::new();
        for item in query.children().filter(|child| child.is("item", ROSTER_NS)) {
            let Some(item) = RosterItem::from_element(item) else {
                continue;
            };
            if item.subscription == Subscription::Remove {
                self.items.remove(&item.jid);
            } else {
                self.items.insert(item.jid.clone(), item.clone());
            }
            debug!(jid = %item.jid, subscription = item.subscription.as_str(), "roster push");
            changed.push(item);
        }
        changed
    }
}
