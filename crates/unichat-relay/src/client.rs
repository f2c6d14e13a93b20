use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::RelayError;

/// Event kinds the relay adapter reads and writes.
pub mod kinds {
    pub const TEXT_NOTE: u32 = 1;
    pub const DELETION: u32 = 5;
    pub const REACTION: u32 = 7;
    pub const CHANNEL_CREATE: u32 = 40;
    pub const CHANNEL_METADATA: u32 = 41;
    pub const CHANNEL_MESSAGE: u32 = 42;
}

/// A signed event as stored and forwarded by relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEvent {
    pub id: String,
    /// Hex public key of the signer.
    pub author: String,
    /// Unix seconds.
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl RelayEvent {
    /// First value of the first tag called `name`.
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some(name))
            .find_map(|t| t.get(1).map(String::as_str))
    }

    /// First value of every tag called `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }

    /// Value of the `e` tag carrying `marker` in its fourth position.
    pub fn marked_event(&self, marker: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| {
                t.first().map(String::as_str) == Some("e")
                    && t.get(3).map(String::as_str) == Some(marker)
            })
            .and_then(|t| t.get(1).map(String::as_str))
    }
}

/// Event content handed to the client for signing and publishing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(kind: u32, content: impl Into<String>) -> Self {
        Self {
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    pub fn tag(mut self, values: &[&str]) -> Self {
        self.tags.push(values.iter().map(|v| v.to_string()).collect());
        self
    }
}

/// Relay query. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayFilter {
    pub ids: Vec<String>,
    pub kinds: Vec<u32>,
    pub authors: Vec<String>,
    /// Tag name → accepted values (`#e`, `#p`, ... without the hash).
    pub tags: BTreeMap<String, Vec<String>>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
}

impl RelayFilter {
    pub fn kind(kind: u32) -> Self {
        Self {
            kinds: vec![kind],
            ..Self::default()
        }
    }

    pub fn ids(ids: Vec<String>) -> Self {
        Self {
            ids,
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, name: &str, values: Vec<String>) -> Self {
        self.tags.insert(name.to_string(), values);
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.authors.push(author.into());
        self
    }

    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, event: &RelayEvent) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&event.id) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.author) {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        self.tags.iter().all(|(name, values)| {
            event
                .tag_values(name)
                .any(|v| values.iter().any(|wanted| wanted == v))
        })
    }
}

/// Live stream of events matching a subscription filter.
#[derive(Debug)]
pub struct RelaySubscription {
    pub id: String,
    pub events: mpsc::Receiver<RelayEvent>,
}

/// Native surface of a gossip-relay network client.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Hex public key events are signed with.
    fn author(&self) -> &str;

    async fn connect(&self) -> Result<(), RelayError>;

    async fn disconnect(&self) -> Result<(), RelayError>;

    /// Sign `event` and publish it to every relay. Returns the stored event.
    async fn publish(&self, event: UnsignedEvent) -> Result<RelayEvent, RelayError>;

    /// Stored events matching `filter`, newest first.
    async fn query(&self, filter: &RelayFilter) -> Result<Vec<RelayEvent>, RelayError>;

    async fn subscribe(&self, filter: RelayFilter) -> Result<RelaySubscription, RelayError>;

    /// Close a subscription. Unknown ids are ignored.
    fn close(&self, subscription_id: &str);
}
