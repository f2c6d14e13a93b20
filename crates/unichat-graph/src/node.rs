//! Typed views of the JSON nodes the graph adapter writes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use unichat_core::{Channel, ChannelKind, Metadata, PresenceStatus, User};

use crate::error::GraphError;
use crate::BACKEND_NAME;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelNode {
    pub name: String,
    pub kind: ChannelKind,
    pub created_at: DateTime<Utc>,
    pub creator: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ChannelNode {
    pub fn into_channel(self, id: &str, participants: BTreeSet<String>) -> Channel {
        Channel {
            id: id.to_string(),
            name: self.name,
            kind: self.kind,
            participants,
            created_at: self.created_at,
            backend: BACKEND_NAME.to_string(),
            metadata: self.metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserNode {
    pub name: String,
    #[serde(default)]
    pub presence: PresenceStatus,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl UserNode {
    pub fn into_user(self, id: &str) -> User {
        User {
            name: self.name,
            presence: self.presence,
            last_seen: self.last_seen,
            ..User::unknown(id)
        }
    }
}

/// Decode a node, treating a tombstone as absent.
pub fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<Option<T>, GraphError> {
    if value.is_null() {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| GraphError::Malformed {
            path: path.to_string(),
            reason: e.to_string(),
        })
}

pub fn encode<T: Serialize>(path: &str, value: &T) -> Result<Value, GraphError> {
    serde_json::to_value(value).map_err(|e| GraphError::Malformed {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Membership flags are `true` while a member, tombstoned on leave.
pub fn is_member(value: &Value) -> bool {
    value.as_bool().unwrap_or(false)
}
