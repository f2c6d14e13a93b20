//! Relay events ↔ unichat data model.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use unichat_core::{
    Channel, ChannelKind, DeliveryStatus, Message, MessageType, Metadata, User,
};

use crate::client::RelayEvent;
use crate::error::RelayError;
use crate::BACKEND_NAME;

/// Metadata key holding the author that created a channel.
pub const CREATOR_KEY: &str = "creator";
/// Metadata key holding the event signature of a message.
pub const SIGNATURE_KEY: &str = "sig";

/// JSON body of channel-create and channel-metadata events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelContent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(flatten)]
    pub extra: Metadata,
}

pub fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Short display name derived from a public key.
pub fn display_name(author: &str) -> String {
    author.chars().take(8).collect()
}

pub fn channel_from_event(event: &RelayEvent) -> Result<Channel, RelayError> {
    let content: ChannelContent = serde_json::from_str(&event.content)
        .map_err(|e| RelayError::Malformed(format!("channel {}: {}", event.id, e)))?;
    let kind = event
        .tag("k")
        .and_then(|k| k.parse::<ChannelKind>().ok())
        .unwrap_or(ChannelKind::Global);

    let mut participants: BTreeSet<String> =
        event.tag_values("p").map(str::to_string).collect();
    participants.insert(event.author.clone());

    let mut metadata = content.extra;
    metadata.insert(CREATOR_KEY.to_string(), Value::String(event.author.clone()));
    if let Some(about) = content.about {
        metadata.insert("about".to_string(), Value::String(about));
    }

    Ok(Channel {
        id: kind.qualify(&event.id),
        name: content.name,
        kind,
        participants,
        created_at: timestamp(event.created_at),
        backend: BACKEND_NAME.to_string(),
        metadata,
    })
}

/// Apply a channel-metadata event on top of a known channel.
pub fn apply_metadata(channel: &mut Channel, event: &RelayEvent) -> Result<(), RelayError> {
    let content: ChannelContent = serde_json::from_str(&event.content)
        .map_err(|e| RelayError::Malformed(format!("metadata {}: {}", event.id, e)))?;
    if !content.name.is_empty() {
        channel.name = content.name;
    }
    if let Some(about) = content.about {
        channel.metadata.insert("about".to_string(), Value::String(about));
    }
    channel.metadata.extend(content.extra);
    Ok(())
}

pub fn message_from_event(event: &RelayEvent, channel_id: &str) -> Message {
    let reply_to = event.marked_event("reply").map(str::to_string);
    let message_type = if reply_to.is_some() {
        MessageType::Reply
    } else {
        MessageType::Text
    };
    let mut metadata = Metadata::new();
    metadata.insert(SIGNATURE_KEY.to_string(), Value::String(event.sig.clone()));

    Message {
        id: event.id.clone(),
        channel_id: channel_id.to_string(),
        sender_id: event.author.clone(),
        sender_name: display_name(&event.author),
        content: event.content.clone(),
        created_at: timestamp(event.created_at),
        message_type,
        status: DeliveryStatus::Sent,
        attachments: Vec::new(),
        reply_to,
        edited_at: None,
        metadata,
    }
}

pub fn user_from_author(author: &str) -> User {
    User {
        name: display_name(author),
        public_key: Some(author.to_string()),
        ..User::unknown(author)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::kinds;

    fn create_event() -> RelayEvent {
        RelayEvent {
            id: "abc123".to_string(),
            author: "f00dfeedcafe".to_string(),
            created_at: 1_700_000_000,
            kind: kinds::CHANNEL_CREATE,
            tags: vec![
                vec!["k".into(), "team".into()],
                vec!["p".into(), "bob".into()],
            ],
            content: r#"{"name":"ops","about":"on-call","topic":"pager"}"#.to_string(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn channel_id_is_qualified_with_kind() {
        let channel = channel_from_event(&create_event()).unwrap();
        assert_eq!(channel.id, "team-abc123");
        assert_eq!(channel.kind, ChannelKind::Team);
        assert_eq!(channel.name, "ops");
        assert!(channel.participants.contains("bob"));
        assert!(channel.participants.contains("f00dfeedcafe"));
        assert_eq!(channel.metadata["topic"], "pager");
        assert_eq!(channel.metadata[CREATOR_KEY], "f00dfeedcafe");
        assert_eq!(channel.backend, "relay");
    }

    #[test]
    fn missing_kind_tag_defaults_to_global() {
        let mut event = create_event();
        event.tags.clear();
        let channel = channel_from_event(&event).unwrap();
        assert_eq!(channel.id, "global-abc123");
    }

    #[test]
    fn malformed_content_is_rejected() {
        let mut event = create_event();
        event.content = "not json".to_string();
        assert!(matches!(
            channel_from_event(&event),
            Err(RelayError::Malformed(_))
        ));
    }

    #[test]
    fn replies_carry_their_parent() {
        let event = RelayEvent {
            id: "m2".to_string(),
            author: "f00dfeedcafe".to_string(),
            created_at: 1_700_000_100,
            kind: kinds::CHANNEL_MESSAGE,
            tags: vec![
                vec!["e".into(), "abc123".into(), "".into(), "root".into()],
                vec!["e".into(), "m1".into(), "".into(), "reply".into()],
            ],
            content: "ack".to_string(),
            sig: "s".to_string(),
        };
        let message = message_from_event(&event, "team-abc123");
        assert_eq!(message.reply_to.as_deref(), Some("m1"));
        assert_eq!(message.message_type, MessageType::Reply);
        assert_eq!(message.sender_name, "f00dfeed");
        assert_eq!(message.status, DeliveryStatus::Sent);
    }
}
