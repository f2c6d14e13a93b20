use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form metadata attached to channels, messages and users.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Callback invoked for every message delivered by a subscription.
pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// Callback invoked for every presence change delivered by a subscription.
pub type PresenceCallback = Arc<dyn Fn(User) + Send + Sync>;

/// Number of messages returned by a history fetch when the caller gives no limit.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Routing key of a channel. Decides which backend owns the channel for its
/// whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// One-to-one conversation.
    Direct,
    /// Group or team room with a managed member list.
    #[serde(alias = "group")]
    Team,
    /// Public broadcast channel.
    #[serde(alias = "broadcast")]
    Global,
    /// Short-lived side conversation.
    #[serde(alias = "ephemeral")]
    Thread,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::Direct,
        ChannelKind::Team,
        ChannelKind::Global,
        ChannelKind::Thread,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Direct => "direct",
            ChannelKind::Team => "team",
            ChannelKind::Global => "global",
            ChannelKind::Thread => "thread",
        }
    }

    /// Build a backend-qualified channel id: `<kind>-<native id>`.
    pub fn qualify(&self, native_id: &str) -> String {
        format!("{}-{}", self.as_str(), native_id)
    }

    /// Read the kind hint embedded in a channel id (`team-42`, `global:news`).
    ///
    /// Returns `None` when the id carries no recognisable prefix.
    pub fn from_channel_id(channel_id: &str) -> Option<Self> {
        let prefix = channel_id.split(['-', ':']).next()?;
        if prefix.len() == channel_id.len() {
            return None;
        }
        prefix.parse().ok()
    }

    /// Strip the `<kind>-` prefix, returning the backend-native part of the id.
    pub fn native_id(channel_id: &str) -> &str {
        match Self::from_channel_id(channel_id) {
            Some(_) => channel_id
                .split_once(['-', ':'])
                .map(|(_, rest)| rest)
                .unwrap_or(channel_id),
            None => channel_id,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a channel kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown channel kind: {0}")]
pub struct ParseKindError(pub String);

impl std::str::FromStr for ChannelKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" | "dm" => Ok(ChannelKind::Direct),
            "team" | "group" => Ok(ChannelKind::Team),
            "global" | "broadcast" => Ok(ChannelKind::Global),
            "thread" | "ephemeral" => Ok(ChannelKind::Thread),
            other => Err(ParseKindError(other.to_string())),
        }
    }
}

/// A conversation owned by exactly one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Backend-qualified identifier, `<kind>-<native id>`.
    pub id: String,
    pub name: String,
    pub kind: ChannelKind,
    pub participants: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    /// Name of the backend that owns the channel (e.g. `"relay"`).
    pub backend: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Delivery progress of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    File,
    Image,
    System,
    Alert,
    Reply,
}

/// Reference to a file that has already been uploaded to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique within its channel once `status` reaches `sent`.
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub message_type: MessageType,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Content the caller wants to send. The backend assigns id, sender and time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn replying_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    /// Type tag a backend should stamp on the resulting message.
    pub fn message_type(&self) -> MessageType {
        if self.reply_to.is_some() {
            MessageType::Reply
        } else if self
            .attachments
            .iter()
            .any(|a| a.mime_type.starts_with("image/"))
        {
            MessageType::Image
        } else if !self.attachments.is_empty() {
            MessageType::File
        } else {
            MessageType::Text
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    #[default]
    Offline,
    Away,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceStatus::Online => write!(f, "online"),
            PresenceStatus::Offline => write!(f, "offline"),
            PresenceStatus::Away => write!(f, "away"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub presence: PresenceStatus,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl User {
    /// A user known only by id, with no presence information.
    pub fn unknown(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            presence: PresenceStatus::Offline,
            last_seen: None,
            public_key: None,
            metadata: Metadata::new(),
        }
    }
}

/// File handed to `upload_attachment`.
#[derive(Clone, PartialEq)]
pub struct AttachmentUpload {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl AttachmentUpload {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

impl fmt::Debug for AttachmentUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentUpload")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedAttachment {
    pub id: String,
    pub url: String,
}

/// Runtime connection state of an adapter or of the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Fully connected and ready to send/receive.
    Connected,

    /// Attempting to establish the connection.
    Connecting,

    /// Cleanly disconnected (not an error condition).
    Disconnected,

    /// The last connection attempt failed.
    Error(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}
