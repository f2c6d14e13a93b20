//! Capability model: what a backend can do, queried by dotted path.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChatError, ErrorCode};
use crate::types::AttachmentUpload;

/// Well-known capability paths.
pub mod paths {
    pub const MESSAGES_SEND: &str = "messaging.send";
    pub const MESSAGES_EDIT: &str = "messaging.edit";
    pub const MESSAGES_DELETE: &str = "messaging.delete";
    pub const MESSAGES_REACT: &str = "messaging.react";
    pub const MESSAGES_REPLY: &str = "messaging.reply";
    pub const MESSAGES_SEARCH: &str = "messaging.search";
    pub const CHANNELS_CREATE: &str = "channels.create";
    pub const CHANNELS_JOIN: &str = "channels.join";
    pub const CHANNELS_LEAVE: &str = "channels.leave";
    pub const CHANNELS_INVITE: &str = "channels.invite";
    pub const CHANNELS_KICK: &str = "channels.kick";
    pub const CHANNELS_SET_METADATA: &str = "channels.setMetadata";
    pub const PRESENCE_GET: &str = "presence.get";
    pub const PRESENCE_SET: &str = "presence.set";
    pub const ATTACHMENTS_UPLOAD: &str = "attachments.upload";
    pub const ATTACHMENTS_DOWNLOAD: &str = "attachments.download";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingCapabilities {
    pub send: bool,
    pub edit: bool,
    pub delete: bool,
    pub react: bool,
    pub reply: bool,
    pub search: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCapabilities {
    pub create: bool,
    pub join: bool,
    pub leave: bool,
    pub invite: bool,
    pub kick: bool,
    pub set_metadata: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceCapabilities {
    pub get: bool,
    pub set: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentCapabilities {
    pub upload: bool,
    pub download: bool,
    /// Maximum upload size in bytes. 0 means no size limit.
    pub max_size: u64,
    /// Accepted MIME types. Empty means any type.
    pub supported_types: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityCapabilities {
    pub encryption: bool,
    pub end_to_end: bool,
    pub post_quantum: bool,
    pub message_verification: bool,
}

/// Scalar limits. 0 means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    pub max_message_length: usize,
    pub max_channels_per_user: usize,
    pub max_participants_per_channel: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkTraits {
    pub offline: bool,
    pub realtime: bool,
    pub persistent: bool,
    pub decentralized: bool,
}

/// The full feature matrix of one backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityMatrix {
    pub backend: BackendInfo,
    pub messaging: MessagingCapabilities,
    pub channels: ChannelCapabilities,
    pub presence: PresenceCapabilities,
    pub attachments: AttachmentCapabilities,
    pub security: SecurityCapabilities,
    pub limits: Limits,
    pub network: NetworkTraits,
}

/// Immutable capability descriptor of an adapter.
///
/// The matrix is flattened into a JSON tree once, at construction, so path
/// queries never touch the typed structs again.
#[derive(Debug, Clone)]
pub struct Capabilities {
    matrix: CapabilityMatrix,
    tree: Value,
}

impl Capabilities {
    pub fn new(matrix: CapabilityMatrix) -> Self {
        let tree = serde_json::to_value(&matrix).unwrap_or(Value::Null);
        Self { matrix, tree }
    }

    pub fn matrix(&self) -> &CapabilityMatrix {
        &self.matrix
    }

    pub fn backend_name(&self) -> &str {
        &self.matrix.backend.name
    }

    /// Resolve a dotted path such as `messaging.delete` or `attachments.maxSize`.
    ///
    /// Missing and falsy nodes (false, 0, "", [], null) resolve to `false`.
    /// `messages.` is accepted for `messaging.` and snake_case segments resolve
    /// like their camelCase spelling.
    pub fn has_capability(&self, path: &str) -> bool {
        let mut node = &self.tree;
        for (index, segment) in path.split('.').enumerate() {
            let key = normalize_segment(index, segment);
            match node.get(key.as_str()) {
                Some(next) => node = next,
                None => return false,
            }
        }
        is_truthy(node)
    }

    /// Reject content longer than `limits.maxMessageLength`.
    pub fn check_message(&self, content: &str) -> Result<(), ChatError> {
        let max = self.matrix.limits.max_message_length;
        let len = content.chars().count();
        if max > 0 && len > max {
            return Err(ChatError::new(
                ErrorCode::InvalidMessage,
                format!("message is {} characters long (max {})", len, max),
            ));
        }
        Ok(())
    }

    /// Reject uploads the backend's attachment limits do not allow.
    pub fn check_upload(&self, upload: &AttachmentUpload) -> Result<(), ChatError> {
        let caps = &self.matrix.attachments;
        if caps.max_size > 0 && upload.size() > caps.max_size {
            return Err(ChatError::new(
                ErrorCode::InvalidMessage,
                format!(
                    "attachment '{}' is {} bytes (max {})",
                    upload.name,
                    upload.size(),
                    caps.max_size
                ),
            ));
        }
        if !caps.supported_types.is_empty()
            && !caps.supported_types.iter().any(|t| t == &upload.mime_type)
        {
            return Err(ChatError::new(
                ErrorCode::InvalidMessage,
                format!("attachment type '{}' is not accepted", upload.mime_type),
            ));
        }
        Ok(())
    }
}

impl From<CapabilityMatrix> for Capabilities {
    fn from(matrix: CapabilityMatrix) -> Self {
        Self::new(matrix)
    }
}

fn normalize_segment(index: usize, segment: &str) -> String {
    if index == 0 && segment == "messages" {
        return "messaging".to_string();
    }
    let mut out = String::with_capacity(segment.len());
    let mut upper_next = false;
    for c in segment.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn is_truthy(node: &Value) -> bool {
    match node {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}
