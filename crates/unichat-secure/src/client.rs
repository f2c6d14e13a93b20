use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use unichat_core::Attachment;

use crate::error::SecureError;

/// A decrypted envelope as returned by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub channel_id: String,
    pub sender: String,
    /// Per-channel sequence number, strictly increasing.
    pub seq: u64,
    pub sent_at: DateTime<Utc>,
    pub plaintext: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecureChannelInfo {
    pub id: String,
    /// Free-form label set at creation; unichat stores the channel kind here.
    pub label: String,
    pub name: String,
    pub owner: String,
    pub members: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Which slice of a channel's envelopes to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchRange {
    /// The newest envelopes.
    Latest,
    /// Envelopes older than the given envelope id.
    Before(String),
    /// Envelopes with a sequence number above the cursor.
    After(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlob {
    pub id: String,
    pub url: String,
}

/// Native surface of the forward-secret channel service.
///
/// Membership is managed by the service; there is no push delivery, so
/// callers poll with [`FetchRange::After`].
#[async_trait]
pub trait SecureClient: Send + Sync {
    /// Member id of the local device.
    fn local_member(&self) -> &str;

    async fn open_session(&self) -> Result<(), SecureError>;

    async fn close_session(&self) -> Result<(), SecureError>;

    async fn post(
        &self,
        channel_id: &str,
        plaintext: &str,
        reply_to: Option<&str>,
        attachments: &[Attachment],
    ) -> Result<Envelope, SecureError>;

    /// At most `limit` envelopes of `range`, oldest first.
    async fn fetch(
        &self,
        channel_id: &str,
        range: FetchRange,
        limit: usize,
    ) -> Result<Vec<Envelope>, SecureError>;

    /// Create a channel owned by the local member, who is always a member.
    async fn create_channel(
        &self,
        label: &str,
        name: &str,
        members: &[String],
    ) -> Result<SecureChannelInfo, SecureError>;

    async fn channel(&self, channel_id: &str) -> Result<SecureChannelInfo, SecureError>;

    /// Channels the local member belongs to.
    async fn channels(&self) -> Result<Vec<SecureChannelInfo>, SecureError>;

    async fn add_member(&self, channel_id: &str, member: &str) -> Result<(), SecureError>;

    async fn remove_member(&self, channel_id: &str, member: &str) -> Result<(), SecureError>;

    async fn members(&self, channel_id: &str) -> Result<Vec<String>, SecureError>;

    async fn upload(
        &self,
        name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<StoredBlob, SecureError>;

    /// Send read acknowledgements for delivered envelopes.
    async fn acknowledge(&self, channel_id: &str, envelope_ids: &[String])
        -> Result<(), SecureError>;
}
