//! Secure-channel shim.
//!
//! The service has no push delivery. Message subscriptions are a poll loop
//! per channel: a tokio interval task that fetches envelopes after the last
//! seen sequence number and stops when its cancellation token fires.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use unichat_adapter::{Adapter, BackendShim, MessageSink, SubscriptionCleanup};
use unichat_core::{
    capability::{
        AttachmentCapabilities, BackendInfo, ChannelCapabilities, Limits, MessagingCapabilities,
        NetworkTraits, SecurityCapabilities,
    },
    AttachmentUpload, BackendFailure, Capabilities, CapabilityMatrix, Channel, ChannelKind,
    DeliveryStatus, Message, MessageDraft, MessageType, Metadata, UploadedAttachment, User,
};

use crate::client::{Envelope, FetchRange, SecureChannelInfo, SecureClient};
use crate::BACKEND_NAME;

pub const MAX_MESSAGE_LENGTH: usize = 4_096;
pub const MAX_ATTACHMENT_SIZE: u64 = 10 * 1024 * 1024;
pub const MAX_PARTICIPANTS: usize = 64;
/// Envelopes fetched per poll.
const POLL_BATCH: usize = 100;

pub type SecureAdapter = Adapter<SecureShim>;

pub fn secure_capabilities() -> CapabilityMatrix {
    CapabilityMatrix {
        backend: BackendInfo {
            name: BACKEND_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        messaging: MessagingCapabilities {
            send: true,
            reply: true,
            ..Default::default()
        },
        channels: ChannelCapabilities {
            create: true,
            join: true,
            leave: true,
            invite: true,
            kick: true,
            set_metadata: false,
        },
        attachments: AttachmentCapabilities {
            upload: true,
            download: true,
            max_size: MAX_ATTACHMENT_SIZE,
            supported_types: [
                "image/png",
                "image/jpeg",
                "image/gif",
                "application/pdf",
                "text/plain",
            ]
            .iter()
            .map(|t| t.to_string())
            .collect(),
        },
        security: SecurityCapabilities {
            encryption: true,
            end_to_end: true,
            post_quantum: true,
            message_verification: true,
        },
        limits: Limits {
            max_message_length: MAX_MESSAGE_LENGTH,
            max_participants_per_channel: MAX_PARTICIPANTS,
            ..Default::default()
        },
        network: NetworkTraits {
            offline: false,
            realtime: false,
            persistent: true,
            decentralized: false,
        },
        ..Default::default()
    }
}

pub struct SecureShim {
    client: Arc<dyn SecureClient>,
    caps: Capabilities,
    poll_interval: Duration,
}

impl SecureShim {
    pub fn new(client: Arc<dyn SecureClient>, poll_interval: Duration) -> Self {
        Self {
            client,
            caps: Capabilities::new(secure_capabilities()),
            poll_interval,
        }
    }

    pub fn into_adapter(self) -> SecureAdapter {
        Adapter::new(self)
    }
}

fn channel_from_info(info: SecureChannelInfo) -> Channel {
    let kind = info.label.parse().unwrap_or(ChannelKind::Direct);
    let mut metadata = Metadata::new();
    metadata.insert("owner".to_string(), Value::String(info.owner));
    Channel {
        id: kind.qualify(&info.id),
        name: info.name,
        kind,
        participants: info.members.into_iter().collect::<BTreeSet<_>>(),
        created_at: info.created_at,
        backend: BACKEND_NAME.to_string(),
        metadata,
    }
}

fn message_from_envelope(envelope: &Envelope, channel_id: &str) -> Message {
    let message_type = if envelope.reply_to.is_some() {
        MessageType::Reply
    } else if envelope
        .attachments
        .iter()
        .any(|a| a.mime_type.starts_with("image/"))
    {
        MessageType::Image
    } else if !envelope.attachments.is_empty() {
        MessageType::File
    } else {
        MessageType::Text
    };
    let mut metadata = Metadata::new();
    metadata.insert("seq".to_string(), Value::from(envelope.seq));
    Message {
        id: envelope.id.clone(),
        channel_id: channel_id.to_string(),
        sender_id: envelope.sender.clone(),
        sender_name: envelope.sender.clone(),
        content: envelope.plaintext.clone(),
        created_at: envelope.sent_at,
        message_type,
        status: DeliveryStatus::Delivered,
        attachments: envelope.attachments.clone(),
        reply_to: envelope.reply_to.clone(),
        edited_at: None,
        metadata,
    }
}

/// Poll `native_id` after `cursor` until cancelled or the sink closes.
async fn poll_loop(
    client: Arc<dyn SecureClient>,
    native_id: String,
    channel_id: String,
    mut cursor: u64,
    interval: Duration,
    sink: MessageSink,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let envelopes = match client
            .fetch(&native_id, FetchRange::After(cursor), POLL_BATCH)
            .await
        {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!(channel = %channel_id, error = %e, "secure poll failed, retrying next tick");
                continue;
            }
        };
        for envelope in envelopes {
            cursor = cursor.max(envelope.seq);
            if !sink.deliver(message_from_envelope(&envelope, &channel_id)) {
                debug!(channel = %channel_id, "subscriber gone, stopping poll loop");
                return;
            }
        }
    }
    debug!(channel = %channel_id, "secure poll loop cancelled");
}

#[async_trait]
impl BackendShim for SecureShim {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    async fn connect_impl(&self) -> Result<(), BackendFailure> {
        self.client.open_session().await?;
        info!(member = %self.client.local_member(), "secure session opened");
        Ok(())
    }

    async fn disconnect_impl(&self) -> Result<(), BackendFailure> {
        self.client.close_session().await?;
        Ok(())
    }

    async fn send_impl(
        &self,
        channel_id: &str,
        draft: &MessageDraft,
    ) -> Result<Message, BackendFailure> {
        let envelope = self
            .client
            .post(
                ChannelKind::native_id(channel_id),
                &draft.content,
                draft.reply_to.as_deref(),
                &draft.attachments,
            )
            .await?;
        Ok(message_from_envelope(&envelope, channel_id))
    }

    async fn fetch_messages_impl(
        &self,
        channel_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<Message>, BackendFailure> {
        let range = match before {
            Some(id) => FetchRange::Before(id.to_string()),
            None => FetchRange::Latest,
        };
        let envelopes = self
            .client
            .fetch(ChannelKind::native_id(channel_id), range, limit)
            .await?;
        Ok(envelopes
            .iter()
            .map(|e| message_from_envelope(e, channel_id))
            .collect())
    }

    async fn subscribe_messages_impl(
        &self,
        channel_id: &str,
        sink: MessageSink,
    ) -> Result<SubscriptionCleanup, BackendFailure> {
        let native_id = ChannelKind::native_id(channel_id).to_string();
        let cursor = self
            .client
            .fetch(&native_id, FetchRange::Latest, 1)
            .await?
            .last()
            .map_or(0, |e| e.seq);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(
            Arc::clone(&self.client),
            native_id,
            channel_id.to_string(),
            cursor,
            self.poll_interval,
            sink,
            cancel.clone(),
        ));
        debug!(channel = %channel_id, cursor, "secure poll loop started");

        Ok(SubscriptionCleanup::new(move || {
            cancel.cancel();
            task.abort();
        }))
    }

    async fn create_channel_impl(
        &self,
        name: &str,
        kind: ChannelKind,
        participants: &[String],
    ) -> Result<Channel, BackendFailure> {
        let info = self
            .client
            .create_channel(kind.as_str(), name, participants)
            .await?;
        Ok(channel_from_info(info))
    }

    async fn join_impl(&self, channel_id: &str) -> Result<Channel, BackendFailure> {
        // membership is granted by an existing member; joining only succeeds
        // for channels this device was already added to
        let info = self.client.channel(ChannelKind::native_id(channel_id)).await?;
        Ok(channel_from_info(info))
    }

    async fn leave_impl(&self, channel_id: &str) -> Result<(), BackendFailure> {
        let me = self.client.local_member().to_string();
        self.client
            .remove_member(ChannelKind::native_id(channel_id), &me)
            .await?;
        Ok(())
    }

    async fn list_channels_impl(&self) -> Result<Vec<Channel>, BackendFailure> {
        Ok(self
            .client
            .channels()
            .await?
            .into_iter()
            .map(channel_from_info)
            .collect())
    }

    async fn list_users_impl(&self, channel_id: &str) -> Result<Vec<User>, BackendFailure> {
        let members = self
            .client
            .members(ChannelKind::native_id(channel_id))
            .await?;
        Ok(members.iter().map(User::unknown).collect())
    }

    async fn mark_read_impl(
        &self,
        channel_id: &str,
        message_ids: &[String],
    ) -> Result<(), BackendFailure> {
        self.client
            .acknowledge(ChannelKind::native_id(channel_id), message_ids)
            .await?;
        Ok(())
    }

    async fn upload_impl(
        &self,
        upload: &AttachmentUpload,
    ) -> Result<UploadedAttachment, BackendFailure> {
        let blob = self
            .client
            .upload(&upload.name, &upload.mime_type, &upload.bytes)
            .await?;
        Ok(UploadedAttachment {
            id: blob.id,
            url: blob.url,
        })
    }

    async fn invite_impl(&self, channel_id: &str, user_id: &str) -> Result<(), BackendFailure> {
        self.client
            .add_member(ChannelKind::native_id(channel_id), user_id)
            .await?;
        Ok(())
    }

    async fn kick_impl(&self, channel_id: &str, user_id: &str) -> Result<(), BackendFailure> {
        self.client
            .remove_member(ChannelKind::native_id(channel_id), user_id)
            .await?;
        Ok(())
    }
}
