//! Relay-network shim.
//!
//! Channels are channel-create events; the channel id is the create event id
//! qualified with the kind stored in its `k` tag. Messages are channel-message
//! events whose root `e` tag points at the create event. Relays keep no
//! membership, so join and leave only update the local view.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use unichat_adapter::{Adapter, BackendShim, MessageSink, SubscriptionCleanup};
use unichat_core::{
    capability::{
        BackendInfo, ChannelCapabilities, Limits, MessagingCapabilities, NetworkTraits,
        SecurityCapabilities,
    },
    BackendFailure, Capabilities, CapabilityMatrix, Channel, ChannelKind, Message, MessageDraft,
    Metadata, User,
};

use crate::client::{kinds, RelayClient, RelayEvent, RelayFilter, UnsignedEvent};
use crate::convert::{
    apply_metadata, channel_from_event, message_from_event, user_from_author, ChannelContent,
    CREATOR_KEY,
};
use crate::error::RelayError;
use crate::BACKEND_NAME;

/// Longest message content relays are expected to accept.
pub const MAX_MESSAGE_LENGTH: usize = 32_768;

pub type RelayAdapter = Adapter<RelayShim>;

pub fn relay_capabilities() -> CapabilityMatrix {
    CapabilityMatrix {
        backend: BackendInfo {
            name: BACKEND_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        messaging: MessagingCapabilities {
            send: true,
            edit: false,
            delete: true,
            react: true,
            reply: true,
            search: false,
        },
        channels: ChannelCapabilities {
            create: true,
            join: true,
            leave: true,
            invite: false,
            kick: false,
            set_metadata: true,
        },
        security: SecurityCapabilities {
            message_verification: true,
            ..Default::default()
        },
        limits: Limits {
            max_message_length: MAX_MESSAGE_LENGTH,
            ..Default::default()
        },
        network: NetworkTraits {
            offline: false,
            realtime: true,
            persistent: true,
            decentralized: true,
        },
        ..Default::default()
    }
}

pub struct RelayShim {
    client: Arc<dyn RelayClient>,
    caps: Capabilities,
    /// Channels created, joined or looked up through this shim, by channel id.
    channels: DashMap<String, Channel>,
    /// Channel ids the local user has joined or created.
    joined: DashMap<String, ()>,
}

impl RelayShim {
    pub fn new(client: Arc<dyn RelayClient>) -> Self {
        Self {
            client,
            caps: Capabilities::new(relay_capabilities()),
            channels: DashMap::new(),
            joined: DashMap::new(),
        }
    }

    /// Wrap the shim in the adapter skeleton.
    pub fn into_adapter(self) -> RelayAdapter {
        Adapter::new(self)
    }

    /// Resolve a channel id to its create event, from cache or the relays.
    async fn load_channel(&self, channel_id: &str) -> Result<Channel, RelayError> {
        if let Some(channel) = self.channels.get(channel_id) {
            return Ok(channel.clone());
        }
        let root = ChannelKind::native_id(channel_id);
        let mut filter = RelayFilter::ids(vec![root.to_string()]);
        filter.kinds = vec![kinds::CHANNEL_CREATE];
        let event = self
            .client
            .query(&filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RelayError::ChannelNotFound(channel_id.to_string()))?;

        let mut channel = channel_from_event(&event)?;
        if channel.id != channel_id {
            return Err(RelayError::ChannelNotFound(channel_id.to_string()));
        }
        let updates = RelayFilter::kind(kinds::CHANNEL_METADATA)
            .with_author(event.author.clone())
            .with_tag("e", vec![event.id.clone()]);
        let mut updates = self.client.query(&updates).await?;
        updates.sort_by_key(|e| e.created_at);
        for update in &updates {
            if let Err(e) = apply_metadata(&mut channel, update) {
                warn!(channel = %channel_id, error = %e, "skipping malformed channel metadata");
            }
        }
        self.channels.insert(channel_id.to_string(), channel.clone());
        Ok(channel)
    }

    async fn load_event(&self, event_id: &str) -> Result<RelayEvent, RelayError> {
        self.client
            .query(&RelayFilter::ids(vec![event_id.to_string()]))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RelayError::EventNotFound(event_id.to_string()))
    }

    /// Message ids of `candidates` that have a deletion event from their author.
    async fn deleted_ids(&self, candidates: &[RelayEvent]) -> Result<Vec<String>, RelayError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let ids = candidates.iter().map(|e| e.id.clone()).collect();
        let deletions = self
            .client
            .query(&RelayFilter::kind(kinds::DELETION).with_tag("e", ids))
            .await?;
        Ok(candidates
            .iter()
            .filter(|message| {
                deletions.iter().any(|d| {
                    d.author == message.author && d.tag_values("e").any(|id| id == message.id)
                })
            })
            .map(|message| message.id.clone())
            .collect())
    }
}

fn channel_filter(channel_id: &str) -> RelayFilter {
    RelayFilter::kind(kinds::CHANNEL_MESSAGE)
        .with_tag("e", vec![ChannelKind::native_id(channel_id).to_string()])
}

#[async_trait]
impl BackendShim for RelayShim {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    async fn connect_impl(&self) -> Result<(), BackendFailure> {
        self.client.connect().await?;
        info!(author = %self.client.author(), "relay client connected");
        Ok(())
    }

    async fn disconnect_impl(&self) -> Result<(), BackendFailure> {
        self.client.disconnect().await?;
        Ok(())
    }

    async fn send_impl(
        &self,
        channel_id: &str,
        draft: &MessageDraft,
    ) -> Result<Message, BackendFailure> {
        let channel = self.load_channel(channel_id).await?;
        let root = ChannelKind::native_id(&channel.id);
        let mut event = UnsignedEvent::new(kinds::CHANNEL_MESSAGE, draft.content.clone())
            .tag(&["e", root, "", "root"]);
        if let Some(parent) = &draft.reply_to {
            event = event.tag(&["e", parent.as_str(), "", "reply"]);
        }
        let published = self.client.publish(event).await?;
        debug!(channel = %channel_id, event = %published.id, "channel message published");
        Ok(message_from_event(&published, channel_id))
    }

    async fn fetch_messages_impl(
        &self,
        channel_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<Message>, BackendFailure> {
        self.load_channel(channel_id).await?;
        // Relays answer newest first; reversing before the stable sort keeps
        // same-second events in publication order.
        let mut events = self.client.query(&channel_filter(channel_id)).await?;
        events.reverse();
        events.sort_by_key(|e| e.created_at);

        if let Some(before) = before {
            let cut = events
                .iter()
                .position(|e| e.id == before)
                .ok_or_else(|| RelayError::EventNotFound(before.to_string()))?;
            events.truncate(cut);
        }
        let deleted = self.deleted_ids(&events).await?;
        events.retain(|e| !deleted.contains(&e.id));

        let skip = events.len().saturating_sub(limit);
        Ok(events
            .iter()
            .skip(skip)
            .map(|e| message_from_event(e, channel_id))
            .collect())
    }

    async fn subscribe_messages_impl(
        &self,
        channel_id: &str,
        sink: MessageSink,
    ) -> Result<SubscriptionCleanup, BackendFailure> {
        self.load_channel(channel_id).await?;
        let filter = channel_filter(channel_id).since(chrono::Utc::now().timestamp());
        let mut subscription = self.client.subscribe(filter).await?;
        let sub_id = subscription.id.clone();
        let channel = channel_id.to_string();

        let task = tokio::spawn(async move {
            while let Some(event) = subscription.events.recv().await {
                if !sink.deliver(message_from_event(&event, &channel)) {
                    break;
                }
            }
            debug!(channel = %channel, "relay subscription stream ended");
        });

        let client = Arc::clone(&self.client);
        Ok(SubscriptionCleanup::new(move || {
            client.close(&sub_id);
            task.abort();
        }))
    }

    async fn create_channel_impl(
        &self,
        name: &str,
        kind: ChannelKind,
        participants: &[String],
    ) -> Result<Channel, BackendFailure> {
        let content = ChannelContent {
            name: name.to_string(),
            ..Default::default()
        };
        let body = serde_json::to_string(&content)
            .map_err(|e| RelayError::Malformed(e.to_string()))?;
        let mut event = UnsignedEvent::new(kinds::CHANNEL_CREATE, body).tag(&["k", kind.as_str()]);
        for participant in participants {
            event = event.tag(&["p", participant.as_str()]);
        }
        let published = self.client.publish(event).await?;
        let channel = channel_from_event(&published)?;
        self.channels.insert(channel.id.clone(), channel.clone());
        self.joined.insert(channel.id.clone(), ());
        Ok(channel)
    }

    async fn join_impl(&self, channel_id: &str) -> Result<Channel, BackendFailure> {
        let channel = self.load_channel(channel_id).await?;
        self.joined.insert(channel.id.clone(), ());
        Ok(channel)
    }

    async fn leave_impl(&self, channel_id: &str) -> Result<(), BackendFailure> {
        self.joined.remove(channel_id);
        Ok(())
    }

    async fn list_channels_impl(&self) -> Result<Vec<Channel>, BackendFailure> {
        let ids: Vec<String> = self.joined.iter().map(|e| e.key().clone()).collect();
        let mut channels = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_channel(&id).await {
                Ok(channel) => channels.push(channel),
                Err(RelayError::ChannelNotFound(_)) => {
                    warn!(channel = %id, "joined channel vanished from relays");
                    self.joined.remove(&id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        channels.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(channels)
    }

    async fn list_users_impl(&self, channel_id: &str) -> Result<Vec<User>, BackendFailure> {
        let channel = self.load_channel(channel_id).await?;
        let mut authors = channel.participants.clone();
        for event in self.client.query(&channel_filter(channel_id)).await? {
            authors.insert(event.author);
        }
        Ok(authors.iter().map(|a| user_from_author(a)).collect())
    }

    async fn delete_impl(&self, channel_id: &str, message_id: &str) -> Result<(), BackendFailure> {
        let event = self.load_event(message_id).await?;
        if event.author != self.client.author() {
            return Err(RelayError::NotAuthor(message_id.to_string()).into());
        }
        let message_kind = kinds::CHANNEL_MESSAGE.to_string();
        let deletion = UnsignedEvent::new(kinds::DELETION, "")
            .tag(&["e", message_id])
            .tag(&["k", message_kind.as_str()]);
        self.client.publish(deletion).await?;
        debug!(channel = %channel_id, event = %message_id, "deletion published");
        Ok(())
    }

    async fn react_impl(
        &self,
        _channel_id: &str,
        message_id: &str,
        reaction: &str,
    ) -> Result<(), BackendFailure> {
        let target = self.load_event(message_id).await?;
        let event = UnsignedEvent::new(kinds::REACTION, reaction)
            .tag(&["e", target.id.as_str()])
            .tag(&["p", target.author.as_str()]);
        self.client.publish(event).await?;
        Ok(())
    }

    async fn set_metadata_impl(
        &self,
        channel_id: &str,
        metadata: &Metadata,
    ) -> Result<(), BackendFailure> {
        let mut channel = self.load_channel(channel_id).await?;
        let creator = channel.metadata.get(CREATOR_KEY).and_then(Value::as_str);
        if creator != Some(self.client.author()) {
            return Err(RelayError::NotAuthor(channel_id.to_string()).into());
        }
        let mut extra = metadata.clone();
        extra.remove(CREATOR_KEY);
        let content = ChannelContent {
            name: String::new(),
            about: None,
            extra,
        };
        let body = serde_json::to_string(&content)
            .map_err(|e| RelayError::Malformed(e.to_string()))?;
        let root = ChannelKind::native_id(&channel.id).to_string();
        let published = self
            .client
            .publish(UnsignedEvent::new(kinds::CHANNEL_METADATA, body).tag(&["e", root.as_str()]))
            .await?;
        apply_metadata(&mut channel, &published)?;
        self.channels.insert(channel_id.to_string(), channel);
        Ok(())
    }
}
