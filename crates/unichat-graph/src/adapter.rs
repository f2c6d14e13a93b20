//! Graph-store shim.
//!
//! Every unichat object is a JSON node under the configured root (see
//! [`GraphPaths`]). Membership is stored in both directions so a channel's
//! members and a user's channels are each one `list` away. Deletes write
//! tombstones; listeners on a parent node drive subscriptions.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use unichat_adapter::{Adapter, BackendShim, MessageSink, PresenceSink, SubscriptionCleanup};
use unichat_core::{
    capability::{
        BackendInfo, ChannelCapabilities, Limits, MessagingCapabilities, NetworkTraits,
        PresenceCapabilities,
    },
    BackendFailure, Capabilities, CapabilityMatrix, Channel, ChannelKind, DeliveryStatus, Message,
    MessageDraft, Metadata, PresenceStatus, User,
};

use crate::client::{GraphClient, GraphListener, GraphPaths};
use crate::error::GraphError;
use crate::node::{decode, encode, is_member, ChannelNode, UserNode};
use crate::BACKEND_NAME;

pub const MAX_MESSAGE_LENGTH: usize = 10_000;

pub type GraphAdapter = Adapter<GraphShim>;

pub fn graph_capabilities() -> CapabilityMatrix {
    CapabilityMatrix {
        backend: BackendInfo {
            name: BACKEND_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        messaging: MessagingCapabilities {
            send: true,
            edit: true,
            delete: true,
            react: true,
            reply: true,
            search: true,
        },
        channels: ChannelCapabilities {
            create: true,
            join: true,
            leave: true,
            invite: true,
            kick: true,
            set_metadata: true,
        },
        presence: PresenceCapabilities {
            get: true,
            set: true,
        },
        limits: Limits {
            max_message_length: MAX_MESSAGE_LENGTH,
            ..Default::default()
        },
        network: NetworkTraits {
            offline: true,
            realtime: true,
            persistent: true,
            decentralized: true,
        },
        ..Default::default()
    }
}

pub struct GraphShim {
    client: Arc<dyn GraphClient>,
    paths: GraphPaths,
    caps: Capabilities,
}

impl GraphShim {
    pub fn new(client: Arc<dyn GraphClient>, root: &str) -> Self {
        Self {
            client,
            paths: GraphPaths::new(root),
            caps: Capabilities::new(graph_capabilities()),
        }
    }

    pub fn into_adapter(self) -> GraphAdapter {
        Adapter::new(self)
    }

    fn user_id(&self) -> &str {
        &self.client.identity().user_id
    }

    async fn channel_node(&self, channel_id: &str) -> Result<ChannelNode, GraphError> {
        let path = self.paths.channel(channel_id);
        let value = self.client.get(&path).await?.unwrap_or(Value::Null);
        decode(&path, value)?.ok_or_else(|| GraphError::ChannelNotFound(channel_id.to_string()))
    }

    async fn member_ids(&self, channel_id: &str) -> Result<BTreeSet<String>, GraphError> {
        Ok(self
            .client
            .list(&self.paths.members(channel_id))
            .await?
            .into_iter()
            .filter(|(_, flag)| is_member(flag))
            .map(|(user_id, _)| user_id)
            .collect())
    }

    async fn load_channel(&self, channel_id: &str) -> Result<Channel, GraphError> {
        let node = self.channel_node(channel_id).await?;
        let members = self.member_ids(channel_id).await?;
        Ok(node.into_channel(channel_id, members))
    }

    async fn set_membership(
        &self,
        channel_id: &str,
        user_id: &str,
        member: bool,
    ) -> Result<(), GraphError> {
        let flag = if member { Value::Bool(true) } else { Value::Null };
        self.client
            .put(&self.paths.member(channel_id, user_id), flag.clone())
            .await?;
        self.client
            .put(&self.paths.membership(user_id, channel_id), flag)
            .await
    }

    async fn require_member(&self, channel_id: &str) -> Result<(), GraphError> {
        if self.member_ids(channel_id).await?.contains(self.user_id()) {
            Ok(())
        } else {
            Err(GraphError::NotPermitted(format!(
                "{} is not a member of {}",
                self.user_id(),
                channel_id
            )))
        }
    }

    async fn load_message(&self, channel_id: &str, message_id: &str) -> Result<Message, GraphError> {
        let path = self.paths.message(channel_id, message_id);
        let value = self.client.get(&path).await?.unwrap_or(Value::Null);
        decode(&path, value)?.ok_or_else(|| GraphError::MessageNotFound(message_id.to_string()))
    }

    /// Load a message the local user sent; anyone else's is off limits.
    async fn own_message(&self, channel_id: &str, message_id: &str) -> Result<Message, GraphError> {
        let message = self.load_message(channel_id, message_id).await?;
        if message.sender_id != self.user_id() {
            return Err(GraphError::NotPermitted(format!(
                "message {} belongs to {}",
                message_id, message.sender_id
            )));
        }
        Ok(message)
    }

    async fn write_message(&self, message: &Message) -> Result<(), GraphError> {
        let path = self.paths.message(&message.channel_id, &message.id);
        let value = encode(&path, message)?;
        self.client.put(&path, value).await
    }

    /// Live messages of a channel, oldest first.
    async fn channel_messages(&self, channel_id: &str) -> Result<Vec<Message>, GraphError> {
        let base = self.paths.messages(channel_id);
        let mut messages = Vec::new();
        for (key, value) in self.client.list(&base).await? {
            let path = format!("{}/{}", base, key);
            match decode::<Message>(&path, value) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "skipping undecodable message node"),
            }
        }
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }

    async fn write_presence(&self, presence: PresenceStatus) -> Result<(), GraphError> {
        let path = self.paths.user(self.user_id());
        let node = UserNode {
            name: self.client.identity().alias.clone(),
            presence,
            last_seen: Some(Utc::now()),
        };
        let value = encode(&path, &node)?;
        self.client.put(&path, value).await
    }
}

#[async_trait]
impl BackendShim for GraphShim {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    async fn connect_impl(&self) -> Result<(), BackendFailure> {
        self.client.connect().await?;
        self.write_presence(PresenceStatus::Online).await?;
        info!(user = %self.user_id(), "graph client connected");
        Ok(())
    }

    async fn disconnect_impl(&self) -> Result<(), BackendFailure> {
        if let Err(e) = self.write_presence(PresenceStatus::Offline).await {
            warn!(user = %self.user_id(), error = %e, "could not publish offline presence");
        }
        self.client.disconnect().await?;
        Ok(())
    }

    async fn send_impl(
        &self,
        channel_id: &str,
        draft: &MessageDraft,
    ) -> Result<Message, BackendFailure> {
        self.channel_node(channel_id).await?;
        if let Some(parent) = &draft.reply_to {
            self.load_message(channel_id, parent).await?;
        }
        let identity = self.client.identity();
        let message = Message {
            id: Uuid::now_v7().to_string(),
            channel_id: channel_id.to_string(),
            sender_id: identity.user_id.clone(),
            sender_name: identity.alias.clone(),
            content: draft.content.clone(),
            created_at: Utc::now(),
            message_type: draft.message_type(),
            status: DeliveryStatus::Sent,
            attachments: draft.attachments.clone(),
            reply_to: draft.reply_to.clone(),
            edited_at: None,
            metadata: Metadata::new(),
        };
        self.write_message(&message).await?;
        Ok(message)
    }

    async fn fetch_messages_impl(
        &self,
        channel_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<Message>, BackendFailure> {
        self.channel_node(channel_id).await?;
        let mut messages = self.channel_messages(channel_id).await?;
        if let Some(before) = before {
            let cut = messages
                .iter()
                .position(|m| m.id == before)
                .ok_or_else(|| GraphError::MessageNotFound(before.to_string()))?;
            messages.truncate(cut);
        }
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.split_off(skip))
    }

    async fn subscribe_messages_impl(
        &self,
        channel_id: &str,
        sink: MessageSink,
    ) -> Result<SubscriptionCleanup, BackendFailure> {
        self.channel_node(channel_id).await?;
        let path = self.paths.messages(channel_id);
        let known: HashSet<String> = self
            .client
            .list(&path)
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        let seen = Mutex::new(known);
        let channel = channel_id.to_string();

        // Edits and tombstones rewrite known keys; only new keys are deliveries.
        let listener: GraphListener = Arc::new(move |key: &str, value: &Value| {
            if value.is_null() {
                return;
            }
            let fresh = seen
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(key.to_string());
            if !fresh {
                return;
            }
            match serde_json::from_value::<Message>(value.clone()) {
                Ok(message) => {
                    sink.deliver(message);
                }
                Err(e) => warn!(channel = %channel, key, error = %e, "undecodable message node"),
            }
        });
        let watch = self.client.watch(&path, listener).await?;
        debug!(channel = %channel_id, watch = watch.0, "graph listener attached");

        let client = Arc::clone(&self.client);
        Ok(SubscriptionCleanup::new(move || client.unwatch(watch)))
    }

    async fn subscribe_presence_impl(
        &self,
        channel_id: &str,
        sink: PresenceSink,
    ) -> Result<SubscriptionCleanup, BackendFailure> {
        let members = self.member_ids(channel_id).await?;
        if members.is_empty() {
            self.channel_node(channel_id).await?;
        }
        let users = self.paths.users();
        let listener: GraphListener = Arc::new(move |user_id: &str, value: &Value| {
            if !members.contains(user_id) {
                return;
            }
            if let Ok(Some(node)) = decode::<UserNode>(user_id, value.clone()) {
                sink.deliver(node.into_user(user_id));
            }
        });
        let watch = self.client.watch(&users, listener).await?;
        let client = Arc::clone(&self.client);
        Ok(SubscriptionCleanup::new(move || client.unwatch(watch)))
    }

    async fn set_presence_impl(&self, status: PresenceStatus) -> Result<(), BackendFailure> {
        self.write_presence(status).await?;
        Ok(())
    }

    async fn create_channel_impl(
        &self,
        name: &str,
        kind: ChannelKind,
        participants: &[String],
    ) -> Result<Channel, BackendFailure> {
        let id = kind.qualify(&Uuid::now_v7().to_string());
        let node = ChannelNode {
            name: name.to_string(),
            kind,
            created_at: Utc::now(),
            creator: self.user_id().to_string(),
            metadata: Metadata::new(),
        };
        let path = self.paths.channel(&id);
        let value = encode(&path, &node)?;
        self.client.put(&path, value).await?;

        let mut members: BTreeSet<String> = participants.iter().cloned().collect();
        members.insert(self.user_id().to_string());
        for member in &members {
            self.set_membership(&id, member, true).await?;
        }
        Ok(node.into_channel(&id, members))
    }

    async fn join_impl(&self, channel_id: &str) -> Result<Channel, BackendFailure> {
        self.channel_node(channel_id).await?;
        self.set_membership(channel_id, self.user_id(), true).await?;
        Ok(self.load_channel(channel_id).await?)
    }

    async fn leave_impl(&self, channel_id: &str) -> Result<(), BackendFailure> {
        self.channel_node(channel_id).await?;
        self.set_membership(channel_id, self.user_id(), false).await?;
        Ok(())
    }

    async fn list_channels_impl(&self) -> Result<Vec<Channel>, BackendFailure> {
        let memberships = self.client.list(&self.paths.memberships(self.user_id())).await?;
        let mut channels = Vec::new();
        for (channel_id, flag) in memberships {
            if !is_member(&flag) {
                continue;
            }
            match self.load_channel(&channel_id).await {
                Ok(channel) => channels.push(channel),
                Err(GraphError::ChannelNotFound(_)) => {
                    debug!(channel = %channel_id, "membership points at a missing channel");
                }
                Err(e) => return Err(e.into()),
            }
        }
        channels.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(channels)
    }

    async fn list_users_impl(&self, channel_id: &str) -> Result<Vec<User>, BackendFailure> {
        self.channel_node(channel_id).await?;
        let mut users = Vec::new();
        for user_id in self.member_ids(channel_id).await? {
            let path = self.paths.user(&user_id);
            let node = match self.client.get(&path).await? {
                Some(value) => decode::<UserNode>(&path, value)?,
                None => None,
            };
            users.push(match node {
                Some(node) => node.into_user(&user_id),
                None => User::unknown(&user_id),
            });
        }
        Ok(users)
    }

    async fn edit_impl(
        &self,
        channel_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Message, BackendFailure> {
        let mut message = self.own_message(channel_id, message_id).await?;
        message.content = content.to_string();
        message.edited_at = Some(Utc::now());
        self.write_message(&message).await?;
        Ok(message)
    }

    async fn delete_impl(&self, channel_id: &str, message_id: &str) -> Result<(), BackendFailure> {
        self.own_message(channel_id, message_id).await?;
        self.client
            .put(&self.paths.message(channel_id, message_id), Value::Null)
            .await?;
        Ok(())
    }

    async fn react_impl(
        &self,
        channel_id: &str,
        message_id: &str,
        reaction: &str,
    ) -> Result<(), BackendFailure> {
        self.load_message(channel_id, message_id).await?;
        let path = self
            .paths
            .reaction(channel_id, message_id, reaction, self.user_id());
        self.client.put(&path, Value::Bool(true)).await?;
        Ok(())
    }

    async fn mark_read_impl(
        &self,
        channel_id: &str,
        message_ids: &[String],
    ) -> Result<(), BackendFailure> {
        let now = Value::String(Utc::now().to_rfc3339());
        for message_id in message_ids {
            let path = self.paths.receipt(channel_id, message_id, self.user_id());
            self.client.put(&path, now.clone()).await?;
        }
        Ok(())
    }

    async fn search_impl(
        &self,
        query: &str,
        channel_id: Option<&str>,
    ) -> Result<Vec<Message>, BackendFailure> {
        let channel_ids: Vec<String> = match channel_id {
            Some(id) => {
                self.channel_node(id).await?;
                vec![id.to_string()]
            }
            None => self
                .client
                .list(&self.paths.memberships(self.user_id()))
                .await?
                .into_iter()
                .filter(|(_, flag)| is_member(flag))
                .map(|(id, _)| id)
                .collect(),
        };
        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        for id in channel_ids {
            hits.extend(
                self.channel_messages(&id)
                    .await?
                    .into_iter()
                    .filter(|m| m.content.to_lowercase().contains(&needle)),
            );
        }
        hits.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(hits)
    }

    async fn invite_impl(&self, channel_id: &str, user_id: &str) -> Result<(), BackendFailure> {
        self.channel_node(channel_id).await?;
        self.require_member(channel_id).await?;
        self.set_membership(channel_id, user_id, true).await?;
        Ok(())
    }

    async fn kick_impl(&self, channel_id: &str, user_id: &str) -> Result<(), BackendFailure> {
        let node = self.channel_node(channel_id).await?;
        if node.creator != self.user_id() && user_id != self.user_id() {
            return Err(GraphError::NotPermitted(format!(
                "only {} may remove members of {}",
                node.creator, channel_id
            ))
            .into());
        }
        self.set_membership(channel_id, user_id, false).await?;
        Ok(())
    }

    async fn set_metadata_impl(
        &self,
        channel_id: &str,
        metadata: &Metadata,
    ) -> Result<(), BackendFailure> {
        let mut node = self.channel_node(channel_id).await?;
        self.require_member(channel_id).await?;
        node.metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        let path = self.paths.channel(channel_id);
        let value = encode(&path, &node)?;
        self.client.put(&path, value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use unichat_adapter::ChatAdapter;
    use unichat_core::ErrorCode;

    use super::*;
    use crate::memory::MemoryGraph;

    async fn adapter_for(client: Arc<MemoryGraph>) -> GraphAdapter {
        let adapter = GraphShim::new(client, "unichat").into_adapter();
        adapter.connect().await.unwrap();
        adapter
    }

    async fn pair() -> (GraphAdapter, GraphAdapter) {
        let alice = Arc::new(MemoryGraph::new("u-alice", "alice"));
        let bob = Arc::new(MemoryGraph::sharing(&alice, "u-bob", "bob"));
        (adapter_for(alice).await, adapter_for(bob).await)
    }

    #[tokio::test]
    async fn members_see_each_others_messages() {
        let (alice, bob) = pair().await;
        let channel = alice
            .create_channel("core", ChannelKind::Team, &["u-bob".to_string()])
            .await
            .unwrap();
        assert!(channel.id.starts_with("team-"));
        assert_eq!(channel.participants.len(), 2);

        alice
            .send_message(&channel.id, &MessageDraft::text("standup?"))
            .await
            .unwrap();
        bob.send_message(&channel.id, &MessageDraft::text("in 5"))
            .await
            .unwrap();

        let history = bob.get_messages(&channel.id, None, None).await.unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["standup?", "in 5"]);
        assert_eq!(bob.get_channels().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn only_the_sender_edits_or_deletes() {
        let (alice, bob) = pair().await;
        let channel = alice
            .create_channel("core", ChannelKind::Team, &["u-bob".to_string()])
            .await
            .unwrap();
        let message = alice
            .send_message(&channel.id, &MessageDraft::text("draft"))
            .await
            .unwrap();

        let err = bob
            .edit_message(&channel.id, &message.id, "hijack")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);

        let edited = alice
            .edit_message(&channel.id, &message.id, "final")
            .await
            .unwrap();
        assert_eq!(edited.content, "final");
        assert!(edited.edited_at.is_some());

        alice.delete_message(&channel.id, &message.id).await.unwrap();
        assert!(alice
            .get_messages(&channel.id, None, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn history_pages_backwards() {
        let (alice, _bob) = pair().await;
        let channel = alice
            .create_channel("log", ChannelKind::Thread, &[])
            .await
            .unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            let m = alice
                .send_message(&channel.id, &MessageDraft::text(format!("m{}", i)))
                .await
                .unwrap();
            ids.push(m.id);
        }

        let latest = alice.get_messages(&channel.id, Some(2), None).await.unwrap();
        assert_eq!(latest[0].content, "m3");
        assert_eq!(latest[1].content, "m4");

        let older = alice
            .get_messages(&channel.id, Some(2), Some(&ids[3]))
            .await
            .unwrap();
        assert_eq!(older[0].content, "m1");
        assert_eq!(older[1].content, "m2");
    }

    #[tokio::test]
    async fn subscription_skips_edits_and_tombstones() {
        let (alice, bob) = pair().await;
        let channel = alice
            .create_channel("core", ChannelKind::Team, &["u-bob".to_string()])
            .await
            .unwrap();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let sub = bob
            .subscribe_to_messages(
                &channel.id,
                Arc::new(move |_: Message| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        let m = alice
            .send_message(&channel.id, &MessageDraft::text("one"))
            .await
            .unwrap();
        alice.edit_message(&channel.id, &m.id, "uno").await.unwrap();
        alice.delete_message(&channel.id, &m.id).await.unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        alice
            .send_message(&channel.id, &MessageDraft::text("two"))
            .await
            .unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn presence_updates_reach_channel_members() {
        let (alice, bob) = pair().await;
        let channel = alice
            .create_channel("core", ChannelKind::Team, &["u-bob".to_string()])
            .await
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = alice
            .subscribe_to_user_presence(
                &channel.id,
                Arc::new(move |user: User| sink.lock().unwrap().push(user.presence)),
            )
            .await
            .unwrap();

        bob.set_presence(PresenceStatus::Away).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![PresenceStatus::Away]);
        let users = alice.get_users(&channel.id).await.unwrap();
        let bob_user = users.iter().find(|u| u.id == "u-bob").unwrap();
        assert_eq!(bob_user.presence, PresenceStatus::Away);
    }

    #[tokio::test]
    async fn search_spans_joined_channels() {
        let (alice, _bob) = pair().await;
        let a = alice.create_channel("a", ChannelKind::Team, &[]).await.unwrap();
        let b = alice.create_channel("b", ChannelKind::Thread, &[]).await.unwrap();
        alice
            .send_message(&a.id, &MessageDraft::text("Deploy at noon"))
            .await
            .unwrap();
        alice
            .send_message(&b.id, &MessageDraft::text("deploy rolled back"))
            .await
            .unwrap();
        alice
            .send_message(&b.id, &MessageDraft::text("lunch"))
            .await
            .unwrap();

        let hits = alice.search_messages("deploy", None).await.unwrap();
        assert_eq!(hits.len(), 2);
        let scoped = alice.search_messages("deploy", Some(&b.id)).await.unwrap();
        assert_eq!(scoped.len(), 1);
    }

    #[tokio::test]
    async fn kick_requires_the_creator() {
        let (alice, bob) = pair().await;
        let channel = alice
            .create_channel("core", ChannelKind::Team, &["u-bob".to_string()])
            .await
            .unwrap();
        let err = bob.remove_user(&channel.id, "u-alice").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);

        alice.remove_user(&channel.id, "u-bob").await.unwrap();
        assert!(bob.get_channels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_timeouts_are_classified() {
        let client = Arc::new(MemoryGraph::new("u-alice", "alice"));
        let adapter = adapter_for(client.clone()).await;
        let channel = adapter
            .create_channel("core", ChannelKind::Team, &[])
            .await
            .unwrap();
        client.fail_next(GraphError::Timeout(250));

        let err = adapter
            .send_message(&channel.id, &MessageDraft::text("hi"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionTimeout);
        assert!(err.recoverable);
    }
}
