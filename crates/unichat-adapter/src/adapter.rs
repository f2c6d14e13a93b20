use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use unichat_core::{
    classify, paths, AttachmentUpload, BackendFailure, Capabilities, Channel, ChannelKind,
    ChatError, ConnectionState, ErrorCode, ErrorContext, ErrorHandler, Message, MessageCallback,
    MessageDraft, Metadata, PresenceCallback, PresenceStatus, Result, TracingErrorHandler,
    UploadedAttachment, User, DEFAULT_HISTORY_LIMIT,
};

use crate::shim::{BackendShim, DeliveryGate, Sink};
use crate::subscription::{Subscription, SubscriptionRegistry};

/// Backend-agnostic contract every adapter exposes.
///
/// Object safe, so the router can hold adapters as `Arc<dyn ChatAdapter>`.
/// The only implementation is [`Adapter`], which wraps a [`BackendShim`].
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Stable lowercase backend name (e.g. `"graph"`).
    fn name(&self) -> &str;

    fn capabilities(&self) -> &Capabilities;

    fn has_capability(&self, path: &str) -> bool {
        self.capabilities().has_capability(path)
    }

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn connect(&self) -> Result<()>;

    /// Tear down every subscription, then close the backend connection.
    async fn disconnect(&self) -> Result<()>;

    async fn send_message(&self, channel_id: &str, draft: &MessageDraft) -> Result<Message>;

    /// Oldest-first page of history. `limit` defaults to 50.
    async fn get_messages(
        &self,
        channel_id: &str,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> Result<Vec<Message>>;

    /// Deliver new messages of `channel_id` to `callback`.
    ///
    /// Replaces any earlier subscription to the same channel on this adapter
    /// once the new one is in place; if subscribing fails the earlier one
    /// keeps running.
    async fn subscribe_to_messages(
        &self,
        channel_id: &str,
        callback: MessageCallback,
    ) -> Result<Subscription>;

    async fn subscribe_to_user_presence(
        &self,
        channel_id: &str,
        callback: PresenceCallback,
    ) -> Result<Subscription>;

    async fn create_channel(
        &self,
        name: &str,
        kind: ChannelKind,
        participants: &[String],
    ) -> Result<Channel>;

    async fn join_channel(&self, channel_id: &str) -> Result<Channel>;

    async fn leave_channel(&self, channel_id: &str) -> Result<()>;

    async fn get_channels(&self) -> Result<Vec<Channel>>;

    async fn get_users(&self, channel_id: &str) -> Result<Vec<User>>;

    async fn edit_message(&self, channel_id: &str, message_id: &str, content: &str)
        -> Result<Message>;

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<()>;

    async fn add_reaction(&self, channel_id: &str, message_id: &str, reaction: &str)
        -> Result<()>;

    async fn mark_messages_as_read(&self, channel_id: &str, message_ids: &[String]) -> Result<()>;

    async fn search_messages(&self, query: &str, channel_id: Option<&str>) -> Result<Vec<Message>>;

    async fn upload_attachment(&self, upload: &AttachmentUpload) -> Result<UploadedAttachment>;

    async fn invite_user(&self, channel_id: &str, user_id: &str) -> Result<()>;

    async fn remove_user(&self, channel_id: &str, user_id: &str) -> Result<()>;

    async fn set_channel_metadata(&self, channel_id: &str, metadata: &Metadata) -> Result<()>;

    async fn set_presence(&self, status: PresenceStatus) -> Result<()>;
}

/// Adapter skeleton: connection check, capability gating and error
/// classification around one backend shim.
pub struct Adapter<S: BackendShim> {
    shim: S,
    handler: Arc<dyn ErrorHandler>,
    state: Mutex<ConnectionState>,
    messages: Arc<SubscriptionRegistry>,
    presence: Arc<SubscriptionRegistry>,
}

impl<S: BackendShim> Adapter<S> {
    /// Wrap `shim`, logging classified errors through `tracing`.
    pub fn new(shim: S) -> Self {
        Self::with_error_handler(shim, Arc::new(TracingErrorHandler))
    }

    pub fn with_error_handler(shim: S, handler: Arc<dyn ErrorHandler>) -> Self {
        Self {
            shim,
            handler,
            state: Mutex::new(ConnectionState::Disconnected),
            messages: Arc::new(SubscriptionRegistry::default()),
            presence: Arc::new(SubscriptionRegistry::default()),
        }
    }

    pub fn into_shared(self) -> Arc<dyn ChatAdapter> {
        Arc::new(self)
    }

    pub fn create_context(&self, operation: &str) -> ErrorContext {
        ErrorContext::new(self.shim.name(), operation)
    }

    /// Await a backend primitive; classify and report any failure.
    pub async fn execute_with_error_handling<T, F>(&self, context: ErrorContext, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, BackendFailure>>,
    {
        match fut.await {
            Ok(value) => Ok(value),
            Err(failure) => Err(self.report(classify(failure, context))),
        }
    }

    /// Raise feature-not-supported unless the capability path is present.
    pub fn require_capability(&self, context: &ErrorContext, path: &str) -> Result<()> {
        if self.shim.capabilities().has_capability(path) {
            return Ok(());
        }
        Err(self.reject(context, ChatError::feature_not_supported(path)))
    }

    fn ensure_connected(&self, context: &ErrorContext) -> Result<()> {
        if self.current_state() == ConnectionState::Connected {
            return Ok(());
        }
        Err(self.reject(context, ChatError::not_connected(self.shim.name())))
    }

    /// Connection check followed by an optional capability check.
    fn guard(&self, context: &ErrorContext, path: Option<&str>) -> Result<()> {
        self.ensure_connected(context)?;
        match path {
            Some(path) => self.require_capability(context, path),
            None => Ok(()),
        }
    }

    fn reject(&self, context: &ErrorContext, err: ChatError) -> ChatError {
        self.report(err.with_context(context.clone()))
    }

    fn report(&self, err: ChatError) -> ChatError {
        self.handler.handle(&err);
        err
    }

    fn current_state(&self) -> ConnectionState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = std::mem::replace(&mut *state, next.clone());
        debug!(backend = %self.shim.name(), from = %previous, to = %next, "adapter state change");
    }
}

#[async_trait]
impl<S: BackendShim> ChatAdapter for Adapter<S> {
    fn name(&self) -> &str {
        self.shim.name()
    }

    fn capabilities(&self) -> &Capabilities {
        self.shim.capabilities()
    }

    fn state(&self) -> ConnectionState {
        self.current_state()
    }

    async fn connect(&self) -> Result<()> {
        if self.current_state() == ConnectionState::Connected {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);
        let context = self.create_context("connect");
        match self
            .execute_with_error_handling(context, self.shim.connect_impl())
            .await
        {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!(backend = %self.shim.name(), "adapter connected");
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::Error(err.message.clone()));
                Err(err)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.messages.clear();
        self.presence.clear();
        if self.current_state() == ConnectionState::Disconnected {
            return Ok(());
        }
        let context = self.create_context("disconnect");
        let result = self
            .execute_with_error_handling(context, self.shim.disconnect_impl())
            .await;
        self.set_state(ConnectionState::Disconnected);
        info!(backend = %self.shim.name(), "adapter disconnected");
        result
    }

    async fn send_message(&self, channel_id: &str, draft: &MessageDraft) -> Result<Message> {
        let context = self.create_context("send_message").with_channel(channel_id);
        self.guard(&context, Some(paths::MESSAGES_SEND))?;
        self.shim
            .capabilities()
            .check_message(&draft.content)
            .map_err(|e| self.reject(&context, e))?;
        if draft.reply_to.is_some() {
            self.require_capability(&context, paths::MESSAGES_REPLY)?;
        }
        if !draft.attachments.is_empty() {
            self.require_capability(&context, paths::ATTACHMENTS_UPLOAD)?;
        }
        self.execute_with_error_handling(context, self.shim.send_impl(channel_id, draft))
            .await
    }

    async fn get_messages(
        &self,
        channel_id: &str,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> Result<Vec<Message>> {
        let context = self.create_context("get_messages").with_channel(channel_id);
        self.guard(&context, None)?;
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.execute_with_error_handling(
            context,
            self.shim.fetch_messages_impl(channel_id, limit, before),
        )
        .await
    }

    async fn subscribe_to_messages(
        &self,
        channel_id: &str,
        callback: MessageCallback,
    ) -> Result<Subscription> {
        let context = self
            .create_context("subscribe_to_messages")
            .with_channel(channel_id);
        self.guard(&context, None)?;
        let gate = DeliveryGate::new();
        let sink = Sink::new(callback, Arc::clone(&gate));
        let cleanup = self
            .execute_with_error_handling(context, self.shim.subscribe_messages_impl(channel_id, sink))
            .await?;
        debug!(backend = %self.shim.name(), channel = %channel_id, "message subscription installed");
        Ok(self.messages.install(channel_id, gate, cleanup))
    }

    async fn subscribe_to_user_presence(
        &self,
        channel_id: &str,
        callback: PresenceCallback,
    ) -> Result<Subscription> {
        let context = self
            .create_context("subscribe_to_user_presence")
            .with_channel(channel_id);
        self.guard(&context, Some(paths::PRESENCE_GET))?;
        let gate = DeliveryGate::new();
        let sink = Sink::new(callback, Arc::clone(&gate));
        let cleanup = self
            .execute_with_error_handling(context, self.shim.subscribe_presence_impl(channel_id, sink))
            .await?;
        Ok(self.presence.install(channel_id, gate, cleanup))
    }

    async fn create_channel(
        &self,
        name: &str,
        kind: ChannelKind,
        participants: &[String],
    ) -> Result<Channel> {
        let context = self.create_context("create_channel");
        self.guard(&context, Some(paths::CHANNELS_CREATE))?;
        if name.trim().is_empty() {
            return Err(self.reject(
                &context,
                ChatError::new(ErrorCode::InvalidChannel, "channel name is empty"),
            ));
        }
        let max = self.shim.capabilities().matrix().limits.max_participants_per_channel;
        if max > 0 && participants.len() > max {
            return Err(self.reject(
                &context,
                ChatError::new(
                    ErrorCode::InvalidChannel,
                    format!("{} participants exceed the limit of {}", participants.len(), max),
                ),
            ));
        }
        let channel = self
            .execute_with_error_handling(
                context,
                self.shim.create_channel_impl(name, kind, participants),
            )
            .await?;
        info!(backend = %self.shim.name(), channel = %channel.id, kind = %kind, "channel created");
        Ok(channel)
    }

    async fn join_channel(&self, channel_id: &str) -> Result<Channel> {
        let context = self.create_context("join_channel").with_channel(channel_id);
        self.guard(&context, Some(paths::CHANNELS_JOIN))?;
        self.execute_with_error_handling(context, self.shim.join_impl(channel_id))
            .await
    }

    async fn leave_channel(&self, channel_id: &str) -> Result<()> {
        let context = self.create_context("leave_channel").with_channel(channel_id);
        self.guard(&context, Some(paths::CHANNELS_LEAVE))?;
        self.messages.release(channel_id);
        self.presence.release(channel_id);
        self.execute_with_error_handling(context, self.shim.leave_impl(channel_id))
            .await
    }

    async fn get_channels(&self) -> Result<Vec<Channel>> {
        let context = self.create_context("get_channels");
        self.guard(&context, None)?;
        self.execute_with_error_handling(context, self.shim.list_channels_impl())
            .await
    }

    async fn get_users(&self, channel_id: &str) -> Result<Vec<User>> {
        let context = self.create_context("get_users").with_channel(channel_id);
        self.guard(&context, None)?;
        self.execute_with_error_handling(context, self.shim.list_users_impl(channel_id))
            .await
    }

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Message> {
        let context = self
            .create_context("edit_message")
            .with_channel(channel_id)
            .with_message(message_id);
        self.guard(&context, Some(paths::MESSAGES_EDIT))?;
        self.shim
            .capabilities()
            .check_message(content)
            .map_err(|e| self.reject(&context, e))?;
        self.execute_with_error_handling(context, self.shim.edit_impl(channel_id, message_id, content))
            .await
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<()> {
        let context = self
            .create_context("delete_message")
            .with_channel(channel_id)
            .with_message(message_id);
        self.guard(&context, Some(paths::MESSAGES_DELETE))?;
        self.execute_with_error_handling(context, self.shim.delete_impl(channel_id, message_id))
            .await
    }

    async fn add_reaction(&self, channel_id: &str, message_id: &str, reaction: &str) -> Result<()> {
        let context = self
            .create_context("add_reaction")
            .with_channel(channel_id)
            .with_message(message_id);
        self.guard(&context, Some(paths::MESSAGES_REACT))?;
        self.execute_with_error_handling(
            context,
            self.shim.react_impl(channel_id, message_id, reaction),
        )
        .await
    }

    async fn mark_messages_as_read(&self, channel_id: &str, message_ids: &[String]) -> Result<()> {
        let context = self
            .create_context("mark_messages_as_read")
            .with_channel(channel_id);
        self.guard(&context, None)?;
        if message_ids.is_empty() {
            return Ok(());
        }
        self.execute_with_error_handling(context, self.shim.mark_read_impl(channel_id, message_ids))
            .await
    }

    async fn search_messages(&self, query: &str, channel_id: Option<&str>) -> Result<Vec<Message>> {
        let mut context = self.create_context("search_messages");
        if let Some(channel_id) = channel_id {
            context = context.with_channel(channel_id);
        }
        self.guard(&context, Some(paths::MESSAGES_SEARCH))?;
        if query.trim().is_empty() {
            return Err(self.reject(
                &context,
                ChatError::new(ErrorCode::InvalidMessage, "search query is empty"),
            ));
        }
        self.execute_with_error_handling(context, self.shim.search_impl(query, channel_id))
            .await
    }

    async fn upload_attachment(&self, upload: &AttachmentUpload) -> Result<UploadedAttachment> {
        let context = self.create_context("upload_attachment");
        self.guard(&context, Some(paths::ATTACHMENTS_UPLOAD))?;
        self.shim
            .capabilities()
            .check_upload(upload)
            .map_err(|e| self.reject(&context, e))?;
        self.execute_with_error_handling(context, self.shim.upload_impl(upload))
            .await
    }

    async fn invite_user(&self, channel_id: &str, user_id: &str) -> Result<()> {
        let context = self
            .create_context("invite_user")
            .with_channel(channel_id)
            .with_user(user_id);
        self.guard(&context, Some(paths::CHANNELS_INVITE))?;
        self.execute_with_error_handling(context, self.shim.invite_impl(channel_id, user_id))
            .await
    }

    async fn remove_user(&self, channel_id: &str, user_id: &str) -> Result<()> {
        let context = self
            .create_context("remove_user")
            .with_channel(channel_id)
            .with_user(user_id);
        self.guard(&context, Some(paths::CHANNELS_KICK))?;
        self.execute_with_error_handling(context, self.shim.kick_impl(channel_id, user_id))
            .await
    }

    async fn set_channel_metadata(&self, channel_id: &str, metadata: &Metadata) -> Result<()> {
        let context = self
            .create_context("set_channel_metadata")
            .with_channel(channel_id);
        self.guard(&context, Some(paths::CHANNELS_SET_METADATA))?;
        self.execute_with_error_handling(context, self.shim.set_metadata_impl(channel_id, metadata))
            .await
    }

    async fn set_presence(&self, status: PresenceStatus) -> Result<()> {
        let context = self.create_context("set_presence");
        self.guard(&context, Some(paths::PRESENCE_SET))?;
        if let Err(err) = self
            .execute_with_error_handling(context, self.shim.set_presence_impl(status))
            .await
        {
            warn!(backend = %self.shim.name(), status = %status, "presence update failed");
            return Err(err);
        }
        Ok(())
    }
}
