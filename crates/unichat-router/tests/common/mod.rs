//! Hand-written fake backend shared by the router integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use unichat_adapter::{Adapter, BackendShim, ChatAdapter, MessageSink, SubscriptionCleanup};
use unichat_core::capability::{
    AttachmentCapabilities, BackendInfo, ChannelCapabilities, Limits, MessagingCapabilities,
    PresenceCapabilities,
};
use unichat_core::{
    AttachmentUpload, BackendFailure, Capabilities, CapabilityMatrix, Channel, ChannelKind,
    ChatError, DeliveryStatus, ErrorCode, Message, MessageDraft, Metadata, UploadedAttachment,
    User,
};

/// Matrix with every operation enabled and small limits.
pub fn full_matrix(name: &str) -> CapabilityMatrix {
    CapabilityMatrix {
        backend: BackendInfo {
            name: name.to_string(),
            version: "test".to_string(),
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
        attachments: AttachmentCapabilities {
            upload: true,
            download: true,
            max_size: 1024,
            supported_types: Vec::new(),
        },
        limits: Limits {
            max_message_length: 1_000,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn failure(code: ErrorCode) -> ChatError {
    ChatError::new(code, format!("injected {}", code))
}

#[derive(Default)]
struct FakeState {
    calls: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<ChatError>>,
    always: Mutex<Option<ChatError>>,
    connect_failure: Mutex<Option<ChatError>>,
    channels: Mutex<Vec<Channel>>,
    messages: Mutex<Vec<Message>>,
    sinks: Mutex<Vec<(String, MessageSink)>>,
    counter: AtomicU64,
}

/// Test-side handle on a fake backend whose adapter is owned by the router.
#[derive(Clone)]
pub struct FakeBackend {
    name: &'static str,
    state: Arc<FakeState>,
}

impl FakeBackend {
    pub fn new(name: &'static str) -> (Self, Arc<dyn ChatAdapter>) {
        Self::with_matrix(name, full_matrix(name))
    }

    pub fn with_matrix(
        name: &'static str,
        matrix: CapabilityMatrix,
    ) -> (Self, Arc<dyn ChatAdapter>) {
        let state = Arc::new(FakeState::default());
        let shim = FakeShim {
            name,
            caps: Capabilities::new(matrix),
            state: Arc::clone(&state),
        };
        (Self { name, state }, Adapter::new(shim).into_shared())
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| *c == op).count()
    }

    pub fn fail_next(&self, err: ChatError) {
        self.state.failures.lock().unwrap().push_back(err);
    }

    pub fn fail_always(&self, err: ChatError) {
        *self.state.always.lock().unwrap() = Some(err);
    }

    pub fn recover(&self) {
        *self.state.always.lock().unwrap() = None;
        self.state.failures.lock().unwrap().clear();
    }

    pub fn fail_connect(&self, err: ChatError) {
        *self.state.connect_failure.lock().unwrap() = Some(err);
    }

    /// Push an incoming message to every live subscription of `channel_id`.
    pub fn emit(&self, channel_id: &str, content: &str) -> usize {
        let message = self.state.message(self.name, channel_id, content);
        let sinks = self.state.sinks.lock().unwrap().clone();
        sinks
            .iter()
            .filter(|(channel, _)| channel == channel_id)
            .filter(|(_, sink)| sink.deliver(message.clone()))
            .count()
    }
}

impl FakeState {
    fn record(&self, op: &str) -> Result<(), BackendFailure> {
        self.calls.lock().unwrap().push(op.to_string());
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(BackendFailure::Classified(err));
        }
        match self.always.lock().unwrap().clone() {
            Some(err) => Err(BackendFailure::Classified(err)),
            None => Ok(()),
        }
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn message(&self, backend: &str, channel_id: &str, content: &str) -> Message {
        Message {
            id: format!("{}.m{}", backend, self.next_id()),
            channel_id: channel_id.to_string(),
            sender_id: "me".to_string(),
            sender_name: "me".to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            message_type: Default::default(),
            status: DeliveryStatus::Sent,
            attachments: Vec::new(),
            reply_to: None,
            edited_at: None,
            metadata: Metadata::new(),
        }
    }
}

struct FakeShim {
    name: &'static str,
    caps: Capabilities,
    state: Arc<FakeState>,
}

#[async_trait]
impl BackendShim for FakeShim {
    fn name(&self) -> &str {
        self.name
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    async fn connect_impl(&self) -> Result<(), BackendFailure> {
        self.state.calls.lock().unwrap().push("connect".to_string());
        match self.state.connect_failure.lock().unwrap().clone() {
            Some(err) => Err(BackendFailure::Classified(err)),
            None => Ok(()),
        }
    }

    async fn disconnect_impl(&self) -> Result<(), BackendFailure> {
        self.state.calls.lock().unwrap().push("disconnect".to_string());
        Ok(())
    }

    async fn send_impl(
        &self,
        channel_id: &str,
        draft: &MessageDraft,
    ) -> Result<Message, BackendFailure> {
        self.state.record("send")?;
        let mut message = self.state.message(self.name, channel_id, &draft.content);
        message.attachments = draft.attachments.clone();
        self.state.messages.lock().unwrap().push(message.clone());
        Ok(message)
    }

    async fn fetch_messages_impl(
        &self,
        channel_id: &str,
        limit: usize,
        _before: Option<&str>,
    ) -> Result<Vec<Message>, BackendFailure> {
        self.state.record("fetch")?;
        let messages: Vec<Message> = self
            .state
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.channel_id == channel_id)
            .cloned()
            .collect();
        let skip = messages.len().saturating_sub(limit);
        Ok(messages[skip..].to_vec())
    }

    async fn subscribe_messages_impl(
        &self,
        channel_id: &str,
        sink: MessageSink,
    ) -> Result<SubscriptionCleanup, BackendFailure> {
        self.state.record("subscribe")?;
        self.state
            .sinks
            .lock()
            .unwrap()
            .push((channel_id.to_string(), sink));
        Ok(SubscriptionCleanup::noop())
    }

    async fn create_channel_impl(
        &self,
        name: &str,
        kind: ChannelKind,
        participants: &[String],
    ) -> Result<Channel, BackendFailure> {
        self.state.record("create")?;
        let channel = Channel {
            // no kind prefix, so routing has to come from the registry
            id: format!("{}/{}", self.name, self.state.next_id()),
            name: name.to_string(),
            kind,
            participants: participants.iter().cloned().collect::<BTreeSet<_>>(),
            created_at: Utc::now(),
            backend: self.name.to_string(),
            metadata: Metadata::new(),
        };
        self.state.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn join_impl(&self, channel_id: &str) -> Result<Channel, BackendFailure> {
        self.state.record("join")?;
        self.state
            .channels
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == channel_id)
            .cloned()
            .ok_or_else(|| {
                BackendFailure::Classified(ChatError::new(
                    ErrorCode::InvalidChannel,
                    format!("no channel {}", channel_id),
                ))
            })
    }

    async fn leave_impl(&self, _channel_id: &str) -> Result<(), BackendFailure> {
        self.state.record("leave")
    }

    async fn list_channels_impl(&self) -> Result<Vec<Channel>, BackendFailure> {
        self.state.record("list")?;
        Ok(self.state.channels.lock().unwrap().clone())
    }

    async fn list_users_impl(&self, _channel_id: &str) -> Result<Vec<User>, BackendFailure> {
        self.state.record("users")?;
        Ok(vec![User::unknown("me")])
    }

    async fn delete_impl(&self, _channel_id: &str, _message_id: &str) -> Result<(), BackendFailure> {
        self.state.record("delete")
    }

    async fn mark_read_impl(
        &self,
        _channel_id: &str,
        _message_ids: &[String],
    ) -> Result<(), BackendFailure> {
        self.state.record("mark_read")
    }

    async fn search_impl(
        &self,
        query: &str,
        _channel_id: Option<&str>,
    ) -> Result<Vec<Message>, BackendFailure> {
        self.state.record("search")?;
        Ok(self
            .state
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.content.contains(query))
            .cloned()
            .collect())
    }

    async fn upload_impl(
        &self,
        upload: &AttachmentUpload,
    ) -> Result<UploadedAttachment, BackendFailure> {
        self.state.record("upload")?;
        let id = format!("{}.blob{}", self.name, self.state.next_id());
        Ok(UploadedAttachment {
            url: format!("fake://{}/{}", id, upload.name),
            id,
        })
    }
}
