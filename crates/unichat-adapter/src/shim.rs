use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use unichat_core::{
    paths, AttachmentUpload, BackendFailure, Capabilities, Channel, ChannelKind, ChatError,
    Message, MessageDraft, Metadata, PresenceStatus, UploadedAttachment, User,
};

/// Backend-specific primitives of a concrete adapter.
///
/// A shim only translates the uniform contract into its backend's native
/// calls. It is never called directly: [`Adapter`](crate::Adapter) wraps it
/// and performs the connection check, capability gating and error
/// classification before and after every primitive.
///
/// Optional primitives default to `feature-not-supported`; a shim overrides
/// exactly the ones its [`Capabilities`] advertise.
#[async_trait]
pub trait BackendShim: Send + Sync + 'static {
    /// Stable lowercase backend name (e.g. `"relay"`), used in error contexts.
    fn name(&self) -> &str;

    /// Capability descriptor, computed once when the shim is built.
    fn capabilities(&self) -> &Capabilities;

    async fn connect_impl(&self) -> Result<(), BackendFailure>;

    async fn disconnect_impl(&self) -> Result<(), BackendFailure>;

    async fn send_impl(&self, channel_id: &str, draft: &MessageDraft)
        -> Result<Message, BackendFailure>;

    /// Return at most `limit` messages older than `before`, oldest first.
    async fn fetch_messages_impl(
        &self,
        channel_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<Message>, BackendFailure>;

    /// Start delivering new messages of `channel_id` into `sink`.
    ///
    /// The returned cleanup must stop the backend side of the subscription
    /// (close the relay subscription, drop the listener, stop the poll loop).
    async fn subscribe_messages_impl(
        &self,
        channel_id: &str,
        sink: MessageSink,
    ) -> Result<SubscriptionCleanup, BackendFailure>;

    async fn create_channel_impl(
        &self,
        name: &str,
        kind: ChannelKind,
        participants: &[String],
    ) -> Result<Channel, BackendFailure>;

    async fn join_impl(&self, channel_id: &str) -> Result<Channel, BackendFailure>;

    async fn leave_impl(&self, channel_id: &str) -> Result<(), BackendFailure>;

    async fn list_channels_impl(&self) -> Result<Vec<Channel>, BackendFailure>;

    async fn list_users_impl(&self, channel_id: &str) -> Result<Vec<User>, BackendFailure>;

    async fn subscribe_presence_impl(
        &self,
        _channel_id: &str,
        _sink: PresenceSink,
    ) -> Result<SubscriptionCleanup, BackendFailure> {
        Err(unsupported(paths::PRESENCE_GET))
    }

    async fn set_presence_impl(&self, _status: PresenceStatus) -> Result<(), BackendFailure> {
        Err(unsupported(paths::PRESENCE_SET))
    }

    async fn edit_impl(
        &self,
        _channel_id: &str,
        _message_id: &str,
        _content: &str,
    ) -> Result<Message, BackendFailure> {
        Err(unsupported(paths::MESSAGES_EDIT))
    }

    async fn delete_impl(&self, _channel_id: &str, _message_id: &str) -> Result<(), BackendFailure> {
        Err(unsupported(paths::MESSAGES_DELETE))
    }

    async fn react_impl(
        &self,
        _channel_id: &str,
        _message_id: &str,
        _reaction: &str,
    ) -> Result<(), BackendFailure> {
        Err(unsupported(paths::MESSAGES_REACT))
    }

    /// Read receipts are best effort; backends without them accept and drop.
    async fn mark_read_impl(
        &self,
        _channel_id: &str,
        _message_ids: &[String],
    ) -> Result<(), BackendFailure> {
        Ok(())
    }

    async fn search_impl(
        &self,
        _query: &str,
        _channel_id: Option<&str>,
    ) -> Result<Vec<Message>, BackendFailure> {
        Err(unsupported(paths::MESSAGES_SEARCH))
    }

    async fn upload_impl(
        &self,
        _upload: &AttachmentUpload,
    ) -> Result<UploadedAttachment, BackendFailure> {
        Err(unsupported(paths::ATTACHMENTS_UPLOAD))
    }

    async fn invite_impl(&self, _channel_id: &str, _user_id: &str) -> Result<(), BackendFailure> {
        Err(unsupported(paths::CHANNELS_INVITE))
    }

    async fn kick_impl(&self, _channel_id: &str, _user_id: &str) -> Result<(), BackendFailure> {
        Err(unsupported(paths::CHANNELS_KICK))
    }

    async fn set_metadata_impl(
        &self,
        _channel_id: &str,
        _metadata: &Metadata,
    ) -> Result<(), BackendFailure> {
        Err(unsupported(paths::CHANNELS_SET_METADATA))
    }
}

fn unsupported(path: &str) -> BackendFailure {
    BackendFailure::Classified(ChatError::feature_not_supported(path))
}

thread_local! {
    static DELIVERING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Open/closed switch shared by a [`Sink`] and the subscription that owns it.
///
/// A delivery holds the read side for as long as the callback runs and
/// [`close`](DeliveryGate::close) takes the write side, so once `close`
/// returns no callback of this gate is still running on another thread.
/// A callback may close its own gate.
#[derive(Debug)]
pub struct DeliveryGate {
    open: AtomicBool,
    in_flight: RwLock<()>,
}

impl DeliveryGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            in_flight: RwLock::new(()),
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Close the gate and wait out running callbacks. Returns `true` only for
    /// the call that actually closed it.
    pub fn close(&self) -> bool {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        if !DELIVERING.with(|d| d.borrow().contains(&self.key())) {
            drop(self.in_flight.write().unwrap_or_else(PoisonError::into_inner));
        }
        was_open
    }

    fn pass(&self, deliver: impl FnOnce()) -> bool {
        let _guard = self.in_flight.read().unwrap_or_else(PoisonError::into_inner);
        if !self.is_open() {
            return false;
        }
        let _mark = DeliveryMark::enter(self.key());
        deliver();
        true
    }

    fn key(&self) -> usize {
        self as *const Self as usize
    }
}

/// Marks the current thread as inside a callback of one gate.
struct DeliveryMark(usize);

impl DeliveryMark {
    fn enter(key: usize) -> Self {
        DELIVERING.with(|d| d.borrow_mut().push(key));
        Self(key)
    }
}

impl Drop for DeliveryMark {
    fn drop(&mut self) {
        DELIVERING.with(|d| {
            let mut delivering = d.borrow_mut();
            if let Some(pos) = delivering.iter().rposition(|k| *k == self.0) {
                delivering.remove(pos);
            }
        });
    }
}

/// Delivery end of a subscription, handed to the shim.
///
/// Once the owning subscription is closed the sink drops every value and
/// [`deliver`](Sink::deliver) returns `false`, so push tasks and poll loops
/// can stop on their own.
pub struct Sink<T> {
    callback: Arc<dyn Fn(T) + Send + Sync>,
    gate: Arc<DeliveryGate>,
}

pub type MessageSink = Sink<Message>;
pub type PresenceSink = Sink<User>;

impl<T> Sink<T> {
    pub fn new(callback: Arc<dyn Fn(T) + Send + Sync>, gate: Arc<DeliveryGate>) -> Self {
        Self { callback, gate }
    }

    /// Hand `value` to the subscriber. Returns `false` if the subscription is gone.
    pub fn deliver(&self, value: T) -> bool {
        self.gate.pass(|| (self.callback)(value))
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
            gate: Arc::clone(&self.gate),
        }
    }
}

impl<T> fmt::Debug for Sink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Backend-side teardown of a subscription. Runs exactly once: explicitly
/// through [`run`](SubscriptionCleanup::run) or when dropped.
pub struct SubscriptionCleanup(Option<Box<dyn FnOnce() + Send + Sync>>);

impl SubscriptionCleanup {
    pub fn new(cleanup: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(cleanup)))
    }

    pub fn noop() -> Self {
        Self(None)
    }

    pub fn run(mut self) {
        if let Some(cleanup) = self.0.take() {
            cleanup();
        }
    }
}

impl Drop for SubscriptionCleanup {
    fn drop(&mut self) {
        if let Some(cleanup) = self.0.take() {
            cleanup();
        }
    }
}

impl fmt::Debug for SubscriptionCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SubscriptionCleanup")
            .field(&self.0.is_some())
            .finish()
    }
}
