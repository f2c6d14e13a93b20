use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use unichat_adapter::{ChatAdapter, Subscription};
use unichat_core::{
    paths, retry_with, Attachment, AttachmentUpload, BackendName, Capabilities, Channel,
    ChannelKind, ChatError, ConfigError, ConnectionState, ErrorCode, ErrorContext,
    FederationConfig, Message, MessageCallback, MessageDraft, Metadata, PresenceCallback, Result,
    RetryPolicy, Severity, UploadedAttachment, User,
};

use crate::builder::RouterBuilder;
use crate::events::RouterEvent;
use crate::fanout::{aggregate, FanOut};
use crate::registry::ChannelRegistry;

/// Backend name used in the context of errors the router raises itself.
pub const ROUTER: &str = "router";

const EVENT_CAPACITY: usize = 64;

/// One distinct adapter and the kinds routed to it.
pub(crate) struct Backend {
    pub(crate) adapter: Arc<dyn ChatAdapter>,
    pub(crate) kinds: Vec<ChannelKind>,
    /// Every kind of this adapter is optional.
    pub(crate) optional: bool,
}

impl Backend {
    fn name(&self) -> &str {
        self.adapter.name()
    }
}

/// Routes every operation to the adapter that owns the channel's kind.
///
/// Dispatched calls run inside the retry loop; disconnecting cancels any
/// retry wait still pending. A critical failure takes the adapter's kinds
/// out of service (degraded) until the next connect.
pub struct Router {
    backends: Vec<Backend>,
    routes: BTreeMap<ChannelKind, usize>,
    channels: ChannelRegistry,
    policy: RetryPolicy,
    state: Mutex<ConnectionState>,
    /// Kinds out of service: optional kinds whose adapter failed to connect,
    /// and degraded kinds. Value is the failure that disabled the kind.
    unavailable: DashMap<ChannelKind, ChatError>,
    cancel: Mutex<CancellationToken>,
    events: broadcast::Sender<RouterEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Router {
    pub(crate) fn new(
        backends: Vec<Backend>,
        routes: BTreeMap<ChannelKind, usize>,
        policy: RetryPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backends,
            routes,
            channels: ChannelRegistry::new(),
            policy,
            state: Mutex::new(ConnectionState::Disconnected),
            unavailable: DashMap::new(),
            cancel: Mutex::new(CancellationToken::new()),
            events,
        }
    }

    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn from_config(
        config: &FederationConfig,
        adapters: &HashMap<BackendName, Arc<dyn ChatAdapter>>,
    ) -> std::result::Result<Self, ConfigError> {
        RouterBuilder::from_config(config, adapters)?.build()
    }

    // ── state & introspection ────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        lock(&self.state).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to router events. Only events sent after this call are seen.
    pub fn events(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn routed_kinds(&self) -> Vec<ChannelKind> {
        self.routes.keys().copied().collect()
    }

    /// Capabilities of the adapter `kind` is routed to.
    pub fn capabilities(&self, kind: ChannelKind) -> Option<&Capabilities> {
        self.backend(kind).map(|b| b.adapter.capabilities())
    }

    /// Name of the backend `kind` is routed to.
    pub fn backend_for(&self, kind: ChannelKind) -> Option<&str> {
        self.backend(kind).map(Backend::name)
    }

    /// `false` for kinds that are unrouted, disabled or degraded.
    pub fn is_available(&self, kind: ChannelKind) -> bool {
        self.routes.contains_key(&kind) && !self.unavailable.contains_key(&kind)
    }

    /// Kind the router would route `channel_id` by.
    pub fn channel_kind(&self, channel_id: &str) -> Option<ChannelKind> {
        self.channels.resolve(channel_id)
    }

    fn backend(&self, kind: ChannelKind) -> Option<&Backend> {
        self.routes.get(&kind).map(|&index| &self.backends[index])
    }

    // ── lifecycle ────────────────────────────────────────────────────────

    /// Connect every distinct adapter concurrently.
    ///
    /// A failing adapter fails the whole router unless all of its kinds are
    /// optional; in that case only its kinds are disabled. On failure the
    /// adapters that did connect are disconnected again.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.unavailable.clear();
        *lock(&self.cancel) = CancellationToken::new();
        self.set_state(ConnectionState::Connecting);

        let results = join_all(self.backends.iter().map(|b| b.adapter.connect())).await;

        let mut fatal: Option<ChatError> = None;
        let mut connected = Vec::new();
        for (backend, result) in self.backends.iter().zip(results) {
            match result {
                Ok(()) => connected.push(backend),
                Err(err) if backend.optional => {
                    warn!(
                        backend = %backend.name(),
                        kinds = ?backend.kinds,
                        error = %err,
                        "optional backend failed to connect, disabling its kinds"
                    );
                    for &kind in &backend.kinds {
                        self.unavailable.insert(kind, err.clone());
                    }
                    self.emit(RouterEvent::AdapterFailed {
                        backend: backend.name().to_string(),
                        error: err,
                    });
                }
                Err(err) => {
                    error!(backend = %backend.name(), error = %err, "backend failed to connect");
                    self.emit(RouterEvent::AdapterFailed {
                        backend: backend.name().to_string(),
                        error: err.clone(),
                    });
                    fatal.get_or_insert(err);
                }
            }
        }

        if let Some(err) = fatal {
            for backend in connected {
                if let Err(e) = backend.adapter.disconnect().await {
                    warn!(backend = %backend.name(), error = %e, "error while rolling back connect");
                }
            }
            self.set_state(ConnectionState::Error(err.message.clone()));
            return Err(err);
        }

        self.set_state(ConnectionState::Connected);
        info!(
            backends = self.backends.len(),
            unavailable = self.unavailable.len(),
            "router connected"
        );
        Ok(())
    }

    /// Cancel pending retry waits and disconnect every adapter.
    ///
    /// Adapter disconnect errors are logged, never returned.
    pub async fn disconnect(&self) -> Result<()> {
        lock(&self.cancel).cancel();
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        self.set_state(ConnectionState::Disconnected);

        let results = join_all(self.backends.iter().map(|b| b.adapter.disconnect())).await;
        for (backend, result) in self.backends.iter().zip(results) {
            if let Err(e) = result {
                warn!(backend = %backend.name(), error = %e, "error while disconnecting backend");
            }
        }
        info!("router disconnected");
        Ok(())
    }

    // ── channel-scoped operations ────────────────────────────────────────

    pub async fn send_message(
        &self,
        channel_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<Message> {
        let draft = MessageDraft::text(content).with_attachments(attachments);
        self.send_draft(channel_id, &draft).await
    }

    /// Send a full draft, including a `reply_to` reference.
    pub async fn send_draft(&self, channel_id: &str, draft: &MessageDraft) -> Result<Message> {
        self.on_channel("send_message", channel_id, |adapter| async move {
            adapter.send_message(channel_id, draft).await
        })
        .await
    }

    pub async fn get_messages(
        &self,
        channel_id: &str,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> Result<Vec<Message>> {
        self.on_channel("get_messages", channel_id, |adapter| async move {
            adapter.get_messages(channel_id, limit, before).await
        })
        .await
    }

    pub async fn subscribe_to_messages(
        &self,
        channel_id: &str,
        callback: MessageCallback,
    ) -> Result<Subscription> {
        self.on_channel("subscribe_to_messages", channel_id, |adapter| {
            let callback = Arc::clone(&callback);
            async move { adapter.subscribe_to_messages(channel_id, callback).await }
        })
        .await
    }

    pub async fn subscribe_to_user_presence(
        &self,
        channel_id: &str,
        callback: PresenceCallback,
    ) -> Result<Subscription> {
        self.on_channel("subscribe_to_user_presence", channel_id, |adapter| {
            let callback = Arc::clone(&callback);
            async move { adapter.subscribe_to_user_presence(channel_id, callback).await }
        })
        .await
    }

    pub async fn join_channel(&self, channel_id: &str) -> Result<Channel> {
        let channel = self
            .on_channel("join_channel", channel_id, |adapter| async move {
                adapter.join_channel(channel_id).await
            })
            .await?;
        if let Some(kind) = self.channels.resolve(channel_id) {
            self.channels.record(channel_id, kind);
            self.channels.record(&channel.id, kind);
        }
        Ok(channel)
    }

    /// Leave the channel and forget its recorded kind.
    pub async fn leave_channel(&self, channel_id: &str) -> Result<()> {
        self.on_channel("leave_channel", channel_id, |adapter| async move {
            adapter.leave_channel(channel_id).await
        })
        .await?;
        self.channels.forget(channel_id);
        Ok(())
    }

    pub async fn get_users(&self, channel_id: &str) -> Result<Vec<User>> {
        self.on_channel("get_users", channel_id, |adapter| async move {
            adapter.get_users(channel_id).await
        })
        .await
    }

    pub async fn mark_messages_as_read(
        &self,
        channel_id: &str,
        message_ids: &[String],
    ) -> Result<()> {
        self.on_channel("mark_messages_as_read", channel_id, |adapter| async move {
            adapter.mark_messages_as_read(channel_id, message_ids).await
        })
        .await
    }

    pub async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Message> {
        self.on_channel("edit_message", channel_id, |adapter| async move {
            adapter.edit_message(channel_id, message_id, content).await
        })
        .await
    }

    pub async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<()> {
        self.on_channel("delete_message", channel_id, |adapter| async move {
            adapter.delete_message(channel_id, message_id).await
        })
        .await
    }

    pub async fn add_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        reaction: &str,
    ) -> Result<()> {
        self.on_channel("add_reaction", channel_id, |adapter| async move {
            adapter.add_reaction(channel_id, message_id, reaction).await
        })
        .await
    }

    pub async fn invite_user(&self, channel_id: &str, user_id: &str) -> Result<()> {
        self.on_channel("invite_user", channel_id, |adapter| async move {
            adapter.invite_user(channel_id, user_id).await
        })
        .await
    }

    pub async fn remove_user(&self, channel_id: &str, user_id: &str) -> Result<()> {
        self.on_channel("remove_user", channel_id, |adapter| async move {
            adapter.remove_user(channel_id, user_id).await
        })
        .await
    }

    pub async fn set_channel_metadata(&self, channel_id: &str, metadata: &Metadata) -> Result<()> {
        self.on_channel("set_channel_metadata", channel_id, |adapter| async move {
            adapter.set_channel_metadata(channel_id, metadata).await
        })
        .await
    }

    // ── kind-scoped and unscoped operations ──────────────────────────────

    /// Create the channel on the adapter `kind` is routed to and record its kind.
    pub async fn create_channel(
        &self,
        name: &str,
        kind: ChannelKind,
        participants: &[String],
    ) -> Result<Channel> {
        const OP: &str = "create_channel";
        self.ensure_connected(OP, None)?;
        let index = self.route_kind(OP, kind, None)?;
        let channel = self
            .dispatch(OP, index, |adapter| async move {
                adapter.create_channel(name, kind, participants).await
            })
            .await?;
        self.channels.record(&channel.id, kind);
        info!(channel = %channel.id, kind = %kind, backend = %self.backends[index].name(), "channel created");
        Ok(channel)
    }

    /// Channels of every healthy adapter, concatenated in route order.
    pub async fn get_channels(&self) -> Result<FanOut<Channel>> {
        const OP: &str = "get_channels";
        self.ensure_connected(OP, None)?;
        let targets = self.healthy_backends();
        if targets.is_empty() {
            return Err(self.nothing_available(OP));
        }
        let listed = self
            .fan_out(OP, &targets, |adapter| async move { adapter.get_channels().await })
            .await?;
        for (index, channels) in &listed.items {
            for channel in channels {
                if self.routes.get(&channel.kind) == Some(index) {
                    self.channels.record(&channel.id, channel.kind);
                }
            }
        }
        Ok(flatten(listed))
    }

    /// Search one channel, or every healthy adapter that supports search.
    ///
    /// Adapters without `messaging.search` are skipped, not counted as
    /// failures. With no channel id and no capable adapter the call fails
    /// with feature-not-supported.
    pub async fn search_messages(
        &self,
        query: &str,
        channel_id: Option<&str>,
    ) -> Result<FanOut<Message>> {
        const OP: &str = "search_messages";
        if let Some(channel_id) = channel_id {
            let items = self
                .on_channel(OP, channel_id, |adapter| async move {
                    adapter.search_messages(query, Some(channel_id)).await
                })
                .await?;
            return Ok(FanOut {
                items,
                failures: Vec::new(),
            });
        }

        self.ensure_connected(OP, None)?;
        let capable: Vec<usize> = (0..self.backends.len())
            .filter(|&i| self.backends[i].adapter.has_capability(paths::MESSAGES_SEARCH))
            .collect();
        if capable.is_empty() {
            return Err(ChatError::feature_not_supported(paths::MESSAGES_SEARCH)
                .with_context(self.context(OP, None)));
        }
        let targets: Vec<usize> = self
            .healthy_backends()
            .into_iter()
            .filter(|i| capable.contains(i))
            .collect();
        if targets.is_empty() {
            return Err(self.nothing_available(OP));
        }
        let found = self
            .fan_out(OP, &targets, |adapter| async move {
                adapter.search_messages(query, None).await
            })
            .await?;
        Ok(flatten(found))
    }

    /// Upload through the first connected adapter, in kind order, whose
    /// attachment limits accept the file.
    pub async fn upload_attachment(&self, upload: &AttachmentUpload) -> Result<UploadedAttachment> {
        const OP: &str = "upload_attachment";
        self.ensure_connected(OP, None)?;

        let mut rejection: Option<ChatError> = None;
        let mut chosen = None;
        for (kind, &index) in &self.routes {
            let adapter = &self.backends[index].adapter;
            if self.unavailable.contains_key(kind)
                || !adapter.is_connected()
                || !adapter.has_capability(paths::ATTACHMENTS_UPLOAD)
            {
                continue;
            }
            match adapter.capabilities().check_upload(upload) {
                Ok(()) => {
                    chosen = Some(index);
                    break;
                }
                Err(err) => {
                    if rejection.is_none() {
                        rejection = Some(err.with_context(ErrorContext::new(adapter.name(), OP)));
                    }
                }
            }
        }

        let Some(index) = chosen else {
            return Err(rejection.unwrap_or_else(|| {
                ChatError::feature_not_supported(paths::ATTACHMENTS_UPLOAD)
                    .with_context(self.context(OP, None))
            }));
        };
        debug!(backend = %self.backends[index].name(), name = %upload.name, "upload routed");
        self.dispatch(OP, index, |adapter| async move {
            adapter.upload_attachment(upload).await
        })
        .await
    }

    // ── dispatch plumbing ────────────────────────────────────────────────

    async fn on_channel<T, F, Fut>(&self, operation: &str, channel_id: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn ChatAdapter>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_connected(operation, Some(channel_id))?;
        let index = self.route_channel(operation, channel_id)?;
        self.dispatch(operation, index, op).await
    }

    /// Run `op` against one adapter inside the retry loop.
    async fn dispatch<T, F, Fut>(&self, operation: &str, index: usize, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn ChatAdapter>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let adapter = Arc::clone(&self.backends[index].adapter);
        let cancel = self.cancel_token();
        let result = retry_with(&self.policy, &cancel, operation, || op(Arc::clone(&adapter))).await;
        if let Err(err) = &result {
            self.note_failure(index, err);
        }
        result
    }

    /// Run `op` against every target concurrently.
    ///
    /// Per-adapter failures are logged and collected; only when every target
    /// fails is a single aggregated error returned.
    async fn fan_out<T, F, Fut>(
        &self,
        operation: &str,
        targets: &[usize],
        op: F,
    ) -> Result<FanOut<(usize, Vec<T>)>>
    where
        F: Fn(Arc<dyn ChatAdapter>) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let cancel = self.cancel_token();
        let op = &op;
        let cancel = &cancel;
        let calls = targets.iter().map(|&index| {
            let adapter = Arc::clone(&self.backends[index].adapter);
            async move {
                let result =
                    retry_with(&self.policy, cancel, operation, || op(Arc::clone(&adapter))).await;
                (index, result)
            }
        });

        let mut out = FanOut::default();
        for (index, result) in join_all(calls).await {
            match result {
                Ok(items) => out.items.push((index, items)),
                Err(err) => {
                    let backend = self.backends[index].name();
                    warn!(backend = %backend, operation, error = %err, "fan-out call failed");
                    self.note_failure(index, &err);
                    self.emit(RouterEvent::AdapterFailed {
                        backend: backend.to_string(),
                        error: err.clone(),
                    });
                    out.failures.push(err);
                }
            }
        }

        if out.items.is_empty() && !out.failures.is_empty() {
            return Err(aggregate(operation, out.failures));
        }
        Ok(out)
    }

    fn route_channel(&self, operation: &str, channel_id: &str) -> Result<usize> {
        let Some(kind) = self.channels.resolve(channel_id) else {
            debug!(channel = %channel_id, operation, "channel kind unknown");
            return Err(ChatError::new(
                ErrorCode::InvalidChannel,
                format!("cannot determine the kind of channel '{}'", channel_id),
            )
            .with_context(self.context(operation, Some(channel_id))));
        };
        self.route_kind(operation, kind, Some(channel_id))
    }

    fn route_kind(
        &self,
        operation: &str,
        kind: ChannelKind,
        channel_id: Option<&str>,
    ) -> Result<usize> {
        let Some(&index) = self.routes.get(&kind) else {
            return Err(ChatError::new(
                ErrorCode::InvalidChannel,
                format!("no backend is routed for {} channels", kind),
            )
            .with_context(self.context(operation, channel_id)));
        };
        if let Some(cause) = self.unavailable.get(&kind) {
            return Err(ChatError::new(
                ErrorCode::ServiceUnavailable,
                format!("{} channels are unavailable: {}", kind, cause.message),
            )
            .with_recoverable(false)
            .with_context(self.context(operation, channel_id)));
        }
        Ok(index)
    }

    /// Connected adapters none of whose kinds are out of service.
    fn healthy_backends(&self) -> Vec<usize> {
        self.backends
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                b.adapter.is_connected()
                    && !b.kinds.iter().any(|k| self.unavailable.contains_key(k))
            })
            .map(|(index, _)| index)
            .collect()
    }

    fn note_failure(&self, index: usize, err: &ChatError) {
        if err.severity == Severity::Critical {
            self.degrade(index, err);
        }
    }

    fn degrade(&self, index: usize, err: &ChatError) {
        let backend = &self.backends[index];
        let mut newly = false;
        for &kind in &backend.kinds {
            newly |= self.unavailable.insert(kind, err.clone()).is_none();
        }
        if !newly {
            return;
        }
        error!(
            backend = %backend.name(),
            kinds = ?backend.kinds,
            error = %err,
            "backend degraded, its kinds are disabled until reconnect"
        );
        self.emit(RouterEvent::Degraded {
            backend: backend.name().to_string(),
            kinds: backend.kinds.clone(),
            error: err.clone(),
        });
    }

    fn ensure_connected(&self, operation: &str, channel_id: Option<&str>) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        Err(ChatError::not_connected(ROUTER).with_context(self.context(operation, channel_id)))
    }

    fn nothing_available(&self, operation: &str) -> ChatError {
        ChatError::new(ErrorCode::ServiceUnavailable, "no backend is available")
            .with_recoverable(false)
            .with_context(self.context(operation, None))
    }

    fn context(&self, operation: &str, channel_id: Option<&str>) -> ErrorContext {
        let context = ErrorContext::new(ROUTER, operation);
        match channel_id {
            Some(channel_id) => context.with_channel(channel_id),
            None => context,
        }
    }

    fn cancel_token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *lock(&self.state), next.clone());
        if previous != next {
            debug!(from = %previous, to = %next, "router state change");
            self.emit(RouterEvent::StateChanged {
                from: previous,
                to: next,
            });
        }
    }

    fn emit(&self, event: RouterEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

fn flatten<T>(fan_out: FanOut<(usize, Vec<T>)>) -> FanOut<T> {
    FanOut {
        items: fan_out
            .items
            .into_iter()
            .flat_map(|(_, items)| items)
            .collect(),
        failures: fan_out.failures,
    }
}
