//! In-process loopback relay.
//!
//! Signs events with a sha256 digest instead of a schnorr signature. Several
//! clients with different authors can share one store through
//! [`MemoryRelay::sharing`].

use std::cmp::Reverse;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::{RelayClient, RelayEvent, RelayFilter, RelaySubscription, UnsignedEvent};
use crate::error::RelayError;

const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Default)]
struct RelayStore {
    events: Mutex<Vec<RelayEvent>>,
    subscribers: DashMap<String, (RelayFilter, mpsc::Sender<RelayEvent>)>,
    next_subscription: AtomicU64,
    nonce: AtomicU64,
}

pub struct MemoryRelay {
    author: String,
    connected: AtomicBool,
    store: Arc<RelayStore>,
    failures: Mutex<VecDeque<RelayError>>,
}

impl MemoryRelay {
    pub fn new(author: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            connected: AtomicBool::new(false),
            store: Arc::new(RelayStore::default()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// A second client on the same store, signing as `author`.
    pub fn sharing(other: &MemoryRelay, author: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            connected: AtomicBool::new(false),
            store: Arc::clone(&other.store),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Make the next client call fail with `err`. Queued failures are consumed in order.
    pub fn fail_next(&self, err: RelayError) {
        self.lock_failures().push_back(err);
    }

    pub fn events(&self) -> Vec<RelayEvent> {
        self.lock_events().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.store.subscribers.len()
    }

    fn lock_events(&self) -> std::sync::MutexGuard<'_, Vec<RelayEvent>> {
        self.store
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, VecDeque<RelayError>> {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> Result<(), RelayError> {
        if let Some(err) = self.lock_failures().pop_front() {
            return Err(err);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RelayError::NotConnected);
        }
        Ok(())
    }

    fn sign(&self, event: UnsignedEvent) -> RelayEvent {
        let created_at = chrono::Utc::now().timestamp();
        let nonce = self.store.nonce.fetch_add(1, Ordering::SeqCst);
        let preimage = serde_json::json!([
            0,
            self.author,
            created_at,
            event.kind,
            event.tags,
            event.content,
            nonce
        ]);
        let id = hex::encode(Sha256::digest(preimage.to_string().as_bytes()));
        let sig = hex::encode(Sha256::digest(format!("{}:{}", self.author, id).as_bytes()));
        RelayEvent {
            id,
            author: self.author.clone(),
            created_at,
            kind: event.kind,
            tags: event.tags,
            content: event.content,
            sig,
        }
    }

    fn fan_out(&self, event: &RelayEvent) {
        let mut closed = Vec::new();
        for entry in self.store.subscribers.iter() {
            let (filter, tx) = entry.value();
            if !filter.matches(event) {
                continue;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscription = %entry.key(), "subscriber lagging, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(entry.key().clone()),
            }
        }
        for id in closed {
            self.store.subscribers.remove(&id);
        }
    }
}

#[async_trait]
impl RelayClient for MemoryRelay {
    fn author(&self) -> &str {
        &self.author
    }

    async fn connect(&self) -> Result<(), RelayError> {
        if let Some(err) = self.lock_failures().pop_front() {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RelayError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, event: UnsignedEvent) -> Result<RelayEvent, RelayError> {
        self.check()?;
        let signed = self.sign(event);
        self.lock_events().push(signed.clone());
        self.fan_out(&signed);
        Ok(signed)
    }

    async fn query(&self, filter: &RelayFilter) -> Result<Vec<RelayEvent>, RelayError> {
        self.check()?;
        let mut matched: Vec<RelayEvent> = self
            .lock_events()
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.sort_by_key(|e| Reverse(e.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn subscribe(&self, filter: RelayFilter) -> Result<RelaySubscription, RelayError> {
        self.check()?;
        let n = self.store.next_subscription.fetch_add(1, Ordering::SeqCst);
        let id = format!("sub-{}", n);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.store.subscribers.insert(id.clone(), (filter, tx));
        Ok(RelaySubscription { id, events: rx })
    }

    fn close(&self, subscription_id: &str) {
        self.store.subscribers.remove(subscription_id);
    }
}
