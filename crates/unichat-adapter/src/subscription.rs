use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::debug;

use crate::shim::{DeliveryGate, SubscriptionCleanup};

/// One live registration: its delivery gate plus the backend teardown.
struct Registration {
    id: u64,
    gate: Arc<DeliveryGate>,
    cleanup: SubscriptionCleanup,
}

impl Registration {
    fn close(self) {
        self.gate.close();
        self.cleanup.run();
    }
}

/// Per-adapter registry: at most one registration per channel id.
///
/// Owned by the adapter skeleton that created it. The only outside access is
/// through the [`Subscription`] handles that same skeleton hands out.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: DashMap<String, Registration>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    /// Tear down the current registration for `key`, if any.
    pub(crate) fn release(&self, key: &str) {
        if let Some((_, previous)) = self.entries.remove(key) {
            debug!(channel = %key, id = previous.id, "replacing subscription");
            previous.close();
        }
    }

    /// Install a registration and return its handle.
    pub(crate) fn install(
        self: &Arc<Self>,
        key: &str,
        gate: Arc<DeliveryGate>,
        cleanup: SubscriptionCleanup,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let registration = Registration {
            id,
            gate: Arc::clone(&gate),
            cleanup,
        };
        if let Some(previous) = self.entries.insert(key.to_string(), registration) {
            debug!(channel = %key, id = previous.id, "replacing subscription");
            previous.close();
        }
        Subscription {
            channel_id: key.to_string(),
            id,
            gate,
            registry: Arc::downgrade(self),
        }
    }

    fn remove_if_current(&self, key: &str, id: u64) {
        if let Some((_, registration)) = self.entries.remove_if(key, |_, r| r.id == id) {
            registration.close();
        }
    }

    /// Close every registration.
    pub(crate) fn clear(&self) {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.release(&key);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

/// Handle returned by every subscribe call.
///
/// [`unsubscribe`](Subscription::unsubscribe) is idempotent. Dropping the
/// handle does not end the subscription; it stays registered until it is
/// unsubscribed, replaced, or the adapter disconnects.
#[derive(Debug)]
pub struct Subscription {
    channel_id: String,
    id: u64,
    gate: Arc<DeliveryGate>,
    registry: Weak<SubscriptionRegistry>,
}

impl Subscription {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// `false` once unsubscribed, replaced, or torn down by a disconnect.
    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }

    /// End the subscription. Once this returns the callback is not running
    /// and will not be called again.
    pub fn unsubscribe(&self) {
        if !self.gate.close() {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if_current(&self.channel_id, self.id);
        }
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}
