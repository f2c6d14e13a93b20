use dashmap::DashMap;
use tracing::debug;

use unichat_core::ChannelKind;

/// Channel id → kind, recorded when the router creates, joins or lists a
/// channel.
///
/// Kinds are immutable for a channel's lifetime, so an entry is only ever
/// removed when the caller leaves the channel.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    kinds: DashMap<String, ChannelKind>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, channel_id: &str, kind: ChannelKind) {
        if self.kinds.insert(channel_id.to_string(), kind).is_none() {
            debug!(channel = %channel_id, kind = %kind, "channel kind recorded");
        }
    }

    pub fn forget(&self, channel_id: &str) -> Option<ChannelKind> {
        self.kinds.remove(channel_id).map(|(_, kind)| kind)
    }

    pub fn kind_of(&self, channel_id: &str) -> Option<ChannelKind> {
        self.kinds.get(channel_id).map(|entry| *entry)
    }

    /// Recorded kind, else the `<kind>-` prefix hint of the id.
    pub fn resolve(&self, channel_id: &str) -> Option<ChannelKind> {
        self.kind_of(channel_id)
            .or_else(|| ChannelKind::from_channel_id(channel_id))
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_kind_wins_over_prefix() {
        let registry = ChannelRegistry::new();
        registry.record("team-7", ChannelKind::Thread);
        assert_eq!(registry.resolve("team-7"), Some(ChannelKind::Thread));
        assert_eq!(registry.resolve("team-8"), Some(ChannelKind::Team));
        assert_eq!(registry.resolve("lobby"), None);
    }

    #[test]
    fn forget_drops_the_entry() {
        let registry = ChannelRegistry::new();
        registry.record("abc", ChannelKind::Direct);
        assert_eq!(registry.forget("abc"), Some(ChannelKind::Direct));
        assert!(registry.is_empty());
        assert_eq!(registry.resolve("abc"), None);
    }
}
