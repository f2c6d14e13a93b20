use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::GraphError;

/// Called with the child key and its new value whenever a direct child of a
/// watched node is written. A `Null` value is a tombstone.
pub type GraphListener = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Who the local client writes as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphIdentity {
    pub user_id: String,
    pub alias: String,
}

/// Handle of an active node listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphWatch(pub u64);

/// Native surface of a distributed graph store client.
///
/// Paths are `/`-separated node keys. Writes are local-first and merge into
/// the peers asynchronously; reads see the local replica.
#[async_trait]
pub trait GraphClient: Send + Sync {
    fn identity(&self) -> &GraphIdentity;

    async fn connect(&self) -> Result<(), GraphError>;

    async fn disconnect(&self) -> Result<(), GraphError>;

    async fn put(&self, path: &str, value: Value) -> Result<(), GraphError>;

    /// `None` when the node was never written. Tombstones read as `Some(Null)`.
    async fn get(&self, path: &str) -> Result<Option<Value>, GraphError>;

    /// Direct children of `path`, tombstones included, ordered by key.
    async fn list(&self, path: &str) -> Result<Vec<(String, Value)>, GraphError>;

    async fn watch(&self, path: &str, listener: GraphListener) -> Result<GraphWatch, GraphError>;

    /// Remove a listener. Unknown handles are ignored.
    fn unwatch(&self, watch: GraphWatch);
}

/// Node layout under the configured root.
#[derive(Debug, Clone)]
pub struct GraphPaths {
    root: String,
}

impl GraphPaths {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into().trim_matches('/').to_string(),
        }
    }

    pub fn channel(&self, channel_id: &str) -> String {
        format!("{}/channels/{}", self.root, channel_id)
    }

    pub fn members(&self, channel_id: &str) -> String {
        format!("{}/members/{}", self.root, channel_id)
    }

    pub fn member(&self, channel_id: &str, user_id: &str) -> String {
        format!("{}/{}", self.members(channel_id), user_id)
    }

    pub fn memberships(&self, user_id: &str) -> String {
        format!("{}/memberships/{}", self.root, user_id)
    }

    pub fn membership(&self, user_id: &str, channel_id: &str) -> String {
        format!("{}/{}", self.memberships(user_id), channel_id)
    }

    pub fn messages(&self, channel_id: &str) -> String {
        format!("{}/messages/{}", self.root, channel_id)
    }

    pub fn message(&self, channel_id: &str, message_id: &str) -> String {
        format!("{}/{}", self.messages(channel_id), message_id)
    }

    pub fn reaction(&self, channel_id: &str, message_id: &str, reaction: &str, user_id: &str) -> String {
        format!(
            "{}/reactions/{}/{}/{}/{}",
            self.root, channel_id, message_id, reaction, user_id
        )
    }

    pub fn receipt(&self, channel_id: &str, message_id: &str, user_id: &str) -> String {
        format!(
            "{}/receipts/{}/{}/{}",
            self.root, channel_id, message_id, user_id
        )
    }

    pub fn users(&self) -> String {
        format!("{}/users", self.root)
    }

    pub fn user(&self, user_id: &str) -> String {
        format!("{}/{}", self.users(), user_id)
    }
}
