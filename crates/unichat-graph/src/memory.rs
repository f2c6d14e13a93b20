//! In-process loopback graph store.
//!
//! One node map shared by every client built with [`MemoryGraph::sharing`],
//! so tests can model several users writing into the same graph.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use crate::client::{GraphClient, GraphIdentity, GraphListener, GraphWatch};
use crate::error::GraphError;

#[derive(Default)]
struct GraphStore {
    nodes: Mutex<BTreeMap<String, Value>>,
    watchers: Mutex<Vec<(GraphWatch, String, GraphListener)>>,
    next_watch: AtomicU64,
}

pub struct MemoryGraph {
    identity: GraphIdentity,
    connected: AtomicBool,
    store: Arc<GraphStore>,
    failures: Mutex<VecDeque<GraphError>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn split_parent(path: &str) -> Option<(&str, &str)> {
    path.rsplit_once('/')
}

impl MemoryGraph {
    pub fn new(user_id: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            identity: GraphIdentity {
                user_id: user_id.into(),
                alias: alias.into(),
            },
            connected: AtomicBool::new(false),
            store: Arc::new(GraphStore::default()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Another user's client on the same store.
    pub fn sharing(
        other: &MemoryGraph,
        user_id: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        Self {
            store: Arc::clone(&other.store),
            ..Self::new(user_id, alias)
        }
    }

    pub fn fail_next(&self, err: GraphError) {
        lock(&self.failures).push_back(err);
    }

    pub fn watcher_count(&self) -> usize {
        lock(&self.store.watchers).len()
    }

    fn check(&self) -> Result<(), GraphError> {
        if let Some(err) = lock(&self.failures).pop_front() {
            return Err(err);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GraphError::NotConnected);
        }
        Ok(())
    }
}

#[async_trait]
impl GraphClient for MemoryGraph {
    fn identity(&self) -> &GraphIdentity {
        &self.identity
    }

    async fn connect(&self) -> Result<(), GraphError> {
        if let Some(err) = lock(&self.failures).pop_front() {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), GraphError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn put(&self, path: &str, value: Value) -> Result<(), GraphError> {
        self.check()?;
        lock(&self.store.nodes).insert(path.to_string(), value.clone());

        let Some((parent, key)) = split_parent(path) else {
            return Ok(());
        };
        // listeners run outside the store locks so they may read the graph
        let listeners: Vec<GraphListener> = lock(&self.store.watchers)
            .iter()
            .filter(|(_, watched, _)| watched == parent)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(key, &value);
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, GraphError> {
        self.check()?;
        Ok(lock(&self.store.nodes).get(path).cloned())
    }

    async fn list(&self, path: &str) -> Result<Vec<(String, Value)>, GraphError> {
        self.check()?;
        let prefix = format!("{}/", path);
        Ok(lock(&self.store.nodes)
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, v)| {
                let child = &k[prefix.len()..];
                (!child.contains('/')).then(|| (child.to_string(), v.clone()))
            })
            .collect())
    }

    async fn watch(&self, path: &str, listener: GraphListener) -> Result<GraphWatch, GraphError> {
        self.check()?;
        let watch = GraphWatch(self.store.next_watch.fetch_add(1, Ordering::SeqCst));
        lock(&self.store.watchers).push((watch, path.to_string(), listener));
        Ok(watch)
    }

    fn unwatch(&self, watch: GraphWatch) {
        lock(&self.store.watchers).retain(|(w, _, _)| *w != watch);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    async fn connected() -> MemoryGraph {
        let graph = MemoryGraph::new("u1", "alice");
        graph.connect().await.unwrap();
        graph
    }

    #[tokio::test]
    async fn list_returns_direct_children_only() {
        let graph = connected().await;
        graph.put("r/messages/c1/m1", json!({"a": 1})).await.unwrap();
        graph.put("r/messages/c1/m2", Value::Null).await.unwrap();
        graph.put("r/messages/c1/m2/deep", json!(1)).await.unwrap();
        graph.put("r/messages/c10/m3", json!(1)).await.unwrap();

        let children = graph.list("r/messages/c1").await.unwrap();
        let keys: Vec<&str> = children.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["m1", "m2"]);
        assert!(children[1].1.is_null());
    }

    #[tokio::test]
    async fn watchers_fire_for_child_writes_until_removed() {
        let graph = connected().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let watch = graph
            .watch(
                "r/messages/c1",
                Arc::new(move |key: &str, _value: &Value| {
                    assert_eq!(key, "m1");
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        graph.put("r/messages/c1/m1", json!("x")).await.unwrap();
        graph.put("r/messages/c2/m1", json!("x")).await.unwrap();
        graph.unwatch(watch);
        graph.put("r/messages/c1/m1", json!("y")).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(graph.watcher_count(), 0);
    }

    #[tokio::test]
    async fn shared_store_is_visible_to_both_clients() {
        let alice = connected().await;
        let bob = MemoryGraph::sharing(&alice, "u2", "bob");
        bob.connect().await.unwrap();

        bob.put("r/users/u2", json!({"name": "bob"})).await.unwrap();
        assert!(alice.get("r/users/u2").await.unwrap().is_some());
        assert_eq!(bob.identity().alias, "bob");
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let graph = connected().await;
        graph.fail_next(GraphError::Timeout(100));
        graph.fail_next(GraphError::Ack("quota".into()));
        assert!(matches!(graph.get("x").await, Err(GraphError::Timeout(100))));
        assert!(matches!(graph.get("x").await, Err(GraphError::Ack(_))));
        assert!(graph.get("x").await.unwrap().is_none());
    }
}
