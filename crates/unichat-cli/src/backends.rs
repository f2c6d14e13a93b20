use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use unichat_adapter::ChatAdapter;
use unichat_core::{BackendName, FederationConfig};
use unichat_graph::{GraphShim, MemoryGraph};
use unichat_relay::{MemoryRelay, RelayShim};
use unichat_secure::{MemorySecure, SecureShim};

const DEFAULT_LOCAL_ID: &str = "local";

/// One loopback adapter per backend the route table references.
///
/// Network endpoints in the config are reported but not dialled; every
/// backend runs in process.
pub fn loopback_adapters(config: &FederationConfig) -> HashMap<BackendName, Arc<dyn ChatAdapter>> {
    let mut adapters = HashMap::new();
    for backend in config.backends() {
        let adapter = match backend {
            BackendName::Relay => {
                if !config.relay.relays.is_empty() {
                    info!(relays = ?config.relay.relays, "relay URLs configured, serving relay channels in process");
                }
                let author = config
                    .relay
                    .author
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LOCAL_ID.to_string());
                RelayShim::new(Arc::new(MemoryRelay::new(author)))
                    .into_adapter()
                    .into_shared()
            }
            BackendName::Graph => {
                if !config.graph.peers.is_empty() {
                    info!(peers = ?config.graph.peers, "graph peers configured, serving graph channels in process");
                }
                let user_id = config
                    .graph
                    .user_id
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LOCAL_ID.to_string());
                let alias = config.graph.alias.clone().unwrap_or_else(|| user_id.clone());
                GraphShim::new(Arc::new(MemoryGraph::new(user_id, alias)), &config.graph.root)
                    .into_adapter()
                    .into_shared()
            }
            BackendName::Secure => {
                if let Some(url) = &config.secure.service_url {
                    info!(url = %url, "secure service configured, serving secure channels in process");
                }
                let member = config
                    .secure
                    .member_id
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LOCAL_ID.to_string());
                SecureShim::new(
                    Arc::new(MemorySecure::new(member)),
                    Duration::from_millis(config.secure.poll_interval_ms),
                )
                .into_adapter()
                .into_shared()
            }
        };
        adapters.insert(backend, adapter);
    }
    adapters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_gets_all_three_backends() {
        let adapters = loopback_adapters(&FederationConfig::default());
        assert_eq!(adapters.len(), 3);
        assert_eq!(adapters[&BackendName::Relay].name(), "relay");
        assert_eq!(adapters[&BackendName::Graph].name(), "graph");
        assert_eq!(adapters[&BackendName::Secure].name(), "secure");
    }
}
