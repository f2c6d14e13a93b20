use std::collections::BTreeMap;
use std::fmt;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::ChannelKind;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_GRAPH_ROOT: &str = "unichat";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Backends the federation layer knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendName {
    Relay,
    Graph,
    Secure,
}

impl BackendName {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendName::Relay => "relay",
            BackendName::Graph => "graph",
            BackendName::Secure => "secure",
        }
    }
}

impl fmt::Display for BackendName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level config (unichat.toml + UNICHAT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    /// Channel kind → owning backend.
    #[serde(default = "default_routes")]
    pub routes: BTreeMap<ChannelKind, BackendName>,
    /// Kinds whose backend may fail to connect without failing the router.
    #[serde(default = "default_optional_kinds")]
    pub optional_kinds: Vec<ChannelKind>,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub secure: SecureConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            routes: default_routes(),
            optional_kinds: default_optional_kinds(),
            relay: RelayConfig::default(),
            graph: GraphConfig::default(),
            secure: SecureConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

/// Gossip-relay network settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay URLs to publish to and subscribe from.
    #[serde(default)]
    pub relays: Vec<String>,
    /// Public key of the local author. Generated by the client when unset.
    pub author: Option<String>,
}

/// Distributed graph store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub peers: Vec<String>,
    /// Root node under which every unichat path lives.
    #[serde(default = "default_graph_root")]
    pub root: String,
    /// Local user id and display name inside the graph.
    pub user_id: Option<String>,
    pub alias: Option<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            root: default_graph_root(),
            user_id: None,
            alias: None,
        }
    }
}

/// Forward-secret channel service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureConfig {
    pub service_url: Option<String>,
    /// How often subscriptions poll the service for new envelopes.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub member_id: Option<String>,
}

impl Default for SecureConfig {
    fn default() -> Self {
        Self {
            service_url: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            member_id: None,
        }
    }
}

fn default_routes() -> BTreeMap<ChannelKind, BackendName> {
    BTreeMap::from([
        (ChannelKind::Global, BackendName::Relay),
        (ChannelKind::Team, BackendName::Graph),
        (ChannelKind::Direct, BackendName::Secure),
        (ChannelKind::Thread, BackendName::Graph),
    ])
}
fn default_optional_kinds() -> Vec<ChannelKind> {
    vec![ChannelKind::Thread]
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_graph_root() -> String {
    DEFAULT_GRAPH_ROOT.to_string()
}

impl FederationConfig {
    /// Load config from a TOML file with UNICHAT_* env var overrides.
    ///
    /// Path resolution: explicit argument, then `~/.unichat/unichat.toml`.
    /// Nested keys use a double underscore: `UNICHAT_RETRY__MAX_ATTEMPTS=5`.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: FederationConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("UNICHAT_").split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routes.is_empty() {
            return Err(ConfigError::Invalid("no channel kind is routed".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms exceeds retry.max_delay_ms".to_string(),
            ));
        }
        if let Some(kind) = self
            .optional_kinds
            .iter()
            .find(|k| !self.routes.contains_key(*k))
        {
            return Err(ConfigError::Invalid(format!(
                "optional kind '{}' has no route",
                kind
            )));
        }
        if self.secure.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "secure.poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Distinct backends referenced by the route table.
    pub fn backends(&self) -> Vec<BackendName> {
        let mut names: Vec<BackendName> = self.routes.values().copied().collect();
        names.sort();
        names.dedup();
        names
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.unichat/unichat.toml", home)
}
