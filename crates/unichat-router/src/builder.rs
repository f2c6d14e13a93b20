use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::warn;

use unichat_adapter::ChatAdapter;
use unichat_core::{BackendName, ChannelKind, ConfigError, FederationConfig, RetryPolicy};

use crate::router::{Backend, Router};

/// Assembles a [`Router`] from kind routes.
///
/// Several kinds may share one adapter; the router then connects it once
/// and degrades all of its kinds together.
pub struct RouterBuilder {
    routes: BTreeMap<ChannelKind, Arc<dyn ChatAdapter>>,
    optional: BTreeSet<ChannelKind>,
    policy: RetryPolicy,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            routes: BTreeMap::new(),
            optional: BTreeSet::new(),
            policy: RetryPolicy::default(),
        }
    }

    /// Route `kind` to `adapter`. A later route for the same kind replaces
    /// the earlier one.
    pub fn route(mut self, kind: ChannelKind, adapter: Arc<dyn ChatAdapter>) -> Self {
        if let Some(previous) = self.routes.insert(kind, adapter) {
            warn!(kind = %kind, previous = %previous.name(), "channel kind re-routed");
        }
        self
    }

    /// Allow the adapter behind `kind` to fail at connect time without
    /// failing the router. Only takes effect when every kind of that adapter
    /// is optional.
    pub fn optional(mut self, kind: ChannelKind) -> Self {
        self.optional.insert(kind);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Routes and retry policy from `config`, resolving each backend name
    /// through `adapters`.
    pub fn from_config(
        config: &FederationConfig,
        adapters: &HashMap<BackendName, Arc<dyn ChatAdapter>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut builder = Self::new().retry_policy(RetryPolicy::from(&config.retry));
        for (kind, backend) in &config.routes {
            let adapter = adapters.get(backend).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "{} channels are routed to '{}', but no such adapter was supplied",
                    kind, backend
                ))
            })?;
            builder = builder.route(*kind, Arc::clone(adapter));
        }
        for kind in &config.optional_kinds {
            builder = builder.optional(*kind);
        }
        Ok(builder)
    }

    pub fn build(self) -> Result<Router, ConfigError> {
        if self.routes.is_empty() {
            return Err(ConfigError::Invalid("no channel kind is routed".to_string()));
        }
        if let Some(kind) = self.optional.iter().find(|k| !self.routes.contains_key(*k)) {
            return Err(ConfigError::Invalid(format!(
                "optional kind '{}' has no route",
                kind
            )));
        }

        let mut backends: Vec<Backend> = Vec::new();
        let mut routes = BTreeMap::new();
        for (kind, adapter) in self.routes {
            let index = match backends.iter().position(|b| same_adapter(&b.adapter, &adapter)) {
                Some(index) => index,
                None => {
                    backends.push(Backend {
                        adapter,
                        kinds: Vec::new(),
                        optional: true,
                    });
                    backends.len() - 1
                }
            };
            let backend = &mut backends[index];
            backend.kinds.push(kind);
            backend.optional &= self.optional.contains(&kind);
            routes.insert(kind, index);
        }

        Ok(Router::new(backends, routes, self.policy))
    }
}

fn same_adapter(a: &Arc<dyn ChatAdapter>, b: &Arc<dyn ChatAdapter>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
