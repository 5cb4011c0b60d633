//! Provider registry - provider name to a freshly built gateway

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{
    Config, Error, EventSink, Gateway, ProviderDescriptor, ProviderName, ProviderRole, Result,
};

/// Builds a gateway from its descriptor. Registered per gateway kind.
pub type GatewayFactory =
    Arc<dyn Fn(&ProviderDescriptor, EventSink) -> Result<Arc<dyn Gateway>> + Send + Sync>;

/// Resolves provider names for one role.
///
/// Every successful `resolve` builds a new gateway; keeping one gateway per
/// provider is the multiplexer's job.
pub struct ProviderRegistry {
    role: ProviderRole,
    descriptors: HashMap<ProviderName, ProviderDescriptor>,
    factories: HashMap<String, GatewayFactory>,
}

impl ProviderRegistry {
    pub fn new(role: ProviderRole, descriptors: impl IntoIterator<Item = ProviderDescriptor>) -> Self {
        let descriptors = descriptors
            .into_iter()
            .filter(|d| d.enabled && d.role == role)
            .map(|d| (d.name.clone(), d))
            .collect();
        Self {
            role,
            descriptors,
            factories: HashMap::new(),
        }
    }

    pub fn from_config(config: &Config, role: ProviderRole) -> Self {
        Self::new(role, config.providers_for(role))
    }

    /// Register the constructor for descriptors of `kind`
    pub fn with_kind(mut self, kind: impl Into<String>, factory: GatewayFactory) -> Self {
        self.register_kind(kind, factory);
        self
    }

    pub fn register_kind(&mut self, kind: impl Into<String>, factory: GatewayFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn role(&self) -> ProviderRole {
        self.role
    }

    pub fn contains(&self, provider: &ProviderName) -> bool {
        self.descriptors.contains_key(provider)
    }

    pub fn providers(&self) -> Vec<ProviderName> {
        let mut names: Vec<_> = self.descriptors.keys().cloned().collect();
        names.sort();
        names
    }

    /// `Ok(None)` when the provider is not configured for this role.
    /// Errors only when a configured provider cannot be built.
    pub fn resolve(&self, provider: &ProviderName, sink: EventSink) -> Result<Option<Arc<dyn Gateway>>> {
        let Some(descriptor) = self.descriptors.get(provider) else {
            return Ok(None);
        };
        let factory = self.factories.get(&descriptor.kind).ok_or_else(|| {
            Error::ProviderResolution(format!(
                "no gateway kind '{}' registered for provider {}",
                descriptor.kind, provider
            ))
        })?;

        factory(descriptor, sink).map(Some).map_err(|e| {
            Error::ProviderResolution(format!("failed to build gateway for {}: {}", provider, e))
        })
    }
}
