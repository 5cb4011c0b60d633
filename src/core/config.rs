//! Configuration - Type-safe, validated config

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::core::{Error, ProviderName, ProviderRole, Result};

/// Engine server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server settings
    pub app: AppConfig,

    /// Ring sizing shared by the outbound and journal pipelines
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Session multiplexing
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Provider descriptors
    #[serde(default)]
    pub providers: Vec<ProviderDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server name used in logs
    pub name: String,

    /// Roles this server multiplexes providers for
    #[serde(default = "default_roles")]
    pub roles: Vec<ProviderRole>,

    /// Journal provider data through the pipeline
    #[serde(default = "default_true")]
    pub journal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of slots, power of two
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Bytes per slot; bounds the largest payload
    #[serde(default = "default_slot_size")]
    pub slot_size: usize,

    /// Pin consumer threads to these cores, in handler order
    #[serde(default)]
    pub consumer_cores: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Evict entries whose last connect failure is older than this. 0 disables.
    #[serde(default = "default_stale_timeout")]
    pub stale_entry_timeout_secs: u64,

    /// How often the reaper looks for stale entries
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

/// Enough information to build one provider's gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Provider name clients log on with
    pub name: ProviderName,

    /// Gateway constructor key (e.g. "simulated")
    pub kind: String,

    pub role: ProviderRole,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Adapter specific settings
    #[serde(default = "empty_table")]
    pub params: toml::Table,
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<ProviderName>, kind: impl Into<String>, role: ProviderRole) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            role,
            enabled: true,
            params: toml::Table::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params
            .get(key)
            .and_then(|v| v.as_integer())
            .and_then(|v| u64::try_from(v).ok())
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(|v| v.as_bool())
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

fn default_roles() -> Vec<ProviderRole> {
    vec![ProviderRole::MarketData, ProviderRole::OrderExecution]
}
fn default_true() -> bool {
    true
}
fn default_capacity() -> usize {
    1024
}
fn default_slot_size() -> usize {
    4096
}
fn default_stale_timeout() -> u64 {
    30
}
fn default_reap_interval() -> u64 {
    5
}
fn empty_table() -> toml::Table {
    toml::Table::new()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            slot_size: default_slot_size(),
            consumer_cores: vec![],
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stale_entry_timeout_secs: default_stale_timeout(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

impl SessionConfig {
    pub fn stale_entry_timeout(&self) -> Option<Duration> {
        (self.stale_entry_timeout_secs > 0).then(|| Duration::from_secs(self.stale_entry_timeout_secs))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig {
                name: "engine-hub".to_string(),
                roles: default_roles(),
                journal: true,
            },
            pipeline: PipelineConfig::default(),
            sessions: SessionConfig::default(),
            providers: vec![],
        }
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config {}: {}", path.display(), e)))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.capacity == 0 || !self.pipeline.capacity.is_power_of_two() {
            return Err(Error::Config(format!(
                "pipeline.capacity must be a power of two, got {}",
                self.pipeline.capacity
            )));
        }
        if self.pipeline.slot_size == 0 {
            return Err(Error::Config("pipeline.slot_size must be non-zero".into()));
        }

        let mut seen = HashSet::new();
        for p in &self.providers {
            if !seen.insert((p.role, p.name.clone())) {
                return Err(Error::Config(format!(
                    "provider {} declared twice for role {}",
                    p.name, p.role
                )));
            }
        }
        Ok(())
    }

    /// Enabled descriptor for `name` within `role`
    pub fn provider(&self, role: ProviderRole, name: &ProviderName) -> Option<&ProviderDescriptor> {
        self.providers
            .iter()
            .find(|p| p.enabled && p.role == role && &p.name == name)
    }

    pub fn providers_for(&self, role: ProviderRole) -> Vec<ProviderDescriptor> {
        self.providers
            .iter()
            .filter(|p| p.role == role)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[app]
name = "market-data-engine"
roles = ["market_data"]

[pipeline]
capacity = 256
slot_size = 1024

[sessions]
stale_entry_timeout_secs = 0

[[providers]]
name = "Blackwood"
kind = "simulated"
role = "market_data"

[providers.params]
connect_delay_ms = 5

[[providers]]
name = "Sterling"
kind = "simulated"
role = "market_data"
enabled = false
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.app.roles, vec![ProviderRole::MarketData]);
        assert!(config.app.journal);
        assert_eq!(config.pipeline.capacity, 256);
        assert_eq!(config.sessions.stale_entry_timeout(), None);

        let blackwood = config
            .provider(ProviderRole::MarketData, &ProviderName::new("Blackwood"))
            .unwrap();
        assert_eq!(blackwood.param_u64("connect_delay_ms"), Some(5));

        // disabled providers do not resolve
        assert!(config
            .provider(ProviderRole::MarketData, &ProviderName::new("Sterling"))
            .is_none());
        // names are scoped by role
        assert!(config
            .provider(ProviderRole::OrderExecution, &ProviderName::new("Blackwood"))
            .is_none());
    }

    #[test]
    fn test_rejects_bad_capacity() {
        let mut config = Config::default();
        config.pipeline.capacity = 1000;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_duplicate_provider() {
        let mut config = Config::default();
        config.providers = vec![
            ProviderDescriptor::new("Blackwood", "simulated", ProviderRole::MarketData),
            ProviderDescriptor::new("Blackwood", "simulated", ProviderRole::MarketData),
        ];
        assert!(config.validate().is_err());

        // same name under another role is fine
        config.providers[1].role = ProviderRole::OrderExecution;
        assert!(config.validate().is_ok());
    }
}
