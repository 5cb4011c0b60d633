//! Error handling - one hierarchy for sessions, pipelines and storage

use thiserror::Error;

use crate::core::types::{AppId, ProviderName};

pub type Result<T> = std::result::Result<T, Error>;

/// Engine hub error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provider name unknown to the registry, or its gateway could not be built
    #[error("Provider resolution error: {0}")]
    ProviderResolution(String),

    /// Gateway failed to connect
    #[error("Connection error on {provider}: {reason}")]
    Connection {
        provider: ProviderName,
        reason: String,
    },

    /// Command issued by an application that holds no session on the provider
    #[error("Application {app} is not logged on to {provider}")]
    NotLoggedOn { provider: ProviderName, app: AppId },

    /// Gateway command failures
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Payload does not fit a pipeline slot
    #[error("Payload of {len} bytes exceeds slot size {slot_size}")]
    PayloadTooLarge { len: usize, slot_size: usize },

    /// Pipeline lifecycle errors
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// A single slot could not be handled by a consumer
    #[error("Consumer failed at sequence {sequence}: {reason}")]
    ConsumerProcessing { sequence: u64, reason: String },

    /// Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Not implemented
    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl Error {
    pub fn connection(provider: &ProviderName, reason: impl Into<String>) -> Self {
        Self::Connection {
            provider: provider.clone(),
            reason: reason.into(),
        }
    }

    /// Errors local to one request that the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Gateway(_))
    }
}
