//! Session layer - provider resolution, shared gateway sessions, observers

pub mod multiplexer;
pub mod observers;
pub mod registry;

pub use multiplexer::{LogonOutcome, LogoutOutcome, SessionMultiplexer};
pub use observers::{ObserverRegistry, SubscriptionId};
pub use registry::{GatewayFactory, ProviderRegistry};
