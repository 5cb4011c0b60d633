//! Core module - Common types, traits, events and error handling

pub mod config;
pub mod error;
pub mod events;
pub mod traits;
pub mod types;

pub use config::{Config, ProviderDescriptor};
pub use error::{Error, Result};
pub use events::{EventSink, GatewayEvent, GatewayEventKind, Notification, NotificationKind};
pub use traits::*;
pub use types::*;
