//! Core traits - the seams to gateways, storage and the client transport

use async_trait::async_trait;

use crate::core::events::Notification;
use crate::core::{AppId, Error, OrderRequest, ProviderName, Result, Symbol};

/// Capability interface every provider adapter implements.
///
/// Connection state changes and data are reported through the
/// [`EventSink`](crate::core::events::EventSink) handed to the adapter's
/// constructor, never through return values of `start`.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Provider this gateway connects to
    fn provider(&self) -> &ProviderName;

    /// Begin connecting. May return before the connection is established;
    /// a synchronous adapter returns an error when the connect attempt fails.
    async fn start(&self) -> Result<()>;

    /// Disconnect and release the underlying session
    async fn stop(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn subscribe(&self, symbol: &Symbol) -> Result<()> {
        Err(Error::NotImplemented(format!(
            "{} does not support subscribe({})",
            self.provider(),
            symbol
        )))
    }

    async fn unsubscribe(&self, symbol: &Symbol) -> Result<()> {
        Err(Error::NotImplemented(format!(
            "{} does not support unsubscribe({})",
            self.provider(),
            symbol
        )))
    }

    async fn send_order(&self, order: &OrderRequest) -> Result<()> {
        Err(Error::NotImplemented(format!(
            "{} does not route orders ({})",
            self.provider(),
            order.client_order_id
        )))
    }
}

/// Storage for journaled entities
pub trait Repository<T>: Send + Sync {
    fn save(&self, entity: T) -> Result<()>;
}

/// Outbound half of the client-facing transport
pub trait Communicator: Send + Sync {
    /// Deliver one notification to one application. Fire-and-forget.
    fn send(&self, app: &AppId, notification: &Notification) -> Result<()>;
}
