//! Outbound transports for addressed notifications

use tracing::{debug, info};

use crate::core::{AppId, Communicator, Error, Notification, NotificationKind, Result};

/// Writes every notification to the log. Used by the standalone binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCommunicator;

impl Communicator for LoggingCommunicator {
    fn send(&self, app: &AppId, notification: &Notification) -> Result<()> {
        match &notification.kind {
            NotificationKind::Data { data } => debug!(
                app = %app,
                provider = %notification.provider,
                symbol = %data.symbol(),
                "data"
            ),
            kind => info!(
                app = %app,
                provider = %notification.provider,
                role = %notification.role,
                kind = ?kind,
                "notification"
            ),
        }
        Ok(())
    }
}

/// Hands notifications to an in-process client over a flume channel
#[derive(Debug, Clone)]
pub struct ChannelCommunicator {
    tx: flume::Sender<Notification>,
}

impl ChannelCommunicator {
    pub fn new(tx: flume::Sender<Notification>) -> Self {
        Self { tx }
    }

    /// Communicator plus the receiving end for the client
    pub fn pair() -> (Self, flume::Receiver<Notification>) {
        let (tx, rx) = flume::unbounded();
        (Self::new(tx), rx)
    }
}

impl Communicator for ChannelCommunicator {
    fn send(&self, app: &AppId, notification: &Notification) -> Result<()> {
        self.tx
            .send(notification.clone())
            .map_err(|_| Error::InvalidState(format!("client channel for {} closed", app)))
    }
}
