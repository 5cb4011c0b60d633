//! Outbound consumer - hands queued notifications to the client transport

use std::sync::Arc;

use crate::core::{Communicator, Error, Notification, Result};
use crate::pipeline::{EventHandler, envelope};

pub struct Forwarder {
    communicator: Arc<dyn Communicator>,
}

impl Forwarder {
    pub fn new(communicator: Arc<dyn Communicator>) -> Self {
        Self { communicator }
    }
}

impl EventHandler for Forwarder {
    fn on_next(&mut self, payload: &[u8], sequence: u64, _end_of_batch: bool) -> Result<()> {
        let notification: Notification = envelope::decode(payload, sequence)?;
        self.communicator
            .send(&notification.app, &notification)
            .map_err(|e| Error::ConsumerProcessing {
                sequence,
                reason: format!("delivery to {} failed: {}", notification.app, e),
            })
    }
}
