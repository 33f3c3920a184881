use std::sync::{Mutex, PoisonError};

use crate::error::PublishError;

/// Outbound side of the transport.
pub trait CommandPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), PublishError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Keeps every publish in memory. Used where no broker is attached.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<PublishedMessage>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<PublishedMessage> {
        self.messages().pop()
    }
}

impl CommandPublisher for RecordingPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), PublishError> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedMessage {
                topic: topic.to_string(),
                payload,
                retain,
            });
        Ok(())
    }
}
