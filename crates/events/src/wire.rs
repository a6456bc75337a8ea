//! Wire encoding: UTF-8 JSON, one event per message.

use thiserror::Error;

use taskrelay_core::{Classify, ErrorClass};

use crate::event::TaskEvent;

/// Name of the durable queue carrying task events.
///
/// Declared idempotently by both producer and consumer on every connect.
pub const TASK_EVENTS_QUEUE: &str = "task_events";

/// Wire (de)serialization failure.
///
/// A message that fails to decode will never decode; it is the poison
/// message case and is dropped, not retried.
#[derive(Debug, Error)]
#[error("malformed event payload: {0}")]
pub struct WireError(#[from] serde_json::Error);

impl Classify for WireError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Ignorable
    }
}

/// Serialize an event for publication.
pub fn encode(event: &TaskEvent) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(event)?)
}

/// Parse a message body received from the queue.
pub fn decode(bytes: &[u8]) -> Result<TaskEvent, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}
