//! Broker-layer error model.

use thiserror::Error;

use taskrelay_core::{Classify, ErrorClass};

/// Failure raised by the transport or the connection manager.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Could not establish a connection (refused, reset, DNS, ...).
    #[error("broker connect failed: {0}")]
    Connect(String),

    /// Queue declaration failed on a fresh channel.
    #[error("queue declaration failed: {0}")]
    Declare(String),

    /// No channel is currently held; the caller should retry later
    /// (the manager reconnects in the background).
    #[error("no broker channel available")]
    ChannelUnavailable,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consume failed: {0}")]
    Consume(String),

    /// Acknowledging or rejecting a delivery failed. The message will
    /// be redelivered by the broker; nothing to do per-message.
    #[error("acknowledgment failed: {0}")]
    Ack(String),

    /// Closing a channel or connection failed during shutdown. Logged
    /// and suppressed so teardown always runs to completion.
    #[error("close failed: {0}")]
    Close(String),

    /// Startup-mode acquisition ran out of attempts. The owning process
    /// is expected to treat this as fatal and exit.
    #[error("max retries reached during startup ({attempts} attempts)")]
    RetriesExhausted { attempts: u32 },

    /// Shutdown was requested; no further connect attempts are made.
    #[error("shutdown in progress")]
    ShuttingDown,
}

impl Classify for BrokerError {
    fn class(&self) -> ErrorClass {
        match self {
            BrokerError::Connect(_)
            | BrokerError::Declare(_)
            | BrokerError::ChannelUnavailable
            | BrokerError::Publish(_)
            | BrokerError::Consume(_) => ErrorClass::Retryable,
            BrokerError::Ack(_) | BrokerError::Close(_) => ErrorClass::Ignorable,
            BrokerError::RetriesExhausted { .. } | BrokerError::ShuttingDown => ErrorClass::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(BrokerError::Connect("refused".into()).class().is_retryable());
        assert!(BrokerError::ChannelUnavailable.class().is_retryable());
        assert!(BrokerError::Publish("channel closed".into()).class().is_retryable());
    }

    #[test]
    fn terminal_outcomes_are_fatal() {
        assert!(BrokerError::RetriesExhausted { attempts: 10 }.class().is_fatal());
        assert!(BrokerError::ShuttingDown.class().is_fatal());
    }
}
