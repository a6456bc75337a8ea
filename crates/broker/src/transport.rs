//! Transport seam between the pipeline and a concrete broker client.
//!
//! The connection manager, poller, and consumer are written against
//! these traits. [`crate::in_memory`] implements them in-process for
//! tests; the `amqp` feature implements them over RabbitMQ.
//!
//! A channel is a logical sub-connection multiplexed over the physical
//! connection; it carries publish and consume operations and cannot
//! outlive its connection.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BrokerError;

/// An error or close event from an established link.
///
/// Connection-level and channel-level events are multiplexed onto one
/// stream so the manager routes them through a single disconnect
/// handler. Several events may fire for the same underlying failure;
/// the handler is expected to deduplicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectionError(String),
    ConnectionClosed,
    ChannelError(String),
    ChannelClosed,
}

impl LinkEvent {
    /// Which side of the link the event came from, for logging.
    pub fn source(&self) -> &'static str {
        match self {
            LinkEvent::ConnectionError(_) | LinkEvent::ConnectionClosed => "connection",
            LinkEvent::ChannelError(_) | LinkEvent::ChannelClosed => "channel",
        }
    }
}

/// Factory for physical broker connections.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

/// An established physical connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Open a logical channel over this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Take the stream of error/close events for this connection and
    /// its channels. Yields `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A logical channel carrying publish/consume operations.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declare the durable queue. Idempotent; safe to repeat on every
    /// connect.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Publish a persistent message. Fire-and-forget: reliability comes
    /// from the outbox retry loop, not publisher confirms.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Subscribe with manual acknowledgment. At most `prefetch`
    /// deliveries are outstanding (delivered but neither acked nor
    /// rejected) at any time.
    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<Delivery>, BrokerError>;

    /// Cancel the active subscription, if any. Idempotent.
    async fn cancel_consumer(&self) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

impl core::fmt::Debug for dyn BrokerChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BrokerChannel").finish_non_exhaustive()
    }
}

/// Acknowledgment handle bound to one delivery.
#[async_trait]
pub trait DeliveryAck: Send + 'static {
    /// Acknowledge successful processing.
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Reject without requeue. The broker drops the message; used for
    /// poison messages and unrecoverable per-message failures.
    async fn reject(self: Box<Self>) -> Result<(), BrokerError>;
}

/// One message delivered to a consumer.
pub struct Delivery {
    pub payload: Vec<u8>,
    acker: Box<dyn DeliveryAck>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, acker: Box<dyn DeliveryAck>) -> Self {
        Self { payload, acker }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn reject(self) -> Result<(), BrokerError> {
        self.acker.reject().await
    }
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
