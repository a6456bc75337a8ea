//! `taskrelay-broker` — broker connectivity for producer and consumer.
//!
//! The pieces, bottom up:
//!
//! - [`transport`]: the seam between the pipeline and a concrete broker
//!   client — connection, channel, and delivery traits.
//! - [`in_memory`]: an in-process broker implementing that seam, with
//!   failure injection. Used by tests and local development.
//! - [`manager`]: the connection manager — one connection and one
//!   channel per process, bounded startup retries, unbounded background
//!   reconnection with full-jitter backoff, coordinated shutdown.
//! - `amqp` (feature `amqp`): the RabbitMQ adapter backed by `lapin`.
//!
//! Each process constructs exactly one [`ConnectionManager`] at startup
//! and passes it by reference to the code paths that publish or consume.

pub mod error;
pub mod in_memory;
pub mod manager;
pub mod shutdown;
pub mod transport;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use error::BrokerError;
pub use in_memory::InMemoryBroker;
pub use manager::{ConnectionManager, ManagerConfig};
pub use shutdown::shutdown_with_grace;
pub use transport::{BrokerChannel, BrokerConnection, BrokerTransport, Delivery, DeliveryAck, LinkEvent};
