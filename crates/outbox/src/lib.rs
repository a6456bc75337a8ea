//! `taskrelay-outbox` — transactional outbox and relay poller.
//!
//! A domain mutation and the event describing it are recorded in the
//! same store transaction; a poller relays recorded events to the
//! broker afterwards. Publication is therefore decoupled from broker
//! availability: if the broker is down, events wait in the outbox.
//!
//! Delivery is at-least-once. Events move `PENDING → PROCESSING → SENT`
//! and revert to `PENDING` when a publish fails; events stuck in
//! `PROCESSING` (crash between publish and mark-sent) are reset by a
//! periodic staleness sweep and redelivered, which the consumer's
//! idempotency handling absorbs.

pub mod event;
pub mod in_memory;
pub mod poller;
pub mod store;

pub use event::{OutboxEvent, OutboxStatus};
pub use in_memory::{InMemoryOutboxStore, OutboxTransaction};
pub use poller::{OutboxPoller, PollerConfig, PollerHandle};
pub use store::{OutboxStore, OutboxStoreError};
