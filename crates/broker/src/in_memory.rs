//! In-process broker for tests and local development.
//!
//! Implements the transport seam with real delivery semantics:
//! durable-enough queues (they survive connections, not the process),
//! manual acknowledgment, prefetch-bounded dispatch, and redelivery of
//! unacknowledged messages when a link dies. Failure injection
//! ([`InMemoryBroker::fail_next_connects`],
//! [`InMemoryBroker::kill_connections`]) drives the reconnection
//! scenarios in the test suites.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::BrokerError;
use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerTransport, Delivery, DeliveryAck, LinkEvent,
};

/// Shared broker handle. Cloning shares the underlying queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    core: Arc<BrokerCore>,
}

struct BrokerCore {
    queues: Mutex<HashMap<String, QueueState>>,
    connections: Mutex<Vec<Weak<ConnCore>>>,
    fail_connects: AtomicU32,
    next_id: AtomicU64,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Vec<u8>>,
    unacked: HashMap<u64, Vec<u8>>,
    consumer: Option<ConsumerSeat>,
}

struct ConsumerSeat {
    id: u64,
    tx: mpsc::Sender<Delivery>,
    prefetch: usize,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            core: Arc::new(BrokerCore {
                queues: Mutex::new(HashMap::new()),
                connections: Mutex::new(Vec::new()),
                fail_connects: AtomicU32::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Make the next `n` connect attempts fail with a refused error.
    pub fn fail_next_connects(&self, n: u32) {
        self.core.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Forcibly drop every live connection, emitting error and close
    /// events. Unacknowledged deliveries return to their queues.
    pub fn kill_connections(&self) {
        let conns: Vec<Arc<ConnCore>> = {
            let mut registry = self.core.connections.lock().unwrap();
            let live: Vec<Arc<ConnCore>> = registry.iter().filter_map(Weak::upgrade).collect();
            registry.clear();
            live
        };
        for conn in conns {
            conn.kill();
        }
    }

    /// Messages waiting for dispatch on `queue`.
    pub fn ready_len(&self, queue: &str) -> usize {
        let queues = self.core.queues.lock().unwrap();
        queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Messages delivered but not yet acknowledged on `queue`.
    pub fn unacked_len(&self, queue: &str) -> usize {
        let queues = self.core.queues.lock().unwrap();
        queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let remaining = self.core.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.core.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::Connect("connection refused".to_string()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(ConnCore {
            broker: Arc::clone(&self.core),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            closed: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
        });
        self.core
            .connections
            .lock()
            .unwrap()
            .push(Arc::downgrade(&conn));
        Ok(Box::new(InMemoryConnection { core: conn }))
    }
}

impl BrokerCore {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Push ready messages to the consumer, respecting its prefetch.
    ///
    /// Call with the queues lock held via the wrappers below.
    fn dispatch_locked(self: &Arc<Self>, queues: &mut HashMap<String, QueueState>, queue: &str) {
        let Some(state) = queues.get_mut(queue) else {
            return;
        };
        loop {
            let (tx, prefetch) = match state.consumer.as_ref() {
                Some(seat) => (seat.tx.clone(), seat.prefetch),
                None => return,
            };
            if state.unacked.len() >= prefetch || state.ready.is_empty() {
                return;
            }
            let payload = state.ready.pop_front().unwrap();
            let tag = self.next_id();
            let delivery = Delivery::new(
                payload.clone(),
                Box::new(InMemoryAck {
                    broker: Arc::clone(self),
                    queue: queue.to_string(),
                    tag,
                }),
            );
            match tx.try_send(delivery) {
                Ok(()) => {
                    state.unacked.insert(tag, payload);
                }
                Err(mpsc::error::TrySendError::Full(d)) => {
                    state.ready.push_front(d.payload);
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(d)) => {
                    state.ready.push_front(d.payload);
                    state.consumer = None;
                    return;
                }
            }
        }
    }

    fn settle(self: &Arc<Self>, queue: &str, tag: u64, requeue: bool) {
        let mut queues = self.queues.lock().unwrap();
        if let Some(state) = queues.get_mut(queue) {
            if let Some(payload) = state.unacked.remove(&tag) {
                if requeue {
                    state.ready.push_front(payload);
                }
            }
        }
        self.dispatch_locked(&mut queues, queue);
    }

    /// Return a dead channel's outstanding deliveries to the queue and
    /// detach its consumer.
    fn drop_channel_state(self: &Arc<Self>, consuming: Option<(String, u64)>) {
        let Some((queue, seat_id)) = consuming else {
            return;
        };
        let mut queues = self.queues.lock().unwrap();
        if let Some(state) = queues.get_mut(&queue) {
            if state.consumer.as_ref().is_some_and(|s| s.id == seat_id) {
                state.consumer = None;
                let mut tags: Vec<u64> = state.unacked.keys().copied().collect();
                tags.sort_unstable();
                for tag in tags.into_iter().rev() {
                    if let Some(payload) = state.unacked.remove(&tag) {
                        state.ready.push_front(payload);
                    }
                }
            }
        }
    }
}

struct ConnCore {
    broker: Arc<BrokerCore>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    closed: AtomicBool,
    channels: Mutex<Vec<Arc<ChanCore>>>,
}

impl ConnCore {
    fn teardown(&self) {
        let channels: Vec<Arc<ChanCore>> = self.channels.lock().unwrap().drain(..).collect();
        for chan in channels {
            chan.teardown();
        }
    }

    /// Simulated crash: tear the link down and emit both an error and a
    /// close event, the way a real client library does for one failure.
    fn kill(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("in-memory broker: killing connection");
        self.teardown();
        let _ = self
            .events_tx
            .send(LinkEvent::ConnectionError("connection reset".to_string()));
        let _ = self.events_tx.send(LinkEvent::ConnectionClosed);
    }
}

struct InMemoryConnection {
    core: Arc<ConnCore>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if self.core.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect("connection closed".to_string()));
        }
        let chan = Arc::new(ChanCore {
            broker: Arc::clone(&self.core.broker),
            events_tx: self.core.events_tx.clone(),
            conn_closed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            consuming: Mutex::new(None),
        });
        self.core.channels.lock().unwrap().push(Arc::clone(&chan));
        Ok(chan)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.core.events_rx.lock().unwrap().take()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.core.teardown();
        Ok(())
    }
}

struct ChanCore {
    broker: Arc<BrokerCore>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    conn_closed: AtomicBool,
    closed: AtomicBool,
    /// Queue name and seat id of the active subscription.
    consuming: Mutex<Option<(String, u64)>>,
}

impl ChanCore {
    fn teardown(&self) {
        self.conn_closed.store(true, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        let consuming = self.consuming.lock().unwrap().take();
        self.broker.drop_channel_state(consuming);
    }

    fn usable(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.conn_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerChannel for ChanCore {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        if !self.usable() {
            return Err(BrokerError::Declare("channel closed".to_string()));
        }
        let mut queues = self.broker.queues.lock().unwrap();
        queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if !self.usable() {
            return Err(BrokerError::Publish("channel closed".to_string()));
        }
        let mut queues = self.broker.queues.lock().unwrap();
        queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(payload.to_vec());
        self.broker.dispatch_locked(&mut queues, queue);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        if !self.usable() {
            return Err(BrokerError::Consume("channel closed".to_string()));
        }
        let prefetch = usize::from(prefetch).max(1);
        let (tx, rx) = mpsc::channel(prefetch);
        let seat_id = self.broker.next_id();
        {
            let mut queues = self.broker.queues.lock().unwrap();
            let state = queues.entry(queue.to_string()).or_default();
            state.consumer = Some(ConsumerSeat {
                id: seat_id,
                tx,
                prefetch,
            });
            self.broker.dispatch_locked(&mut queues, queue);
        }
        *self.consuming.lock().unwrap() = Some((queue.to_string(), seat_id));
        Ok(rx)
    }

    async fn cancel_consumer(&self) -> Result<(), BrokerError> {
        let consuming = self.consuming.lock().unwrap().take();
        if let Some((queue, seat_id)) = consuming {
            let mut queues = self.broker.queues.lock().unwrap();
            if let Some(state) = queues.get_mut(&queue) {
                if state.consumer.as_ref().is_some_and(|s| s.id == seat_id) {
                    state.consumer = None;
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let consuming = self.consuming.lock().unwrap().take();
        self.broker.drop_channel_state(consuming);
        Ok(())
    }
}

struct InMemoryAck {
    broker: Arc<BrokerCore>,
    queue: String,
    tag: u64,
}

#[async_trait]
impl DeliveryAck for InMemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.broker.settle(&self.queue, self.tag, false);
        Ok(())
    }

    async fn reject(self: Box<Self>) -> Result<(), BrokerError> {
        // No requeue: the message is dropped.
        self.broker.settle(&self.queue, self.tag, false);
        Ok(())
    }
}
