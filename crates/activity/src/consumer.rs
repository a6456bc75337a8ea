//! Task-event consumer.
//!
//! Pulls deliveries from the queue, records activity, and settles each
//! message explicitly. A message is acknowledged only after the record
//! is stored or recognized as an already-processed duplicate; malformed
//! payloads and unrecoverable store failures are rejected without
//! requeue so a poison message cannot wedge the queue.
//!
//! The subscription dies with the channel, so the consumer registers a
//! reconnect hook with the connection manager: after a background
//! reconnect it tears down the stale pump and subscribes on the fresh
//! channel.

use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskrelay_broker::{BrokerChannel, BrokerError, ConnectionManager, Delivery};
use taskrelay_events::{TASK_EVENTS_QUEUE, decode};

use crate::record::ActivityRecord;
use crate::store::{ActivityStore, ActivityStoreError};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: String,
    /// Upper bound on deliveries being processed concurrently. Also
    /// used as the broker prefetch window.
    pub max_in_flight: u16,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: TASK_EVENTS_QUEUE.to_string(),
            max_in_flight: 8,
        }
    }
}

struct ConsumerState {
    running: bool,
    pump: Option<JoinHandle<()>>,
}

/// One consumer per process.
pub struct ActivityConsumer {
    manager: Arc<ConnectionManager>,
    store: Arc<dyn ActivityStore>,
    config: ConsumerConfig,
    state: Mutex<ConsumerState>,
}

impl ActivityConsumer {
    pub fn new(
        manager: Arc<ConnectionManager>,
        store: Arc<dyn ActivityStore>,
        config: ConsumerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            store,
            config,
            state: Mutex::new(ConsumerState {
                running: false,
                pump: None,
            }),
        })
    }

    /// Acquire a channel (startup mode), subscribe, and install the
    /// resubscribe hook for background reconnects.
    pub async fn start(self: &Arc<Self>) -> Result<(), BrokerError> {
        let channel = self.manager.channel().await?;

        let consumer = Arc::clone(self);
        self.manager
            .on_reconnect(move |chan| {
                let consumer = Arc::clone(&consumer);
                async move { consumer.resubscribe(chan).await }
            })
            .await;

        self.subscribe(channel).await
    }

    /// Cancel the pump. The channel-level consumer cancellation happens
    /// in the manager's shutdown path.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.running = false;
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
    }

    async fn subscribe(self: &Arc<Self>, channel: Arc<dyn BrokerChannel>) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if state.running {
            // A second subscription would double-deliver every message.
            warn!(queue = %self.config.queue, "consumer already running, ignoring subscribe");
            return Ok(());
        }

        let mut deliveries = channel
            .consume(&self.config.queue, self.config.max_in_flight)
            .await?;
        info!(
            queue = %self.config.queue,
            max_in_flight = self.config.max_in_flight,
            "consumer subscribed"
        );

        state.running = true;
        let consumer = Arc::clone(self);
        let limiter = Arc::new(Semaphore::new(self.config.max_in_flight as usize));
        state.pump = Some(tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
                    break;
                };
                let consumer = Arc::clone(&consumer);
                tokio::spawn(async move {
                    consumer.handle_delivery(delivery).await;
                    drop(permit);
                });
            }
            debug!("delivery stream ended");
            consumer.state.lock().await.running = false;
        }));
        Ok(())
    }

    /// Reconnect hook body: replace the stale subscription with one on
    /// the fresh channel.
    async fn resubscribe(self: &Arc<Self>, channel: Arc<dyn BrokerChannel>) {
        {
            let mut state = self.state.lock().await;
            if let Some(pump) = state.pump.take() {
                pump.abort();
            }
            state.running = false;
        }
        info!(queue = %self.config.queue, "re-establishing consumer subscription");
        if let Err(err) = self.subscribe(channel).await {
            // The subscribe failure surfaces as a link event and the
            // manager schedules another reconnect round.
            error!(error = %err, "failed to re-establish subscription");
        }
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let event = match decode(&delivery.payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "malformed event payload, rejecting");
                if let Err(err) = delivery.reject().await {
                    warn!(error = %err, "failed to reject malformed message");
                }
                return;
            }
        };

        let record = ActivityRecord::from_event(&event);
        match self.store.insert(record).await {
            Ok(()) => {
                debug!(task = %event.task_id, kind = %event.kind, "activity stored");
                if let Err(err) = delivery.ack().await {
                    warn!(error = %err, "failed to ack processed message");
                }
            }
            Err(ActivityStoreError::DuplicateCreation(task)) => {
                // Redelivery of an event we already processed; settle it
                // so the broker stops redelivering.
                info!(%task, "duplicate creation event, acknowledging");
                if let Err(err) = delivery.ack().await {
                    warn!(error = %err, "failed to ack duplicate message");
                }
            }
            Err(err) => {
                error!(task = %event.task_id, error = %err, "failed to store activity, rejecting");
                if let Err(err) = delivery.reject().await {
                    warn!(error = %err, "failed to reject message");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use taskrelay_broker::{InMemoryBroker, ManagerConfig};
    use taskrelay_core::{RetryPolicy, TaskId, UserId};
    use taskrelay_events::{TaskEvent, encode};

    use crate::store::InMemoryActivityStore;

    fn fast_manager(broker: &InMemoryBroker) -> Arc<ConnectionManager> {
        let mut config = ManagerConfig::consumer(TASK_EVENTS_QUEUE);
        config.startup = RetryPolicy::bounded(3)
            .with_delays(Duration::from_millis(10), Duration::from_millis(50));
        config.background = RetryPolicy::unbounded()
            .with_delays(Duration::from_millis(10), Duration::from_millis(50));
        ConnectionManager::new(Arc::new(broker.clone()), config)
    }

    async fn publish(manager: &Arc<ConnectionManager>, event: &TaskEvent) {
        manager.publish(&encode(event).unwrap()).await.unwrap();
    }

    fn created(task: &str, title: &str) -> TaskEvent {
        TaskEvent::created(TaskId::new(task), UserId::new("u1"), title)
    }

    #[tokio::test(start_paused = true)]
    async fn deliveries_are_recorded_and_acknowledged() {
        let broker = InMemoryBroker::new();
        let manager = fast_manager(&broker);
        let store = Arc::new(InMemoryActivityStore::new());
        let consumer =
            ActivityConsumer::new(manager.clone(), store.clone(), ConsumerConfig::default());

        consumer.start().await.unwrap();
        publish(&manager, &created("t1", "first")).await;
        publish(&manager, &created("t2", "second")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.len(), 2);
        assert_eq!(broker.ready_len(TASK_EVENTS_QUEUE), 0);
        assert_eq!(broker.unacked_len(TASK_EVENTS_QUEUE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payloads_are_rejected_and_processing_continues() {
        let broker = InMemoryBroker::new();
        let manager = fast_manager(&broker);
        let store = Arc::new(InMemoryActivityStore::new());
        let consumer =
            ActivityConsumer::new(manager.clone(), store.clone(), ConsumerConfig::default());

        consumer.start().await.unwrap();
        manager.publish(b"not json at all").await.unwrap();
        publish(&manager, &created("t1", "valid")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.len(), 1);
        // Rejected without requeue: the poison message is gone.
        assert_eq!(broker.ready_len(TASK_EVENTS_QUEUE), 0);
        assert_eq!(broker.unacked_len(TASK_EVENTS_QUEUE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivered_creation_events_are_acked_not_duplicated() {
        let broker = InMemoryBroker::new();
        let manager = fast_manager(&broker);
        let store = Arc::new(InMemoryActivityStore::new());
        let consumer =
            ActivityConsumer::new(manager.clone(), store.clone(), ConsumerConfig::default());

        consumer.start().await.unwrap();
        publish(&manager, &created("t1", "once")).await;
        publish(&manager, &created("t1", "once")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.len(), 1);
        assert_eq!(broker.unacked_len(TASK_EVENTS_QUEUE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failures_reject_the_delivery() {
        let broker = InMemoryBroker::new();
        let manager = fast_manager(&broker);
        let store = Arc::new(InMemoryActivityStore::new());
        let consumer =
            ActivityConsumer::new(manager.clone(), store.clone(), ConsumerConfig::default());

        consumer.start().await.unwrap();
        store.fail_next_inserts(1);
        publish(&manager, &created("t1", "lost to the outage")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Rejected without requeue: no record, nothing outstanding.
        assert!(store.is_empty());
        assert_eq!(broker.ready_len(TASK_EVENTS_QUEUE), 0);
        assert_eq!(broker.unacked_len(TASK_EVENTS_QUEUE), 0);

        // The consumer keeps processing once the store recovers.
        publish(&manager, &created("t2", "recorded")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn double_subscription_is_a_no_op() {
        let broker = InMemoryBroker::new();
        let manager = fast_manager(&broker);
        let store = Arc::new(InMemoryActivityStore::new());
        let consumer =
            ActivityConsumer::new(manager.clone(), store.clone(), ConsumerConfig::default());

        consumer.start().await.unwrap();
        let channel = manager.channel().await.unwrap();
        consumer.subscribe(channel).await.unwrap();

        publish(&manager, &created("t1", "one record")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_survives_a_connection_drop() {
        let broker = InMemoryBroker::new();
        let manager = fast_manager(&broker);
        let store = Arc::new(InMemoryActivityStore::new());
        let consumer =
            ActivityConsumer::new(manager.clone(), store.clone(), ConsumerConfig::default());

        consumer.start().await.unwrap();
        publish(&manager, &created("t1", "before")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        broker.kill_connections();
        tokio::time::sleep(Duration::from_millis(300)).await;

        publish(&manager, &created("t2", "after")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.len(), 2);
        assert_eq!(broker.unacked_len(TASK_EVENTS_QUEUE), 0);
    }
}
