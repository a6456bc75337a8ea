//! Outbox relay poller.
//!
//! A single cancellable task per producer process (single active poller
//! assumed). Each tick atomically claims one pending event, publishes
//! it through the connection manager, and marks it sent — or releases
//! it back to pending when the publish fails, so a later tick retries.
//! Every `sweep_every` ticks the staleness sweep rescues events
//! orphaned in `Processing` by a crash between publish and mark-sent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use taskrelay_broker::ConnectionManager;
use taskrelay_events::encode;

use crate::store::OutboxStore;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Tick interval.
    pub interval: Duration,
    /// Run the staleness sweep every this many ticks. 0 disables it.
    pub sweep_every: u32,
    /// How long an event may sit in `Processing` before the sweep
    /// resets it.
    pub stale_after: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            sweep_every: 12,
            stale_after: Duration::from_secs(60),
        }
    }
}

/// Handle to the running poller task.
pub struct PollerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PollerHandle {
    /// Request shutdown and wait for the in-flight tick to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            warn!(error = %err, "outbox poller task join failed");
        }
    }
}

pub struct OutboxPoller;

impl OutboxPoller {
    /// Spawn the poller bound to the process lifecycle via the returned
    /// handle.
    pub fn spawn(
        store: Arc<dyn OutboxStore>,
        manager: Arc<ConnectionManager>,
        config: PollerConfig,
    ) -> PollerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            info!(interval_ms = config.interval.as_millis() as u64, "outbox poller started");
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks: u32 = 0;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                ticks = ticks.wrapping_add(1);
                if config.sweep_every > 0 && ticks % config.sweep_every == 0 {
                    match store.reset_stale(config.stale_after).await {
                        Ok(0) => {}
                        Ok(count) => warn!(count, "rescued outbox events stuck in processing"),
                        Err(err) => error!(error = %err, "staleness sweep failed"),
                    }
                }
                Self::tick(store.as_ref(), &manager).await;
            }
            info!("outbox poller stopped");
        });
        PollerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    /// One relay step: claim, publish, settle.
    async fn tick(store: &dyn OutboxStore, manager: &ConnectionManager) {
        let event = match store.claim_pending().await {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(err) => {
                error!(error = %err, "failed to claim pending outbox event");
                return;
            }
        };

        let payload = match encode(&event.payload) {
            Ok(payload) => payload,
            Err(err) => {
                // Cannot happen for well-formed events; release so the
                // event is not orphaned in Processing.
                error!(event = %event.id, error = %err, "failed to encode outbox payload");
                if let Err(err) = store.release(event.id).await {
                    error!(event = %event.id, error = %err, "failed to release outbox event");
                }
                return;
            }
        };

        match manager.publish(&payload).await {
            Ok(()) => {
                debug!(event = %event.id, kind = %event.payload.kind, "outbox event published");
                if let Err(err) = store.mark_sent(event.id).await {
                    // The event stays in Processing; the staleness sweep
                    // will re-deliver it.
                    error!(event = %event.id, error = %err, "failed to mark outbox event sent");
                }
            }
            Err(err) => {
                warn!(event = %event.id, error = %err, "publish failed, releasing outbox event");
                if let Err(err) = store.release(event.id).await {
                    error!(event = %event.id, error = %err, "failed to release outbox event");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use taskrelay_broker::{InMemoryBroker, ManagerConfig};
    use taskrelay_core::{RetryPolicy, TaskId, UserId};
    use taskrelay_events::{TASK_EVENTS_QUEUE, TaskEvent};

    use crate::event::OutboxStatus;
    use crate::in_memory::InMemoryOutboxStore;

    fn fast_manager(broker: &InMemoryBroker) -> Arc<ConnectionManager> {
        let mut config = ManagerConfig::producer(TASK_EVENTS_QUEUE);
        config.startup = RetryPolicy::bounded(3)
            .with_delays(Duration::from_millis(10), Duration::from_millis(50));
        config.background = RetryPolicy::unbounded()
            .with_delays(Duration::from_millis(10), Duration::from_millis(50));
        ConnectionManager::new(Arc::new(broker.clone()), config)
    }

    fn fast_poller_config() -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(100),
            sweep_every: 5,
            stale_after: Duration::from_secs(60),
        }
    }

    fn sample(title: &str) -> TaskEvent {
        TaskEvent::created(TaskId::new("t1"), UserId::new("u1"), title)
    }

    #[tokio::test(start_paused = true)]
    async fn pending_events_are_published_and_marked_sent() {
        let broker = InMemoryBroker::new();
        let manager = fast_manager(&broker);
        manager.channel().await.unwrap();

        let store = Arc::new(InMemoryOutboxStore::new());
        let id = store.insert(sample("publish me"));

        let handle = OutboxPoller::spawn(store.clone(), manager.clone(), fast_poller_config());
        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.shutdown().await;

        assert_eq!(store.get(id).unwrap().status, OutboxStatus::Sent);
        assert_eq!(broker.ready_len(TASK_EVENTS_QUEUE), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_releases_the_event_for_retry() {
        let broker = InMemoryBroker::new();
        let manager = fast_manager(&broker);
        // No channel established: publish fails with ChannelUnavailable.

        let store = Arc::new(InMemoryOutboxStore::new());
        let id = store.insert(sample("try again"));

        let handle = OutboxPoller::spawn(store.clone(), manager.clone(), fast_poller_config());
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(store.get(id).unwrap().status, OutboxStatus::Pending);

        // Once the broker is reachable, a later tick delivers it.
        manager.channel().await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.shutdown().await;

        assert_eq!(store.get(id).unwrap().status, OutboxStatus::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_ticker() {
        let broker = InMemoryBroker::new();
        let manager = fast_manager(&broker);
        manager.channel().await.unwrap();

        let store = Arc::new(InMemoryOutboxStore::new());
        let handle = OutboxPoller::spawn(store.clone(), manager, fast_poller_config());
        handle.shutdown().await;

        store.insert(sample("after shutdown"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.count_with_status(OutboxStatus::Pending), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_requeues_stale_processing_events() {
        let broker = InMemoryBroker::new();
        let manager = fast_manager(&broker);
        manager.channel().await.unwrap();

        let store = Arc::new(InMemoryOutboxStore::new());
        let id = store.insert(sample("orphan"));
        // Simulate a crash after claim: the event sits in Processing
        // with an old claim timestamp.
        store.claim_pending().await.unwrap();
        store.backdate_claim(id, chrono::Duration::seconds(120));

        let config = PollerConfig {
            interval: Duration::from_millis(100),
            sweep_every: 2,
            stale_after: Duration::from_secs(60),
        };
        let handle = OutboxPoller::spawn(store.clone(), manager, config);
        tokio::time::sleep(Duration::from_millis(450)).await;
        handle.shutdown().await;

        assert_eq!(store.get(id).unwrap().status, OutboxStatus::Sent);
    }
}
