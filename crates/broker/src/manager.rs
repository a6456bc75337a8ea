//! Broker connection manager.
//!
//! Owns the lifecycle of one connection and one channel per process and
//! keeps them alive transparently to callers:
//!
//! - **Startup mode**: an explicit caller awaits [`ConnectionManager::channel`].
//!   Attempts are bounded by the startup retry policy; exhausting them
//!   fails the caller with [`BrokerError::RetriesExhausted`], which the
//!   owning process treats as fatal.
//! - **Background mode**: after a previously successful connection drops,
//!   the manager retries forever with full-jitter backoff. Once
//!   reconnected it re-runs the registered resubscribe hook, because a
//!   consumer subscription does not survive a channel replacement.
//!
//! Connection- and channel-level error/close events arrive on one event
//! stream and are routed through a single disconnect handler, which only
//! schedules a reconnect when no attempt is already running and a link
//! is actually held — several events for one underlying failure must not
//! spawn overlapping retry chains.
//!
//! Errors during an established link always force a full reconnect.
//! Channel state (subscriptions, outstanding acks) cannot be resumed, so
//! there is no channel-only recovery path.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskrelay_core::RetryPolicy;

use crate::error::BrokerError;
use crate::transport::{BrokerChannel, BrokerConnection, BrokerTransport, LinkEvent};

/// Per-process connection settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Durable queue declared idempotently on every connect.
    pub queue: String,
    /// Bounded policy for startup-mode acquisition.
    pub startup: RetryPolicy,
    /// Unbounded policy for background reconnection.
    pub background: RetryPolicy,
}

impl ManagerConfig {
    /// Producer-process defaults: 10 startup attempts.
    pub fn producer(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            startup: RetryPolicy::bounded(10),
            background: RetryPolicy::unbounded(),
        }
    }

    /// Consumer-process defaults: 3 startup attempts.
    pub fn consumer(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            startup: RetryPolicy::bounded(3),
            background: RetryPolicy::unbounded(),
        }
    }
}

/// Hook invoked with the fresh channel after a background reconnect.
pub type ReconnectHook =
    Box<dyn Fn(Arc<dyn BrokerChannel>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// The link currently held, plus the guards coordinating its lifecycle.
///
/// The channel is present only while its connection is; both are cleared
/// together by the disconnect handler and by shutdown.
struct Link {
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    connecting: bool,
    /// Failures since the last successful connection.
    attempts: u32,
    monitor: Option<JoinHandle<()>>,
    /// At most one outstanding background retry chain.
    retry: Option<JoinHandle<()>>,
}

/// One instance per process, shared by reference with every code path
/// that publishes or consumes.
pub struct ConnectionManager {
    transport: Arc<dyn BrokerTransport>,
    config: ManagerConfig,
    link: Mutex<Link>,
    /// Serializes connection establishment across callers.
    connect_gate: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    reconnect_hook: Mutex<Option<ReconnectHook>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn BrokerTransport>, config: ManagerConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            transport,
            config,
            link: Mutex::new(Link {
                connection: None,
                channel: None,
                connecting: false,
                attempts: 0,
                monitor: None,
                retry: None,
            }),
            connect_gate: Mutex::new(()),
            shutdown_tx,
            reconnect_hook: Mutex::new(None),
        })
    }

    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Register the hook re-establishing the consumer subscription after
    /// a background reconnect.
    pub async fn on_reconnect<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<dyn BrokerChannel>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: ReconnectHook = Box::new(move |chan| Box::pin(hook(chan)));
        *self.reconnect_hook.lock().await = Some(boxed);
    }

    /// Startup-mode channel acquisition.
    ///
    /// Returns the held channel immediately when one exists; otherwise
    /// connects, retrying up to the startup bound with jittered delays.
    /// A shutdown request fails the caller fast, including one arriving
    /// while a retry delay is pending.
    pub async fn channel(self: &Arc<Self>) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow() {
                return Err(BrokerError::ShuttingDown);
            }
            if let Some(chan) = self.link.lock().await.channel.clone() {
                debug!("broker channel already established");
                return Ok(chan);
            }

            let gate = self.connect_gate.lock().await;
            // Re-check under the gate: a background reconnect or another
            // caller may have won the race.
            if let Some(chan) = self.link.lock().await.channel.clone() {
                return Ok(chan);
            }
            let result = self.try_connect().await;
            drop(gate);

            match result {
                Ok(chan) => return Ok(chan),
                Err(BrokerError::ShuttingDown) => return Err(BrokerError::ShuttingDown),
                Err(err) => {
                    let attempts = self.link.lock().await.attempts;
                    if self.config.startup.is_exhausted(attempts) {
                        error!(attempts, error = %err, "max retries reached during startup");
                        return Err(BrokerError::RetriesExhausted { attempts });
                    }
                    let delay = self.config.startup.delay_for_attempt(attempts);
                    self.link.lock().await.attempts = attempts + 1;
                    info!(
                        attempt = attempts + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "broker connect failed, scheduling startup retry"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return Err(BrokerError::ShuttingDown),
                    }
                }
            }
        }
    }

    /// Publish a persistent message to the configured queue through the
    /// held channel. Fails with [`BrokerError::ChannelUnavailable`] when
    /// disconnected; the background reconnect is already underway and
    /// the caller retries at its own granularity (the outbox loop).
    pub async fn publish(&self, payload: &[u8]) -> Result<(), BrokerError> {
        let chan = self.link.lock().await.channel.clone();
        let Some(chan) = chan else {
            warn!("no broker channel available, cannot publish");
            return Err(BrokerError::ChannelUnavailable);
        };
        chan.publish(&self.config.queue, payload).await
    }

    /// Idempotent, ordered teardown: flag first (pending waiters fail
    /// fast), then cancel the consumer, close channel then connection
    /// with close errors suppressed, and clear any pending retry.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            debug!("shutdown already in progress");
            return;
        }
        info!("shutting down broker resources");

        let (connection, channel, monitor, retry) = {
            let mut link = self.link.lock().await;
            link.connecting = false;
            link.attempts = 0;
            (
                link.connection.take(),
                link.channel.take(),
                link.monitor.take(),
                link.retry.take(),
            )
        };

        if let Some(retry) = retry {
            retry.abort();
            debug!("cleared pending reconnect attempt");
        }
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        if let Some(chan) = channel {
            if let Err(err) = chan.cancel_consumer().await {
                warn!(error = %err, "error cancelling consumer during shutdown");
            }
            if let Err(err) = chan.close().await {
                warn!(error = %err, "error closing broker channel");
            }
        }
        if let Some(conn) = connection {
            if let Err(err) = conn.close().await {
                warn!(error = %err, "error closing broker connection");
            }
        }
        info!("broker resource cleanup complete");
    }

    /// One connect attempt: connection, channel, idempotent queue
    /// declaration, then install the disconnect monitor.
    async fn try_connect(self: &Arc<Self>) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if self.is_shutting_down() {
            return Err(BrokerError::ShuttingDown);
        }
        self.link.lock().await.connecting = true;
        let result = self.establish().await;
        let mut link = self.link.lock().await;
        link.connecting = false;
        if self.is_shutting_down() {
            // Shutdown won the race while we were connecting; do not
            // install a link it can no longer tear down.
            drop(link);
            if let Ok((connection, _, _)) = result {
                let _ = connection.close().await;
            }
            return Err(BrokerError::ShuttingDown);
        }
        match result {
            Ok((connection, channel, events)) => {
                link.attempts = 0;
                link.connection = Some(connection);
                link.channel = Some(channel.clone());
                if let Some(old) = link.monitor.take() {
                    old.abort();
                }
                if let Some(events) = events {
                    link.monitor = Some(self.spawn_monitor(events));
                }
                info!(queue = %self.config.queue, "broker connection and channel established");
                Ok(channel)
            }
            Err(err) => Err(err),
        }
    }

    async fn establish(
        &self,
    ) -> Result<
        (
            Arc<dyn BrokerConnection>,
            Arc<dyn BrokerChannel>,
            Option<mpsc::UnboundedReceiver<LinkEvent>>,
        ),
        BrokerError,
    > {
        let connection: Arc<dyn BrokerConnection> = Arc::from(self.transport.connect().await?);
        let channel = connection.open_channel().await?;
        channel.declare_queue(&self.config.queue).await?;
        debug!(queue = %self.config.queue, "durable queue declared");
        let events = connection.take_events();
        Ok((connection, channel, events))
    }

    fn spawn_monitor(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<LinkEvent>) -> JoinHandle<()> {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Some(event) => {
                        if mgr.handle_disconnect(&event).await {
                            break;
                        }
                    }
                    None => {
                        mgr.handle_disconnect(&LinkEvent::ConnectionClosed).await;
                        break;
                    }
                }
            }
        })
    }

    /// Single handler for connection- and channel-level events. Returns
    /// true when the monitor should stop (a reconnect was scheduled or
    /// shutdown owns the teardown).
    async fn handle_disconnect(self: &Arc<Self>, event: &LinkEvent) -> bool {
        if self.is_shutting_down() {
            return true;
        }
        let mut link = self.link.lock().await;
        if link.connecting {
            debug!(source = event.source(), "already connecting, disconnect event ignored");
            return false;
        }
        if link.connection.is_none() && link.channel.is_none() {
            debug!(source = event.source(), "link already cleared, disconnect event ignored");
            return false;
        }
        warn!(source = event.source(), "broker link lost, scheduling background reconnect");
        link.connection = None;
        link.channel = None;
        if let Some(old) = link.retry.take() {
            old.abort();
        }
        link.retry = Some(self.spawn_reconnect());
        true
    }

    /// Unbounded reconnect chain. On success, re-runs the resubscribe
    /// hook with the fresh channel.
    fn spawn_reconnect(self: &Arc<Self>) -> JoinHandle<()> {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = mgr.shutdown_tx.subscribe();
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let attempts = mgr.link.lock().await.attempts;
                let delay = mgr.config.background.delay_for_attempt(attempts);
                mgr.link.lock().await.attempts = attempts + 1;
                info!(
                    attempt = attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling broker reconnect"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }

                let gate = mgr.connect_gate.lock().await;
                if mgr.link.lock().await.channel.is_some() {
                    break;
                }
                let result = mgr.try_connect().await;
                drop(gate);

                match result {
                    Ok(channel) => {
                        info!("background reconnect succeeded");
                        let hook = mgr.reconnect_hook.lock().await;
                        if let Some(hook) = hook.as_ref() {
                            hook(channel).await;
                        }
                        break;
                    }
                    Err(BrokerError::ShuttingDown) => break,
                    Err(err) => {
                        warn!(error = %err, "background reconnect attempt failed");
                    }
                }
            }
        })
    }
}
