//! Black-box pipeline tests: outbox writes on one side, activity
//! records on the other, an in-process broker in between.

use std::sync::Arc;
use std::time::Duration;

use taskrelay_activity::{ActivityConsumer, ConsumerConfig, InMemoryActivityStore};
use taskrelay_broker::{BrokerError, ConnectionManager, InMemoryBroker, ManagerConfig};
use taskrelay_core::{RetryPolicy, TaskId, UserId};
use taskrelay_events::{TASK_EVENTS_QUEUE, TaskEvent};
use taskrelay_outbox::{InMemoryOutboxStore, OutboxPoller, OutboxStatus, PollerConfig, PollerHandle};

fn fast_retries(config: &mut ManagerConfig) {
    config.startup = config
        .startup
        .clone()
        .with_delays(Duration::from_millis(10), Duration::from_millis(50));
    config.background = config
        .background
        .clone()
        .with_delays(Duration::from_millis(10), Duration::from_millis(50));
}

struct Pipeline {
    broker: InMemoryBroker,
    producer: Arc<ConnectionManager>,
    consumer_link: Arc<ConnectionManager>,
    outbox: Arc<InMemoryOutboxStore>,
    activity: Arc<InMemoryActivityStore>,
    consumer: Arc<ActivityConsumer>,
    poller: Option<PollerHandle>,
}

impl Pipeline {
    /// Producer and consumer processes wired to one shared broker, with
    /// test-friendly retry delays and a fast poller tick.
    async fn spawn() -> Self {
        let broker = InMemoryBroker::new();

        let mut producer_config = ManagerConfig::producer(TASK_EVENTS_QUEUE);
        fast_retries(&mut producer_config);
        let producer = ConnectionManager::new(Arc::new(broker.clone()), producer_config);
        producer.channel().await.expect("producer startup");

        let mut consumer_config = ManagerConfig::consumer(TASK_EVENTS_QUEUE);
        fast_retries(&mut consumer_config);
        let consumer_link = ConnectionManager::new(Arc::new(broker.clone()), consumer_config);

        let activity = Arc::new(InMemoryActivityStore::new());
        let consumer = ActivityConsumer::new(
            Arc::clone(&consumer_link),
            activity.clone(),
            ConsumerConfig::default(),
        );
        consumer.start().await.expect("consumer startup");

        let outbox = Arc::new(InMemoryOutboxStore::new());
        let poller = OutboxPoller::spawn(
            outbox.clone(),
            Arc::clone(&producer),
            PollerConfig {
                interval: Duration::from_millis(100),
                sweep_every: 5,
                stale_after: Duration::from_secs(60),
            },
        );

        Self {
            broker,
            producer,
            consumer_link,
            outbox,
            activity,
            consumer,
            poller: Some(poller),
        }
    }

    fn record(&self, event: TaskEvent) {
        let mut txn = self.outbox.begin();
        txn.stage(event);
        txn.commit();
    }

    async fn teardown(mut self) {
        if let Some(poller) = self.poller.take() {
            poller.shutdown().await;
        }
        self.consumer.stop().await;
        self.consumer_link.shutdown().await;
        self.producer.shutdown().await;
    }
}

fn created(task: &str, title: &str) -> TaskEvent {
    TaskEvent::created(TaskId::new(task), UserId::new("u1"), title)
}

#[tokio::test(start_paused = true)]
async fn events_flow_from_outbox_to_activity_feed() {
    let pipeline = Pipeline::spawn().await;

    pipeline.record(created("t1", "write the report"));
    pipeline.record(TaskEvent::assigned(
        TaskId::new("t1"),
        UserId::new("u1"),
        "write the report",
        UserId::new("u2"),
    ));
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(pipeline.outbox.count_with_status(OutboxStatus::Sent), 2);
    let records = pipeline.activity.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].description, "Task \"write the report\" was created.");
    assert_eq!(
        records[1].description,
        "Task \"write the report\" was assigned to u2."
    );
    assert_eq!(pipeline.broker.unacked_len(TASK_EVENTS_QUEUE), 0);

    pipeline.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn pipeline_recovers_from_a_broker_outage() {
    let pipeline = Pipeline::spawn().await;

    pipeline.record(created("t1", "before the outage"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pipeline.activity.len(), 1);

    // Drop every connection. Both sides reconnect in the background and
    // the consumer re-establishes its subscription.
    pipeline.broker.kill_connections();
    pipeline.record(created("t2", "during the outage"));
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(pipeline.outbox.count_with_status(OutboxStatus::Sent), 2);
    assert_eq!(pipeline.activity.len(), 2);
    assert_eq!(pipeline.broker.unacked_len(TASK_EVENTS_QUEUE), 0);

    pipeline.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn redelivered_creation_events_produce_one_record() {
    let pipeline = Pipeline::spawn().await;

    // The same creation event recorded twice, as a crash between
    // publish and mark-sent would produce.
    let event = created("t1", "exactly once, effectively");
    pipeline.record(event.clone());
    pipeline.record(event);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(pipeline.outbox.count_with_status(OutboxStatus::Sent), 2);
    assert_eq!(pipeline.activity.len(), 1);
    assert_eq!(pipeline.broker.unacked_len(TASK_EVENTS_QUEUE), 0);

    pipeline.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn a_poison_message_does_not_wedge_the_consumer() {
    let pipeline = Pipeline::spawn().await;

    pipeline
        .producer
        .publish(b"{\"this is\": \"not a task event\"")
        .await
        .expect("raw publish");
    pipeline.record(created("t1", "still flowing"));
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(pipeline.activity.len(), 1);
    assert_eq!(pipeline.broker.ready_len(TASK_EVENTS_QUEUE), 0);
    assert_eq!(pipeline.broker.unacked_len(TASK_EVENTS_QUEUE), 0);

    pipeline.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn consumer_startup_fails_fatally_when_the_broker_never_answers() {
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(u32::MAX);

    let mut config = ManagerConfig::consumer(TASK_EVENTS_QUEUE);
    fast_retries(&mut config);
    let link = ConnectionManager::new(Arc::new(broker), config);
    let consumer = ActivityConsumer::new(
        link,
        Arc::new(InMemoryActivityStore::new()),
        ConsumerConfig::default(),
    );

    match consumer.start().await {
        Err(BrokerError::RetriesExhausted { attempts }) => assert_eq!(attempts, 3),
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_unpublished_events_pending() {
    let pipeline = Pipeline::spawn().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outbox = pipeline.outbox.clone();
    pipeline.teardown().await;

    // Recorded after teardown: nothing relays it, nothing is lost.
    let mut txn = outbox.begin();
    txn.stage(created("t9", "next deploy picks this up"));
    txn.commit();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(outbox.count_with_status(OutboxStatus::Pending), 1);
}
