//! RabbitMQ transport adapter (feature `amqp`), backed by `lapin`.
//!
//! Maps the transport seam onto a real AMQP connection: durable queue
//! declaration, persistent publishes, and manual-ack consumption with a
//! `basic.qos` prefetch window. Connection errors surface through the
//! client's error callback; channel failures surface when the consumer
//! stream ends or errors, since both mean the subscription is gone and
//! a full reconnect is required anyway.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_lite::stream::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ConnectionProperties};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::BrokerError;
use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerTransport, Delivery, DeliveryAck, LinkEvent,
};

const CONSUMER_TAG: &str = "taskrelay-consumer";

/// Transport connecting to an AMQP broker by URI.
pub struct AmqpTransport {
    uri: String,
}

impl AmqpTransport {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let connection = lapin::Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        {
            let tx = events_tx.clone();
            connection.on_error(move |err| {
                let _ = tx.send(LinkEvent::ConnectionError(err.to_string()));
            });
        }

        Ok(Box::new(AmqpConnection {
            inner: connection,
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
        }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        Ok(Arc::new(AmqpChannel {
            inner: channel,
            events_tx: self.events_tx.clone(),
            consumer_tag: StdMutex::new(None),
            cancelled: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(200, "shutdown")
            .await
            .map_err(|e| BrokerError::Close(e.to_string()))
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    consumer_tag: StdMutex<Option<String>>,
    cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Declare(e.to_string()))
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        // delivery_mode 2 = persistent. The confirm future is dropped:
        // no publisher confirms, reliability comes from the outbox loop.
        self.inner
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map(|_confirm| ())
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        self.inner
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        let mut consumer = self
            .inner
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        *self.consumer_tag.lock().unwrap() = Some(CONSUMER_TAG.to_string());
        self.cancelled.store(false, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(usize::from(prefetch).max(1));
        let events_tx = self.events_tx.clone();
        let cancelled = Arc::clone(&self.cancelled);
        tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                match item {
                    Ok(delivery) => {
                        let payload = delivery.data.clone();
                        let acker = Box::new(AmqpAck {
                            acker: delivery.acker,
                        });
                        if tx.send(Delivery::new(payload, acker)).await.is_err() {
                            debug!("delivery receiver dropped, stopping consumer pump");
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "consumer stream error");
                        let _ = events_tx.send(LinkEvent::ChannelError(err.to_string()));
                        return;
                    }
                }
            }
            if !cancelled.load(Ordering::SeqCst) {
                let _ = events_tx.send(LinkEvent::ChannelClosed);
            }
        });

        Ok(rx)
    }

    async fn cancel_consumer(&self) -> Result<(), BrokerError> {
        let tag = self.consumer_tag.lock().unwrap().take();
        if let Some(tag) = tag {
            self.cancelled.store(true, Ordering::SeqCst);
            self.inner
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await
                .map_err(|e| BrokerError::Consume(e.to_string()))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner
            .close(200, "shutdown")
            .await
            .map_err(|e| BrokerError::Close(e.to_string()))
    }
}

struct AmqpAck {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl DeliveryAck for AmqpAck {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn reject(self: Box<Self>) -> Result<(), BrokerError> {
        self.acker
            .nack(BasicNackOptions {
                requeue: false,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
