use crate::config::AmqpConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Errors from the broker subscription
#[derive(Error, Debug)]
pub enum SubscriberError {
    #[error("failed to connect to broker: {0}")]
    Connect(#[source] lapin::Error),

    #[error("failed to set up exchange binding: {0}")]
    Setup(#[source] lapin::Error),

    #[error("failed to start consuming: {0}")]
    Consume(#[source] lapin::Error),
}

/// Outcome a handler decides for one delivery.
///
/// The subscriber owns settlement: the handler only returns this value, and
/// the broker is told strictly after the handler has finished. Exactly one
/// settlement happens per delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Processing succeeded; remove the message from the queue permanently
    Ack,
    /// Transient failure; leave the message eligible for broker redelivery
    Requeue,
    /// Poison message; drop (or dead-letter), never redeliver
    Discard,
}

/// A received event with payload and delivery metadata
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    /// Raw message payload
    pub payload: Vec<u8>,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key (empty on a fanout exchange)
    pub routing_key: String,
    /// Whether the broker has delivered this message before
    pub redelivered: bool,
    /// When this instance received the delivery
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
impl InboundDelivery {
    /// Delivery carrying `payload`, fresh off the wire
    pub(crate) fn for_payload(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            exchange: "video-uploaded".to_string(),
            routing_key: String::new(),
            redelivered: false,
            received_at: Utc::now(),
        }
    }
}

/// Handler trait for processing deliveries
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process a single delivery and decide its settlement
    async fn handle(&self, delivery: &InboundDelivery) -> Settlement;
}

/// Subscriber bound to the upload-notification fanout exchange.
///
/// Each instance declares the exchange (idempotent), binds its own anonymous
/// exclusive queue to it, and consumes that queue one delivery at a time in
/// broker order. Declaring again on restart never double-binds a queue, so
/// the only duplication is the broker's own at-least-once redelivery.
pub struct UploadSubscriber {
    // Held so the channel outlives this struct; dropping it closes the channel.
    _connection: Connection,
    channel: Channel,
    queue: String,
    exchange: String,
    shutdown_tx: broadcast::Sender<()>,
}

impl UploadSubscriber {
    /// Connect to the broker and bind a private queue to the exchange
    pub async fn connect(config: &AmqpConfig) -> Result<Self, SubscriberError> {
        let connection = Connection::connect(&config.host, ConnectionProperties::default())
            .await
            .map_err(SubscriberError::Connect)?;

        let channel = connection
            .create_channel()
            .await
            .map_err(SubscriberError::Connect)?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(SubscriberError::Setup)?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(SubscriberError::Setup)?;

        channel
            .queue_bind(
                queue.name().as_str(),
                &config.exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(SubscriberError::Setup)?;

        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await
            .map_err(SubscriberError::Setup)?;

        info!(
            exchange = %config.exchange,
            queue = %queue.name().as_str(),
            prefetch = config.prefetch,
            "Bound queue to exchange"
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            _connection: connection,
            channel,
            queue: queue.name().as_str().to_string(),
            exchange: config.exchange.clone(),
            shutdown_tx,
        })
    }

    /// Get a sender that stops the consumption loop when signalled
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Signal the consumption loop to stop
    pub fn shutdown(&self) {
        info!("Signaling subscriber shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Start consuming and route every delivery through the handler
    #[instrument(skip(self, handler), fields(exchange = %self.exchange, queue = %self.queue))]
    pub async fn run<H: EventHandler>(&self, handler: Arc<H>) -> Result<(), SubscriberError> {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &consumer_tag(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(SubscriberError::Consume)?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!("Starting event consumption loop");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(mut delivery)) => {
                            let incoming = InboundDelivery {
                                payload: std::mem::take(&mut delivery.data),
                                exchange: delivery.exchange.as_str().to_string(),
                                routing_key: delivery.routing_key.as_str().to_string(),
                                redelivered: delivery.redelivered,
                                received_at: Utc::now(),
                            };

                            debug!(
                                exchange = %incoming.exchange,
                                redelivered = incoming.redelivered,
                                bytes = incoming.payload.len(),
                                "Received delivery"
                            );

                            let settlement = handler.handle(&incoming).await;
                            self.settle(&delivery, settlement).await;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Broker consume error");
                            metrics::counter!("metadata.amqp.errors").increment(1);
                        }
                        None => {
                            debug!("Consumer stream ended");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Report the handler's decision to the broker.
    ///
    /// A failed settlement is logged and left to the broker: an unsettled
    /// delivery is redelivered once the channel closes, which keeps the
    /// at-least-once contract.
    async fn settle(&self, delivery: &Delivery, settlement: Settlement) {
        let result = match settlement {
            Settlement::Ack => delivery.ack(BasicAckOptions::default()).await,
            Settlement::Requeue => {
                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
            }
            Settlement::Discard => delivery.reject(BasicRejectOptions::default()).await,
        };

        if let Err(e) = result {
            warn!(error = %e, settlement = ?settlement, "Failed to settle delivery");
            metrics::counter!("metadata.amqp.settle_failures").increment(1);
        }
    }
}

/// Per-instance consumer tag, unique so restarts are distinguishable in
/// broker diagnostics
fn consumer_tag() -> String {
    format!("metadata-service-{}", Uuid::new_v4().simple())
}
