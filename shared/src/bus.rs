//! Kafka-backed event bus.
//!
//! Two shapes on top of one transport: a topic is a Kafka topic fanned out
//! to named consumer groups (one group per logical subscription), and a
//! queue is a topic every consumer reads through the same group. Delivery
//! is at-least-once: offsets are committed only after a message is acked,
//! and a nack seeks back so the message is redelivered.
//!
//! Producers and subscriptions are process-scoped resources with explicit
//! `start`/`stop`; handlers receive them injected rather than reaching for
//! ambient state.

use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Message, Offset};
use tracing::{error, warn};

use crate::events::Envelope;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Publishing half of the bus.
#[derive(Clone)]
pub struct EventBus {
    producer: FutureProducer,
}

impl EventBus {
    pub fn start(brokers: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .context("creating bus producer")?;
        Ok(Self { producer })
    }

    /// Publish an envelope, keyed by its correlation id so per-order events
    /// land on one partition.
    pub async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        let payload = serde_json::to_string(envelope)?;
        self.publish_raw(topic, &envelope.correlation_id, &payload)
            .await
    }

    pub async fn publish_raw(&self, topic: &str, key: &str, payload: &str) -> Result<()> {
        let record = FutureRecord::to(topic).payload(payload).key(key);
        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| anyhow::anyhow!("failed to publish to {}: {}", topic, e))?;
        Ok(())
    }

    /// Broker reachability probe for health reporting. Blocking; call from
    /// a blocking-friendly context.
    pub fn is_connected(&self, timeout: Duration) -> bool {
        self.producer.client().fetch_metadata(None, timeout).is_ok()
    }

    /// Flush in-flight messages and drop the producer.
    pub fn stop(self) {
        if let Err(e) = self.producer.flush(SEND_TIMEOUT) {
            warn!("bus producer flush on stop failed: {}", e);
        }
    }
}

/// Consuming half of the bus. One instance per logical subscription; the
/// subscription name is the Kafka consumer group, which gives durable
/// per-subscription offsets across restarts.
pub struct Subscription {
    name: String,
    consumer: StreamConsumer,
}

impl Subscription {
    pub fn start(brokers: &str, name: &str, topics: &[&str]) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", name)
            .set("bootstrap.servers", brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .with_context(|| format!("creating subscription {}", name))?;
        consumer
            .subscribe(topics)
            .with_context(|| format!("subscribing {} to {:?}", name, topics))?;
        Ok(Self {
            name: name.to_string(),
            consumer,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Await the next delivery. Redeliveries of unacked messages show up
    /// here again after a nack, rebalance, or restart.
    pub async fn recv(&self) -> Result<BorrowedMessage<'_>> {
        let message = self.consumer.recv().await?;
        Ok(message)
    }

    /// Mark a delivery handled; its offset will not be redelivered.
    pub fn ack(&self, message: &BorrowedMessage<'_>) {
        if let Err(e) = self.consumer.commit_message(message, CommitMode::Async) {
            error!(subscription = %self.name, "commit failed: {}", e);
        }
    }

    /// Rewind to the failed offset so the bus redelivers it.
    pub fn nack(&self, message: &BorrowedMessage<'_>) {
        if let Err(e) = self.consumer.seek(
            message.topic(),
            message.partition(),
            Offset::Offset(message.offset()),
            Duration::from_secs(5),
        ) {
            error!(subscription = %self.name, "seek for redelivery failed: {}", e);
        }
    }

    pub fn stop(self) {
        self.consumer.unsubscribe();
    }
}

/// Decode an envelope off the wire. Unknown `eventType` tags fail here,
/// which is the consumer-boundary rejection point for malformed traffic.
pub fn decode_envelope(payload: &[u8]) -> std::result::Result<Envelope, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Topic (or queue) an outbox row is drained to, by event type.
pub fn topic_for(event_type: &str) -> &'static str {
    match event_type {
        "StockReserved" | "StockReleased" | "LowStockAlert" | "OrderVerified" => {
            crate::events::INVENTORY_EVENTS
        }
        "VerifyOrder" => crate::events::VERIFY_ORDERS,
        _ => crate::events::ORDER_EVENTS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{INVENTORY_EVENTS, ORDER_EVENTS, VERIFY_ORDERS};

    #[test]
    fn routes_event_types_to_topics() {
        assert_eq!(topic_for("OrderCreated"), ORDER_EVENTS);
        assert_eq!(topic_for("OrderPendingVerification"), ORDER_EVENTS);
        assert_eq!(topic_for("StockReserved"), INVENTORY_EVENTS);
        assert_eq!(topic_for("LowStockAlert"), INVENTORY_EVENTS);
        assert_eq!(topic_for("OrderVerified"), INVENTORY_EVENTS);
        assert_eq!(topic_for("VerifyOrder"), VERIFY_ORDERS);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_envelope(b"not json").is_err());
        assert!(decode_envelope(br#"{"eventType":"Nope","data":{}}"#).is_err());
    }
}
