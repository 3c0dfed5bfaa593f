//! Wire types for the event bus.
//!
//! Every published message is an [`Envelope`] carrying a typed payload.
//! The payload union is tagged by `eventType`; a message whose tag is not
//! listed here fails to decode, which is how consumers reject unknown
//! variants at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fan-out topic for order lifecycle events.
pub const ORDER_EVENTS: &str = "order-events";
/// Fan-out topic for inventory and verification events.
pub const INVENTORY_EVENTS: &str = "inventory-events";
/// Point-to-point queue feeding the verification handler.
pub const VERIFY_ORDERS: &str = "verify-orders";
/// Reserved for the out-of-process telemetry sink; the core never emits here.
pub const SYSTEM_METRICS: &str = "system-metrics";

/// Bus message envelope. `event_id` doubles as the bus `messageId` and is
/// stable across publish retries; `correlation_id` is the order id (or the
/// product id for stock alerts).
#[derive(Debug, Clone)]
pub struct Envelope {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub event: Event,
}

/// On-the-wire shape; the `eventType`/`data` pair is lifted into [`Event`].
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    event_id: Uuid,
    timestamp: DateTime<Utc>,
    correlation_id: String,
    event_type: String,
    data: serde_json::Value,
}

impl Serialize for Envelope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let data = self.event.payload().map_err(serde::ser::Error::custom)?;
        RawEnvelope {
            event_id: self.event_id,
            timestamp: self.timestamp,
            correlation_id: self.correlation_id.clone(),
            event_type: self.event.event_type().to_string(),
            data,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawEnvelope::deserialize(deserializer)?;
        let event = serde_json::from_value(serde_json::json!({
            "eventType": raw.event_type,
            "data": raw.data,
        }))
        .map_err(serde::de::Error::custom)?;
        Ok(Envelope {
            event_id: raw.event_id,
            timestamp: raw.timestamp,
            correlation_id: raw.correlation_id,
            event,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "data")]
pub enum Event {
    OrderCreated(OrderCreated),
    OrderConfirmed(OrderConfirmed),
    OrderFailed(OrderFailed),
    OrderCancelled(OrderCancelled),
    OrderPendingVerification(OrderPendingVerification),
    StockReserved(StockReserved),
    StockReleased(StockReleased),
    LowStockAlert(LowStockAlert),
    OrderVerified(OrderVerified),
    /// Legacy name for [`Event::OrderVerified`]; accepted on ingress for
    /// wire compatibility, never emitted.
    VerificationComplete(VerificationComplete),
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::OrderCreated(_) => "OrderCreated",
            Event::OrderConfirmed(_) => "OrderConfirmed",
            Event::OrderFailed(_) => "OrderFailed",
            Event::OrderCancelled(_) => "OrderCancelled",
            Event::OrderPendingVerification(_) => "OrderPendingVerification",
            Event::StockReserved(_) => "StockReserved",
            Event::StockReleased(_) => "StockReleased",
            Event::LowStockAlert(_) => "LowStockAlert",
            Event::OrderVerified(_) => "OrderVerified",
            Event::VerificationComplete(_) => "VerificationComplete",
        }
    }

    /// The `data` payload alone, for staging into an outbox row.
    pub fn payload(&self) -> serde_json::Result<serde_json::Value> {
        let mut value = serde_json::to_value(self)?;
        Ok(value
            .get_mut("data")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub customer_id: String,
    pub product_id: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderConfirmed {
    pub order_id: Uuid,
    pub reservation_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFailed {
    pub order_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    pub order_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPendingVerification {
    pub order_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReserved {
    pub order_id: Uuid,
    pub reservation_id: Uuid,
    pub product_id: String,
    pub quantity: i32,
    pub remaining_stock: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReleased {
    pub order_id: Uuid,
    pub reservation_id: Uuid,
    pub product_id: String,
    pub quantity: i32,
    pub remaining_stock: i32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LowStockAlert {
    pub product_id: String,
    pub stock: i32,
    pub threshold: i32,
}

/// Outcome of the asynchronous verification handler. `not_found` means no
/// reservation could be made, including the insufficient-stock case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifiedStatus {
    Confirmed,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderVerified {
    pub order_id: Uuid,
    pub status: VerifiedStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<Uuid>,
    pub recovered_from_crash: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationComplete {
    pub order_id: Uuid,
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Body of the `verify-orders` queue message. Published bare, without an
/// [`Envelope`], so the queue stays readable by the original consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOrder {
    pub order_id: Uuid,
    pub product_id: String,
    pub quantity: i32,
    pub idempotency_key: String,
    pub original_request_time: DateTime<Utc>,
}

impl VerifyOrder {
    /// Idempotency key used when the verification path has to reserve
    /// itself, distinct from the original key so a late-arriving original
    /// call cannot collide with it.
    pub fn verification_key(&self) -> String {
        format!("verify-{}", self.idempotency_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(event: Event) -> Envelope {
        Envelope {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: "c0ffee".to_string(),
            event,
        }
    }

    #[test]
    fn envelope_wire_shape() {
        let order_id = Uuid::new_v4();
        let reservation_id = Uuid::new_v4();
        let env = envelope(Event::OrderConfirmed(OrderConfirmed {
            order_id,
            reservation_id,
        }));

        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["eventType"], "OrderConfirmed");
        assert_eq!(json["data"]["orderId"], order_id.to_string());
        assert_eq!(json["data"]["reservationId"], reservation_id.to_string());
        assert!(json["eventId"].is_string());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn accepts_both_verification_event_names() {
        let order_id = Uuid::new_v4();

        let modern = serde_json::json!({
            "eventId": Uuid::new_v4(),
            "timestamp": Utc::now(),
            "correlationId": order_id,
            "eventType": "OrderVerified",
            "data": {
                "orderId": order_id,
                "status": "confirmed",
                "recoveredFromCrash": true,
            }
        });
        let env: Envelope = serde_json::from_value(modern).unwrap();
        match env.event {
            Event::OrderVerified(v) => {
                assert_eq!(v.status, VerifiedStatus::Confirmed);
                assert!(v.recovered_from_crash);
                assert_eq!(v.reservation_id, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let legacy = serde_json::json!({
            "eventId": Uuid::new_v4(),
            "timestamp": Utc::now(),
            "correlationId": order_id,
            "eventType": "VerificationComplete",
            "data": {
                "orderId": order_id,
                "verified": false,
                "reason": "Insufficient stock",
            }
        });
        let env: Envelope = serde_json::from_value(legacy).unwrap();
        match env.event {
            Event::VerificationComplete(v) => {
                assert!(!v.verified);
                assert_eq!(v.reason.as_deref(), Some("Insufficient stock"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_event_type() {
        let raw = serde_json::json!({
            "eventId": Uuid::new_v4(),
            "timestamp": Utc::now(),
            "correlationId": "x",
            "eventType": "OrderTeleported",
            "data": {}
        });
        assert!(serde_json::from_value::<Envelope>(raw).is_err());
    }

    #[test]
    fn payload_strips_the_tag() {
        let event = Event::LowStockAlert(LowStockAlert {
            product_id: "SKU-001".to_string(),
            stock: 3,
            threshold: 10,
        });
        assert_eq!(event.event_type(), "LowStockAlert");
        let payload = event.payload().unwrap();
        assert_eq!(payload["productId"], "SKU-001");
        assert!(payload.get("eventType").is_none());
    }

    #[test]
    fn verification_key_is_prefixed() {
        let msg = VerifyOrder {
            order_id: Uuid::new_v4(),
            product_id: "SKU-002".to_string(),
            quantity: 3,
            idempotency_key: "k-42".to_string(),
            original_request_time: Utc::now(),
        };
        assert_eq!(msg.verification_key(), "verify-k-42");
    }
}
