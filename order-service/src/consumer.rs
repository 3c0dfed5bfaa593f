//! Consumer for `inventory-events`.
//!
//! Applies stock and verification events to order state through the same
//! transition function as the synchronous reply path. Handlers are
//! idempotent; redelivered or reordered events converge on the first
//! terminal transition.

use std::time::Duration;

use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection};
use rdkafka::message::BorrowedMessage;
use rdkafka::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shared::events::VerifiedStatus;
use shared::{decode_envelope, Event, Subscription};

use crate::error::OrderError;
use crate::models::OrderStatus;
use crate::transition::{self, Transition};

type DbPool = Pool<AsyncPgConnection>;

pub struct InventoryEventConsumer {
    pool: DbPool,
}

impl InventoryEventConsumer {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn run(&self, subscription: Subscription) {
        loop {
            match subscription.recv().await {
                Ok(message) => match self.handle(&message).await {
                    Ok(()) => subscription.ack(&message),
                    Err(e) => {
                        error!(subscription = %subscription.name(), "error handling event: {}", e);
                        subscription.nack(&message);
                        // Let redelivery back off instead of spinning.
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                Err(e) => error!("error receiving message: {}", e),
            }
        }
    }

    async fn handle(&self, message: &BorrowedMessage<'_>) -> Result<(), OrderError> {
        let Some(payload) = message.payload() else {
            warn!("dropping message without payload");
            return Ok(());
        };

        let envelope = match decode_envelope(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Unknown event types are rejected here; acking keeps
                // poison messages from blocking the stream.
                warn!("rejecting undecodable message: {}", e);
                return Ok(());
            }
        };

        match envelope.event {
            Event::StockReserved(ev) => {
                self.confirm(ev.order_id, ev.reservation_id, false).await
            }
            Event::StockReleased(ev) => {
                info!(order_id = %ev.order_id, reservation_id = %ev.reservation_id, "stock released");
                Ok(())
            }
            Event::OrderVerified(ev) => {
                let reason = match ev.status {
                    VerifiedStatus::Confirmed => None,
                    VerifiedStatus::NotFound => {
                        Some("Verification found no reservation could be made".to_string())
                    }
                };
                self.apply_verification(
                    ev.order_id,
                    ev.status == VerifiedStatus::Confirmed,
                    ev.reservation_id,
                    reason,
                )
                .await
            }
            Event::VerificationComplete(ev) => {
                self.apply_verification(ev.order_id, ev.verified, ev.reservation_id, ev.reason)
                    .await
            }
            other => {
                debug!(event_type = other.event_type(), "ignoring event");
                Ok(())
            }
        }
    }

    /// `StockReserved` path: confirm from either open state.
    async fn confirm(
        &self,
        order_id: Uuid,
        reservation_id: Uuid,
        verification_only: bool,
    ) -> Result<(), OrderError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| OrderError::Pool(e.to_string()))?;

        conn.transaction::<(), OrderError, _>(|conn| {
            Box::pin(async move {
                let Some(order) = transition::lock(conn, order_id).await? else {
                    // Orphan event; must not block the stream.
                    warn!(order_id = %order_id, "event references unknown order, skipping");
                    return Ok(());
                };
                if verification_only && order.status() != OrderStatus::PendingVerification {
                    info!(order_id = %order_id, status = %order.status, "not pending verification, skipping");
                    return Ok(());
                }
                transition::advance(conn, &order, &Transition::Confirm { reservation_id }).await?;
                Ok(())
            })
        })
        .await
    }

    /// Verification events apply only while the order awaits verification;
    /// any other state keeps its outcome (terminal-state safety).
    async fn apply_verification(
        &self,
        order_id: Uuid,
        verified: bool,
        reservation_id: Option<Uuid>,
        reason: Option<String>,
    ) -> Result<(), OrderError> {
        if verified {
            let Some(reservation_id) = reservation_id else {
                warn!(order_id = %order_id, "verified event without reservation id, skipping");
                return Ok(());
            };
            return self.confirm(order_id, reservation_id, true).await;
        }

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| OrderError::Pool(e.to_string()))?;

        conn.transaction::<(), OrderError, _>(|conn| {
            Box::pin(async move {
                let Some(order) = transition::lock(conn, order_id).await? else {
                    warn!(order_id = %order_id, "event references unknown order, skipping");
                    return Ok(());
                };
                if order.status() != OrderStatus::PendingVerification {
                    info!(order_id = %order_id, status = %order.status, "not pending verification, skipping");
                    return Ok(());
                }
                let reason =
                    reason.unwrap_or_else(|| "Verification reported failure".to_string());
                transition::advance(conn, &order, &Transition::Fail { reason }).await?;
                Ok(())
            })
        })
        .await
    }
}
