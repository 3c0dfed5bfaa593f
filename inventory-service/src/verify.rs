//! `VerifyOrder` queue handler: the recovery half of the reservation
//! protocol.
//!
//! Every order the coordinator parked in `pending_verification` arrives
//! here at least once. The handler is idempotent: an existing active
//! reservation means the original transaction committed (a crash ate the
//! reply), so it is simply re-announced; otherwise the reservation is
//! attempted under a derived idempotency key. The message is acked only
//! after the verdict is durably staged for publication.

use std::time::Duration;

use rdkafka::message::BorrowedMessage;
use rdkafka::Message;
use tracing::{error, info, warn};

use shared::events::{OrderVerified, VerifiedStatus};
use shared::{Subscription, VerifyOrder};

use crate::error::InventoryError;
use crate::stock::{ReserveOutcome, ReserveRequest, StockStore};

pub struct VerifyOrderConsumer {
    store: StockStore,
}

impl VerifyOrderConsumer {
    pub fn new(store: StockStore) -> Self {
        Self { store }
    }

    pub async fn run(&self, subscription: Subscription) {
        loop {
            match subscription.recv().await {
                Ok(message) => match self.handle(&message).await {
                    Ok(()) => subscription.ack(&message),
                    Err(e) => {
                        error!(subscription = %subscription.name(), "error verifying order: {}", e);
                        subscription.nack(&message);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                Err(e) => error!("error receiving message: {}", e),
            }
        }
    }

    async fn handle(&self, message: &BorrowedMessage<'_>) -> Result<(), InventoryError> {
        let Some(payload) = message.payload() else {
            warn!("dropping verify message without payload");
            return Ok(());
        };
        let request: VerifyOrder = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("rejecting undecodable verify message: {}", e);
                return Ok(());
            }
        };

        // An active reservation means the original call committed and only
        // the reply was lost.
        if let Some(reservation) = self.store.find_active_reservation(request.order_id).await? {
            info!(
                order_id = %request.order_id,
                reservation_id = %reservation.id,
                "found existing reservation, recovered from crash"
            );
            return self
                .store
                .stage_verified(OrderVerified {
                    order_id: request.order_id,
                    status: VerifiedStatus::Confirmed,
                    reservation_id: Some(reservation.id),
                    recovered_from_crash: true,
                })
                .await;
        }

        let outcome = self
            .store
            .reserve(&ReserveRequest {
                order_id: request.order_id,
                product_id: request.product_id.clone(),
                quantity: request.quantity,
                idempotency_key: Some(request.verification_key()),
            })
            .await?;

        let verdict = match outcome {
            ReserveOutcome::Confirmed { reservation_id, .. }
            | ReserveOutcome::AlreadyExists { reservation_id, .. } => OrderVerified {
                order_id: request.order_id,
                status: VerifiedStatus::Confirmed,
                reservation_id: Some(reservation_id),
                recovered_from_crash: false,
            },
            ReserveOutcome::InsufficientStock { .. } | ReserveOutcome::ProductNotFound => {
                // "not_found" here means no reservation can be made.
                OrderVerified {
                    order_id: request.order_id,
                    status: VerifiedStatus::NotFound,
                    reservation_id: None,
                    recovered_from_crash: false,
                }
            }
        };

        info!(
            order_id = %request.order_id,
            status = ?verdict.status,
            "verification settled"
        );
        self.store.stage_verified(verdict).await
    }
}
