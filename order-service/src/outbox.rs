//! Transactional outbox.
//!
//! Handlers stage events in the same database transaction as the state
//! change that warrants them; the pumper drains staged rows to the bus.
//! The outbox row id becomes the published `eventId`, so retried publishes
//! carry the same message identity and downstream consumers can stay
//! idempotent.

use std::time::Duration;

use anyhow::Result;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use tokio::time;
use tracing::{error, info};
use uuid::Uuid;

use shared::events::VERIFY_ORDERS;
use shared::{topic_for, Event, EventBus, VerifyOrder};

use crate::error::OrderError;
use crate::models::{DbOutboxEvent, NewOutboxEvent};
use crate::schema::outbox_events;

type DbPool = Pool<AsyncPgConnection>;

/// Stage a lifecycle event for publication. Must be called inside the
/// transaction that performs the matching state change.
pub async fn stage(
    conn: &mut AsyncPgConnection,
    aggregate_id: &str,
    event: &Event,
) -> Result<(), OrderError> {
    let row = NewOutboxEvent {
        id: Uuid::new_v4(),
        aggregate_id: aggregate_id.to_string(),
        event_type: event.event_type().to_string(),
        event_data: event.payload()?,
    };
    diesel::insert_into(outbox_events::table)
        .values(&row)
        .execute(conn)
        .await?;
    Ok(())
}

/// Stage a `VerifyOrder` queue message. Drained to the `verify-orders`
/// queue as a bare body rather than an envelope.
pub async fn stage_verify(
    conn: &mut AsyncPgConnection,
    message: &VerifyOrder,
) -> Result<(), OrderError> {
    let row = NewOutboxEvent {
        id: Uuid::new_v4(),
        aggregate_id: message.order_id.to_string(),
        event_type: "VerifyOrder".to_string(),
        event_data: serde_json::to_value(message)?,
    };
    diesel::insert_into(outbox_events::table)
        .values(&row)
        .execute(conn)
        .await?;
    Ok(())
}

pub struct OutboxPumper {
    pool: DbPool,
    bus: EventBus,
}

impl OutboxPumper {
    pub fn new(pool: DbPool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(Duration::from_secs(1));

        loop {
            interval.tick().await;

            if let Err(e) = self.drain().await {
                error!("error draining outbox: {}", e);
            }
        }
    }

    async fn drain(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let staged = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(100)
            .load::<DbOutboxEvent>(&mut conn)
            .await?;

        for row in staged {
            if let Err(e) = self.publish(&row).await {
                error!(event_id = %row.id, "failed to publish outbox row: {}", e);
                continue;
            }

            diesel::update(outbox_events::table.filter(outbox_events::id.eq(row.id)))
                .set(outbox_events::processed.eq(true))
                .execute(&mut conn)
                .await?;

            info!(event_id = %row.id, event_type = %row.event_type, "published outbox row");
        }

        Ok(())
    }

    async fn publish(&self, row: &DbOutboxEvent) -> Result<()> {
        if row.event_type == "VerifyOrder" {
            let payload = serde_json::to_string(&row.event_data)?;
            return self
                .bus
                .publish_raw(VERIFY_ORDERS, &row.aggregate_id, &payload)
                .await;
        }

        let payload = serde_json::json!({
            "eventId": row.id,
            "timestamp": row.created_at,
            "correlationId": row.aggregate_id,
            "eventType": row.event_type,
            "data": row.event_data,
        })
        .to_string();
        self.bus
            .publish_raw(topic_for(&row.event_type), &row.aggregate_id, &payload)
            .await
    }
}
