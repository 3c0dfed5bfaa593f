//! Transactional outbox for the inventory side.
//!
//! `StockReserved`, `StockReleased`, `LowStockAlert` and `OrderVerified`
//! are staged in the same transaction as the stock mutation (or the
//! verification decision) and drained to `inventory-events` by the pumper.
//! The row id becomes the published `eventId`.

use std::time::Duration;

use anyhow::Result;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use tokio::time;
use tracing::{error, info};
use uuid::Uuid;

use shared::{topic_for, Event, EventBus};

use crate::error::InventoryError;
use crate::models::{DbOutboxEvent, NewOutboxEvent};
use crate::schema::outbox_events;

type DbPool = Pool<AsyncPgConnection>;

/// Stage an event for publication inside the caller's transaction.
pub async fn stage(
    conn: &mut AsyncPgConnection,
    aggregate_id: &str,
    event: &Event,
) -> Result<(), InventoryError> {
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
            let payload = serde_json::json!({
                "eventId": row.id,
                "timestamp": row.created_at,
                "correlationId": row.aggregate_id,
                "eventType": row.event_type,
                "data": row.event_data,
            })
            .to_string();

            if let Err(e) = self
                .bus
                .publish_raw(topic_for(&row.event_type), &row.aggregate_id, &payload)
                .await
            {
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
}
