//! Transactional reserve/release over the inventory database.
//!
//! Every mutation runs in one serializable transaction: the product row is
//! taken `FOR UPDATE`, so concurrent reservers serialize per product and
//! cannot both observe enough stock. The unique idempotency-key constraint
//! (and the one-active-per-order index) catch the races that slip past the
//! read-side replay check; losers re-read the committed row and answer
//! `already_exists`.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use tracing::{info, warn};
use uuid::Uuid;

use shared::events::{LowStockAlert, StockReleased, StockReserved};
use shared::Event;

use crate::error::InventoryError;
use crate::models::{NewAuditEntry, NewReservation, Product, Reservation, ReservationStatus};
use crate::outbox;
use crate::schema::{products, reservations};

type DbPool = Pool<AsyncPgConnection>;

#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub order_id: Uuid,
    pub product_id: String,
    pub quantity: i32,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    Confirmed {
        reservation_id: Uuid,
        remaining_stock: i32,
    },
    AlreadyExists {
        reservation_id: Uuid,
        remaining_stock: i32,
    },
    InsufficientStock {
        remaining_stock: i32,
    },
    ProductNotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOutcome {
    Released {
        reservation_id: Uuid,
        remaining_stock: i32,
    },
    NotFound,
    /// Reservation exists but is not active; carries the current status.
    NotActive {
        status: String,
    },
}

#[derive(Clone)]
pub struct StockStore {
    pool: DbPool,
}

impl StockStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn reserve(&self, req: &ReserveRequest) -> Result<ReserveOutcome, InventoryError> {
        match self.try_reserve(req.clone()).await {
            Err(e) if e.is_serialization_conflict() => {
                // Retried once in-handler; persistent failure surfaces.
                info!(order_id = %req.order_id, "serialization conflict, retrying reserve");
                match self.try_reserve(req.clone()).await {
                    Err(e) if e.is_unique_violation() => self.settle_insert_race(req).await,
                    other => other,
                }
            }
            Err(e) if e.is_unique_violation() => self.settle_insert_race(req).await,
            other => other,
        }
    }

    async fn try_reserve(&self, req: ReserveRequest) -> Result<ReserveOutcome, InventoryError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| InventoryError::Pool(e.to_string()))?;

        conn.build_transaction()
            .serializable()
            .run(|conn| {
                Box::pin(async move {
                    // Replay check first; a hit commits immediately.
                    if let Some(key) = &req.idempotency_key {
                        let existing = reservations::table
                            .filter(reservations::idempotency_key.eq(key.as_str()))
                            .first::<Reservation>(conn)
                            .await
                            .optional()?;
                        if let Some(reservation) = existing {
                            let remaining = current_stock(conn, &req.product_id).await?;
                            info!(
                                order_id = %req.order_id,
                                reservation_id = %reservation.id,
                                "idempotent replay of reserve"
                            );
                            return Ok(ReserveOutcome::AlreadyExists {
                                reservation_id: reservation.id,
                                remaining_stock: remaining,
                            });
                        }
                    }

                    let product = products::table
                        .find(req.product_id.as_str())
                        .for_update()
                        .first::<Product>(conn)
                        .await
                        .optional()?;
                    let Some(product) = product else {
                        return Ok(ReserveOutcome::ProductNotFound);
                    };

                    if product.stock < req.quantity {
                        return Ok(ReserveOutcome::InsufficientStock {
                            remaining_stock: product.stock,
                        });
                    }

                    let new_stock = product.stock - req.quantity;
                    let now = Utc::now();
                    diesel::update(products::table.find(req.product_id.as_str()))
                        .set((
                            products::stock.eq(new_stock),
                            products::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;

                    let reservation_id = Uuid::new_v4();
                    diesel::insert_into(reservations::table)
                        .values(&NewReservation {
                            id: reservation_id,
                            order_id: req.order_id,
                            product_id: req.product_id.clone(),
                            quantity: req.quantity,
                            status: ReservationStatus::Active.as_str().to_string(),
                            idempotency_key: req.idempotency_key.clone(),
                        })
                        .execute(conn)
                        .await?;

                    diesel::insert_into(crate::schema::stock_audit_log::table)
                        .values(&NewAuditEntry {
                            id: Uuid::new_v4(),
                            product_id: req.product_id.clone(),
                            previous_stock: product.stock,
                            new_stock,
                            quantity_change: -req.quantity,
                            operation: "reserve".to_string(),
                            order_id: Some(req.order_id),
                            reservation_id: Some(reservation_id),
                            reason: None,
                        })
                        .execute(conn)
                        .await?;

                    outbox::stage(
                        conn,
                        &req.order_id.to_string(),
                        &Event::StockReserved(StockReserved {
                            order_id: req.order_id,
                            reservation_id,
                            product_id: req.product_id.clone(),
                            quantity: req.quantity,
                            remaining_stock: new_stock,
                        }),
                    )
                    .await?;

                    if new_stock <= product.low_stock_threshold {
                        warn!(
                            product_id = %req.product_id,
                            stock = new_stock,
                            threshold = product.low_stock_threshold,
                            "stock below threshold"
                        );
                        outbox::stage(
                            conn,
                            &req.product_id,
                            &Event::LowStockAlert(LowStockAlert {
                                product_id: req.product_id.clone(),
                                stock: new_stock,
                                threshold: product.low_stock_threshold,
                            }),
                        )
                        .await?;
                    }

                    info!(
                        order_id = %req.order_id,
                        reservation_id = %reservation_id,
                        remaining_stock = new_stock,
                        "stock reserved"
                    );
                    Ok(ReserveOutcome::Confirmed {
                        reservation_id,
                        remaining_stock: new_stock,
                    })
                })
            })
            .await
    }

    /// The insert lost a unique-constraint race; the committed row wins.
    async fn settle_insert_race(
        &self,
        req: &ReserveRequest,
    ) -> Result<ReserveOutcome, InventoryError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| InventoryError::Pool(e.to_string()))?;

        if let Some(key) = &req.idempotency_key {
            let existing = reservations::table
                .filter(reservations::idempotency_key.eq(key.as_str()))
                .first::<Reservation>(&mut conn)
                .await
                .optional()?;
            if let Some(reservation) = existing {
                let remaining = current_stock(&mut conn, &req.product_id).await?;
                return Ok(ReserveOutcome::AlreadyExists {
                    reservation_id: reservation.id,
                    remaining_stock: remaining,
                });
            }
        }

        if let Some(reservation) = self.find_active_reservation(req.order_id).await? {
            let remaining = current_stock(&mut conn, &req.product_id).await?;
            return Ok(ReserveOutcome::AlreadyExists {
                reservation_id: reservation.id,
                remaining_stock: remaining,
            });
        }

        Err(InventoryError::Internal(
            "reservation insert conflicted but no surviving row was found".to_string(),
        ))
    }

    pub async fn release(
        &self,
        order_id: Uuid,
        reservation_id: Uuid,
        reason: String,
    ) -> Result<ReleaseOutcome, InventoryError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| InventoryError::Pool(e.to_string()))?;

        conn.build_transaction()
            .serializable()
            .run(|conn| {
                Box::pin(async move {
                    let reservation = reservations::table
                        .filter(reservations::id.eq(reservation_id))
                        .filter(reservations::order_id.eq(order_id))
                        .for_update()
                        .first::<Reservation>(conn)
                        .await
                        .optional()?;
                    let Some(reservation) = reservation else {
                        return Ok(ReleaseOutcome::NotFound);
                    };

                    if reservation.status != ReservationStatus::Active.as_str() {
                        return Ok(ReleaseOutcome::NotActive {
                            status: reservation.status,
                        });
                    }

                    let product = products::table
                        .find(reservation.product_id.as_str())
                        .for_update()
                        .first::<Product>(conn)
                        .await?;

                    let new_stock = product.stock + reservation.quantity;
                    let now = Utc::now();
                    diesel::update(products::table.find(reservation.product_id.as_str()))
                        .set((
                            products::stock.eq(new_stock),
                            products::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;

                    diesel::update(reservations::table.find(reservation.id))
                        .set((
                            reservations::status.eq(ReservationStatus::Released.as_str()),
                            reservations::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;

                    diesel::insert_into(crate::schema::stock_audit_log::table)
                        .values(&NewAuditEntry {
                            id: Uuid::new_v4(),
                            product_id: reservation.product_id.clone(),
                            previous_stock: product.stock,
                            new_stock,
                            quantity_change: reservation.quantity,
                            operation: "release".to_string(),
                            order_id: Some(order_id),
                            reservation_id: Some(reservation.id),
                            reason: Some(reason.clone()),
                        })
                        .execute(conn)
                        .await?;

                    outbox::stage(
                        conn,
                        &order_id.to_string(),
                        &Event::StockReleased(StockReleased {
                            order_id,
                            reservation_id: reservation.id,
                            product_id: reservation.product_id.clone(),
                            quantity: reservation.quantity,
                            remaining_stock: new_stock,
                            reason,
                        }),
                    )
                    .await?;

                    info!(
                        order_id = %order_id,
                        reservation_id = %reservation.id,
                        remaining_stock = new_stock,
                        "stock released"
                    );
                    Ok(ReleaseOutcome::Released {
                        reservation_id: reservation.id,
                        remaining_stock: new_stock,
                    })
                })
            })
            .await
    }

    pub async fn check(&self, product_id: &str) -> Result<Option<Product>, InventoryError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| InventoryError::Pool(e.to_string()))?;
        let product = products::table
            .find(product_id)
            .first::<Product>(&mut conn)
            .await
            .optional()?;
        Ok(product)
    }

    /// Idempotent finder used by the verification handler.
    pub async fn find_active_reservation(
        &self,
        order_id: Uuid,
    ) -> Result<Option<Reservation>, InventoryError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| InventoryError::Pool(e.to_string()))?;
        let reservation = reservations::table
            .filter(reservations::order_id.eq(order_id))
            .filter(reservations::status.eq(ReservationStatus::Active.as_str()))
            .first::<Reservation>(&mut conn)
            .await
            .optional()?;
        Ok(reservation)
    }

    /// Durably stage an `OrderVerified` outcome for publication.
    pub async fn stage_verified(
        &self,
        verdict: shared::events::OrderVerified,
    ) -> Result<(), InventoryError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| InventoryError::Pool(e.to_string()))?;
        let aggregate = verdict.order_id.to_string();
        outbox::stage(&mut conn, &aggregate, &Event::OrderVerified(verdict)).await
    }
}

async fn current_stock(
    conn: &mut AsyncPgConnection,
    product_id: &str,
) -> Result<i32, InventoryError> {
    let stock = products::table
        .find(product_id)
        .select(products::stock)
        .first::<i32>(conn)
        .await
        .optional()?;
    Ok(stock.unwrap_or(0))
}
