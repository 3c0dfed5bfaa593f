//! Order coordinator: owns the order lifecycle and decides, per
//! reservation RPC outcome, whether an order confirms, fails, or is
//! delegated to the asynchronous verification path.

use chrono::Utc;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::{info, warn};
use uuid::Uuid;

use shared::events::{OrderCreated, OrderPendingVerification};
use shared::{Event, VerifyOrder};

use crate::error::OrderError;
use crate::models::{NewOrder, Order, OrderStatus};
use crate::outbox;
use crate::rpc::{InventoryClient, ReserveReply, RpcFailure};
use crate::schema::orders;
use crate::transition::{self, Settled, Transition};

type DbPool = Pool<AsyncPgConnection>;

#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub customer_id: String,
    pub product_id: String,
    pub quantity: i32,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedOrder {
    pub order: Order,
    /// True when an idempotent replay returned the stored order instead of
    /// creating one.
    pub cached: bool,
}

#[derive(Clone)]
pub struct Coordinator {
    pool: DbPool,
    inventory: InventoryClient,
}

impl Coordinator {
    pub fn new(pool: DbPool, inventory: InventoryClient) -> Self {
        Self { pool, inventory }
    }

    pub async fn create_order(&self, req: CreateOrder) -> Result<CreatedOrder, OrderError> {
        // Replay check before any side effect.
        if let Some(key) = &req.idempotency_key {
            if let Some(existing) = self.find_by_idempotency_key(key).await? {
                info!(order_id = %existing.id, "idempotent replay, returning stored order");
                return Ok(CreatedOrder {
                    order: existing,
                    cached: true,
                });
            }
        }

        let order_id = Uuid::new_v4();
        let effective_key = req
            .idempotency_key
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let order = match self.persist_pending(&req, order_id, &effective_key).await {
            Ok(order) => order,
            Err(OrderError::Db(diesel::result::Error::DatabaseError(
                DatabaseErrorKind::UniqueViolation,
                _,
            ))) => {
                // Lost the insert race to a concurrent retry with the same
                // key; the winner's row is the answer.
                return self
                    .find_by_idempotency_key(&effective_key)
                    .await?
                    .map(|order| CreatedOrder {
                        order,
                        cached: true,
                    })
                    .ok_or_else(|| {
                        OrderError::Internal("order vanished after idempotency conflict".into())
                    });
            }
            Err(e) => return Err(e),
        };

        let reply = self
            .inventory
            .reserve(order_id, &req.product_id, req.quantity, &effective_key)
            .await;

        let order = match reply {
            Ok(ReserveReply::Confirmed { reservation_id, .. })
            | Ok(ReserveReply::AlreadyExists { reservation_id, .. }) => {
                self.settle(order_id, Transition::Confirm { reservation_id })
                    .await?
            }
            Ok(ReserveReply::InsufficientStock { remaining_stock }) => {
                self.settle(
                    order_id,
                    Transition::Fail {
                        reason: format!(
                            "Insufficient stock for {}: {} unit(s) available",
                            req.product_id, remaining_stock
                        ),
                    },
                )
                .await?
            }
            Ok(ReserveReply::ProductNotFound) => {
                self.settle(
                    order_id,
                    Transition::Fail {
                        reason: format!("Product {} not found", req.product_id),
                    },
                )
                .await?
            }
            Err(failure @ (RpcFailure::Timeout | RpcFailure::Unavailable)) => {
                info!(
                    order_id = %order_id,
                    failure = %failure,
                    "reservation outcome unknown, delegating to verification"
                );
                self.delegate_to_verification(VerifyOrder {
                    order_id,
                    product_id: req.product_id.clone(),
                    quantity: req.quantity,
                    idempotency_key: effective_key.clone(),
                    original_request_time: Utc::now(),
                })
                .await?
            }
            Err(failure) => {
                // The order stays pending; the event-driven path reconciles
                // it if inventory did in fact commit.
                return Err(OrderError::Rpc(failure.to_string()));
            }
        };

        Ok(CreatedOrder {
            order,
            cached: false,
        })
    }

    async fn persist_pending(
        &self,
        req: &CreateOrder,
        order_id: Uuid,
        effective_key: &str,
    ) -> Result<Order, OrderError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| OrderError::Pool(e.to_string()))?;

        let new_order = NewOrder {
            id: order_id,
            customer_id: req.customer_id.clone(),
            product_id: req.product_id.clone(),
            quantity: req.quantity,
            status: OrderStatus::Pending.as_str().to_string(),
            idempotency_key: Some(effective_key.to_string()),
        };
        let created = Event::OrderCreated(OrderCreated {
            order_id,
            customer_id: req.customer_id.clone(),
            product_id: req.product_id.clone(),
            quantity: req.quantity,
        });

        conn.transaction::<Order, OrderError, _>(|conn| {
            Box::pin(async move {
                let order: Order = diesel::insert_into(orders::table)
                    .values(&new_order)
                    .get_result(conn)
                    .await?;
                outbox::stage(conn, &order.id.to_string(), &created).await?;
                Ok(order)
            })
        })
        .await
    }

    /// Apply a terminal transition under the order row lock.
    async fn settle(&self, order_id: Uuid, transition: Transition) -> Result<Order, OrderError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| OrderError::Pool(e.to_string()))?;

        conn.transaction::<Order, OrderError, _>(|conn| {
            Box::pin(async move {
                let order = transition::lock(conn, order_id)
                    .await?
                    .ok_or(OrderError::NotFound(order_id))?;
                let settled = transition::advance(conn, &order, &transition).await?;
                Ok(settled.order().clone())
            })
        })
        .await
    }

    /// Park the order in `pending_verification` and stage the `VerifyOrder`
    /// queue message, all in one transaction. If the event consumer settled
    /// the order in the meantime, that outcome stands.
    async fn delegate_to_verification(&self, verify: VerifyOrder) -> Result<Order, OrderError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| OrderError::Pool(e.to_string()))?;

        conn.transaction::<Order, OrderError, _>(|conn| {
            Box::pin(async move {
                let order = transition::lock(conn, verify.order_id)
                    .await?
                    .ok_or(OrderError::NotFound(verify.order_id))?;
                if order.status() != OrderStatus::Pending {
                    info!(order_id = %order.id, status = %order.status, "already settled, skipping verification");
                    return Ok(order);
                }

                let updated: Order = diesel::update(orders::table.find(order.id))
                    .set((
                        orders::status.eq(OrderStatus::PendingVerification.as_str()),
                        orders::updated_at.eq(Utc::now()),
                    ))
                    .get_result(conn)
                    .await?;

                outbox::stage_verify(conn, &verify).await?;
                outbox::stage(
                    conn,
                    &order.id.to_string(),
                    &Event::OrderPendingVerification(OrderPendingVerification {
                        order_id: order.id,
                    }),
                )
                .await?;

                Ok(updated)
            })
        })
        .await
    }

    pub async fn cancel_order(&self, order_id: Uuid) -> Result<Order, OrderError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| OrderError::Pool(e.to_string()))?;

        let cancelled = conn
            .transaction::<Order, OrderError, _>(|conn| {
                Box::pin(async move {
                    let order = transition::lock(conn, order_id)
                        .await?
                        .ok_or(OrderError::NotFound(order_id))?;
                    match transition::advance(conn, &order, &Transition::Cancel).await? {
                        Settled::Applied(o) | Settled::Unchanged(o) => Ok(o),
                        Settled::Rejected(o) => Err(OrderError::Terminal {
                            id: o.id,
                            status: o.status.clone(),
                        }),
                    }
                })
            })
            .await?;

        // Release outside the transaction: a failed release (already
        // released, inventory down) must not block the cancel. Orphan
        // reservations are reconciled out of band.
        if let Some(reservation_id) = cancelled.reservation_id {
            match self
                .inventory
                .release(cancelled.id, reservation_id, "order cancelled")
                .await
            {
                Ok((true, _)) => {
                    info!(order_id = %cancelled.id, reservation_id = %reservation_id, "reservation released")
                }
                Ok((false, message)) => {
                    warn!(order_id = %cancelled.id, "release refused: {}", message)
                }
                Err(failure) => {
                    warn!(order_id = %cancelled.id, "release failed ({}), reconciling out of band", failure)
                }
            }
        }

        Ok(cancelled)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Order, OrderError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| OrderError::Pool(e.to_string()))?;
        orders::table
            .find(order_id)
            .first::<Order>(&mut conn)
            .await
            .optional()?
            .ok_or(OrderError::NotFound(order_id))
    }

    pub async fn list_orders(
        &self,
        status: Option<OrderStatus>,
        limit: i64,
    ) -> Result<Vec<Order>, OrderError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| OrderError::Pool(e.to_string()))?;

        let mut query = orders::table.into_boxed();
        if let Some(status) = status {
            query = query.filter(orders::status.eq(status.as_str()));
        }
        let rows = query
            .order(orders::created_at.desc())
            .limit(limit)
            .load::<Order>(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Order>, OrderError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| OrderError::Pool(e.to_string()))?;
        let order = orders::table
            .filter(orders::idempotency_key.eq(key))
            .first::<Order>(&mut conn)
            .await
            .optional()?;
        Ok(order)
    }
}
