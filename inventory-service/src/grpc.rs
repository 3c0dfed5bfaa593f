//! gRPC surface over the stock store.

use std::time::Duration;

use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use tonic::{Request, Response, Status};
use uuid::Uuid;

use shared::proto::inventory_service_server::InventoryService;
use shared::proto::{
    CheckStockRequest, CheckStockResponse, HealthCheckRequest, HealthCheckResponse,
    ReleaseStockRequest, ReleaseStockResponse, ReserveStatus, ReserveStockRequest,
    ReserveStockResponse,
};
use shared::EventBus;

use crate::chaos::ChaosConfig;
use crate::stock::{ReleaseOutcome, ReserveOutcome, ReserveRequest, StockStore};

type DbPool = Pool<AsyncPgConnection>;

pub struct InventoryGrpc {
    store: StockStore,
    pool: DbPool,
    bus: EventBus,
    chaos: ChaosConfig,
}

impl InventoryGrpc {
    pub fn new(store: StockStore, pool: DbPool, bus: EventBus, chaos: ChaosConfig) -> Self {
        Self {
            store,
            pool,
            bus,
            chaos,
        }
    }
}

fn parse_uuid(value: &str, field: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(value)
        .map_err(|_| Status::invalid_argument(format!("{} must be a UUID", field)))
}

fn none_if_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[tonic::async_trait]
impl InventoryService for InventoryGrpc {
    async fn reserve_stock(
        &self,
        request: Request<ReserveStockRequest>,
    ) -> Result<Response<ReserveStockResponse>, Status> {
        let req = request.into_inner();
        let order_id = parse_uuid(&req.order_id, "order_id")?;
        if req.product_id.is_empty() {
            return Err(Status::invalid_argument("product_id is required"));
        }
        if req.quantity <= 0 {
            return Err(Status::invalid_argument("quantity must be positive"));
        }

        // Detached task: a caller that gives up at its deadline drops this
        // handler future, but the reservation must still run to completion.
        // The outbox publishes the outcome either way.
        let store = self.store.clone();
        let chaos = self.chaos.clone();
        let reserve_req = ReserveRequest {
            order_id,
            product_id: req.product_id,
            quantity: req.quantity,
            idempotency_key: none_if_empty(req.idempotency_key),
        };
        let outcome = tokio::spawn(async move {
            chaos.gremlin_delay().await;
            store.reserve(&reserve_req).await
        })
        .await
        .map_err(|e| Status::internal(format!("reserve task failed: {}", e)))??;

        // The transaction is committed; an abort here loses only the reply.
        self.chaos.maybe_crash();

        let response = match outcome {
            ReserveOutcome::Confirmed {
                reservation_id,
                remaining_stock,
            } => ReserveStockResponse {
                success: true,
                status: ReserveStatus::Confirmed as i32,
                reservation_id: reservation_id.to_string(),
                remaining_stock,
                message: String::new(),
            },
            ReserveOutcome::AlreadyExists {
                reservation_id,
                remaining_stock,
            } => ReserveStockResponse {
                success: true,
                status: ReserveStatus::AlreadyExists as i32,
                reservation_id: reservation_id.to_string(),
                remaining_stock,
                message: "reservation already exists".to_string(),
            },
            ReserveOutcome::InsufficientStock { remaining_stock } => ReserveStockResponse {
                success: false,
                status: ReserveStatus::InsufficientStock as i32,
                reservation_id: String::new(),
                remaining_stock,
                message: format!("Insufficient stock: {} unit(s) available", remaining_stock),
            },
            ReserveOutcome::ProductNotFound => ReserveStockResponse {
                success: false,
                status: ReserveStatus::ProductNotFound as i32,
                reservation_id: String::new(),
                remaining_stock: 0,
                message: "Product not found".to_string(),
            },
        };
        Ok(Response::new(response))
    }

    async fn release_stock(
        &self,
        request: Request<ReleaseStockRequest>,
    ) -> Result<Response<ReleaseStockResponse>, Status> {
        let req = request.into_inner();
        let order_id = parse_uuid(&req.order_id, "order_id")?;
        let reservation_id = parse_uuid(&req.reservation_id, "reservation_id")?;
        let reason = if req.reason.is_empty() {
            "released by caller".to_string()
        } else {
            req.reason
        };

        let outcome = self.store.release(order_id, reservation_id, reason).await?;

        let response = match outcome {
            ReleaseOutcome::Released {
                reservation_id, ..
            } => ReleaseStockResponse {
                success: true,
                message: format!("reservation {} released", reservation_id),
            },
            ReleaseOutcome::NotFound => ReleaseStockResponse {
                success: false,
                message: "reservation not found".to_string(),
            },
            ReleaseOutcome::NotActive { status } => ReleaseStockResponse {
                success: false,
                message: format!("already {}", status),
            },
        };
        Ok(Response::new(response))
    }

    async fn check_stock(
        &self,
        request: Request<CheckStockRequest>,
    ) -> Result<Response<CheckStockResponse>, Status> {
        let req = request.into_inner();
        let product = self
            .store
            .check(&req.product_id)
            .await?
            .ok_or_else(|| Status::not_found(format!("product {} not found", req.product_id)))?;

        Ok(Response::new(CheckStockResponse {
            product_id: product.id,
            name: product.name,
            stock: product.stock,
            low_stock_threshold: product.low_stock_threshold,
        }))
    }

    /// Healthy iff the owned database answers and the bus producer is
    /// connected; the whole probe is bounded to 1 s.
    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let probe = async {
            let db_ok = match self.pool.get().await {
                Ok(mut conn) => diesel::sql_query("SELECT 1").execute(&mut conn).await.is_ok(),
                Err(_) => false,
            };
            let bus = self.bus.clone();
            let bus_ok = tokio::task::spawn_blocking(move || {
                bus.is_connected(Duration::from_millis(500))
            })
            .await
            .unwrap_or(false);
            (db_ok, bus_ok)
        };

        let (db_ok, bus_ok) = tokio::time::timeout(Duration::from_secs(1), probe)
            .await
            .unwrap_or((false, false));

        let healthy = db_ok && bus_ok;
        let message = if healthy {
            "ok".to_string()
        } else {
            format!("database: {}, bus: {}", db_ok, bus_ok)
        };
        Ok(Response::new(HealthCheckResponse { healthy, message }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The numeric codes are part of the wire contract.
    #[test]
    fn reserve_status_wire_codes() {
        assert_eq!(ReserveStatus::Unknown as i32, 0);
        assert_eq!(ReserveStatus::Confirmed as i32, 1);
        assert_eq!(ReserveStatus::InsufficientStock as i32, 2);
        assert_eq!(ReserveStatus::ProductNotFound as i32, 3);
        assert_eq!(ReserveStatus::AlreadyExists as i32, 4);
    }

    #[test]
    fn empty_idempotency_key_is_absent() {
        assert_eq!(none_if_empty(String::new()), None);
        assert_eq!(none_if_empty("k-42".to_string()), Some("k-42".to_string()));
    }
}
