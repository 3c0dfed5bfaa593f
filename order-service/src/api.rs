use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared::EventBus;

use crate::coordinator::{Coordinator, CreateOrder};
use crate::error::OrderError;
use crate::models::{Order, OrderStatus};
use crate::rpc::InventoryClient;

type DbPool = Pool<AsyncPgConnection>;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 200;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub pool: DbPool,
    pub bus: EventBus,
    pub inventory: InventoryClient,
    pub http: reqwest::Client,
    pub catalog_url: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/products", get(list_products))
        .route("/products/:id/stock", get(product_stock))
        .route("/health", get(health))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub customer_id: Option<String>,
    pub product_id: Option<String>,
    pub quantity: Option<i32>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: Uuid,
    pub customer_id: String,
    pub product_id: String,
    pub quantity: i32,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl OrderResponse {
    fn new(order: Order, cached: bool) -> Self {
        let message = match order.status() {
            OrderStatus::PendingVerification => Some(
                "Reservation outcome unknown; the order is being verified asynchronously"
                    .to_string(),
            ),
            _ => None,
        };
        Self {
            order_id: order.id,
            customer_id: order.customer_id,
            product_id: order.product_id,
            quantity: order.quantity,
            status: order.status,
            reservation_id: order.reservation_id,
            error_message: order.error_message,
            cached,
            message,
            created_at: order.created_at,
            updated_at: order.updated_at,
            completed_at: order.completed_at,
        }
    }
}

fn status_code_for(status: OrderStatus, cached: bool) -> StatusCode {
    if cached {
        return StatusCode::OK;
    }
    match status {
        OrderStatus::Confirmed => StatusCode::CREATED,
        OrderStatus::Failed => StatusCode::BAD_REQUEST,
        OrderStatus::PendingVerification => StatusCode::ACCEPTED,
        OrderStatus::Pending | OrderStatus::Cancelled => StatusCode::OK,
    }
}

async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateOrderRequest>,
) -> Result<Response, OrderError> {
    let customer_id = body
        .customer_id
        .filter(|s| !s.is_empty())
        .ok_or(OrderError::MissingField("customerId"))?;
    let product_id = body
        .product_id
        .filter(|s| !s.is_empty())
        .ok_or(OrderError::MissingField("productId"))?;
    let quantity = body.quantity.ok_or(OrderError::MissingField("quantity"))?;
    if quantity <= 0 {
        return Err(OrderError::InvalidQuantity);
    }

    // The header wins when both the header and the body carry a key.
    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(body.idempotency_key)
        .filter(|s| !s.is_empty());

    let created = state
        .coordinator
        .create_order(CreateOrder {
            customer_id,
            product_id,
            quantity,
            idempotency_key,
        })
        .await?;

    let status = status_code_for(created.order.status(), created.cached);
    let body = OrderResponse::new(created.order, created.cached);
    Ok((status, Json(body)).into_response())
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderResponse>, OrderError> {
    let order = state.coordinator.get_order(id).await?;
    Ok(Json(OrderResponse::new(order, false)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

async fn list_orders(
    State(state): State<AppState>,
    Query(params): Query<ListQuery>,
) -> Result<Json<Vec<OrderResponse>>, OrderError> {
    let status = match params.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            OrderStatus::parse(raw).ok_or_else(|| OrderError::InvalidStatusFilter(raw.to_string()))?,
        ),
        None => None,
    };
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let orders = state.coordinator.list_orders(status, limit).await?;
    Ok(Json(
        orders
            .into_iter()
            .map(|o| OrderResponse::new(o, false))
            .collect(),
    ))
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderResponse>, OrderError> {
    let order = state.coordinator.cancel_order(id).await?;
    Ok(Json(OrderResponse::new(order, false)))
}

/// Pass-through to the catalog read API.
async fn list_products(State(state): State<AppState>) -> Result<Response, OrderError> {
    let upstream = state
        .http
        .get(format!("{}/products", state.catalog_url))
        .send()
        .await
        .map_err(|e| OrderError::Internal(format!("catalog unreachable: {}", e)))?;

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = upstream
        .bytes()
        .await
        .map_err(|e| OrderError::Internal(format!("catalog read failed: {}", e)))?;
    Ok((
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}

async fn product_stock(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
) -> Result<Response, OrderError> {
    match state.inventory.check_stock(&product_id).await {
        Ok(Some(stock)) => Ok(Json(serde_json::json!({
            "productId": stock.product_id,
            "name": stock.name,
            "stock": stock.stock,
            "lowStockThreshold": stock.low_stock_threshold,
        }))
        .into_response()),
        Ok(None) => Ok((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("product {} not found", product_id) })),
        )
            .into_response()),
        Err(status) => Err(OrderError::Rpc(status.to_string())),
    }
}

/// Healthy iff the owned database answers and the bus producer is
/// connected; downstream inventory health is informational only.
async fn health(State(state): State<AppState>) -> Response {
    let db_ok = match state.pool.get().await {
        Ok(mut conn) => diesel::sql_query("SELECT 1").execute(&mut conn).await.is_ok(),
        Err(_) => false,
    };

    let bus = state.bus.clone();
    let bus_ok = tokio::task::spawn_blocking(move || bus.is_connected(Duration::from_secs(1)))
        .await
        .unwrap_or(false);

    if db_ok && bus_ok {
        (StatusCode::OK, Json(serde_json::json!({ "status": "healthy" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "degraded",
                "database": db_ok,
                "bus": bus_ok,
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_accepts_camel_case() {
        let body: CreateOrderRequest = serde_json::from_str(
            r#"{"customerId":"C1","productId":"SKU-002","quantity":3,"idempotencyKey":"k-42"}"#,
        )
        .unwrap();
        assert_eq!(body.customer_id.as_deref(), Some("C1"));
        assert_eq!(body.product_id.as_deref(), Some("SKU-002"));
        assert_eq!(body.quantity, Some(3));
        assert_eq!(body.idempotency_key.as_deref(), Some("k-42"));
    }

    #[test]
    fn reply_status_codes() {
        assert_eq!(
            status_code_for(OrderStatus::Confirmed, false),
            StatusCode::CREATED
        );
        assert_eq!(
            status_code_for(OrderStatus::Failed, false),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_code_for(OrderStatus::PendingVerification, false),
            StatusCode::ACCEPTED
        );
        // Replays return the stored order as-is.
        assert_eq!(status_code_for(OrderStatus::Failed, true), StatusCode::OK);
    }
}
