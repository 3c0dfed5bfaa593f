//! Client side of the inventory reservation RPC.
//!
//! The reserve call carries a hard 2 s deadline. Deadline breaches and
//! transport failures are not errors to surface; they are classified here
//! and converted by the coordinator into the verification recovery path.

use std::time::Duration;

use anyhow::Result;
use tonic::transport::Channel;
use tonic::{Code, Request, Status};
use uuid::Uuid;

use shared::proto::inventory_service_client::InventoryServiceClient;
use shared::proto::{
    CheckStockRequest, CheckStockResponse, ReleaseStockRequest, ReserveStatus,
    ReserveStockRequest,
};

pub const RESERVE_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum ReserveReply {
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
pub enum RpcFailure {
    /// Deadline breached; the reservation may or may not have committed.
    Timeout,
    /// Transport-level failure; same uncertainty as a timeout.
    Unavailable,
    /// Anything else, surfaced to the caller as an internal error.
    Other(String),
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcFailure::Timeout => f.write_str("deadline exceeded"),
            RpcFailure::Unavailable => f.write_str("unavailable"),
            RpcFailure::Other(msg) => f.write_str(msg),
        }
    }
}

/// Uncertain outcomes (the Schrödinger cases) go to verification; known
/// failures do not.
pub fn classify(status: &Status) -> RpcFailure {
    match status.code() {
        Code::DeadlineExceeded => RpcFailure::Timeout,
        Code::Unavailable => RpcFailure::Unavailable,
        _ => RpcFailure::Other(status.to_string()),
    }
}

#[derive(Clone)]
pub struct InventoryClient {
    client: InventoryServiceClient<Channel>,
}

impl InventoryClient {
    /// Lazy connection: the channel is established on first use, so a
    /// down inventory service shows up as `UNAVAILABLE` per call instead
    /// of failing startup.
    pub fn connect_lazy(endpoint: &str) -> Result<Self> {
        let channel = Channel::from_shared(endpoint.to_string())?.connect_lazy();
        Ok(Self {
            client: InventoryServiceClient::new(channel),
        })
    }

    pub async fn reserve(
        &self,
        order_id: Uuid,
        product_id: &str,
        quantity: i32,
        idempotency_key: &str,
    ) -> Result<ReserveReply, RpcFailure> {
        let mut request = Request::new(ReserveStockRequest {
            order_id: order_id.to_string(),
            product_id: product_id.to_string(),
            quantity,
            idempotency_key: idempotency_key.to_string(),
        });
        request.set_timeout(RESERVE_DEADLINE);

        let mut client = self.client.clone();
        let call = client.reserve_stock(request);
        let response = match tokio::time::timeout(RESERVE_DEADLINE, call).await {
            Err(_) => return Err(RpcFailure::Timeout),
            Ok(Err(status)) => return Err(classify(&status)),
            Ok(Ok(response)) => response.into_inner(),
        };

        let reservation_id = || {
            Uuid::parse_str(&response.reservation_id)
                .map_err(|e| RpcFailure::Other(format!("malformed reservation id: {}", e)))
        };

        match response.status() {
            ReserveStatus::Confirmed => Ok(ReserveReply::Confirmed {
                reservation_id: reservation_id()?,
                remaining_stock: response.remaining_stock,
            }),
            ReserveStatus::AlreadyExists => Ok(ReserveReply::AlreadyExists {
                reservation_id: reservation_id()?,
                remaining_stock: response.remaining_stock,
            }),
            ReserveStatus::InsufficientStock => Ok(ReserveReply::InsufficientStock {
                remaining_stock: response.remaining_stock,
            }),
            ReserveStatus::ProductNotFound => Ok(ReserveReply::ProductNotFound),
            ReserveStatus::Unknown => Err(RpcFailure::Other(format!(
                "unknown reserve status in reply: {}",
                response.message
            ))),
        }
    }

    /// Best-effort release; the cancel path logs failures instead of
    /// propagating them.
    pub async fn release(
        &self,
        order_id: Uuid,
        reservation_id: Uuid,
        reason: &str,
    ) -> Result<(bool, String), RpcFailure> {
        let request = Request::new(ReleaseStockRequest {
            order_id: order_id.to_string(),
            reservation_id: reservation_id.to_string(),
            reason: reason.to_string(),
        });

        let response = self
            .client
            .clone()
            .release_stock(request)
            .await
            .map_err(|status| classify(&status))?
            .into_inner();
        Ok((response.success, response.message))
    }

    pub async fn check_stock(&self, product_id: &str) -> Result<Option<CheckStockResponse>, Status> {
        let request = Request::new(CheckStockRequest {
            product_id: product_id.to_string(),
        });
        match self.client.clone().check_stock(request).await {
            Ok(response) => Ok(Some(response.into_inner())),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_and_transport_failures_enter_verification() {
        assert_eq!(
            classify(&Status::deadline_exceeded("too slow")),
            RpcFailure::Timeout
        );
        assert_eq!(
            classify(&Status::unavailable("connection refused")),
            RpcFailure::Unavailable
        );
    }

    #[test]
    fn other_codes_stay_errors() {
        for status in [
            Status::internal("boom"),
            Status::invalid_argument("bad"),
            Status::cancelled("gone"),
        ] {
            assert!(matches!(classify(&status), RpcFailure::Other(_)));
        }
    }
}
