//! Coordinator error taxonomy with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrderError {
    /// Request is missing a field or carries an out-of-range value.
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("quantity must be greater than zero")]
    InvalidQuantity,

    #[error("unknown status filter: {0}")]
    InvalidStatusFilter(String),

    #[error("order {0} not found")]
    NotFound(Uuid),

    /// Operation not allowed from a terminal status.
    #[error("order {id} is already {status}")]
    Terminal { id: Uuid, status: String },

    #[error("database error: {0}")]
    Db(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Reservation RPC failed in a way that is neither a domain outcome
    /// nor a timeout/unavailable, so the order is left pending.
    #[error("reservation rpc failed: {0}")]
    Rpc(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for OrderError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            OrderError::MissingField(_)
            | OrderError::InvalidQuantity
            | OrderError::InvalidStatusFilter(_)
            | OrderError::Terminal { .. } => (StatusCode::BAD_REQUEST, self.to_string()),
            OrderError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            OrderError::Rpc(_)
            | OrderError::Db(_)
            | OrderError::Pool(_)
            | OrderError::Serde(_)
            | OrderError::Internal(_) => {
                tracing::error!(error = %self, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_to_http_statuses() {
        let id = Uuid::new_v4();
        assert_eq!(
            OrderError::MissingField("customerId").into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            OrderError::NotFound(id).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            OrderError::Terminal {
                id,
                status: "failed".to_string()
            }
            .into_response()
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            OrderError::Internal("boom".to_string())
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
