//! Custodian error type. Domain outcomes (insufficient stock, unknown
//! product) are not errors; they travel as [`crate::stock::ReserveOutcome`]
//! variants. This type covers the infrastructure failures underneath.

use diesel::result::DatabaseErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("database error: {0}")]
    Db(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl InventoryError {
    /// Serializable transactions can abort under contention; these are
    /// retried once in-handler before surfacing.
    pub fn is_serialization_conflict(&self) -> bool {
        matches!(
            self,
            InventoryError::Db(diesel::result::Error::DatabaseError(
                DatabaseErrorKind::SerializationFailure,
                _
            ))
        )
    }

    /// A reservation insert lost a race on the idempotency key (or the
    /// one-active-per-order index); the committed row is the answer.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            InventoryError::Db(diesel::result::Error::DatabaseError(
                DatabaseErrorKind::UniqueViolation,
                _
            ))
        )
    }
}

impl From<InventoryError> for tonic::Status {
    fn from(e: InventoryError) -> Self {
        tracing::error!(error = %e, "inventory handler failed");
        tonic::Status::internal(e.to_string())
    }
}
