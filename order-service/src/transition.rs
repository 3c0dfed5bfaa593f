//! Single transition function for order status changes.
//!
//! Two independent paths can settle the same order: the synchronous
//! reservation reply and the inventory-events consumer. Both funnel
//! through [`apply`] while holding a `SELECT ... FOR UPDATE` lock on the
//! order row, so the first terminal transition wins and re-applying it is
//! a no-op.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use tracing::info;
use uuid::Uuid;

use shared::events::{OrderCancelled, OrderConfirmed, OrderFailed};
use shared::Event;

use crate::error::OrderError;
use crate::models::{Order, OrderStatus};
use crate::outbox;
use crate::schema::orders;

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Confirm { reservation_id: Uuid },
    Fail { reason: String },
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Move to the new status.
    Advance(OrderStatus),
    /// Already settled compatibly; nothing to do.
    Noop,
    /// Not allowed from the current status.
    Invalid,
}

pub fn apply(current: OrderStatus, transition: &Transition) -> Step {
    use OrderStatus::*;
    match (current, transition) {
        (Pending | PendingVerification, Transition::Confirm { .. }) => Step::Advance(Confirmed),
        (Confirmed | Failed | Cancelled, Transition::Confirm { .. }) => Step::Noop,

        (Pending | PendingVerification, Transition::Fail { .. }) => Step::Advance(Failed),
        (Confirmed | Failed | Cancelled, Transition::Fail { .. }) => Step::Noop,

        (Pending | PendingVerification | Confirmed, Transition::Cancel) => Step::Advance(Cancelled),
        (Failed | Cancelled, Transition::Cancel) => Step::Invalid,
    }
}

/// Row-lock an order. Callers run inside a transaction; the lock holds
/// until it commits.
pub async fn lock(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
) -> Result<Option<Order>, OrderError> {
    let order = orders::table
        .find(order_id)
        .for_update()
        .first::<Order>(conn)
        .await
        .optional()?;
    Ok(order)
}

#[derive(AsChangeset)]
#[diesel(table_name = crate::schema::orders)]
struct OrderChanges {
    status: String,
    updated_at: chrono::DateTime<Utc>,
    completed_at: Option<chrono::DateTime<Utc>>,
    reservation_id: Option<Uuid>,
    error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Settled {
    Applied(Order),
    Unchanged(Order),
    Rejected(Order),
}

impl Settled {
    pub fn order(&self) -> &Order {
        match self {
            Settled::Applied(o) | Settled::Unchanged(o) | Settled::Rejected(o) => o,
        }
    }
}

/// Apply a transition to a locked order, persist it, and stage the
/// matching lifecycle event in the outbox (same transaction).
pub async fn advance(
    conn: &mut AsyncPgConnection,
    order: &Order,
    transition: &Transition,
) -> Result<Settled, OrderError> {
    let next = match apply(order.status(), transition) {
        Step::Advance(next) => next,
        Step::Noop => {
            info!(order_id = %order.id, status = %order.status, "transition is a no-op");
            return Ok(Settled::Unchanged(order.clone()));
        }
        Step::Invalid => return Ok(Settled::Rejected(order.clone())),
    };

    let now = Utc::now();
    let changes = OrderChanges {
        status: next.as_str().to_string(),
        updated_at: now,
        completed_at: next.is_terminal().then_some(now),
        reservation_id: match transition {
            Transition::Confirm { reservation_id } => Some(*reservation_id),
            _ => None,
        },
        error_message: match transition {
            Transition::Fail { reason } => Some(reason.clone()),
            _ => None,
        },
    };

    let updated: Order = diesel::update(orders::table.find(order.id))
        .set(&changes)
        .get_result(conn)
        .await?;

    let event = match transition {
        Transition::Confirm { reservation_id } => Event::OrderConfirmed(OrderConfirmed {
            order_id: order.id,
            reservation_id: *reservation_id,
        }),
        Transition::Fail { reason } => Event::OrderFailed(OrderFailed {
            order_id: order.id,
            reason: reason.clone(),
        }),
        Transition::Cancel => Event::OrderCancelled(OrderCancelled { order_id: order.id }),
    };
    outbox::stage(conn, &order.id.to_string(), &event).await?;

    info!(order_id = %order.id, from = %order.status, to = %next, "order transitioned");
    Ok(Settled::Applied(updated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrderStatus::*;

    fn confirm() -> Transition {
        Transition::Confirm {
            reservation_id: Uuid::new_v4(),
        }
    }

    fn fail() -> Transition {
        Transition::Fail {
            reason: "Insufficient stock".to_string(),
        }
    }

    #[test]
    fn confirm_from_open_states() {
        assert_eq!(apply(Pending, &confirm()), Step::Advance(Confirmed));
        assert_eq!(
            apply(PendingVerification, &confirm()),
            Step::Advance(Confirmed)
        );
    }

    #[test]
    fn terminal_states_absorb() {
        for terminal in [Confirmed, Failed, Cancelled] {
            assert_eq!(apply(terminal, &confirm()), Step::Noop);
            assert_eq!(apply(terminal, &fail()), Step::Noop);
        }
    }

    #[test]
    fn reapplying_confirm_is_a_noop() {
        // The reply path and the consumer may both try to confirm.
        let first = apply(PendingVerification, &confirm());
        assert_eq!(first, Step::Advance(Confirmed));
        assert_eq!(apply(Confirmed, &confirm()), Step::Noop);
    }

    #[test]
    fn cancel_allowed_from_confirmed_but_not_terminal_failures() {
        assert_eq!(apply(Pending, &Transition::Cancel), Step::Advance(Cancelled));
        assert_eq!(
            apply(PendingVerification, &Transition::Cancel),
            Step::Advance(Cancelled)
        );
        assert_eq!(
            apply(Confirmed, &Transition::Cancel),
            Step::Advance(Cancelled)
        );
        assert_eq!(apply(Failed, &Transition::Cancel), Step::Invalid);
        assert_eq!(apply(Cancelled, &Transition::Cancel), Step::Invalid);
    }
}
