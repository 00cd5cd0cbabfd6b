//! Order status machine.
//!
//! Two independent axes live on every order:
//!
//! * fulfillment: `pending -> processing -> shipped -> delivered`, and
//!   `pending -> cancelled`
//! * payment: `pending -> paid`, `pending -> failed`, `paid -> refunded`, plus
//!   `failed -> paid` when a customer retries after a declined attempt
//!
//! Settlement is the only place the axes are coupled (a successful payment also
//! moves fulfillment from `pending` to `processing`). Admin overrides bypass these
//! rules entirely.

use crate::entities::order::{OrderStatus, PaymentStatus};
use crate::errors::ServiceError;

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Shipped)
                | (Shipped, Delivered)
        )
    }

    pub fn is_cancellable(&self) -> bool {
        self.can_transition_to(OrderStatus::Cancelled)
    }
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Paid) | (Pending, Failed) | (Failed, Paid) | (Paid, Refunded)
        )
    }

    /// Money has already moved; no new payment may be started.
    pub fn is_settled(&self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::Refunded)
    }

    /// States a successful payment may be applied from.
    pub fn payable_states() -> [PaymentStatus; 2] {
        [PaymentStatus::Pending, PaymentStatus::Failed]
    }
}

pub fn ensure_cancellable(status: OrderStatus) -> Result<(), ServiceError> {
    if status.is_cancellable() {
        Ok(())
    } else {
        Err(ServiceError::InvalidState(format!(
            "order cannot be cancelled while {}",
            status.as_str()
        )))
    }
}

pub fn ensure_payable(status: PaymentStatus) -> Result<(), ServiceError> {
    if status.is_settled() {
        Err(ServiceError::Conflict(format!(
            "order is already {}",
            status.as_str()
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    #[rstest]
    #[case(OrderStatus::Pending, OrderStatus::Processing, true)]
    #[case(OrderStatus::Pending, OrderStatus::Cancelled, true)]
    #[case(OrderStatus::Processing, OrderStatus::Shipped, true)]
    #[case(OrderStatus::Shipped, OrderStatus::Delivered, true)]
    #[case(OrderStatus::Pending, OrderStatus::Shipped, false)]
    #[case(OrderStatus::Processing, OrderStatus::Cancelled, false)]
    #[case(OrderStatus::Delivered, OrderStatus::Pending, false)]
    #[case(OrderStatus::Cancelled, OrderStatus::Pending, false)]
    fn fulfillment_transitions(
        #[case] from: OrderStatus,
        #[case] to: OrderStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[rstest]
    #[case(PaymentStatus::Pending, PaymentStatus::Paid, true)]
    #[case(PaymentStatus::Pending, PaymentStatus::Failed, true)]
    #[case(PaymentStatus::Failed, PaymentStatus::Paid, true)]
    #[case(PaymentStatus::Paid, PaymentStatus::Refunded, true)]
    #[case(PaymentStatus::Paid, PaymentStatus::Failed, false)]
    #[case(PaymentStatus::Paid, PaymentStatus::Paid, false)]
    #[case(PaymentStatus::Refunded, PaymentStatus::Paid, false)]
    #[case(PaymentStatus::Pending, PaymentStatus::Refunded, false)]
    fn payment_transitions(
        #[case] from: PaymentStatus,
        #[case] to: PaymentStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[rstest]
    #[case(OrderStatus::Processing)]
    #[case(OrderStatus::Shipped)]
    #[case(OrderStatus::Delivered)]
    #[case(OrderStatus::Cancelled)]
    fn only_pending_orders_cancel(#[case] status: OrderStatus) {
        assert_matches!(ensure_cancellable(status), Err(ServiceError::InvalidState(_)));
    }

    #[test]
    fn pending_order_cancels() {
        assert!(ensure_cancellable(OrderStatus::Pending).is_ok());
    }

    #[test]
    fn settled_payments_reject_new_attempts() {
        assert_matches!(
            ensure_payable(PaymentStatus::Paid),
            Err(ServiceError::Conflict(_))
        );
        assert_matches!(
            ensure_payable(PaymentStatus::Refunded),
            Err(ServiceError::Conflict(_))
        );
        assert!(ensure_payable(PaymentStatus::Pending).is_ok());
        assert!(ensure_payable(PaymentStatus::Failed).is_ok());
    }

    #[test]
    fn names_match_stored_values() {
        use sea_orm::{ActiveEnum, Iterable};
        for status in OrderStatus::iter() {
            assert_eq!(status.as_str(), status.to_value());
        }
        for status in PaymentStatus::iter() {
            assert_eq!(status.as_str(), status.to_value());
        }
    }
}
