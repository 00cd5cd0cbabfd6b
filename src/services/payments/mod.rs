//! Payment settlement.
//!
//! An order's [`PaymentMethod`] picks the protocol once, at checkout. Both protocols
//! verify the gateway's message first and only then call into [`settlement`], which owns
//! the order-state transitions.

pub mod intent;
pub mod settlement;
pub mod vnpay;

use chrono::Utc;
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use sea_orm::{sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    entities::order::{self, OrderStatus, PaymentMethod},
    errors::ServiceError,
    services::order_status::ensure_payable,
};

pub use settlement::{SettlementOutcome, SettlementService};

/// Settlement protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentProtocol {
    /// Token created up front, outcome pushed by a signed webhook
    Intent,
    /// Browser sent to the gateway and returned with signed query parameters
    Redirect,
}

impl PaymentMethod {
    /// `None` for methods settled offline.
    pub fn protocol(&self) -> Option<PaymentProtocol> {
        match self {
            PaymentMethod::Cod => None,
            PaymentMethod::Stripe => Some(PaymentProtocol::Intent),
            PaymentMethod::Vnpay => Some(PaymentProtocol::Redirect),
        }
    }
}

/// ISO 4217 codes without a minor unit.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];

pub fn is_zero_decimal(currency: &str) -> bool {
    ZERO_DECIMAL_CURRENCIES
        .iter()
        .any(|code| code.eq_ignore_ascii_case(currency))
}

/// Converts an amount to the smallest unit of its currency, rounding half away from zero.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Result<i64, ServiceError> {
    let scale = if is_zero_decimal(currency) {
        Decimal::ONE
    } else {
        Decimal::ONE_HUNDRED
    };
    (amount * scale)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError(format!("amount {} out of range", amount)))
}

/// Loads the caller's order and checks it can still take a payment attempt.
pub(crate) async fn payable_order<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    order_id: Uuid,
) -> Result<order::Model, ServiceError> {
    let order = order::Entity::find_by_id(order_id)
        .filter(order::Column::UserId.eq(user_id))
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Order", order_id))?;

    ensure_payable(order.payment_status)?;
    if order.status == OrderStatus::Cancelled {
        return Err(ServiceError::InvalidState(format!(
            "Order {} is cancelled",
            order.order_number
        )));
    }
    Ok(order)
}

/// Stores the method and gateway reference of a new payment attempt.
pub(crate) async fn record_payment_attempt<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    method: PaymentMethod,
    reference: Option<String>,
) -> Result<(), ServiceError> {
    order::Entity::update_many()
        .col_expr(order::Column::PaymentMethod, Expr::value(method))
        .col_expr(order::Column::PaymentReference, Expr::value(reference))
        .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(order::Column::Id.eq(order_id))
        .exec(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn methods_select_protocols() {
        assert_eq!(PaymentMethod::Cod.protocol(), None);
        assert_eq!(PaymentMethod::Stripe.protocol(), Some(PaymentProtocol::Intent));
        assert_eq!(PaymentMethod::Vnpay.protocol(), Some(PaymentProtocol::Redirect));
    }

    #[test]
    fn minor_units_respect_currency_exponent() {
        assert_eq!(to_minor_units(dec!(20.00), "USD").unwrap(), 2000);
        assert_eq!(to_minor_units(dec!(10.005), "eur").unwrap(), 1001);
        assert_eq!(to_minor_units(dec!(150000), "VND").unwrap(), 150000);
        assert_eq!(to_minor_units(dec!(1200), "jpy").unwrap(), 1200);
    }
}
