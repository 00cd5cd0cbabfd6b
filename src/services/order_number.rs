//! `ORD-YYYYMMDD-NNNN` order numbers.
//!
//! The daily sequence is a counter row per calendar day, bumped with a single upsert
//! inside the checkout transaction. The row lock taken by the upsert serializes
//! concurrent checkouts on the same day, so two orders can never share a number.

use chrono::NaiveDate;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ConnectionTrait, EntityTrait, Set,
};

use crate::entities::order_sequence;
use crate::errors::ServiceError;

pub const ORDER_NUMBER_PREFIX: &str = "ORD";

/// Day key used for the counter row
pub fn day_key(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Formats a sequence as an order number. Four digits is a minimum width, not a cap.
pub fn format_order_number(date: NaiveDate, sequence: i64) -> String {
    format!("{}-{}-{:04}", ORDER_NUMBER_PREFIX, day_key(date), sequence)
}

/// Atomically takes the next sequence value for `date`.
pub async fn next_sequence<C: ConnectionTrait>(
    conn: &C,
    date: NaiveDate,
) -> Result<i64, ServiceError> {
    let day = day_key(date);

    order_sequence::Entity::insert(order_sequence::ActiveModel {
        day: Set(day.clone()),
        last_value: Set(1),
    })
    .on_conflict(
        OnConflict::column(order_sequence::Column::Day)
            .value(
                order_sequence::Column::LastValue,
                Expr::col((
                    order_sequence::Entity,
                    order_sequence::Column::LastValue,
                ))
                .add(1),
            )
            .to_owned(),
    )
    .exec_without_returning(conn)
    .await?;

    let row = order_sequence::Entity::find_by_id(day.clone())
        .one(conn)
        .await?
        .ok_or_else(|| {
            ServiceError::InternalError(format!("order sequence for {} vanished", day))
        })?;

    Ok(row.last_value)
}

/// Allocates the next order number for `date`.
pub async fn next_order_number<C: ConnectionTrait>(
    conn: &C,
    date: NaiveDate,
) -> Result<String, ServiceError> {
    let sequence = next_sequence(conn, date).await?;
    Ok(format_order_number(date, sequence))
}
