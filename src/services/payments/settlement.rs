//! Terminal payment transitions shared by every protocol.
//!
//! Each transition is a conditional update guarded on the current payment status. A
//! replayed notification matches no row and reports [`SettlementOutcome::AlreadySettled`]
//! without side effects.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use sea_orm::{sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    db::UnitOfWork,
    entities::order::{self, OrderStatus, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    notifications::{queue_order_confirmation, NotificationSender},
    services::orders::{find_order, load_details},
};

#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    /// This call moved the payment status.
    Applied(order::Model),
    /// The payment status had already left the source state; nothing changed.
    AlreadySettled(order::Model),
}

impl SettlementOutcome {
    pub fn order(&self) -> &order::Model {
        match self {
            SettlementOutcome::Applied(order) | SettlementOutcome::AlreadySettled(order) => order,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, SettlementOutcome::Applied(_))
    }

    pub fn kind(&self) -> SettlementKind {
        match self {
            SettlementOutcome::Applied(_) => SettlementKind::Applied,
            SettlementOutcome::AlreadySettled(_) => SettlementKind::AlreadySettled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    Applied,
    AlreadySettled,
}

#[derive(Clone)]
pub struct SettlementService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    notifier: Arc<dyn NotificationSender>,
}

impl SettlementService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        notifier: Arc<dyn NotificationSender>,
    ) -> Self {
        Self {
            db,
            event_sender,
            notifier,
        }
    }

    /// Marks the order paid and, if it is still pending, moves it to processing.
    /// The confirmation is sent once, by the call that applied the change.
    #[instrument(skip(self))]
    pub async fn mark_order_paid(
        &self,
        order_id: Uuid,
        transaction_id: &str,
    ) -> Result<SettlementOutcome, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db).await?;
        let now = Utc::now();

        let existing = find_order(uow.txn(), order_id).await?;

        let paid = order::Entity::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(PaymentStatus::Paid))
            .col_expr(
                order::Column::PaymentReference,
                Expr::value(Some(transaction_id.to_string())),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::PaymentStatus.is_in(PaymentStatus::payable_states()))
            .exec(uow.txn())
            .await?;
        if paid.rows_affected == 0 {
            counter!("storefront.settlement.replayed", 1);
            info!(order_id = %order_id, "Payment already settled, ignoring");
            return Ok(SettlementOutcome::AlreadySettled(existing));
        }

        order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Processing))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(uow.txn())
            .await?;

        let details = load_details(uow.txn(), find_order(uow.txn(), order_id).await?).await?;
        if let Some(address) = &details.shipping_address {
            queue_order_confirmation(
                &mut uow,
                self.notifier.clone(),
                address,
                &details.order,
                &details.items,
            );
        }
        let events = self.event_sender.clone();
        let succeeded = Event::PaymentSucceeded {
            order_id,
            transaction_id: transaction_id.to_string(),
        };
        uow.after_commit("payment_succeeded_event", async move {
            events.send(succeeded).await
        });
        uow.commit().await?;

        counter!("storefront.settlement.paid", 1);
        info!(
            order_id = %order_id,
            order_number = %details.order.order_number,
            transaction_id,
            "Order marked paid"
        );
        Ok(SettlementOutcome::Applied(details.order))
    }

    /// Marks a pending payment failed. A later successful attempt may still pay it.
    #[instrument(skip(self))]
    pub async fn mark_order_payment_failed(
        &self,
        order_id: Uuid,
        reason: &str,
    ) -> Result<SettlementOutcome, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db).await?;

        let existing = find_order(uow.txn(), order_id).await?;

        let failed = order::Entity::update_many()
            .col_expr(
                order::Column::PaymentStatus,
                Expr::value(PaymentStatus::Failed),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Pending))
            .exec(uow.txn())
            .await?;
        if failed.rows_affected == 0 {
            counter!("storefront.settlement.replayed", 1);
            return Ok(SettlementOutcome::AlreadySettled(existing));
        }

        let updated = find_order(uow.txn(), order_id).await?;
        let events = self.event_sender.clone();
        let event = Event::PaymentFailed {
            order_id,
            reason: reason.to_string(),
        };
        uow.after_commit("payment_failed_event", async move { events.send(event).await });
        uow.commit().await?;

        counter!("storefront.settlement.failed", 1);
        info!(order_id = %order_id, reason, "Order payment failed");
        Ok(SettlementOutcome::Applied(updated))
    }
}
