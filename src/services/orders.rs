use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::UnitOfWork,
    entities::{
        order::{self, OrderStatus, PaymentStatus},
        order_item, shipping_address,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{catalog::adjust_stock, order_status::ensure_cancellable},
};

/// An order with its line snapshots and delivery address.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub shipping_address: Option<shipping_address::Model>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderPage {
    pub orders: Vec<order::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Manual correction of either status axis. Neither value is checked against the
/// transition rules.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusOverrideRequest {
    pub status: Option<OrderStatus>,
    pub payment_status: Option<PaymentStatus>,
}

/// Loads items and address for an order through any connection.
pub async fn load_details<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
) -> Result<OrderDetails, ServiceError> {
    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order.id))
        .order_by_asc(order_item::Column::CreatedAt)
        .all(conn)
        .await?;
    let shipping_address = shipping_address::Entity::find()
        .filter(shipping_address::Column::OrderId.eq(order.id))
        .one(conn)
        .await?;
    Ok(OrderDetails {
        order,
        items,
        shipping_address,
    })
}

pub async fn find_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<order::Model, ServiceError> {
    order::Entity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Order", order_id))
}

/// Order reads, customer cancellation and the admin override.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    #[instrument(skip(self))]
    pub async fn list_orders_for_user(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<OrderPage, ServiceError> {
        let paginator = order::Entity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page);
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok(OrderPage {
            orders,
            total,
            page,
            per_page,
        })
    }

    /// Another user's order reads as missing rather than forbidden.
    #[instrument(skip(self))]
    pub async fn get_order_for_user(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderDetails, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .filter(order::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::not_found("Order", order_id))?;
        load_details(&*self.db, order).await
    }

    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        page: u64,
        per_page: u64,
        status: Option<OrderStatus>,
    ) -> Result<OrderPage, ServiceError> {
        let mut query = order::Entity::find().order_by_desc(order::Column::CreatedAt);
        if let Some(status) = status {
            query = query.filter(order::Column::Status.eq(status));
        }
        let paginator = query.paginate(&*self.db, per_page);
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok(OrderPage {
            orders,
            total,
            page,
            per_page,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let order = find_order(&*self.db, order_id).await?;
        load_details(&*self.db, order).await
    }

    /// Cancels a pending order and returns every line's quantity to stock.
    ///
    /// The status change is a conditional update on `status = pending`, so of two
    /// concurrent cancels only one restocks. Status and stock commit together.
    #[instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderDetails, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db).await?;

        let order = order::Entity::find_by_id(order_id)
            .filter(order::Column::UserId.eq(user_id))
            .one(uow.txn())
            .await?
            .ok_or_else(|| ServiceError::not_found("Order", order_id))?;
        ensure_cancellable(order.status)?;

        let result = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Cancelled))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(uow.txn())
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::InvalidState(format!(
                "Order {} is no longer pending",
                order.order_number
            )));
        }

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(uow.txn())
            .await?;
        for item in &items {
            adjust_stock(uow.txn(), item.product_id, item.quantity).await?;
        }

        let details = load_details(uow.txn(), find_order(uow.txn(), order_id).await?).await?;

        let events = self.event_sender.clone();
        let restocked_items = items.len();
        uow.after_commit("order_cancelled_event", async move {
            events
                .send(Event::OrderCancelled {
                    order_id,
                    restocked_items,
                })
                .await
        });
        uow.commit().await?;

        info!(order_id = %order_id, restocked_items, "Order cancelled");
        Ok(details)
    }

    /// Sets either status field to any value. Stock is not touched.
    #[instrument(skip(self, request))]
    pub async fn override_status(
        &self,
        order_id: Uuid,
        request: StatusOverrideRequest,
    ) -> Result<OrderDetails, ServiceError> {
        if request.status.is_none() && request.payment_status.is_none() {
            return Err(ServiceError::ValidationError(
                "at least one of status or payment_status is required".to_string(),
            ));
        }

        let existing = find_order(&*self.db, order_id).await?;
        let previous_status = existing.status;
        let previous_payment_status = existing.payment_status;

        let mut active: order::ActiveModel = existing.into();
        if let Some(status) = request.status {
            active.status = Set(status);
        }
        if let Some(payment_status) = request.payment_status {
            active.payment_status = Set(payment_status);
        }
        active.updated_at = Set(Utc::now());
        let updated = active.update(&*self.db).await?;

        warn!(
            order_id = %order_id,
            from_status = previous_status.as_str(),
            to_status = updated.status.as_str(),
            from_payment_status = previous_payment_status.as_str(),
            to_payment_status = updated.payment_status.as_str(),
            "Order status overridden by admin"
        );

        self.event_sender
            .send_or_log(Event::OrderStatusOverridden {
                order_id,
                status: updated.status,
                payment_status: updated.payment_status,
            })
            .await;

        load_details(&*self.db, updated).await
    }
}
