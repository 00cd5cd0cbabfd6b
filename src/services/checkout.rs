use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use serde::Deserialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::UnitOfWork,
    entities::{
        cart_item,
        order::{self, OrderStatus, PaymentMethod, PaymentStatus},
        order_item, product, shipping_address,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    notifications::{queue_order_confirmation, NotificationSender},
    services::{
        cart::{cart_items, clear_cart_items, find_cart, CartOwner},
        catalog::{adjust_stock, find_product},
        order_number::next_order_number,
        orders::OrderDetails,
        pricing::PricingPolicy,
    },
};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ShippingAddressInput {
    #[validate(length(min = 1, max = 200))]
    pub full_name: String,
    #[validate(length(min = 6, max = 32))]
    pub phone: String,
    /// Falls back to the account email when omitted
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub address_line1: String,
    #[validate(length(max = 255))]
    pub address_line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(max = 100))]
    pub state: Option<String>,
    #[validate(length(max = 20))]
    pub postal_code: Option<String>,
    #[validate(length(min = 2, max = 100))]
    pub country: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate]
    pub shipping_address: ShippingAddressInput,
    pub payment_method: PaymentMethod,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

/// Account placing the order.
#[derive(Debug, Clone)]
pub struct Customer {
    pub user_id: Uuid,
    pub email: Option<String>,
}

/// A cart line with the product it was re-validated against.
struct CheckedLine {
    line: cart_item::Model,
    product: product::Model,
}

/// Converts a user's cart into an order.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    notifier: Arc<dyn NotificationSender>,
    pricing: Arc<dyn PricingPolicy>,
    currency: String,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        notifier: Arc<dyn NotificationSender>,
        pricing: Arc<dyn PricingPolicy>,
        currency: String,
    ) -> Self {
        Self {
            db,
            event_sender,
            notifier,
            pricing,
            currency,
        }
    }

    /// Places an order from the customer's cart.
    ///
    /// Stock re-validation, numbering, persistence, stock decrement and cart clearing
    /// share one transaction: either the order exists with stock reserved and the cart
    /// empty, or nothing changed. The confirmation goes out only after commit.
    #[instrument(skip(self, customer, request), fields(user_id = %customer.user_id))]
    pub async fn create_order(
        &self,
        customer: &Customer,
        request: CreateOrderRequest,
    ) -> Result<OrderDetails, ServiceError> {
        request.validate()?;
        let email = request
            .shipping_address
            .email
            .clone()
            .or_else(|| customer.email.clone())
            .ok_or_else(|| {
                ServiceError::ValidationError(
                    "shipping_address.email is required when the account has no email"
                        .to_string(),
                )
            })?;

        let result = self.place_order(customer, request, email).await;
        match &result {
            Ok(details) => {
                counter!("storefront.checkout.completed", 1);
                info!(
                    order_id = %details.order.id,
                    order_number = %details.order.order_number,
                    "Order placed"
                );
            }
            Err(err) => {
                counter!("storefront.checkout.failed", 1);
                warn!(error = %err, "Checkout failed");
            }
        }
        result
    }

    async fn place_order(
        &self,
        customer: &Customer,
        request: CreateOrderRequest,
        email: String,
    ) -> Result<OrderDetails, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db).await?;
        let owner = CartOwner::User(customer.user_id);

        let cart = find_cart(uow.txn(), &owner)
            .await?
            .ok_or(ServiceError::EmptyCart)?;
        let lines = cart_items(uow.txn(), cart.id).await?;
        if lines.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        // Stock may have moved since the cart was last touched.
        let mut checked = Vec::with_capacity(lines.len());
        for line in lines {
            let product = find_product(uow.txn(), line.product_id)
                .await?
                .ok_or_else(|| ServiceError::not_found("Product", line.product_id))?;
            if product.stock_quantity < line.quantity {
                return Err(ServiceError::InsufficientStock {
                    product_id: product.id,
                    product_name: product.name,
                    requested: line.quantity,
                    available: product.stock_quantity,
                });
            }
            checked.push(CheckedLine { line, product });
        }

        let now = Utc::now();
        let order_number = next_order_number(uow.txn(), now.date_naive()).await?;

        let subtotal: Decimal = checked.iter().map(|c| c.line.line_total()).sum();
        let totals = self.pricing.totals(subtotal);

        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_number: Set(order_number),
            user_id: Set(customer.user_id),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            payment_method: Set(request.payment_method),
            payment_reference: Set(None),
            subtotal: Set(totals.subtotal),
            shipping_fee: Set(totals.shipping_fee),
            tax: Set(totals.tax),
            discount: Set(totals.discount),
            total: Set(totals.total),
            currency: Set(self.currency.clone()),
            notes: Set(request.notes),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(uow.txn())
        .await?;

        let mut items = Vec::with_capacity(checked.len());
        for CheckedLine { line, product } in &checked {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(product.id),
                product_name: Set(product.name.clone()),
                sku: Set(product.sku.clone()),
                price: Set(line.price),
                quantity: Set(line.quantity),
                subtotal: Set(line.line_total()),
                created_at: Set(now),
            }
            .insert(uow.txn())
            .await?;
            items.push(item);
        }

        let address = request.shipping_address;
        let shipping_address = shipping_address::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            full_name: Set(address.full_name),
            phone: Set(address.phone),
            email: Set(email),
            address_line1: Set(address.address_line1),
            address_line2: Set(address.address_line2),
            city: Set(address.city),
            state: Set(address.state),
            postal_code: Set(address.postal_code),
            country: Set(address.country),
            created_at: Set(now),
        }
        .insert(uow.txn())
        .await?;

        for CheckedLine { line, product } in &checked {
            adjust_stock(uow.txn(), product.id, -line.quantity).await?;
        }

        clear_cart_items(uow.txn(), cart.id).await?;

        queue_order_confirmation(
            &mut uow,
            self.notifier.clone(),
            &shipping_address,
            &order,
            &items,
        );
        let events = self.event_sender.clone();
        let created = Event::OrderCreated {
            order_id: order.id,
            order_number: order.order_number.clone(),
            user_id: order.user_id,
        };
        uow.after_commit("order_created_event", async move { events.send(created).await });

        uow.commit().await?;

        Ok(OrderDetails {
            order,
            items,
            shipping_address: Some(shipping_address),
        })
    }
}
