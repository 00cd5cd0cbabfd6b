//! Order confirmation delivery.
//!
//! Senders are called from post-commit tasks only, so a failure here is logged by the
//! unit of work and never affects the order that triggered it.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::UnitOfWork;
use crate::entities::{order, order_item, shipping_address};

/// Notification delivery errors
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Relay rejected notification with status {0}")]
    Rejected(u16),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConfirmationLine {
    pub product_name: String,
    pub sku: String,
    pub quantity: i32,
    pub price: Decimal,
    pub subtotal: Decimal,
}

/// Rendered order confirmation, ready for a mail relay.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OrderConfirmation {
    pub to_email: String,
    pub to_name: String,
    pub order_id: Uuid,
    pub order_number: String,
    pub currency: String,
    pub subtotal: Decimal,
    pub shipping_fee: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub lines: Vec<ConfirmationLine>,
}

impl OrderConfirmation {
    pub fn new(
        email: &str,
        name: &str,
        order: &order::Model,
        items: &[order_item::Model],
    ) -> Self {
        Self {
            to_email: email.to_string(),
            to_name: name.to_string(),
            order_id: order.id,
            order_number: order.order_number.clone(),
            currency: order.currency.clone(),
            subtotal: order.subtotal,
            shipping_fee: order.shipping_fee,
            tax: order.tax,
            discount: order.discount,
            total: order.total,
            lines: items
                .iter()
                .map(|item| ConfirmationLine {
                    product_name: item.product_name.clone(),
                    sku: item.sku.clone(),
                    quantity: item.quantity,
                    price: item.price,
                    subtotal: item.subtotal,
                })
                .collect(),
        }
    }

    pub fn subject(&self) -> String {
        format!("Order {} confirmed", self.order_number)
    }

    /// Plain-text body
    pub fn render_text(&self) -> String {
        let mut body = format!(
            "Hi {},\n\nThanks for your order {}.\n\n",
            self.to_name, self.order_number
        );
        for line in &self.lines {
            body.push_str(&format!(
                "  {} x{} @ {} = {}\n",
                line.product_name, line.quantity, line.price, line.subtotal
            ));
        }
        body.push_str(&format!(
            "\nSubtotal: {sub} {cur}\nShipping: {ship} {cur}\nTax: {tax} {cur}\nDiscount: {disc} {cur}\nTotal: {total} {cur}\n",
            sub = self.subtotal,
            ship = self.shipping_fee,
            tax = self.tax,
            disc = self.discount,
            total = self.total,
            cur = self.currency,
        ));
        body
    }
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send_order_confirmation(
        &self,
        confirmation: &OrderConfirmation,
    ) -> Result<(), NotificationError>;
}

/// Writes confirmations to the log. Used when no relay is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send_order_confirmation(
        &self,
        confirmation: &OrderConfirmation,
    ) -> Result<(), NotificationError> {
        info!(
            to = %confirmation.to_email,
            subject = %confirmation.subject(),
            "order confirmation\n{}",
            confirmation.render_text()
        );
        Ok(())
    }
}

/// Posts confirmations as JSON to a mail relay, with exponential backoff.
#[derive(Clone)]
pub struct HttpNotificationSender {
    client: reqwest::Client,
    endpoint: String,
    max_retries: u32,
}

impl HttpNotificationSender {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoint: endpoint.into(),
            max_retries: 3,
        }
    }
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    to: &'a str,
    subject: String,
    text: String,
    order: &'a OrderConfirmation,
}

#[async_trait]
impl NotificationSender for HttpNotificationSender {
    #[instrument(skip(self, confirmation), fields(order_number = %confirmation.order_number))]
    async fn send_order_confirmation(
        &self,
        confirmation: &OrderConfirmation,
    ) -> Result<(), NotificationError> {
        let message = RelayMessage {
            to: &confirmation.to_email,
            subject: confirmation.subject(),
            text: confirmation.render_text(),
            order: confirmation,
        };

        let mut last_error = NotificationError::Transport("no attempt made".to_string());
        for attempt in 1..=self.max_retries {
            match self.client.post(&self.endpoint).json(&message).send().await {
                Ok(response) if response.status().is_success() => {
                    info!("Order confirmation delivered");
                    return Ok(());
                }
                Ok(response) => {
                    warn!(
                        "Relay returned {} (attempt {}/{})",
                        response.status(),
                        attempt,
                        self.max_retries
                    );
                    last_error = NotificationError::Rejected(response.status().as_u16());
                }
                Err(e) => {
                    warn!(
                        "Relay delivery error: {} (attempt {}/{})",
                        e, attempt, self.max_retries
                    );
                    last_error = NotificationError::Transport(e.to_string());
                }
            }

            if attempt < self.max_retries {
                tokio::time::sleep(Duration::from_secs(2_u64.pow(attempt - 1))).await;
            }
        }

        Err(last_error)
    }
}

/// Queues a confirmation for the order to go out once `uow` commits.
pub fn queue_order_confirmation(
    uow: &mut UnitOfWork,
    sender: Arc<dyn NotificationSender>,
    address: &shipping_address::Model,
    order: &order::Model,
    items: &[order_item::Model],
) {
    let confirmation = OrderConfirmation::new(&address.email, &address.full_name, order, items);
    uow.after_commit("order_confirmation", async move {
        sender.send_order_confirmation(&confirmation).await
    });
}
