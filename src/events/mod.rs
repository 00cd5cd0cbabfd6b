use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entities::order::{OrderStatus, PaymentStatus};

/// Handle for publishing domain events onto the in-process channel.
#[derive(Clone, Debug)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with its receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is closed
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("{}", e);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
        user_id: Uuid,
    },
    OrderCancelled {
        order_id: Uuid,
        restocked_items: usize,
    },
    OrderStatusOverridden {
        order_id: Uuid,
        status: OrderStatus,
        payment_status: PaymentStatus,
    },
    PaymentSucceeded {
        order_id: Uuid,
        transaction_id: String,
    },
    PaymentFailed {
        order_id: Uuid,
        reason: String,
    },
    CartMerged {
        user_id: Uuid,
        merged_lines: usize,
    },
    ProductCreated(Uuid),
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated {
                order_id,
                order_number,
                ..
            } => info!(%order_id, %order_number, "order created"),
            Event::OrderCancelled {
                order_id,
                restocked_items,
            } => info!(%order_id, restocked_items, "order cancelled"),
            Event::OrderStatusOverridden {
                order_id,
                status,
                payment_status,
            } => warn!(%order_id, ?status, ?payment_status, "order status overridden"),
            Event::PaymentSucceeded {
                order_id,
                transaction_id,
            } => info!(%order_id, %transaction_id, "payment succeeded"),
            Event::PaymentFailed { order_id, reason } => {
                info!(%order_id, %reason, "payment failed")
            }
            other => debug!(event = ?other, "event received"),
        }
    }

    info!("Event processing loop stopped");
}
