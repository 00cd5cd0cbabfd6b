use crate::{
    entities::{cart, cart_item, product},
    errors::ServiceError,
    events::{Event, EventSender},
    services::catalog::find_product,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::OnConflict,
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, ModelTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Largest quantity a single cart line may hold.
pub const MAX_LINE_QUANTITY: i32 = 999;

/// Key a cart is bound to: an authenticated user or an anonymous session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartOwner {
    User(Uuid),
    Session(String),
}

impl std::fmt::Display for CartOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CartOwner::User(id) => write!(f, "user:{}", id),
            CartOwner::Session(id) => write!(f, "session:{}", id),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AddCartItemRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 999))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateCartItemRequest {
    /// Zero removes the line
    #[validate(range(min = 0, max = 999))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CartLine {
    pub product_id: Uuid,
    pub product_name: String,
    pub sku: String,
    pub quantity: i32,
    pub price: Decimal,
    pub line_total: Decimal,
    pub in_stock: i32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CartSummary {
    pub cart_id: Uuid,
    pub items: Vec<CartLine>,
    pub item_count: i32,
    pub subtotal: Decimal,
}

pub async fn find_cart<C: ConnectionTrait>(
    conn: &C,
    owner: &CartOwner,
) -> Result<Option<cart::Model>, ServiceError> {
    let query = match owner {
        CartOwner::User(user_id) => cart::Entity::find().filter(cart::Column::UserId.eq(*user_id)),
        CartOwner::Session(session_id) => {
            cart::Entity::find().filter(cart::Column::SessionId.eq(session_id.as_str()))
        }
    };
    Ok(query.one(conn).await?)
}

/// Returns the owner's cart, creating it on first access.
pub async fn get_or_create_cart<C: ConnectionTrait>(
    conn: &C,
    owner: &CartOwner,
) -> Result<cart::Model, ServiceError> {
    if let Some(cart) = find_cart(conn, owner).await? {
        return Ok(cart);
    }

    insert_cart_if_absent(conn, owner).await?;
    find_cart(conn, owner)
        .await?
        .ok_or_else(|| ServiceError::InternalError(format!("cart for {} vanished", owner)))
}

/// Inserts an empty cart for `owner` unless one exists. Returns whether a row was written.
///
/// A concurrent first access may insert the same owner; the conflict is skipped
/// rather than raised, so the surrounding transaction stays usable on Postgres.
pub async fn insert_cart_if_absent<C: ConnectionTrait>(
    conn: &C,
    owner: &CartOwner,
) -> Result<bool, ServiceError> {
    let now = Utc::now();
    let (user_id, session_id, owner_column) = match owner {
        CartOwner::User(id) => (Some(*id), None, cart::Column::UserId),
        CartOwner::Session(id) => (None, Some(id.clone()), cart::Column::SessionId),
    };
    let inserted = cart::Entity::insert(cart::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        session_id: Set(session_id),
        created_at: Set(now),
        updated_at: Set(now),
    })
    .on_conflict(OnConflict::column(owner_column).do_nothing().to_owned())
    .exec_without_returning(conn)
    .await?;
    Ok(inserted > 0)
}

pub async fn cart_items<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<Vec<cart_item::Model>, ServiceError> {
    Ok(cart_item::Entity::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .order_by_asc(cart_item::Column::CreatedAt)
        .all(conn)
        .await?)
}

pub async fn clear_cart_items<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<u64, ServiceError> {
    let result = cart_item::Entity::delete_many()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

async fn find_line<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
    product_id: Uuid,
) -> Result<Option<cart_item::Model>, ServiceError> {
    Ok(cart_item::Entity::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .filter(cart_item::Column::ProductId.eq(product_id))
        .one(conn)
        .await?)
}

fn ensure_stock(product: &product::Model, quantity: i32) -> Result<(), ServiceError> {
    if quantity > product.stock_quantity {
        return Err(ServiceError::InsufficientStock {
            product_id: product.id,
            product_name: product.name.clone(),
            requested: quantity,
            available: product.stock_quantity,
        });
    }
    Ok(())
}

async fn active_product<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<product::Model, ServiceError> {
    find_product(conn, product_id)
        .await?
        .filter(|p| p.is_active)
        .ok_or_else(|| ServiceError::not_found("Product", product_id))
}

/// Shopping cart service.
///
/// Every quantity the service stores is bounded by the product's stock at the time of
/// the change. Checkout re-checks stock, since it may have moved since.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Returns the owner's cart with current product details, creating it if needed.
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn get_cart(&self, owner: &CartOwner) -> Result<CartSummary, ServiceError> {
        let cart = get_or_create_cart(&*self.db, owner).await?;
        self.summarize(cart).await
    }

    async fn summarize(&self, cart: cart::Model) -> Result<CartSummary, ServiceError> {
        let rows = cart
            .find_related(cart_item::Entity)
            .find_also_related(product::Entity)
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for (line, product) in rows {
            let Some(product) = product else {
                warn!(product_id = %line.product_id, "cart line references a missing product");
                continue;
            };
            items.push(CartLine {
                product_id: line.product_id,
                product_name: product.name,
                sku: product.sku,
                quantity: line.quantity,
                price: line.price,
                line_total: line.line_total(),
                in_stock: product.stock_quantity,
            });
        }

        Ok(CartSummary {
            cart_id: cart.id,
            item_count: items.iter().map(|line| line.quantity).sum(),
            subtotal: items.iter().map(|line| line.line_total).sum(),
            items,
        })
    }

    /// Adds a product, incrementing the existing line if there is one.
    #[instrument(skip(self, request), fields(owner = %owner, product_id = %request.product_id))]
    pub async fn add_item(
        &self,
        owner: &CartOwner,
        request: AddCartItemRequest,
    ) -> Result<CartSummary, ServiceError> {
        request.validate()?;
        let txn = self.db.begin().await?;

        let cart = get_or_create_cart(&txn, owner).await?;
        let product = active_product(&txn, request.product_id).await?;
        let now = Utc::now();

        match find_line(&txn, cart.id, product.id).await? {
            Some(line) => {
                let quantity = line.quantity + request.quantity;
                if quantity > MAX_LINE_QUANTITY {
                    return Err(ServiceError::ValidationError(format!(
                        "quantity per product is limited to {}",
                        MAX_LINE_QUANTITY
                    )));
                }
                ensure_stock(&product, quantity)?;
                let mut line: cart_item::ActiveModel = line.into();
                line.quantity = Set(quantity);
                line.updated_at = Set(now);
                line.update(&txn).await?;
            }
            None => {
                ensure_stock(&product, request.quantity)?;
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(product.id),
                    quantity: Set(request.quantity),
                    price: Set(product.price),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&txn)
                .await?;
            }
        }

        txn.commit().await?;
        info!("Added {} x{} to cart {}", product.sku, request.quantity, cart.id);
        self.summarize(cart).await
    }

    /// Sets a line's quantity; zero removes it.
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn update_item(
        &self,
        owner: &CartOwner,
        product_id: Uuid,
        request: UpdateCartItemRequest,
    ) -> Result<CartSummary, ServiceError> {
        request.validate()?;
        if request.quantity == 0 {
            return self.remove_item(owner, product_id).await;
        }

        let txn = self.db.begin().await?;
        let cart = get_or_create_cart(&txn, owner).await?;
        let line = find_line(&txn, cart.id, product_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Cart item for product", product_id))?;
        let product = active_product(&txn, product_id).await?;
        ensure_stock(&product, request.quantity)?;

        let mut line: cart_item::ActiveModel = line.into();
        line.quantity = Set(request.quantity);
        line.updated_at = Set(Utc::now());
        line.update(&txn).await?;
        txn.commit().await?;

        self.summarize(cart).await
    }

    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn remove_item(
        &self,
        owner: &CartOwner,
        product_id: Uuid,
    ) -> Result<CartSummary, ServiceError> {
        let cart = get_or_create_cart(&*self.db, owner).await?;
        let removed = cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .exec(&*self.db)
            .await?;
        if removed.rows_affected == 0 {
            return Err(ServiceError::not_found("Cart item for product", product_id));
        }
        self.summarize(cart).await
    }

    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn clear_cart(&self, owner: &CartOwner) -> Result<CartSummary, ServiceError> {
        let cart = get_or_create_cart(&*self.db, owner).await?;
        let removed = clear_cart_items(&*self.db, cart.id).await?;
        info!("Cleared {} lines from cart {}", removed, cart.id);
        self.summarize(cart).await
    }

    /// Moves a guest cart into the user's cart after login.
    ///
    /// Quantities for the same product are summed and capped at current stock; lines
    /// for products that are gone or out of stock are dropped. The guest cart is
    /// deleted afterwards.
    #[instrument(skip(self, session_id))]
    pub async fn merge_guest_cart(
        &self,
        session_id: &str,
        user_id: Uuid,
    ) -> Result<CartSummary, ServiceError> {
        let guest_owner = CartOwner::Session(session_id.to_string());
        let user_owner = CartOwner::User(user_id);
        let txn = self.db.begin().await?;

        let user_cart = get_or_create_cart(&txn, &user_owner).await?;
        let Some(guest_cart) = find_cart(&txn, &guest_owner).await? else {
            txn.commit().await?;
            return self.summarize(user_cart).await;
        };

        let now = Utc::now();
        let mut merged_lines = 0;
        for guest_line in cart_items(&txn, guest_cart.id).await? {
            let Some(product) = find_product(&txn, guest_line.product_id)
                .await?
                .filter(|p| p.is_active)
            else {
                continue;
            };

            let existing = find_line(&txn, user_cart.id, product.id).await?;
            let wanted = existing.as_ref().map(|l| l.quantity).unwrap_or(0) + guest_line.quantity;
            let quantity = wanted.min(product.stock_quantity).min(MAX_LINE_QUANTITY);
            if quantity < 1 {
                continue;
            }

            match existing {
                Some(line) => {
                    let mut line: cart_item::ActiveModel = line.into();
                    line.quantity = Set(quantity);
                    line.updated_at = Set(now);
                    line.update(&txn).await?;
                }
                None => {
                    cart_item::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        cart_id: Set(user_cart.id),
                        product_id: Set(product.id),
                        quantity: Set(quantity),
                        price: Set(guest_line.price),
                        created_at: Set(now),
                        updated_at: Set(now),
                    }
                    .insert(&txn)
                    .await?;
                }
            }
            merged_lines += 1;
        }

        clear_cart_items(&txn, guest_cart.id).await?;
        cart::Entity::delete_by_id(guest_cart.id).exec(&txn).await?;
        txn.commit().await?;

        info!("Merged {} guest lines into cart {}", merged_lines, user_cart.id);
        self.event_sender
            .send_or_log(Event::CartMerged {
                user_id,
                merged_lines,
            })
            .await;

        self.summarize(user_cart).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use sea_orm::PaginatorTrait;

    async fn database() -> DatabaseConnection {
        let db = establish_connection_with_config(&DbConfig::in_memory_sqlite())
            .await
            .unwrap();
        run_migrations(&db).await.unwrap();
        db
    }

    #[tokio::test]
    async fn duplicate_cart_insert_keeps_the_transaction_usable() {
        let db = database().await;
        let owners = [
            CartOwner::User(Uuid::new_v4()),
            CartOwner::Session("guest-race".to_string()),
        ];

        let txn = db.begin().await.unwrap();
        for owner in &owners {
            assert!(insert_cart_if_absent(&txn, owner).await.unwrap());
            // The losing insert of a race is skipped, not an error.
            assert!(!insert_cart_if_absent(&txn, owner).await.unwrap());

            let first = get_or_create_cart(&txn, owner).await.unwrap();
            let again = get_or_create_cart(&txn, owner).await.unwrap();
            assert_eq!(first.id, again.id);
        }
        txn.commit().await.unwrap();

        assert_eq!(cart::Entity::find().count(&db).await.unwrap(), 2);
    }
}
