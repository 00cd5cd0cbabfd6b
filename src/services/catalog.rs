use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait,
    DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::product,
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Looks up a product by id through any connection, including an open transaction.
pub async fn find_product<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<Option<product::Model>, ServiceError> {
    Ok(product::Entity::find_by_id(product_id).one(conn).await?)
}

/// Applies `delta` to a product's stock as a single relative UPDATE.
///
/// A decrement only matches rows whose stock covers it, so concurrent checkouts
/// serialize on the row and stock can never go negative.
pub async fn adjust_stock<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    delta: i32,
) -> Result<(), ServiceError> {
    if delta == 0 {
        return Ok(());
    }

    let mut update = product::Entity::update_many()
        .col_expr(
            product::Column::StockQuantity,
            Expr::col(product::Column::StockQuantity).add(delta),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product::Column::Id.eq(product_id));
    if delta < 0 {
        update = update.filter(product::Column::StockQuantity.gte(-delta));
    }

    let result = update.exec(conn).await?;
    if result.rows_affected == 1 {
        return Ok(());
    }

    match find_product(conn, product_id).await? {
        None => Err(ServiceError::not_found("Product", product_id)),
        Some(product) => Err(ServiceError::InsufficientStock {
            product_id,
            product_name: product.name,
            requested: -delta,
            available: product.stock_quantity,
        }),
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateProductRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    /// Derived from the name when omitted
    #[validate(length(min = 1, max = 200))]
    pub slug: Option<String>,
    #[validate(length(min = 1, max = 64))]
    pub sku: String,
    pub description: Option<String>,
    pub price: Decimal,
    #[validate(range(min = 0))]
    pub stock_quantity: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductPage {
    pub products: Vec<product::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Lowercase ASCII slug with single dashes between words.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Active products, newest first, optionally filtered by name.
    #[instrument(skip(self))]
    pub async fn list_products(
        &self,
        page: u64,
        per_page: u64,
        search: Option<String>,
    ) -> Result<ProductPage, ServiceError> {
        let mut query = product::Entity::find().filter(product::Column::IsActive.eq(true));
        if let Some(term) = search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            query = query.filter(
                Condition::any()
                    .add(product::Column::Name.contains(term))
                    .add(product::Column::Sku.contains(term)),
            );
        }

        let paginator = query
            .order_by_desc(product::Column::CreatedAt)
            .paginate(&*self.db, per_page);
        let total = paginator.num_items().await?;
        let products = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok(ProductPage {
            products,
            total,
            page,
            per_page,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_product(&self, product_id: Uuid) -> Result<product::Model, ServiceError> {
        find_product(&*self.db, product_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| ServiceError::not_found("Product", product_id))
    }

    #[instrument(skip(self, request), fields(sku = %request.sku))]
    pub async fn create_product(
        &self,
        request: CreateProductRequest,
    ) -> Result<product::Model, ServiceError> {
        request.validate()?;
        if request.price < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "price must not be negative".to_string(),
            ));
        }

        let slug = request
            .slug
            .clone()
            .map(|s| slugify(&s))
            .unwrap_or_else(|| slugify(&request.name));
        if slug.is_empty() {
            return Err(ServiceError::ValidationError(
                "slug must contain at least one letter or digit".to_string(),
            ));
        }

        let existing = product::Entity::find()
            .filter(
                Condition::any()
                    .add(product::Column::Slug.eq(slug.as_str()))
                    .add(product::Column::Sku.eq(request.sku.as_str())),
            )
            .one(&*self.db)
            .await?;
        if let Some(existing) = existing {
            let field = if existing.sku == request.sku { "sku" } else { "slug" };
            return Err(ServiceError::Conflict(format!(
                "a product with this {} already exists",
                field
            )));
        }

        let now = Utc::now();
        let product = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(request.name),
            slug: Set(slug),
            sku: Set(request.sku),
            description: Set(request.description),
            price: Set(request.price),
            stock_quantity: Set(request.stock_quantity),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!(product_id = %product.id, "Product created");
        self.event_sender
            .send_or_log(Event::ProductCreated(product.id))
            .await;

        Ok(product)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Espresso  Beans (1kg)"), "espresso-beans-1kg");
        assert_eq!(slugify("--Hello--World--"), "hello-world");
        assert_eq!(slugify("Cà phê sữa"), "c-ph-s-a");
        assert_eq!(slugify("!!!"), "");
    }
}
