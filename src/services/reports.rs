use std::{collections::BTreeMap, sync::Arc};

use rust_decimal::Decimal;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, Iterable, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect,
};
use serde::Serialize;
use tracing::instrument;

use crate::{
    entities::{
        order::{self, OrderStatus, PaymentStatus},
        product,
    },
    errors::ServiceError,
};

const RECENT_ORDER_LIMIT: u64 = 10;
const LOW_STOCK_LIMIT: u64 = 20;

#[derive(Debug, Clone, Serialize)]
pub struct LowStockProduct {
    pub id: uuid::Uuid,
    pub name: String,
    pub sku: String,
    pub stock_quantity: i32,
}

/// Admin dashboard snapshot
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub total_orders: u64,
    pub orders_by_status: BTreeMap<&'static str, u64>,
    /// Sum of totals over paid orders
    pub paid_revenue: Decimal,
    pub product_count: u64,
    pub low_stock_threshold: i32,
    pub low_stock_products: Vec<LowStockProduct>,
    pub recent_orders: Vec<order::Model>,
}

/// Read-only aggregation over orders and products.
#[derive(Clone)]
pub struct ReportService {
    db: Arc<DatabaseConnection>,
    low_stock_threshold: i32,
}

impl ReportService {
    pub fn new(db: Arc<DatabaseConnection>, low_stock_threshold: i32) -> Self {
        Self {
            db,
            low_stock_threshold,
        }
    }

    #[instrument(skip(self))]
    pub async fn dashboard(&self) -> Result<Dashboard, ServiceError> {
        let db = &*self.db;

        let mut orders_by_status = BTreeMap::new();
        let mut total_orders = 0;
        for status in OrderStatus::iter() {
            let count = order::Entity::find()
                .filter(order::Column::Status.eq(status))
                .count(db)
                .await?;
            total_orders += count;
            orders_by_status.insert(status.as_str(), count);
        }

        // Summed here rather than in SQL so SQLite and Postgres agree on precision.
        let paid_totals: Vec<Decimal> = order::Entity::find()
            .select_only()
            .column(order::Column::Total)
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Paid))
            .into_tuple()
            .all(db)
            .await?;
        let paid_revenue = paid_totals.into_iter().sum();

        let product_count = product::Entity::find().count(db).await?;

        let low_stock_products = product::Entity::find()
            .filter(product::Column::IsActive.eq(true))
            .filter(product::Column::StockQuantity.lte(self.low_stock_threshold))
            .order_by_asc(product::Column::StockQuantity)
            .limit(LOW_STOCK_LIMIT)
            .all(db)
            .await?
            .into_iter()
            .map(|p| LowStockProduct {
                id: p.id,
                name: p.name,
                sku: p.sku,
                stock_quantity: p.stock_quantity,
            })
            .collect();

        let recent_orders = order::Entity::find()
            .order_by_desc(order::Column::CreatedAt)
            .limit(RECENT_ORDER_LIMIT)
            .all(db)
            .await?;

        Ok(Dashboard {
            total_orders,
            orders_by_status,
            paid_revenue,
            product_count,
            low_stock_threshold: self.low_stock_threshold,
            low_stock_products,
            recent_orders,
        })
    }
}
