use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::common::{Paginated, PaginationParams};
use crate::{entities::product, ApiResponse, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct ProductQuery {
    pub page: Option<u64>,
    pub per_page: Option<u64>,
    pub search: Option<String>,
}

impl ProductQuery {
    fn pagination(&self) -> PaginationParams {
        let defaults = PaginationParams::default();
        PaginationParams {
            page: self.page.unwrap_or(defaults.page),
            per_page: self.per_page.unwrap_or(defaults.per_page),
        }
        .normalized()
    }
}

pub async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<ProductQuery>,
) -> ApiResult<Paginated<product::Model>> {
    let PaginationParams { page, per_page } = query.pagination();
    let result = state
        .services
        .catalog
        .list_products(page, per_page, query.search)
        .await?;
    Ok(Json(ApiResponse::success(Paginated::new(
        result.products,
        page,
        per_page,
        result.total,
    ))))
}

pub async fn get_product(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> ApiResult<product::Model> {
    let product = state.services.catalog.get_product(product_id).await?;
    Ok(Json(ApiResponse::success(product)))
}
