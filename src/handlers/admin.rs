use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::common::{created, Paginated, PaginationParams};
use crate::{
    auth::AdminUser,
    entities::{order, product},
    errors::ServiceError,
    services::{
        catalog::CreateProductRequest,
        orders::{OrderDetails, StatusOverrideRequest},
        reports::Dashboard,
    },
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Deserialize)]
pub struct AdminOrderQuery {
    pub page: Option<u64>,
    pub per_page: Option<u64>,
    pub status: Option<order::OrderStatus>,
}

pub async fn list_orders(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<AdminOrderQuery>,
) -> ApiResult<Paginated<order::Model>> {
    let defaults = PaginationParams::default();
    let PaginationParams { page, per_page } = PaginationParams {
        page: query.page.unwrap_or(defaults.page),
        per_page: query.per_page.unwrap_or(defaults.per_page),
    }
    .normalized();

    let result = state
        .services
        .orders
        .list_orders(page, per_page, query.status)
        .await?;
    Ok(Json(ApiResponse::success(Paginated::new(
        result.orders,
        page,
        per_page,
        result.total,
    ))))
}

pub async fn get_order(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<OrderDetails> {
    let details = state.services.orders.get_order(order_id).await?;
    Ok(Json(ApiResponse::success(details)))
}

pub async fn override_order_status(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(order_id): Path<Uuid>,
    Json(request): Json<StatusOverrideRequest>,
) -> ApiResult<OrderDetails> {
    tracing::info!(admin_id = %admin.user_id, order_id = %order_id, "Admin status override requested");
    let details = state
        .services
        .orders
        .override_status(order_id, request)
        .await?;
    Ok(Json(ApiResponse::success(details)))
}

pub async fn dashboard(State(state): State<AppState>, _admin: AdminUser) -> ApiResult<Dashboard> {
    let dashboard = state.services.reports.dashboard().await?;
    Ok(Json(ApiResponse::success(dashboard)))
}

pub async fn create_product(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(request): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<ApiResponse<product::Model>>), ServiceError> {
    let product = state.services.catalog.create_product(request).await?;
    Ok(created(product))
}
