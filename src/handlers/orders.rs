use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use super::common::{created, Paginated, PaginationParams};
use crate::{
    auth::AuthUser,
    entities::order,
    services::{
        checkout::{CreateOrderRequest, Customer},
        orders::OrderDetails,
    },
    ApiResponse, ApiResult, AppState,
};

/// Checks out the caller's cart.
pub async fn create_order(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderDetails>>), crate::errors::ServiceError> {
    let customer = Customer {
        user_id: user.user_id,
        email: user.email,
    };
    let details = state
        .services
        .checkout
        .create_order(&customer, request)
        .await?;
    Ok(created(details))
}

pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<PaginationParams>,
) -> ApiResult<Paginated<order::Model>> {
    let PaginationParams { page, per_page } = params.normalized();
    let result = state
        .services
        .orders
        .list_orders_for_user(user.user_id, page, per_page)
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
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<OrderDetails> {
    let details = state
        .services
        .orders
        .get_order_for_user(user.user_id, order_id)
        .await?;
    Ok(Json(ApiResponse::success(details)))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<OrderDetails> {
    let details = state
        .services
        .orders
        .cancel_order(user.user_id, order_id)
        .await?;
    Ok(Json(
        ApiResponse::success(details).with_message("Order cancelled and stock restored"),
    ))
}
