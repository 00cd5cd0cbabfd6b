use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::{parse_session_id, session_from_headers, AuthUser, CartCaller, SESSION_HEADER},
    errors::ServiceError,
    services::cart::{AddCartItemRequest, CartSummary, UpdateCartItemRequest},
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct MergeCartRequest {
    /// Must name the same session as the `x-session-id` header when given
    #[serde(default)]
    pub session_id: Option<String>,
}

pub async fn get_cart(
    State(state): State<AppState>,
    CartCaller(owner): CartCaller,
) -> ApiResult<CartSummary> {
    let cart = state.services.cart.get_cart(&owner).await?;
    Ok(Json(ApiResponse::success(cart)))
}

pub async fn clear_cart(
    State(state): State<AppState>,
    CartCaller(owner): CartCaller,
) -> ApiResult<CartSummary> {
    let cart = state.services.cart.clear_cart(&owner).await?;
    Ok(Json(ApiResponse::success(cart)))
}

pub async fn add_item(
    State(state): State<AppState>,
    CartCaller(owner): CartCaller,
    Json(request): Json<AddCartItemRequest>,
) -> ApiResult<CartSummary> {
    let cart = state.services.cart.add_item(&owner, request).await?;
    Ok(Json(ApiResponse::success(cart)))
}

pub async fn update_item(
    State(state): State<AppState>,
    CartCaller(owner): CartCaller,
    Path(product_id): Path<Uuid>,
    Json(request): Json<UpdateCartItemRequest>,
) -> ApiResult<CartSummary> {
    let cart = state
        .services
        .cart
        .update_item(&owner, product_id, request)
        .await?;
    Ok(Json(ApiResponse::success(cart)))
}

pub async fn remove_item(
    State(state): State<AppState>,
    CartCaller(owner): CartCaller,
    Path(product_id): Path<Uuid>,
) -> ApiResult<CartSummary> {
    let cart = state.services.cart.remove_item(&owner, product_id).await?;
    Ok(Json(ApiResponse::success(cart)))
}

/// Folds the caller's guest cart into their account cart.
///
/// The guest cart is taken from the `x-session-id` header, so only a client holding
/// that session can claim it.
pub async fn merge_cart(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    request: Option<Json<MergeCartRequest>>,
) -> ApiResult<CartSummary> {
    let session_id = session_from_headers(&headers)?.ok_or_else(|| {
        ServiceError::ValidationError(format!("{} header required to merge", SESSION_HEADER))
    })?;
    let request = request.map(|Json(body)| body).unwrap_or_default();
    if let Some(claimed) = request.session_id.as_deref() {
        if parse_session_id(claimed)? != session_id {
            return Err(ServiceError::Forbidden(
                "session_id does not match the caller's session".to_string(),
            ));
        }
    }

    let cart = state
        .services
        .cart
        .merge_guest_cart(&session_id, user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(cart)))
}
