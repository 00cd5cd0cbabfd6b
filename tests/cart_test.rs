mod common;

use axum::http::{Method, StatusCode};
use common::{decimal_at, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;

#[tokio::test]
async fn guest_cart_lives_on_the_session_header() {
    let app = TestApp::new().await;
    let product = app.seed_product("Guest Mug", dec!(6), 10).await;
    let headers = [("x-session-id", "guest-session-1")];

    let (status, body) = app
        .send(
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({ "product_id": product.id, "quantity": 2 })),
            &headers,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    // Adding the same product again accumulates on the line.
    app.send(
        Method::POST,
        "/api/v1/cart/items",
        Some(json!({ "product_id": product.id, "quantity": 1 })),
        &headers,
    )
    .await;

    let (status, body) = app.send(Method::GET, "/api/v1/cart", None, &headers).await;
    assert_eq!(status, StatusCode::OK);
    let items = body["data"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["quantity"], 3);
    assert_eq!(decimal_at(&body, "/data/subtotal"), dec!(18));

    let (_, other) = app
        .send(Method::GET, "/api/v1/cart", None, &[("x-session-id", "guest-session-2")])
        .await;
    assert_eq!(other["data"]["items"].as_array().unwrap().len(), 0);

    // Carts hold no stock.
    assert_eq!(app.stock_of(product.id).await, 10);
}

#[tokio::test]
async fn cart_requires_an_identity() {
    let app = TestApp::new().await;
    let (status, body) = app.send(Method::GET, "/api/v1/cart", None, &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn adding_beyond_stock_is_rejected() {
    let app = TestApp::new().await;
    let (_, token) = app.new_customer();
    let product = app.seed_product("Limited", dec!(9), 3).await;

    let (status, body) = app
        .authed(
            Method::POST,
            "/api/v1/cart/items",
            &token,
            Some(json!({ "product_id": product.id, "quantity": 4 })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "insufficient_stock");

    app.add_to_cart(&token, product.id, 3).await;
    let (status, _) = app
        .authed(
            Method::POST,
            "/api/v1/cart/items",
            &token,
            Some(json!({ "product_id": product.id, "quantity": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = app
        .authed(
            Method::POST,
            "/api/v1/cart/items",
            &token,
            Some(json!({ "product_id": product.id, "quantity": 0 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn updating_to_zero_removes_the_line() {
    let app = TestApp::new().await;
    let (_, token) = app.new_customer();
    let keep = app.seed_product("Keep", dec!(2), 10).await;
    let drop = app.seed_product("Drop", dec!(3), 10).await;
    app.add_to_cart(&token, keep.id, 1).await;
    app.add_to_cart(&token, drop.id, 2).await;

    let (status, body) = app
        .authed(
            Method::PUT,
            &format!("/api/v1/cart/items/{}", keep.id),
            &token,
            Some(json!({ "quantity": 5 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (status, body) = app
        .authed(
            Method::PUT,
            &format!("/api/v1/cart/items/{}", drop.id),
            &token,
            Some(json!({ "quantity": 0 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let items = body["data"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["quantity"], 5);
    assert_eq!(decimal_at(&body, "/data/subtotal"), dec!(10));

    let (status, body) = app.authed(Method::DELETE, "/api/v1/cart", &token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn merge_folds_guest_lines_capped_at_stock() {
    let app = TestApp::new().await;
    let (_, token) = app.new_customer();
    let scarce = app.seed_product("Scarce Lamp", dec!(20), 4).await;
    let plenty = app.seed_product("Plenty Cup", dec!(5), 100).await;
    let guest = [("x-session-id", "guest-merge")];

    app.add_to_cart(&token, scarce.id, 3).await;
    for (product_id, quantity) in [(scarce.id, 3), (plenty.id, 2)] {
        let (status, body) = app
            .send(
                Method::POST,
                "/api/v1/cart/items",
                Some(json!({ "product_id": product_id, "quantity": quantity })),
                &guest,
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
    }

    let bearer = format!("Bearer {}", token);
    let (status, body) = app
        .send(
            Method::POST,
            "/api/v1/cart/merge",
            Some(json!({ "session_id": "guest-merge" })),
            &[("authorization", bearer.as_str()), ("x-session-id", "guest-merge")],
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let items = body["data"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    let lamp = items
        .iter()
        .find(|line| line["product_name"] == "Scarce Lamp")
        .unwrap();
    assert_eq!(lamp["quantity"], 4);

    let (_, guest_cart) = app.send(Method::GET, "/api/v1/cart", None, &guest).await;
    assert_eq!(guest_cart["data"]["items"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn merge_only_claims_the_callers_own_session() {
    let app = TestApp::new().await;
    let (_, token) = app.new_customer();
    let product = app.seed_product("Glass Vase", dec!(15), 10).await;
    let other = [("x-session-id", "other-session")];
    app.send(
        Method::POST,
        "/api/v1/cart/items",
        Some(json!({ "product_id": product.id, "quantity": 2 })),
        &other,
    )
    .await;

    // Naming another session in the body is not enough.
    let (status, body) = app
        .authed(
            Method::POST,
            "/api/v1/cart/merge",
            &token,
            Some(json!({ "session_id": "other-session" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);

    let bearer = format!("Bearer {}", token);
    let (status, body) = app
        .send(
            Method::POST,
            "/api/v1/cart/merge",
            Some(json!({ "session_id": "other-session" })),
            &[("authorization", bearer.as_str()), ("x-session-id", "own-session")],
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN, "{}", body);
    assert_eq!(body["code"], "forbidden");

    let (_, other_cart) = app.send(Method::GET, "/api/v1/cart", None, &other).await;
    assert_eq!(other_cart["data"]["items"].as_array().unwrap().len(), 1);
    let (_, own_cart) = app.authed(Method::GET, "/api/v1/cart", &token, None).await;
    assert_eq!(own_cart["data"]["items"].as_array().unwrap().len(), 0);

    // Header alone, no body, merges the caller's own guest cart.
    let own = [("x-session-id", "own-session")];
    app.send(
        Method::POST,
        "/api/v1/cart/items",
        Some(json!({ "product_id": product.id, "quantity": 1 })),
        &own,
    )
    .await;
    let (status, body) = app
        .send(
            Method::POST,
            "/api/v1/cart/merge",
            None,
            &[("authorization", bearer.as_str()), ("x-session-id", "own-session")],
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["items"][0]["quantity"], 1);
}
