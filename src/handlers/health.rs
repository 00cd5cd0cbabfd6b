use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::{db::check_connection, ApiResponse, AppState};

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub database: &'static str,
    pub version: &'static str,
}

/// Liveness plus a database round trip. Answers 503 while the database is unreachable.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse<HealthStatus>>) {
    let (code, status, database) = match check_connection(&state.db).await {
        Ok(()) => (StatusCode::OK, "ok", "up"),
        Err(err) => {
            tracing::warn!(error = %err, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "degraded", "down")
        }
    };

    (
        code,
        Json(ApiResponse::success(HealthStatus {
            status,
            database,
            version: env!("CARGO_PKG_VERSION"),
        })),
    )
}
