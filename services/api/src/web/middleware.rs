//! services/api/src/web/middleware.rs
//!
//! Request guards for the user-facing routes and the provider webhook.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use crate::web::state::{AppState, UserId};

pub const USER_HEADER: &str = "x-user-id";
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

/// Middleware that resolves the caller from the `x-user-id` header.
///
/// If valid, inserts a `UserId` into request extensions for handlers to use.
/// If invalid or missing, returns 401 Unauthorized.
pub async fn require_user(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let user_id = req
        .headers()
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(UserId(user_id));
    Ok(next.run(req).await)
}

/// Middleware that checks the shared webhook secret, when one is configured.
pub async fn verify_webhook(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(expected) = state.config.webhook_secret.as_deref() {
        let presented = req
            .headers()
            .get(WEBHOOK_SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected) {
            warn!("Rejected webhook call with a missing or wrong secret");
            return Err(StatusCode::UNAUTHORIZED);
        }
    }
    Ok(next.run(req).await)
}
