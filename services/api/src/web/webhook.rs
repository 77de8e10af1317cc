//! services/api/src/web/webhook.rs
//!
//! The endpoint the WhatsApp Web bridge posts its events to.

use crate::web::rest::{failure, relay_failure, ApiFailure, ErrorResponse};
use crate::web::state::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;
use utoipa::ToSchema;
use wa_bridge_core::Ingested;

#[derive(Serialize, Deserialize, ToSchema)]
pub struct WebhookResponse {
    pub success: bool,
    /// The event had already been applied; nothing changed.
    pub duplicate: bool,
}

/// Receive one provider event.
///
/// Redelivered events are acknowledged without being applied twice.
#[utoipa::path(
    post,
    path = "/whatsapp/hook",
    request_body(content_type = "application/json", description = "A `message`, `status_update` or `connection_update` event."),
    responses(
        (status = 200, description = "Event accepted", body = WebhookResponse),
        (status = 400, description = "Malformed event", body = ErrorResponse),
        (status = 401, description = "Missing or wrong webhook secret"),
        (status = 404, description = "Unknown session token or message", body = ErrorResponse)
    )
)]
pub async fn webhook_handler(
    State(app_state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiFailure> {
    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        warn!("Dropped webhook body that is not JSON: {}", e);
        failure(StatusCode::BAD_REQUEST, format!("Malformed event: {}", e))
    })?;

    let outcome = app_state
        .relay
        .ingest(&payload)
        .await
        .map_err(relay_failure)?;

    Ok(Json(WebhookResponse {
        success: true,
        duplicate: outcome == Ingested::Duplicate,
    }))
}
