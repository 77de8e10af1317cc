pub mod middleware;
pub mod protocol;
pub mod rest;
pub mod state;
pub mod webhook;
pub mod ws_handler;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use middleware::{require_user, verify_webhook};
pub use rest::ApiDoc;
pub use state::AppState;
pub use ws_handler::ws_handler;

/// Builds the full application router: the user API, the provider webhook and
/// the Swagger UI.
pub fn router(app_state: Arc<AppState>) -> Router {
    // User routes (caller identity required)
    let user_routes = Router::new()
        .route("/sessions", post(rest::create_session_handler))
        .route("/sessions/active", get(rest::active_session_handler))
        .route("/sessions/{id}/disconnect", post(rest::disconnect_handler))
        .route("/sessions/{id}/status", get(rest::status_handler))
        .route("/sessions/{id}/qr", get(rest::qr_handler))
        .route("/sessions/{id}/unread", get(rest::unread_handler))
        .route("/sessions/{id}/chats", get(rest::list_chats_handler))
        .route(
            "/sessions/{id}/chats/{chat_id}/messages",
            get(rest::list_messages_handler).post(rest::send_message_handler),
        )
        .route("/sessions/{id}/chats/{chat_id}/read", post(rest::mark_read_handler))
        .route(
            "/sessions/{id}/chats/{chat_id}/history",
            get(rest::provider_history_handler),
        )
        .route("/ws", get(ws_handler))
        .layer(axum_middleware::from_fn(require_user));

    // Provider routes (shared secret, when configured)
    let provider_routes = Router::new()
        .route("/whatsapp/hook", post(webhook::webhook_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            verify_webhook,
        ));

    let api_router = Router::new()
        .merge(user_routes)
        .merge(provider_routes)
        .with_state(app_state);

    Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
