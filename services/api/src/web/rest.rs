//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::web::state::{AppState, UserId};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;
use wa_bridge_core::store::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use wa_bridge_core::{ChatSummary, Message, PageCursor, ProviderMessage, RelayError, Session};

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        create_session_handler,
        active_session_handler,
        disconnect_handler,
        status_handler,
        qr_handler,
        unread_handler,
        list_chats_handler,
        list_messages_handler,
        send_message_handler,
        mark_read_handler,
        provider_history_handler,
        crate::web::webhook::webhook_handler,
    ),
    components(
        schemas(
            CreateSessionRequest,
            CreateSessionResponse,
            ActiveSessionResponse,
            StatusResponse,
            QrResponse,
            UnreadResponse,
            ChatResponse,
            MessageResponse,
            MessagesPage,
            SendMessageRequest,
            SendMessageResponse,
            MarkReadResponse,
            ProviderMessageResponse,
            SuccessResponse,
            ErrorResponse,
            crate::web::webhook::WebhookResponse,
        )
    ),
    tags(
        (name = "WhatsApp Relay API", description = "Session pairing, chat history and messaging through the WhatsApp Web bridge.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    /// Per-user session name; an existing session with this name is reused.
    pub name: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
    pub state: String,
    pub qr_code_uri: Option<String>,
}

/// The caller's connected session, if any.
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ActiveSessionResponse {
    pub active: bool,
    pub session_id: Option<Uuid>,
    pub name: Option<String>,
    /// Unread incoming messages across all chats of the active session.
    pub unread_count: u64,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub state: String,
    pub session_token: Option<String>,
    pub last_connected: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct QrResponse {
    /// Base64 of the PNG bytes.
    pub qr_code: String,
    pub qr_code_uri: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct UnreadResponse {
    pub count: u64,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChatResponse {
    pub id: String,
    pub name: String,
    pub last_message: String,
    pub unread: u32,
    pub timestamp: Option<i64>,
}

impl From<ChatSummary> for ChatResponse {
    fn from(chat: ChatSummary) -> Self {
        Self {
            id: chat.id,
            name: chat.name,
            last_message: chat.last_message,
            unread: chat.unread,
            timestamp: chat.timestamp,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub id: Uuid,
    pub external_message_id: Option<String>,
    pub chat_id: String,
    pub content: String,
    pub direction: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl From<Message> for MessageResponse {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            external_message_id: message.external_message_id,
            chat_id: message.chat_id,
            content: message.content,
            direction: message.direction.as_str().to_string(),
            status: message.status.as_str().to_string(),
            created_at: message.created_at,
        }
    }
}

/// One page of chat history, newest first.
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MessagesPage {
    pub messages: Vec<MessageResponse>,
    /// Pass as `before` to fetch the next page; absent on a short page.
    pub next_before: Option<DateTime<Utc>>,
    pub next_before_id: Option<Uuid>,
}

#[derive(Deserialize, IntoParams)]
pub struct HistoryQuery {
    /// Page size, clamped to 1..=200. Defaults to 50.
    pub limit: Option<usize>,
    pub before: Option<DateTime<Utc>>,
    /// Tie-breaker for `before`; requires `before`.
    pub before_id: Option<Uuid>,
}

#[derive(Deserialize, IntoParams)]
pub struct ProviderHistoryQuery {
    /// Number of entries, clamped to 1..=200. Defaults to 50.
    pub limit: Option<usize>,
}

/// A message from the provider's own chat history.
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ProviderMessageResponse {
    pub external_message_id: String,
    pub chat_id: String,
    pub content: String,
    pub direction: String,
    pub status: String,
    /// Unix seconds, as reported by the provider.
    pub timestamp: Option<i64>,
}

impl From<ProviderMessage> for ProviderMessageResponse {
    fn from(message: ProviderMessage) -> Self {
        Self {
            external_message_id: message.external_id,
            chat_id: message.chat_id,
            content: message.content,
            direction: message.direction.as_str().to_string(),
            status: message.status.as_str().to_string(),
            timestamp: message.timestamp,
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct SendMessageResponse {
    pub message_id: Uuid,
    pub status: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct MarkReadResponse {
    pub count: u64,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiFailure = (StatusCode, Json<ErrorResponse>);

pub fn failure(status: StatusCode, reason: impl Into<String>) -> ApiFailure {
    (
        status,
        Json(ErrorResponse {
            error: reason.into(),
        }),
    )
}

/// Maps the relay taxonomy onto HTTP status codes.
pub fn relay_failure(err: RelayError) -> ApiFailure {
    let status = match &err {
        RelayError::SessionNotFound(_)
        | RelayError::UnknownSession(_)
        | RelayError::MessageNotFound(_) => StatusCode::NOT_FOUND,
        RelayError::NotConnected(_) | RelayError::AlreadyConnected(_) | RelayError::Conflict(_) => {
            StatusCode::CONFLICT
        }
        RelayError::MalformedEvent(_) => StatusCode::BAD_REQUEST,
        RelayError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::ProviderRejected(_) | RelayError::SendFailed { .. } => StatusCode::BAD_GATEWAY,
        RelayError::Storage(e) => {
            error!("Storage failure while serving a request: {:?}", e);
            return failure(StatusCode::INTERNAL_SERVER_ERROR, "Internal storage error");
        }
    };
    failure(status, err.to_string())
}

/// Loads the session, hiding sessions owned by other users.
async fn owned_session(
    app_state: &AppState,
    user_id: UserId,
    session_id: Uuid,
) -> Result<Session, ApiFailure> {
    let session = app_state
        .relay
        .session(session_id)
        .await
        .map_err(relay_failure)?;
    if session.user_id != user_id.0 {
        return Err(relay_failure(RelayError::SessionNotFound(session_id)));
    }
    Ok(session)
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Open (or reuse) a named session and start QR pairing.
#[utoipa::path(
    post,
    path = "/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Pairing started", body = CreateSessionResponse),
        (status = 400, description = "Empty session name", body = ErrorResponse),
        (status = 409, description = "Session already connected", body = ErrorResponse),
        (status = 503, description = "Provider unavailable", body = ErrorResponse)
    ),
    params(
        ("x-user-id" = i64, Header, description = "The ID of the calling user.")
    )
)]
pub async fn create_session_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiFailure> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(failure(StatusCode::BAD_REQUEST, "Session name must not be empty"));
    }

    let session_id = app_state
        .relay
        .connect(user_id.0, name)
        .await
        .map_err(relay_failure)?;
    let session = app_state
        .relay
        .session(session_id)
        .await
        .map_err(relay_failure)?;
    info!(%session_id, user_id = user_id.0, "Session pairing started");

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id,
            state: session.state.to_string(),
            qr_code_uri: session.qr_rendered_uri(),
        }),
    ))
}

/// Report the caller's connected session and its unread count.
#[utoipa::path(
    get,
    path = "/sessions/active",
    responses(
        (status = 200, description = "Active session, or `active: false`", body = ActiveSessionResponse)
    ),
    params(
        ("x-user-id" = i64, Header, description = "The ID of the calling user.")
    )
)]
pub async fn active_session_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
) -> Result<impl IntoResponse, ApiFailure> {
    let active = app_state
        .relay
        .active_session(user_id.0)
        .await
        .map_err(relay_failure)?;
    let Some(session) = active else {
        return Ok(Json(ActiveSessionResponse {
            active: false,
            session_id: None,
            name: None,
            unread_count: 0,
        }));
    };
    let unread_count = app_state
        .relay
        .unread_count(session.id)
        .await
        .map_err(relay_failure)?;
    Ok(Json(ActiveSessionResponse {
        active: true,
        session_id: Some(session.id),
        name: Some(session.name),
        unread_count,
    }))
}

/// Disconnect a session. Disconnecting an already disconnected session succeeds.
#[utoipa::path(
    post,
    path = "/sessions/{id}/disconnect",
    responses(
        (status = 200, description = "Session disconnected", body = SuccessResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = i64, Header, description = "The ID of the calling user.")
    )
)]
pub async fn disconnect_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiFailure> {
    owned_session(&app_state, user_id, session_id).await?;
    app_state
        .relay
        .disconnect(session_id)
        .await
        .map_err(relay_failure)?;
    Ok(Json(SuccessResponse { success: true }))
}

/// Report the session's pairing state, reconciling with the provider while connecting.
#[utoipa::path(
    get,
    path = "/sessions/{id}/status",
    responses(
        (status = 200, description = "Current state", body = StatusResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 503, description = "Provider unavailable", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = i64, Header, description = "The ID of the calling user.")
    )
)]
pub async fn status_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiFailure> {
    owned_session(&app_state, user_id, session_id).await?;
    let status = app_state
        .relay
        .get_status(session_id)
        .await
        .map_err(relay_failure)?;
    Ok(Json(StatusResponse {
        state: status.state.to_string(),
        session_token: status.session_token,
        last_connected: status.last_connected,
    }))
}

/// Fetch the pending pairing QR code.
#[utoipa::path(
    get,
    path = "/sessions/{id}/qr",
    responses(
        (status = 200, description = "QR code to scan", body = QrResponse),
        (status = 404, description = "No QR code pending", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = i64, Header, description = "The ID of the calling user.")
    )
)]
pub async fn qr_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiFailure> {
    let session = owned_session(&app_state, user_id, session_id).await?;
    let qr = session
        .qr_code
        .ok_or_else(|| failure(StatusCode::NOT_FOUND, "No QR code pending for this session"))?;
    Ok(Json(QrResponse {
        qr_code: qr.to_base64(),
        qr_code_uri: qr.rendered_uri(),
    }))
}

/// Count the session's unread incoming messages.
#[utoipa::path(
    get,
    path = "/sessions/{id}/unread",
    responses(
        (status = 200, description = "Unread count", body = UnreadResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = i64, Header, description = "The ID of the calling user.")
    )
)]
pub async fn unread_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiFailure> {
    owned_session(&app_state, user_id, session_id).await?;
    let count = app_state
        .relay
        .unread_count(session_id)
        .await
        .map_err(relay_failure)?;
    Ok(Json(UnreadResponse { count }))
}

/// List the chats of a connected session.
#[utoipa::path(
    get,
    path = "/sessions/{id}/chats",
    responses(
        (status = 200, description = "Chat summaries", body = [ChatResponse]),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "Session not connected", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = i64, Header, description = "The ID of the calling user.")
    )
)]
pub async fn list_chats_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiFailure> {
    owned_session(&app_state, user_id, session_id).await?;
    let chats = app_state
        .relay
        .list_chats(session_id)
        .await
        .map_err(relay_failure)?;
    let chats: Vec<ChatResponse> = chats.into_iter().map(ChatResponse::from).collect();
    Ok(Json(chats))
}

/// Page through a chat's history, newest first.
#[utoipa::path(
    get,
    path = "/sessions/{id}/chats/{chat_id}/messages",
    responses(
        (status = 200, description = "One page of messages", body = MessagesPage),
        (status = 400, description = "Invalid cursor", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("chat_id" = String, Path, description = "Provider chat ID"),
        HistoryQuery,
        ("x-user-id" = i64, Header, description = "The ID of the calling user.")
    )
)]
pub async fn list_messages_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
    Path((session_id, chat_id)): Path<(Uuid, String)>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiFailure> {
    owned_session(&app_state, user_id, session_id).await?;

    let before = match (query.before, query.before_id) {
        (Some(created_at), id) => Some(PageCursor { created_at, id }),
        (None, Some(_)) => {
            return Err(failure(StatusCode::BAD_REQUEST, "before_id requires before"));
        }
        (None, None) => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

    let messages = app_state
        .relay
        .list_messages(session_id, &chat_id, limit, before)
        .await
        .map_err(relay_failure)?;

    let next = if messages.len() == limit {
        messages.last().map(Message::cursor)
    } else {
        None
    };
    Ok(Json(MessagesPage {
        messages: messages.into_iter().map(MessageResponse::from).collect(),
        next_before: next.map(|c| c.created_at),
        next_before_id: next.and_then(|c| c.id),
    }))
}

/// Send a text message to a chat.
#[utoipa::path(
    post,
    path = "/sessions/{id}/chats/{chat_id}/messages",
    request_body = SendMessageRequest,
    responses(
        (status = 201, description = "Message accepted by the provider", body = SendMessageResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "Session not connected", body = ErrorResponse),
        (status = 502, description = "Provider rejected or failed the send", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("chat_id" = String, Path, description = "Provider chat ID"),
        ("x-user-id" = i64, Header, description = "The ID of the calling user.")
    )
)]
pub async fn send_message_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
    Path((session_id, chat_id)): Path<(Uuid, String)>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiFailure> {
    owned_session(&app_state, user_id, session_id).await?;
    let message = app_state
        .relay
        .send(session_id, &chat_id, &payload.content)
        .await
        .map_err(relay_failure)?;
    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            message_id: message.id,
            status: message.status.as_str().to_string(),
        }),
    ))
}

/// Mark every incoming message of a chat as read.
#[utoipa::path(
    post,
    path = "/sessions/{id}/chats/{chat_id}/read",
    responses(
        (status = 200, description = "Messages updated", body = MarkReadResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("chat_id" = String, Path, description = "Provider chat ID"),
        ("x-user-id" = i64, Header, description = "The ID of the calling user.")
    )
)]
pub async fn mark_read_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
    Path((session_id, chat_id)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, ApiFailure> {
    owned_session(&app_state, user_id, session_id).await?;
    let count = app_state
        .relay
        .mark_read(session_id, &chat_id)
        .await
        .map_err(relay_failure)?;
    Ok(Json(MarkReadResponse { count }))
}

/// Read the provider's own history for a chat. Nothing is stored locally.
#[utoipa::path(
    get,
    path = "/sessions/{id}/chats/{chat_id}/history",
    responses(
        (status = 200, description = "Provider history, oldest first", body = [ProviderMessageResponse]),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "Session not connected", body = ErrorResponse),
        (status = 503, description = "Provider unavailable", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("chat_id" = String, Path, description = "Provider chat ID"),
        ProviderHistoryQuery,
        ("x-user-id" = i64, Header, description = "The ID of the calling user.")
    )
)]
pub async fn provider_history_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
    Path((session_id, chat_id)): Path<(Uuid, String)>,
    Query(query): Query<ProviderHistoryQuery>,
) -> Result<impl IntoResponse, ApiFailure> {
    owned_session(&app_state, user_id, session_id).await?;
    let history = app_state
        .relay
        .fetch_history(session_id, &chat_id, query.limit.unwrap_or(DEFAULT_PAGE_SIZE))
        .await
        .map_err(relay_failure)?;
    let history: Vec<ProviderMessageResponse> =
        history.into_iter().map(ProviderMessageResponse::from).collect();
    Ok(Json(history))
}
