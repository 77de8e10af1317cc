//! services/api/src/web/ws_handler.rs
//!
//! This is the main entry point and control loop for a notification WebSocket.
//! After the `init` handshake it forwards every bus notification of the chosen
//! session to the client until either side goes away.

use crate::web::{
    protocol::{ClientMessage, ServerMessage},
    state::{AppState, UserId},
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, user_id))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, user_id: UserId) {
    info!("New WebSocket connection established for user: {}", user_id.0);

    // The sender is wrapped in an Arc<Mutex<>> to allow for shared mutable access across tasks.
    let (sender, mut receiver) = socket.split();
    let ws_sender: WsSender = Arc::new(Mutex::new(sender));

    // --- 1. Initialization Phase ---
    let session_id = match receiver.next().await {
        Some(Ok(Message::Text(init_json))) => {
            match serde_json::from_str::<ClientMessage>(&init_json) {
                Ok(ClientMessage::Init { session_id }) => session_id,
                Err(e) => {
                    error!("First message was not a valid Init message: {}", e);
                    send_message(&ws_sender, &ServerMessage::error("Expected an init message.")).await;
                    return;
                }
            }
        }
        _ => {
            error!("Client disconnected before sending Init message.");
            return;
        }
    };

    match app_state.relay.session(session_id).await {
        Ok(session) if session.user_id == user_id.0 => {}
        Ok(_) => {
            error!("Session {} does not belong to user {}", session_id, user_id.0);
            send_message(
                &ws_sender,
                &ServerMessage::error("Unauthorized: Session does not belong to this user."),
            )
            .await;
            return;
        }
        Err(e) => {
            error!("Failed to get session: {:?}", e);
            send_message(&ws_sender, &ServerMessage::error("Failed to load session data.")).await;
            return;
        }
    }

    // Subscribe before confirming so no notification falls in between.
    let subscription = app_state.relay.subscribe(session_id);
    if !send_message(&ws_sender, &ServerMessage::initialized(session_id)).await {
        error!("Failed to send session initialized message.");
        return;
    }
    info!(%session_id, "Notification stream started");

    // --- 2. Forwarding Task ---
    let forward_task = {
        let ws_sender = ws_sender.clone();
        tokio::spawn(async move {
            let mut notifications = Box::pin(subscription.into_stream());
            while let Some(notification) = notifications.next().await {
                if !send_message(&ws_sender, &ServerMessage::Notification(notification)).await {
                    break;
                }
            }
        })
    };

    // --- 3. Main Message Loop ---
    // Client frames carry nothing after init; the loop only watches for the close.
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) => break,
            Ok(Message::Text(text)) => debug!(%session_id, "Ignoring client frame: {}", text.as_str()),
            Ok(_) => {}
            Err(e) => {
                warn!(%session_id, "WebSocket receive error: {}", e);
                break;
            }
        }
    }

    forward_task.abort();
    info!(%session_id, "Notification stream closed");
}

/// Serializes and sends one message. Returns `false` once the client is gone.
async fn send_message(ws_sender: &WsSender, message: &ServerMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize server message: {}", e);
            return false;
        }
    };
    ws_sender
        .lock()
        .await
        .send(Message::Text(json.into()))
        .await
        .is_ok()
}
