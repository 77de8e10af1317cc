//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between the UI client and the API server
//! for live session notifications.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wa_bridge_core::Notification;

//=========================================================================================
// Messages Sent FROM the Client (UI) TO the Server
//=========================================================================================

/// Represents the structured text messages a client can send to the server.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribes the connection to one session. This must be the first message sent.
    Init { session_id: Uuid },
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client (UI)
//=========================================================================================

/// Represents the structured text messages the server can send to the client.
///
/// Relay notifications are forwarded in their own `type`-tagged shape.
#[derive(Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum ServerMessage {
    Control(ControlMessage),
    Notification(Notification),
}

#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Confirms the subscription is live.
    SessionInitialized { session_id: Uuid },

    /// Reports a fatal error; the server closes the connection afterwards.
    Error { message: String },
}

impl ServerMessage {
    pub fn initialized(session_id: Uuid) -> Self {
        ServerMessage::Control(ControlMessage::SessionInitialized { session_id })
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Control(ControlMessage::Error {
            message: message.into(),
        })
    }
}
