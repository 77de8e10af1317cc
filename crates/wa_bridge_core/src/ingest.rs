//! crates/wa_bridge_core/src/ingest.rs
//!
//! Turns provider webhook payloads into state transitions.
//!
//! Every failure on this path is non-fatal: the event is logged and dropped,
//! and the caller gets the error back to report to the sender.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::bus::{Notification, NotificationBus, Topic};
use crate::domain::{Change, MessageStatus, QrCode, SessionState};
use crate::error::{RelayError, RelayResult};
use crate::session::SessionStateMachine;
use crate::store::MessageStore;

//=========================================================================================
// Event Types
//=========================================================================================

/// A validated provider event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewMessage {
        session_token: String,
        chat_id: String,
        external_id: String,
        content: String,
    },
    StatusUpdate {
        session_token: String,
        external_id: String,
        status: MessageStatus,
    },
    ConnectionUpdate {
        session_token: String,
        state: SessionState,
        qr_code: Option<QrCode>,
    },
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(alias = "session_token", alias = "sessionToken")]
    session_id: Option<String>,
    message: Option<RawMessage>,
    /// An object for `status_update`, a string for `connection_update`.
    status: Option<Value>,
    message_id: Option<String>,
    qr_code: Option<String>,
}

#[derive(Deserialize)]
struct RawMessage {
    id: Option<String>,
    chat_id: Option<String>,
    content: Option<String>,
}

#[derive(Deserialize)]
struct RawStatus {
    message_id: Option<String>,
    status: Option<String>,
}

fn required(value: Option<String>, field: &str) -> RelayResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(RelayError::MalformedEvent(format!("missing field '{}'", field))),
    }
}

impl InboundEvent {
    pub fn parse(payload: &Value) -> RelayResult<Self> {
        let raw = RawEvent::deserialize(payload)
            .map_err(|e| RelayError::MalformedEvent(e.to_string()))?;
        let kind = required(raw.kind, "type")?;
        let session_token = required(raw.session_id, "session_id")?;

        match kind.as_str() {
            "message" => {
                let message = raw
                    .message
                    .ok_or_else(|| RelayError::MalformedEvent("missing field 'message'".into()))?;
                Ok(InboundEvent::NewMessage {
                    session_token,
                    chat_id: required(message.chat_id, "message.chat_id")?,
                    external_id: required(message.id, "message.id")?,
                    // An empty body is a valid message (e.g. media without caption).
                    content: message.content.ok_or_else(|| {
                        RelayError::MalformedEvent("missing field 'message.content'".into())
                    })?,
                })
            }
            "status_update" => {
                let (external_id, status) = match raw.status {
                    Some(nested @ Value::Object(_)) => {
                        let nested = RawStatus::deserialize(nested)
                            .map_err(|e| RelayError::MalformedEvent(e.to_string()))?;
                        (nested.message_id, nested.status)
                    }
                    Some(Value::String(status)) => (raw.message_id, Some(status)),
                    _ => (raw.message_id, None),
                };
                let status = required(status, "status.status")?;
                Ok(InboundEvent::StatusUpdate {
                    session_token,
                    external_id: required(external_id, "status.message_id")?,
                    status: status.parse().map_err(RelayError::MalformedEvent)?,
                })
            }
            "connection_update" => {
                let state = match raw.status {
                    Some(Value::String(status)) => {
                        status.parse::<SessionState>().map_err(RelayError::MalformedEvent)?
                    }
                    _ => return Err(RelayError::MalformedEvent("missing field 'status'".into())),
                };
                let qr_code = raw
                    .qr_code
                    .filter(|qr| !qr.is_empty())
                    .map(|qr| QrCode::from_base64(&qr))
                    .transpose()
                    .map_err(|e| RelayError::MalformedEvent(format!("invalid qr_code: {}", e)))?;
                Ok(InboundEvent::ConnectionUpdate {
                    session_token,
                    state,
                    qr_code,
                })
            }
            other => Err(RelayError::MalformedEvent(format!(
                "unknown event type '{}'",
                other
            ))),
        }
    }

    pub fn session_token(&self) -> &str {
        match self {
            InboundEvent::NewMessage { session_token, .. }
            | InboundEvent::StatusUpdate { session_token, .. }
            | InboundEvent::ConnectionUpdate { session_token, .. } => session_token,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::NewMessage { .. } => "message",
            InboundEvent::StatusUpdate { .. } => "status_update",
            InboundEvent::ConnectionUpdate { .. } => "connection_update",
        }
    }
}

//=========================================================================================
// The Ingestor
//=========================================================================================

/// Whether an accepted event changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    Applied,
    Duplicate,
}

impl<T> From<&Change<T>> for Ingested {
    fn from(change: &Change<T>) -> Self {
        if change.is_applied() {
            Ingested::Applied
        } else {
            Ingested::Duplicate
        }
    }
}

pub struct EventIngestor {
    sessions: Arc<SessionStateMachine>,
    store: Arc<MessageStore>,
    bus: Arc<NotificationBus>,
}

impl EventIngestor {
    pub fn new(
        sessions: Arc<SessionStateMachine>,
        store: Arc<MessageStore>,
        bus: Arc<NotificationBus>,
    ) -> Self {
        Self {
            sessions,
            store,
            bus,
        }
    }

    /// Parses and applies one raw webhook payload.
    pub async fn ingest(&self, payload: &Value) -> RelayResult<Ingested> {
        let result = match InboundEvent::parse(payload) {
            Ok(event) => self.handle(event).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!(error = %e, "webhook event dropped");
        }
        result
    }

    pub async fn handle(&self, event: InboundEvent) -> RelayResult<Ingested> {
        let session = self.sessions.find_by_token(event.session_token()).await?;
        let topic = Topic::Session(session.id);

        match event {
            InboundEvent::NewMessage {
                chat_id,
                external_id,
                content,
                ..
            } => {
                let change = self
                    .store
                    .ingest_incoming(session.id, &chat_id, &external_id, &content)
                    .await?;
                if let Change::Applied(message) = &change {
                    info!(session_id = %session.id, chat_id, external_id, "incoming message stored");
                    self.bus.publish(
                        topic,
                        Notification::NewMessage {
                            session_id: session.id,
                            chat_id: message.chat_id.clone(),
                            message_id: message.id,
                            content: message.content.clone(),
                            timestamp: message.created_at,
                        },
                    );
                }
                Ok((&change).into())
            }
            InboundEvent::StatusUpdate {
                external_id,
                status,
                ..
            } => {
                let change = self
                    .store
                    .apply_status_update(session.id, &external_id, status)
                    .await?;
                if let Change::Applied(message) = &change {
                    self.bus.publish(
                        topic,
                        Notification::StatusUpdate {
                            message_id: message.id,
                            status: message.status,
                        },
                    );
                }
                Ok((&change).into())
            }
            // Connection notifications are published by the state machine itself.
            InboundEvent::ConnectionUpdate {
                session_token,
                state,
                qr_code,
            } => {
                let change = match state {
                    SessionState::Connected => {
                        self.sessions.complete_qr(session.id, &session_token).await?
                    }
                    SessionState::Disconnected => {
                        self.sessions
                            .mark_disconnected(session.id, &session_token)
                            .await?
                    }
                    SessionState::Connecting => match qr_code {
                        Some(qr) => {
                            self.sessions
                                .refresh_qr(session.id, &session_token, qr)
                                .await?
                        }
                        None => Change::Unchanged(session),
                    },
                };
                Ok((&change).into())
            }
        }
    }
}
