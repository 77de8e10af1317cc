//! crates/wa_bridge_core/src/domain.rs
//!
//! Defines the pure, core data structures for the bridge.
//! These structs are independent of any database or wire format; the
//! adapters translate to and from them.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Returns the current time truncated to microseconds, the precision the
/// storage layer keeps. Pagination cursors compare these values exactly.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

//=========================================================================================
// Sessions
//=========================================================================================

/// Connectivity of a session with the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(SessionState::Disconnected),
            "connecting" => Ok(SessionState::Connecting),
            "connected" => Ok(SessionState::Connected),
            other => Err(format!("unknown session state '{}'", other)),
        }
    }
}

/// QR pairing material, kept in its canonical binary form (PNG bytes).
#[derive(Clone, PartialEq, Eq)]
pub struct QrCode(Vec<u8>);

impl QrCode {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Decodes a base64 payload, tolerating a leading `data:...;base64,` prefix.
    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        let payload = match encoded.split_once(";base64,") {
            Some((_, rest)) => rest,
            None => encoded,
        };
        STANDARD.decode(payload.trim()).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// The display encoding handed to UIs.
    pub fn rendered_uri(&self) -> String {
        format!("data:image/png;base64,{}", self.to_base64())
    }
}

impl fmt::Debug for QrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QrCode({} bytes)", self.0.len())
    }
}

/// A non-authoritative summary of one provider conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub unread: u32,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// A per-user pairing with the provider.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub user_id: i64,
    pub name: String,
    pub external_session_token: Option<String>,
    pub qr_code: Option<QrCode>,
    pub state: SessionState,
    pub last_connected: Option<DateTime<Utc>>,
    pub chat_cache: Vec<ChatSummary>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: i64, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            external_session_token: None,
            qr_code: None,
            state: SessionState::Disconnected,
            last_connected: None,
            chat_cache: Vec::new(),
            created_at: now_micros(),
        }
    }

    pub fn qr_rendered_uri(&self) -> Option<String> {
        self.qr_code.as_ref().map(QrCode::rendered_uri)
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
}

//=========================================================================================
// Messages
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(Direction::Incoming),
            "outgoing" => Ok(Direction::Outgoing),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

/// Delivery status of a message.
///
/// Statuses form a monotonic lattice: `Pending < Sent < Delivered < Read`,
/// with `Failed` reachable only from `Pending` or `Sent` and terminal once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => u8::MAX,
        }
    }

    /// Returns the status to move to when `next` is reported, or `None` when
    /// the report would not move the message forward.
    pub fn advance(self, next: MessageStatus) -> Option<MessageStatus> {
        match (self, next) {
            (MessageStatus::Failed, _) => None,
            (MessageStatus::Pending | MessageStatus::Sent, MessageStatus::Failed) => {
                Some(MessageStatus::Failed)
            }
            (_, MessageStatus::Failed) => None,
            (current, next) if next.rank() > current.rank() => Some(next),
            _ => None,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(format!("unknown message status '{}'", other)),
        }
    }
}

/// A single message owned by exactly one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    pub external_message_id: Option<String>,
    pub chat_id: String,
    pub content: String,
    pub direction: Direction,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn outgoing(session_id: Uuid, chat_id: &str, content: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            external_message_id: None,
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            direction: Direction::Outgoing,
            status: MessageStatus::Pending,
            created_at: now_micros(),
        }
    }

    pub fn incoming(session_id: Uuid, chat_id: &str, external_id: &str, content: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            external_message_id: Some(external_id.to_string()),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            direction: Direction::Incoming,
            status: MessageStatus::Delivered,
            created_at: now_micros(),
        }
    }

    /// Moves `created_at` past `previous`, the newest timestamp already stored
    /// for the session, so no two messages of a session share a timestamp.
    pub fn order_after(&mut self, previous: Option<DateTime<Utc>>) {
        if let Some(previous) = previous {
            if self.created_at <= previous {
                self.created_at = previous + Duration::microseconds(1);
            }
        }
    }

    pub fn cursor(&self) -> PageCursor {
        PageCursor {
            created_at: self.created_at,
            id: Some(self.id),
        }
    }
}

/// One entry of the provider's own history for a chat. Read through, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub external_id: String,
    pub chat_id: String,
    pub content: String,
    pub direction: Direction,
    pub status: MessageStatus,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Keyset cursor for chat history, ordered by `(created_at DESC, id DESC)`.
///
/// Without an `id` the page holds every message strictly older than
/// `created_at`. Messages written through `MessageStore` never share a
/// timestamp within a session, so such a cursor skips nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub id: Option<Uuid>,
}

impl PageCursor {
    /// Whether `message` sorts strictly after the cursor in descending order.
    pub fn admits(&self, message: &Message) -> bool {
        match self.id {
            Some(id) => (message.created_at, message.id) < (self.created_at, id),
            None => message.created_at < self.created_at,
        }
    }
}

/// Outcome of an idempotent mutation: the record after the call, and whether
/// the call changed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<T> {
    Applied(T),
    Unchanged(T),
}

impl<T> Change<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Change::Applied(_))
    }

    pub fn get(&self) -> &T {
        match self {
            Change::Applied(value) | Change::Unchanged(value) => value,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Change::Applied(value) | Change::Unchanged(value) => value,
        }
    }
}
