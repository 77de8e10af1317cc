//! crates/wa_bridge_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the bridge's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the storage engine and of how the provider is reached.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    ChatSummary, Message, MessageStatus, PageCursor, ProviderMessage, QrCode, Session,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Conflicting write: {0}")]
    Conflict(String),
    /// Transient failure; the caller may retry.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    /// Permanent refusal by the remote side; retrying will not help.
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

impl PortError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PortError::Unavailable(_))
    }
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Storage Ports
//=========================================================================================

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create_session(&self, session: &Session) -> PortResult<()>;

    async fn get_session(&self, session_id: Uuid) -> PortResult<Session>;

    async fn find_session_by_name(&self, user_id: i64, name: &str) -> PortResult<Option<Session>>;

    async fn find_session_by_token(&self, token: &str) -> PortResult<Option<Session>>;

    /// The user's `Connected` session, the most recently connected one if several are.
    async fn find_active_session(&self, user_id: i64) -> PortResult<Option<Session>>;

    /// Overwrites the stored row. Only called while the per-session lock is held.
    async fn save_session(&self, session: &Session) -> PortResult<()>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn insert_message(&self, message: &Message) -> PortResult<()>;

    async fn get_message(&self, message_id: Uuid) -> PortResult<Message>;

    async fn find_by_external_id(
        &self,
        session_id: Uuid,
        external_id: &str,
    ) -> PortResult<Option<Message>>;

    /// Atomically inserts `message` unless the session already holds a message with
    /// the same external id. Returns the stored record and whether it was created.
    async fn insert_incoming_if_absent(&self, message: &Message) -> PortResult<(Message, bool)>;

    /// Sets the status only if it still equals `expected`. Returns whether it was applied.
    async fn compare_and_set_status(
        &self,
        message_id: Uuid,
        expected: MessageStatus,
        new: MessageStatus,
    ) -> PortResult<bool>;

    /// Records the outcome of a send. Applies only while the message is `Pending`.
    async fn complete_send(
        &self,
        message_id: Uuid,
        external_id: Option<&str>,
        status: MessageStatus,
    ) -> PortResult<bool>;

    /// Moves every incoming, not yet read message of the chat to `Read` and
    /// returns the ids it moved.
    async fn mark_chat_read(&self, session_id: Uuid, chat_id: &str) -> PortResult<Vec<Uuid>>;

    /// Incoming messages of the session that are not `Read`, across all chats.
    async fn count_unread(&self, session_id: Uuid) -> PortResult<u64>;

    /// The newest `created_at` stored for the session.
    async fn latest_created_at(&self, session_id: Uuid) -> PortResult<Option<DateTime<Utc>>>;

    /// Newest first, ordered by `(created_at DESC, id DESC)`.
    async fn list_chat(
        &self,
        session_id: Uuid,
        chat_id: &str,
        limit: usize,
        before: Option<PageCursor>,
    ) -> PortResult<Vec<Message>>;
}

//=========================================================================================
// Provider Port
//=========================================================================================

/// Connectivity as reported by the provider for a session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderConnection {
    Unpaired,
    Pairing,
    Connected,
}

/// The boundary to the external messaging network.
///
/// Transient failures are reported as `PortError::Unavailable`, permanent ones
/// as `PortError::Rejected`.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Starts a provider client for the token if needed and returns its QR challenge.
    async fn request_qr(&self, session_token: &str) -> PortResult<QrCode>;

    async fn query_status(&self, session_token: &str) -> PortResult<ProviderConnection>;

    async fn list_chats(&self, session_token: &str) -> PortResult<Vec<ChatSummary>>;

    /// Returns the provider-assigned message id.
    async fn send_message(
        &self,
        session_token: &str,
        chat_id: &str,
        content: &str,
    ) -> PortResult<String>;

    /// The newest `limit` messages the provider holds for the chat.
    async fn fetch_history(
        &self,
        session_token: &str,
        chat_id: &str,
        limit: usize,
    ) -> PortResult<Vec<ProviderMessage>>;

    /// Tells the provider the chat has been read on this side.
    async fn mark_seen(&self, session_token: &str, chat_id: &str) -> PortResult<()>;

    async fn logout(&self, session_token: &str) -> PortResult<()>;
}
