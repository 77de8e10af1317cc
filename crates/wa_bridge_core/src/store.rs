//! crates/wa_bridge_core/src/store.rs
//!
//! Message bookkeeping on top of the `MessageRepository` port.
//!
//! Writes keyed by provider message id go through the repository's atomic
//! primitives (insert-if-absent, compare-and-set), so duplicate or reordered
//! webhooks can never produce two records or regress a status.

use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{Change, Message, MessageStatus, PageCursor, Session, SessionState};
use crate::error::{RelayError, RelayResult};
use crate::ports::{MessageRepository, PortError, SessionRepository};
use crate::registry::SessionLocks;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 200;

/// Compare-and-set rounds before a status update is reported as a conflict.
const CAS_ATTEMPTS: usize = 8;

/// A freshly created outgoing message and the token to send it with.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub message: Message,
    pub session_token: String,
}

pub struct MessageStore {
    sessions: Arc<dyn SessionRepository>,
    messages: Arc<dyn MessageRepository>,
    locks: Arc<SessionLocks>,
}

impl MessageStore {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        messages: Arc<dyn MessageRepository>,
        locks: Arc<SessionLocks>,
    ) -> Self {
        Self {
            sessions,
            messages,
            locks,
        }
    }

    /// Records a `Pending` outgoing message. The session must be connected.
    pub async fn create_outgoing(
        &self,
        session_id: Uuid,
        chat_id: &str,
        content: &str,
    ) -> RelayResult<OutgoingMessage> {
        // Held so a concurrent disconnect cannot slip in between the check and the insert.
        let _guard = self.locks.lock(session_id).await;
        let session = self.session(session_id).await?;
        let session_token = match (session.state, session.external_session_token) {
            (SessionState::Connected, Some(token)) => token,
            _ => return Err(RelayError::NotConnected(session_id)),
        };

        let mut message = Message::outgoing(session_id, chat_id, content);
        message.order_after(self.messages.latest_created_at(session_id).await?);
        self.messages.insert_message(&message).await?;
        debug!(message_id = %message.id, %session_id, chat_id, "outgoing message queued");
        Ok(OutgoingMessage {
            message,
            session_token,
        })
    }

    /// Stores the provider's verdict on a send. Only the first call has an effect.
    pub async fn record_send_result(
        &self,
        message_id: Uuid,
        external_id: Option<&str>,
        ok: bool,
    ) -> RelayResult<Change<Message>> {
        let status = if ok && external_id.is_some() {
            MessageStatus::Sent
        } else {
            MessageStatus::Failed
        };
        let applied = self
            .messages
            .complete_send(message_id, external_id.filter(|_| ok), status)
            .await?;
        let message = self.messages.get_message(message_id).await?;
        if applied {
            info!(%message_id, %status, "send result recorded");
            Ok(Change::Applied(message))
        } else {
            Ok(Change::Unchanged(message))
        }
    }

    /// Stores an incoming message once per provider id.
    ///
    /// Runs under the session lock so its timestamp is ordered after every
    /// message already stored for the session.
    pub async fn ingest_incoming(
        &self,
        session_id: Uuid,
        chat_id: &str,
        external_id: &str,
        content: &str,
    ) -> RelayResult<Change<Message>> {
        let _guard = self.locks.lock(session_id).await;
        let mut candidate = Message::incoming(session_id, chat_id, external_id, content);
        candidate.order_after(self.messages.latest_created_at(session_id).await?);
        let (message, created) = self.messages.insert_incoming_if_absent(&candidate).await?;
        if created {
            Ok(Change::Applied(message))
        } else {
            debug!(%session_id, external_id, "duplicate incoming message ignored");
            Ok(Change::Unchanged(message))
        }
    }

    /// Moves a message forward in the status lattice. Reports that would not
    /// move it forward leave it untouched.
    pub async fn apply_status_update(
        &self,
        session_id: Uuid,
        external_id: &str,
        new_status: MessageStatus,
    ) -> RelayResult<Change<Message>> {
        for _ in 0..CAS_ATTEMPTS {
            let mut message = self
                .messages
                .find_by_external_id(session_id, external_id)
                .await?
                .ok_or_else(|| RelayError::MessageNotFound(external_id.to_string()))?;

            let Some(next) = message.status.advance(new_status) else {
                return Ok(Change::Unchanged(message));
            };
            if self
                .messages
                .compare_and_set_status(message.id, message.status, next)
                .await?
            {
                message.status = next;
                return Ok(Change::Applied(message));
            }
        }
        Err(RelayError::Conflict(session_id))
    }

    pub async fn list_chat(
        &self,
        session_id: Uuid,
        chat_id: &str,
        limit: usize,
        before: Option<PageCursor>,
    ) -> RelayResult<Vec<Message>> {
        self.session(session_id).await?;
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        Ok(self
            .messages
            .list_chat(session_id, chat_id, limit, before)
            .await?)
    }

    /// Marks every unread incoming message of the chat as read. Returns the
    /// ids of the messages that moved.
    pub async fn mark_read(&self, session_id: Uuid, chat_id: &str) -> RelayResult<Vec<Uuid>> {
        self.session(session_id).await?;
        let moved = self.messages.mark_chat_read(session_id, chat_id).await?;
        debug!(%session_id, chat_id, count = moved.len(), "chat marked read");
        Ok(moved)
    }

    pub async fn count_unread(&self, session_id: Uuid) -> RelayResult<u64> {
        self.session(session_id).await?;
        Ok(self.messages.count_unread(session_id).await?)
    }

    async fn session(&self, session_id: Uuid) -> RelayResult<Session> {
        self.sessions
            .get_session(session_id)
            .await
            .map_err(|e| match e {
                PortError::NotFound(_) => RelayError::SessionNotFound(session_id),
                other => RelayError::Storage(other),
            })
    }
}
