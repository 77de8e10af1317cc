//! crates/wa_bridge_core/src/service.rs
//!
//! `RelayService` wires the state machine, message store, ingestor and bus
//! together and exposes the operations the UI and CLI collaborators call.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{Notification, NotificationBus, Subscription, Topic, DEFAULT_QUEUE_CAPACITY};
use crate::domain::{
    Change, ChatSummary, Message, MessageStatus, PageCursor, ProviderMessage, QrCode, Session,
    SessionState,
};
use crate::error::{RelayError, RelayResult};
use crate::ingest::{EventIngestor, Ingested};
use crate::ports::{MessageRepository, PortError, ProviderGateway, SessionRepository};
use crate::registry::SessionLocks;
use crate::retry::RetryPolicy;
use crate::session::SessionStateMachine;
use crate::store::{MessageStore, MAX_PAGE_SIZE};

#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    pub retry: RetryPolicy,
    pub queue_capacity: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// What `get_status` reports about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub session_token: Option<String>,
    pub last_connected: Option<DateTime<Utc>>,
}

pub struct RelayService {
    sessions: Arc<SessionStateMachine>,
    store: Arc<MessageStore>,
    ingestor: EventIngestor,
    bus: Arc<NotificationBus>,
    gateway: Arc<dyn ProviderGateway>,
    retry: RetryPolicy,
}

impl RelayService {
    pub fn new(
        session_repo: Arc<dyn SessionRepository>,
        message_repo: Arc<dyn MessageRepository>,
        gateway: Arc<dyn ProviderGateway>,
        options: RelayOptions,
    ) -> Self {
        let locks = Arc::new(SessionLocks::new());
        let bus = Arc::new(NotificationBus::new(options.queue_capacity));
        let sessions = Arc::new(SessionStateMachine::new(
            session_repo.clone(),
            gateway.clone(),
            locks.clone(),
            bus.clone(),
            options.retry,
        ));
        let store = Arc::new(MessageStore::new(session_repo, message_repo, locks));
        let ingestor = EventIngestor::new(sessions.clone(), store.clone(), bus.clone());
        Self {
            sessions,
            store,
            ingestor,
            bus,
            gateway,
            retry: options.retry,
        }
    }

    pub fn sessions(&self) -> &SessionStateMachine {
        &self.sessions
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub async fn session(&self, session_id: Uuid) -> RelayResult<Session> {
        self.sessions.get(session_id).await
    }

    /// Opens (or reuses) the user's named session and starts QR pairing.
    pub async fn connect(&self, user_id: i64, session_name: &str) -> RelayResult<Uuid> {
        let session = self.sessions.open(user_id, session_name).await?;
        let session = self.sessions.connect(session.id).await?;
        Ok(session.id)
    }

    pub async fn disconnect(&self, session_id: Uuid) -> RelayResult<()> {
        self.sessions.disconnect(session_id).await.map(|_| ())
    }

    pub async fn get_status(&self, session_id: Uuid) -> RelayResult<SessionStatus> {
        let session = self.sessions.check_status(session_id).await?;
        Ok(SessionStatus {
            state: session.state,
            session_token: session.external_session_token,
            last_connected: session.last_connected,
        })
    }

    pub async fn get_qr(&self, session_id: Uuid) -> RelayResult<Option<QrCode>> {
        Ok(self.sessions.get(session_id).await?.qr_code)
    }

    pub async fn list_chats(&self, session_id: Uuid) -> RelayResult<Vec<ChatSummary>> {
        self.sessions.list_chats(session_id).await
    }

    pub async fn list_messages(
        &self,
        session_id: Uuid,
        chat_id: &str,
        limit: usize,
        before: Option<PageCursor>,
    ) -> RelayResult<Vec<Message>> {
        self.store.list_chat(session_id, chat_id, limit, before).await
    }

    /// Sends a text message and reports the final local record.
    ///
    /// The message is stored as `Pending` before the provider is called, and ends
    /// `Sent` or `Failed` once the call settles.
    pub async fn send(&self, session_id: Uuid, chat_id: &str, content: &str) -> RelayResult<Message> {
        let outgoing = self.store.create_outgoing(session_id, chat_id, content).await?;
        let message_id = outgoing.message.id;

        let gateway = self.gateway.as_ref();
        let token = outgoing.session_token.as_str();
        let result = self
            .retry
            .run("send_message", move || gateway.send_message(token, chat_id, content))
            .await;

        match result {
            Ok(external_id) => {
                let change = self
                    .store
                    .record_send_result(message_id, Some(&external_id), true)
                    .await?;
                self.publish_status(session_id, &change);
                info!(%session_id, %message_id, external_id, "message sent");
                Ok(change.into_inner())
            }
            Err(e) => {
                let change = self.store.record_send_result(message_id, None, false).await?;
                self.publish_status(session_id, &change);
                error!(%session_id, %message_id, error = %e, "message send failed");
                Err(match e {
                    PortError::Rejected(reason) => RelayError::ProviderRejected(reason),
                    other => RelayError::SendFailed {
                        message_id,
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Marks the chat read locally and, when connected, tells the provider.
    pub async fn mark_read(&self, session_id: Uuid, chat_id: &str) -> RelayResult<u64> {
        let moved = self.store.mark_read(session_id, chat_id).await?;
        for message_id in &moved {
            self.bus.publish(
                Topic::Session(session_id),
                Notification::StatusUpdate {
                    message_id: *message_id,
                    status: MessageStatus::Read,
                },
            );
        }
        let count = moved.len() as u64;
        let session = self.sessions.get(session_id).await?;
        if let (SessionState::Connected, Some(token)) =
            (session.state, session.external_session_token.as_deref())
        {
            if let Err(e) = self.gateway.mark_seen(token, chat_id).await {
                warn!(%session_id, chat_id, error = %e, "provider read receipt failed");
            }
        }
        Ok(count)
    }

    /// The user's connected session, if any.
    pub async fn active_session(&self, user_id: i64) -> RelayResult<Option<Session>> {
        self.sessions.find_active(user_id).await
    }

    /// Incoming messages of the session not yet read, across all chats.
    pub async fn unread_count(&self, session_id: Uuid) -> RelayResult<u64> {
        self.store.count_unread(session_id).await
    }

    /// The provider's own history for a chat, newest `limit` entries. Local
    /// records are not touched.
    pub async fn fetch_history(
        &self,
        session_id: Uuid,
        chat_id: &str,
        limit: usize,
    ) -> RelayResult<Vec<ProviderMessage>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        self.sessions.fetch_history(session_id, chat_id, limit).await
    }

    /// Webhook entry point.
    pub async fn ingest(&self, payload: &Value) -> RelayResult<Ingested> {
        self.ingestor.ingest(payload).await
    }

    pub fn subscribe(&self, session_id: Uuid) -> Subscription {
        self.bus.subscribe(Topic::Session(session_id))
    }

    fn publish_status(&self, session_id: Uuid, change: &Change<Message>) {
        if let Change::Applied(message) = change {
            self.bus.publish(
                Topic::Session(session_id),
                Notification::StatusUpdate {
                    message_id: message.id,
                    status: message.status,
                },
            );
        }
    }
}
