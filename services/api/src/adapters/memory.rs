//! services/api/src/adapters/memory.rs
//!
//! An in-process implementation of the storage ports. Used when no
//! `DATABASE_URL` is configured, and by the test suite.
//!
//! Each repository keeps its rows behind one mutex, which makes every port
//! call a single atomic step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;
use wa_bridge_core::domain::{Direction, Message, MessageStatus, PageCursor, Session};
use wa_bridge_core::ports::{MessageRepository, PortError, PortResult, SessionRepository};

#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<Uuid, Session>>,
    messages: Mutex<HashMap<Uuid, Message>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().map(|m| m.len()).unwrap_or(0)
    }
}

fn is_unread(message: &Message) -> bool {
    message.direction == Direction::Incoming && message.status != MessageStatus::Read
}

fn poisoned<T>(_: T) -> PortError {
    PortError::Unexpected("memory store lock poisoned".to_string())
}

//=========================================================================================
// `SessionRepository` Trait Implementation
//=========================================================================================

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn create_session(&self, session: &Session) -> PortResult<()> {
        let mut sessions = self.sessions.lock().map_err(poisoned)?;
        if sessions
            .values()
            .any(|s| s.user_id == session.user_id && s.name == session.name)
        {
            return Err(PortError::Conflict(format!(
                "user {} already has a session named '{}'",
                session.user_id, session.name
            )));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> PortResult<Session> {
        self.sessions
            .lock()
            .map_err(poisoned)?
            .get(&session_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Session {} not found", session_id)))
    }

    async fn find_session_by_name(&self, user_id: i64, name: &str) -> PortResult<Option<Session>> {
        Ok(self
            .sessions
            .lock()
            .map_err(poisoned)?
            .values()
            .find(|s| s.user_id == user_id && s.name == name)
            .cloned())
    }

    async fn find_session_by_token(&self, token: &str) -> PortResult<Option<Session>> {
        Ok(self
            .sessions
            .lock()
            .map_err(poisoned)?
            .values()
            .find(|s| s.external_session_token.as_deref() == Some(token))
            .cloned())
    }

    async fn find_active_session(&self, user_id: i64) -> PortResult<Option<Session>> {
        Ok(self
            .sessions
            .lock()
            .map_err(poisoned)?
            .values()
            .filter(|s| s.user_id == user_id && s.is_connected())
            .max_by_key(|s| s.last_connected)
            .cloned())
    }

    async fn save_session(&self, session: &Session) -> PortResult<()> {
        let mut sessions = self.sessions.lock().map_err(poisoned)?;
        if let Some(token) = session.external_session_token.as_deref() {
            if sessions
                .values()
                .any(|s| s.id != session.id && s.external_session_token.as_deref() == Some(token))
            {
                return Err(PortError::Conflict(format!("token '{}' is already bound", token)));
            }
        }
        match sessions.get_mut(&session.id) {
            Some(stored) => {
                *stored = session.clone();
                Ok(())
            }
            None => Err(PortError::NotFound(format!("Session {} not found", session.id))),
        }
    }
}

//=========================================================================================
// `MessageRepository` Trait Implementation
//=========================================================================================

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn insert_message(&self, message: &Message) -> PortResult<()> {
        self.messages
            .lock()
            .map_err(poisoned)?
            .insert(message.id, message.clone());
        Ok(())
    }

    async fn get_message(&self, message_id: Uuid) -> PortResult<Message> {
        self.messages
            .lock()
            .map_err(poisoned)?
            .get(&message_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Message {} not found", message_id)))
    }

    async fn find_by_external_id(
        &self,
        session_id: Uuid,
        external_id: &str,
    ) -> PortResult<Option<Message>> {
        Ok(self
            .messages
            .lock()
            .map_err(poisoned)?
            .values()
            .find(|m| {
                m.session_id == session_id && m.external_message_id.as_deref() == Some(external_id)
            })
            .cloned())
    }

    async fn insert_incoming_if_absent(&self, message: &Message) -> PortResult<(Message, bool)> {
        let mut messages = self.messages.lock().map_err(poisoned)?;
        let existing = messages.values().find(|m| {
            m.session_id == message.session_id
                && m.external_message_id.is_some()
                && m.external_message_id == message.external_message_id
        });
        if let Some(existing) = existing {
            return Ok((existing.clone(), false));
        }
        messages.insert(message.id, message.clone());
        Ok((message.clone(), true))
    }

    async fn compare_and_set_status(
        &self,
        message_id: Uuid,
        expected: MessageStatus,
        new: MessageStatus,
    ) -> PortResult<bool> {
        let mut messages = self.messages.lock().map_err(poisoned)?;
        match messages.get_mut(&message_id) {
            Some(message) if message.status == expected => {
                message.status = new;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PortError::NotFound(format!("Message {} not found", message_id))),
        }
    }

    async fn complete_send(
        &self,
        message_id: Uuid,
        external_id: Option<&str>,
        status: MessageStatus,
    ) -> PortResult<bool> {
        let mut messages = self.messages.lock().map_err(poisoned)?;
        match messages.get_mut(&message_id) {
            Some(message) if message.status == MessageStatus::Pending => {
                message.status = status;
                if let Some(external_id) = external_id {
                    message.external_message_id = Some(external_id.to_string());
                }
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PortError::NotFound(format!("Message {} not found", message_id))),
        }
    }

    async fn mark_chat_read(&self, session_id: Uuid, chat_id: &str) -> PortResult<Vec<Uuid>> {
        let mut messages = self.messages.lock().map_err(poisoned)?;
        let mut moved = Vec::new();
        for message in messages.values_mut().filter(|m| {
            m.session_id == session_id && m.chat_id == chat_id && is_unread(m)
        }) {
            message.status = MessageStatus::Read;
            moved.push(message.id);
        }
        Ok(moved)
    }

    async fn count_unread(&self, session_id: Uuid) -> PortResult<u64> {
        let messages = self.messages.lock().map_err(poisoned)?;
        Ok(messages
            .values()
            .filter(|m| m.session_id == session_id && is_unread(m))
            .count() as u64)
    }

    async fn latest_created_at(&self, session_id: Uuid) -> PortResult<Option<DateTime<Utc>>> {
        let messages = self.messages.lock().map_err(poisoned)?;
        Ok(messages
            .values()
            .filter(|m| m.session_id == session_id)
            .map(|m| m.created_at)
            .max())
    }

    async fn list_chat(
        &self,
        session_id: Uuid,
        chat_id: &str,
        limit: usize,
        before: Option<PageCursor>,
    ) -> PortResult<Vec<Message>> {
        let messages = self.messages.lock().map_err(poisoned)?;
        let mut page: Vec<Message> = messages
            .values()
            .filter(|m| m.session_id == session_id && m.chat_id == chat_id)
            .filter(|m| before.map_or(true, |cursor| cursor.admits(m)))
            .cloned()
            .collect();
        page.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        page.truncate(limit);
        Ok(page)
    }
}
