//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the storage ports from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;
use wa_bridge_core::domain::{
    ChatSummary, Message, MessageStatus, PageCursor, QrCode, Session,
};
use wa_bridge_core::ports::{MessageRepository, PortError, PortResult, SessionRepository};

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `SessionRepository` and `MessageRepository` ports.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn map_db_err(e: sqlx::Error) -> PortError {
    match e {
        sqlx::Error::RowNotFound => PortError::NotFound("row not found".to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            PortError::Conflict(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => PortError::Unavailable(e.to_string()),
        _ => PortError::Unexpected(e.to_string()),
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(value: &str) -> PortResult<T> {
    value.parse().map_err(PortError::Unexpected)
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

const SESSION_COLUMNS: &str = "id, user_id, name, external_session_token, qr_code, state, \
     last_connected, chat_cache, created_at";

const MESSAGE_COLUMNS: &str =
    "id, session_id, external_message_id, chat_id, content, direction, status, created_at";

#[derive(FromRow)]
struct SessionRecord {
    id: Uuid,
    user_id: i64,
    name: String,
    external_session_token: Option<String>,
    qr_code: Option<Vec<u8>>,
    state: String,
    last_connected: Option<DateTime<Utc>>,
    chat_cache: Json<Vec<ChatSummary>>,
    created_at: DateTime<Utc>,
}
impl SessionRecord {
    fn to_domain(self) -> PortResult<Session> {
        Ok(Session {
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            external_session_token: self.external_session_token,
            qr_code: self.qr_code.map(QrCode::new),
            state: parse_column(&self.state)?,
            last_connected: self.last_connected,
            chat_cache: self.chat_cache.0,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct MessageRecord {
    id: Uuid,
    session_id: Uuid,
    external_message_id: Option<String>,
    chat_id: String,
    content: String,
    direction: String,
    status: String,
    created_at: DateTime<Utc>,
}
impl MessageRecord {
    fn to_domain(self) -> PortResult<Message> {
        Ok(Message {
            id: self.id,
            session_id: self.session_id,
            external_message_id: self.external_message_id,
            chat_id: self.chat_id,
            content: self.content,
            direction: parse_column(&self.direction)?,
            status: parse_column(&self.status)?,
            created_at: self.created_at,
        })
    }
}

//=========================================================================================
// `SessionRepository` Trait Implementation
//=========================================================================================

#[async_trait]
impl SessionRepository for DbAdapter {
    async fn create_session(&self, session: &Session) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, name, state, chat_cache, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(&session.name)
        .bind(session.state.as_str())
        .bind(Json(&session.chat_cache))
        .bind(session.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> PortResult<Session> {
        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {} FROM sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("Session {} not found", session_id)),
            other => map_db_err(other),
        })?;
        record.to_domain()
    }

    async fn find_session_by_name(&self, user_id: i64, name: &str) -> PortResult<Option<Session>> {
        sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {} FROM sessions WHERE user_id = $1 AND name = $2",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?
        .map(SessionRecord::to_domain)
        .transpose()
    }

    async fn find_session_by_token(&self, token: &str) -> PortResult<Option<Session>> {
        sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {} FROM sessions WHERE external_session_token = $1",
            SESSION_COLUMNS
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?
        .map(SessionRecord::to_domain)
        .transpose()
    }

    async fn find_active_session(&self, user_id: i64) -> PortResult<Option<Session>> {
        sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {} FROM sessions WHERE user_id = $1 AND state = 'connected' \
             ORDER BY last_connected DESC NULLS LAST LIMIT 1",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?
        .map(SessionRecord::to_domain)
        .transpose()
    }

    async fn save_session(&self, session: &Session) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE sessions SET external_session_token = $1, qr_code = $2, state = $3, \
             last_connected = $4, chat_cache = $5 WHERE id = $6",
        )
        .bind(session.external_session_token.as_deref())
        .bind(session.qr_code.as_ref().map(|qr| qr.as_bytes()))
        .bind(session.state.as_str())
        .bind(session.last_connected)
        .bind(Json(&session.chat_cache))
        .bind(session.id)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;

        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Session {} not found", session.id)));
        }
        Ok(())
    }
}

//=========================================================================================
// `MessageRepository` Trait Implementation
//=========================================================================================

#[async_trait]
impl MessageRepository for DbAdapter {
    async fn insert_message(&self, message: &Message) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO messages (id, session_id, external_message_id, chat_id, content, \
             direction, status, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(message.id)
        .bind(message.session_id)
        .bind(message.external_message_id.as_deref())
        .bind(&message.chat_id)
        .bind(&message.content)
        .bind(message.direction.as_str())
        .bind(message.status.as_str())
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn get_message(&self, message_id: Uuid) -> PortResult<Message> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {} FROM messages WHERE id = $1",
            MESSAGE_COLUMNS
        ))
        .bind(message_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("Message {} not found", message_id)),
            other => map_db_err(other),
        })?;
        record.to_domain()
    }

    async fn find_by_external_id(
        &self,
        session_id: Uuid,
        external_id: &str,
    ) -> PortResult<Option<Message>> {
        sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {} FROM messages WHERE session_id = $1 AND external_message_id = $2",
            MESSAGE_COLUMNS
        ))
        .bind(session_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?
        .map(MessageRecord::to_domain)
        .transpose()
    }

    async fn insert_incoming_if_absent(&self, message: &Message) -> PortResult<(Message, bool)> {
        let external_id = message
            .external_message_id
            .as_deref()
            .ok_or_else(|| PortError::Unexpected("incoming message without provider id".into()))?;

        let inserted = sqlx::query_as::<_, MessageRecord>(&format!(
            "INSERT INTO messages (id, session_id, external_message_id, chat_id, content, \
             direction, status, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (session_id, external_message_id) DO NOTHING RETURNING {}",
            MESSAGE_COLUMNS
        ))
        .bind(message.id)
        .bind(message.session_id)
        .bind(external_id)
        .bind(&message.chat_id)
        .bind(&message.content)
        .bind(message.direction.as_str())
        .bind(message.status.as_str())
        .bind(message.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        if let Some(record) = inserted {
            return Ok((record.to_domain()?, true));
        }
        let existing = self
            .find_by_external_id(message.session_id, external_id)
            .await?
            .ok_or_else(|| PortError::Conflict(format!("message '{}' vanished", external_id)))?;
        Ok((existing, false))
    }

    async fn compare_and_set_status(
        &self,
        message_id: Uuid,
        expected: MessageStatus,
        new: MessageStatus,
    ) -> PortResult<bool> {
        let result = sqlx::query("UPDATE messages SET status = $1 WHERE id = $2 AND status = $3")
            .bind(new.as_str())
            .bind(message_id)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_send(
        &self,
        message_id: Uuid,
        external_id: Option<&str>,
        status: MessageStatus,
    ) -> PortResult<bool> {
        let result = sqlx::query(
            "UPDATE messages SET status = $1, \
             external_message_id = COALESCE($2, external_message_id) \
             WHERE id = $3 AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(external_id)
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_chat_read(&self, session_id: Uuid, chat_id: &str) -> PortResult<Vec<Uuid>> {
        sqlx::query_scalar::<_, Uuid>(
            "UPDATE messages SET status = 'read' WHERE session_id = $1 AND chat_id = $2 \
             AND direction = 'incoming' AND status <> 'read' RETURNING id",
        )
        .bind(session_id)
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)
    }

    async fn count_unread(&self, session_id: Uuid) -> PortResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM messages WHERE session_id = $1 \
             AND direction = 'incoming' AND status <> 'read'",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(count.max(0) as u64)
    }

    async fn latest_created_at(&self, session_id: Uuid) -> PortResult<Option<DateTime<Utc>>> {
        sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(created_at) FROM messages WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)
    }

    async fn list_chat(
        &self,
        session_id: Uuid,
        chat_id: &str,
        limit: usize,
        before: Option<PageCursor>,
    ) -> PortResult<Vec<Message>> {
        let keyset = match before {
            None => "",
            Some(PageCursor { id: Some(_), .. }) => "AND (created_at, id) < ($4, $5)",
            Some(PageCursor { id: None, .. }) => "AND created_at < $4",
        };
        let sql = format!(
            "SELECT {} FROM messages WHERE session_id = $1 AND chat_id = $2 {} \
             ORDER BY created_at DESC, id DESC LIMIT $3",
            MESSAGE_COLUMNS, keyset
        );

        let mut query = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(session_id)
            .bind(chat_id)
            .bind(limit as i64);
        if let Some(cursor) = before {
            query = query.bind(cursor.created_at);
            if let Some(id) = cursor.id {
                query = query.bind(id);
            }
        }

        let records = query.fetch_all(&self.pool).await.map_err(map_db_err)?;
        records.into_iter().map(MessageRecord::to_domain).collect()
    }
}
