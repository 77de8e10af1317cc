//! crates/wa_bridge_core/src/session.rs
//!
//! The per-session connection lifecycle: `Disconnected -> Connecting -> Connected`.
//!
//! Every transition runs under the session's lock. Provider calls never do:
//! the lock is released before the call and re-acquired to commit the result,
//! and the commit re-checks that the session did not move in between.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{Notification, NotificationBus, Topic};
use crate::domain::{
    now_micros, Change, ChatSummary, ProviderMessage, QrCode, Session, SessionState,
};
use crate::error::{RelayError, RelayResult};
use crate::ports::{PortError, ProviderConnection, ProviderGateway, SessionRepository};
use crate::registry::SessionLocks;
use crate::retry::RetryPolicy;

/// How many times an optimistic commit is attempted before giving up.
const COMMIT_ATTEMPTS: usize = 2;

enum Commit<T> {
    Done(T),
    /// The session moved on to another attempt; try again.
    Stale,
    /// The session was reset while the provider call was in flight.
    Cancelled,
}

pub struct SessionStateMachine {
    sessions: Arc<dyn SessionRepository>,
    gateway: Arc<dyn ProviderGateway>,
    locks: Arc<SessionLocks>,
    bus: Arc<NotificationBus>,
    retry: RetryPolicy,
}

impl SessionStateMachine {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        gateway: Arc<dyn ProviderGateway>,
        locks: Arc<SessionLocks>,
        bus: Arc<NotificationBus>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            sessions,
            gateway,
            locks,
            bus,
            retry,
        }
    }

    pub async fn get(&self, session_id: Uuid) -> RelayResult<Session> {
        self.sessions
            .get_session(session_id)
            .await
            .map_err(|e| match e {
                PortError::NotFound(_) => RelayError::SessionNotFound(session_id),
                other => RelayError::Storage(other),
            })
    }

    pub async fn find_by_token(&self, token: &str) -> RelayResult<Session> {
        self.sessions
            .find_session_by_token(token)
            .await?
            .ok_or_else(|| RelayError::UnknownSession(token.to_string()))
    }

    /// The user's connected session, if any.
    pub async fn find_active(&self, user_id: i64) -> RelayResult<Option<Session>> {
        Ok(self.sessions.find_active_session(user_id).await?)
    }

    /// Returns the user's session with this name, creating it on first use.
    pub async fn open(&self, user_id: i64, name: &str) -> RelayResult<Session> {
        if let Some(existing) = self.sessions.find_session_by_name(user_id, name).await? {
            return Ok(existing);
        }
        let session = Session::new(user_id, name);
        match self.sessions.create_session(&session).await {
            Ok(()) => {
                info!(session_id = %session.id, user_id, name, "session created");
                Ok(session)
            }
            // Lost a race against a concurrent open of the same name.
            Err(PortError::Conflict(_)) => self
                .sessions
                .find_session_by_name(user_id, name)
                .await?
                .ok_or_else(|| RelayError::Conflict(session.id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Starts pairing: moves the session to `Connecting` and stores a fresh QR challenge.
    pub async fn connect(&self, session_id: Uuid) -> RelayResult<Session> {
        for _ in 0..COMMIT_ATTEMPTS {
            match self.try_connect(session_id).await? {
                Commit::Done(session) => return Ok(session),
                Commit::Stale => {
                    warn!(%session_id, "session changed while requesting a QR code, retrying");
                }
                Commit::Cancelled => {
                    info!(%session_id, "session disconnected while requesting a QR code");
                    return Err(RelayError::Conflict(session_id));
                }
            }
        }
        Err(RelayError::Conflict(session_id))
    }

    async fn try_connect(&self, session_id: Uuid) -> RelayResult<Commit<Session>> {
        let (token, previous) = {
            let _guard = self.locks.lock(session_id).await;
            let mut session = self.get(session_id).await?;
            if session.is_connected() {
                return Err(RelayError::AlreadyConnected(session_id));
            }
            let previous = session.state;
            let token = match &session.external_session_token {
                Some(token) => token.clone(),
                None => {
                    let token = issue_token(&session);
                    session.external_session_token = Some(token.clone());
                    token
                }
            };
            session.state = SessionState::Connecting;
            self.sessions.save_session(&session).await?;
            if previous != SessionState::Connecting {
                self.announce(&session);
            }
            (token, previous)
        };

        let gateway = self.gateway.as_ref();
        let token_ref = token.as_str();
        let qr = self
            .retry
            .run("request_qr", move || gateway.request_qr(token_ref))
            .await;

        let outcome = {
            let _guard = self.locks.lock(session_id).await;
            let mut session = self.get(session_id).await?;
            let same_token = session.external_session_token.as_deref() == Some(token.as_str());
            match qr {
                Ok(qr) if same_token && session.state == SessionState::Connecting => {
                    session.qr_code = Some(qr);
                    self.sessions.save_session(&session).await?;
                    info!(%session_id, "QR challenge stored, waiting for pairing");
                    return Ok(Commit::Done(session));
                }
                // Pairing was confirmed while the QR request was in flight.
                Ok(_) if same_token && session.is_connected() => {
                    return Ok(Commit::Done(session));
                }
                Ok(_) if session.external_session_token.is_none() => Commit::Cancelled,
                Ok(_) => Commit::Stale,
                Err(e) => {
                    if same_token
                        && session.state == SessionState::Connecting
                        && session.qr_code.is_none()
                    {
                        session.state = previous;
                        self.sessions.save_session(&session).await?;
                        if previous != SessionState::Connecting {
                            self.announce(&session);
                        }
                    }
                    warn!(%session_id, error = %e, "QR request failed");
                    return Err(RelayError::from_provider(e));
                }
            }
        };

        // The token no longer belongs to the session, but the provider may have
        // started a client for it.
        if let Err(e) = self.gateway.logout(&token).await {
            warn!(%session_id, error = %e, "provider logout of abandoned token failed");
        }
        Ok(outcome)
    }

    /// Marks pairing as confirmed by the provider.
    pub async fn complete_qr(&self, session_id: Uuid, token: &str) -> RelayResult<Change<Session>> {
        let _guard = self.locks.lock(session_id).await;
        let mut session = self.get(session_id).await?;

        match session.external_session_token.as_deref() {
            Some(current) if current != token => {
                return Err(RelayError::UnknownSession(token.to_string()));
            }
            Some(_) if session.is_connected() => return Ok(Change::Unchanged(session)),
            Some(_) => {}
            None => {
                if let Some(holder) = self.sessions.find_session_by_token(token).await? {
                    if holder.id != session_id {
                        return Err(RelayError::Conflict(session_id));
                    }
                }
                session.external_session_token = Some(token.to_string());
            }
        }

        session.state = SessionState::Connected;
        session.last_connected = Some(now_micros());
        session.qr_code = None;
        self.sessions.save_session(&session).await?;
        info!(%session_id, "session connected");
        self.announce(&session);
        Ok(Change::Applied(session))
    }

    /// Replaces the QR challenge when the provider rotates it during pairing.
    pub async fn refresh_qr(
        &self,
        session_id: Uuid,
        token: &str,
        qr: QrCode,
    ) -> RelayResult<Change<Session>> {
        let _guard = self.locks.lock(session_id).await;
        let mut session = self.get(session_id).await?;
        if session.state != SessionState::Connecting
            || session.external_session_token.as_deref() != Some(token)
            || session.qr_code.as_ref() == Some(&qr)
        {
            return Ok(Change::Unchanged(session));
        }
        session.qr_code = Some(qr);
        self.sessions.save_session(&session).await?;
        Ok(Change::Applied(session))
    }

    /// User-initiated disconnect. Idempotent from any state.
    pub async fn disconnect(&self, session_id: Uuid) -> RelayResult<Change<Session>> {
        let (change, token) = {
            let _guard = self.locks.lock(session_id).await;
            let mut session = self.get(session_id).await?;
            let token = session.external_session_token.clone();
            (self.reset(&mut session).await?, token)
        };

        if let Some(token) = token {
            if let Err(e) = self.gateway.logout(&token).await {
                warn!(%session_id, error = %e, "provider logout failed");
            }
        }
        Ok(change)
    }

    /// Provider-reported disconnect for `token`. Ignored if the session has moved on.
    pub async fn mark_disconnected(
        &self,
        session_id: Uuid,
        token: &str,
    ) -> RelayResult<Change<Session>> {
        let _guard = self.locks.lock(session_id).await;
        let mut session = self.get(session_id).await?;
        if session.external_session_token.as_deref() != Some(token) {
            return Ok(Change::Unchanged(session));
        }
        self.reset(&mut session).await
    }

    async fn reset(&self, session: &mut Session) -> RelayResult<Change<Session>> {
        if session.state == SessionState::Disconnected
            && session.external_session_token.is_none()
            && session.qr_code.is_none()
        {
            return Ok(Change::Unchanged(session.clone()));
        }
        let was = session.state;
        session.state = SessionState::Disconnected;
        session.external_session_token = None;
        session.qr_code = None;
        self.sessions.save_session(session).await?;
        info!(session_id = %session.id, "session disconnected");
        if was != SessionState::Disconnected {
            self.announce(session);
        }
        Ok(Change::Applied(session.clone()))
    }

    /// Reads the session state. A session stuck in `Connecting` is reconciled
    /// against the provider when the provider reports a terminal state.
    pub async fn check_status(&self, session_id: Uuid) -> RelayResult<Session> {
        let session = self.get(session_id).await?;
        let token = match (&session.state, &session.external_session_token) {
            (SessionState::Connecting, Some(token)) => token.clone(),
            _ => return Ok(session),
        };

        let gateway = self.gateway.as_ref();
        let token_ref = token.as_str();
        let reported = match self
            .retry
            .run("query_status", move || gateway.query_status(token_ref))
            .await
        {
            Ok(reported) => reported,
            Err(e) => {
                warn!(%session_id, error = %e, "status poll failed, returning stored state");
                return Ok(session);
            }
        };

        let _guard = self.locks.lock(session_id).await;
        let mut session = self.get(session_id).await?;
        if session.state != SessionState::Connecting
            || session.external_session_token.as_deref() != Some(token.as_str())
        {
            return Ok(session);
        }
        match reported {
            ProviderConnection::Connected => {
                session.state = SessionState::Connected;
                session.last_connected = Some(now_micros());
                session.qr_code = None;
                self.sessions.save_session(&session).await?;
                info!(%session_id, "provider reports pairing complete");
                self.announce(&session);
                Ok(session)
            }
            ProviderConnection::Unpaired => {
                info!(%session_id, "provider no longer knows the session");
                Ok(self.reset(&mut session).await?.into_inner())
            }
            ProviderConnection::Pairing => Ok(session),
        }
    }

    /// Refreshes the chat list from the provider. Falls back to the cached list
    /// when the provider is temporarily unreachable.
    pub async fn list_chats(&self, session_id: Uuid) -> RelayResult<Vec<ChatSummary>> {
        let session = self.get(session_id).await?;
        let token = match (&session.state, &session.external_session_token) {
            (SessionState::Connected, Some(token)) => token.clone(),
            _ => return Err(RelayError::NotConnected(session_id)),
        };

        let gateway = self.gateway.as_ref();
        let token_ref = token.as_str();
        let chats = match self
            .retry
            .run("list_chats", move || gateway.list_chats(token_ref))
            .await
        {
            Ok(chats) => chats,
            Err(e) if e.is_transient() => {
                warn!(%session_id, error = %e, "chat refresh failed, serving cached list");
                return Ok(session.chat_cache);
            }
            Err(e) => return Err(RelayError::from_provider(e)),
        };

        let _guard = self.locks.lock(session_id).await;
        let mut session = self.get(session_id).await?;
        if session.is_connected() && session.external_session_token.as_deref() == Some(token.as_str())
        {
            session.chat_cache = chats.clone();
            self.sessions.save_session(&session).await?;
        }
        Ok(chats)
    }

    /// Reads the provider's own history for a chat. Nothing is stored.
    pub async fn fetch_history(
        &self,
        session_id: Uuid,
        chat_id: &str,
        limit: usize,
    ) -> RelayResult<Vec<ProviderMessage>> {
        let session = self.get(session_id).await?;
        let token = match (&session.state, &session.external_session_token) {
            (SessionState::Connected, Some(token)) => token.clone(),
            _ => return Err(RelayError::NotConnected(session_id)),
        };

        let gateway = self.gateway.as_ref();
        let token_ref = token.as_str();
        self.retry
            .run("fetch_history", move || {
                gateway.fetch_history(token_ref, chat_id, limit)
            })
            .await
            .map_err(RelayError::from_provider)
    }

    fn announce(&self, session: &Session) {
        self.bus.publish(
            Topic::Session(session.id),
            Notification::ConnectionUpdate {
                session_id: session.id,
                state: session.state,
            },
        );
    }
}

fn issue_token(session: &Session) -> String {
    format!("sess_{}_{}", session.user_id, Uuid::new_v4().simple())
}
