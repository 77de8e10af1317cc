//! crates/wa_bridge_core/src/error.rs
//!
//! The error taxonomy surfaced by the core to its callers.

use uuid::Uuid;

use crate::ports::PortError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Session {0} is not connected")]
    NotConnected(Uuid),

    #[error("Session {0} is already connected")]
    AlreadyConnected(Uuid),

    #[error("Session {0} not found")]
    SessionNotFound(Uuid),

    /// The provider could not be reached; retries are exhausted.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The provider permanently refused the request.
    #[error("Provider rejected the request: {0}")]
    ProviderRejected(String),

    #[error("No session is bound to provider token '{0}'")]
    UnknownSession(String),

    #[error("No message with provider id '{0}'")]
    MessageNotFound(String),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Terminal send failure after the retry budget was spent.
    #[error("Sending message {message_id} failed: {reason}")]
    SendFailed { message_id: Uuid, reason: String },

    /// The session kept changing underneath an optimistic update.
    #[error("Concurrent update on session {0}, try again")]
    Conflict(Uuid),

    #[error("Storage error: {0}")]
    Storage(#[from] PortError),
}

impl RelayError {
    /// Maps a provider failure onto the caller-facing taxonomy.
    pub fn from_provider(err: PortError) -> Self {
        match err {
            PortError::Unavailable(reason) => RelayError::ProviderUnavailable(reason),
            PortError::Rejected(reason) | PortError::NotFound(reason) => {
                RelayError::ProviderRejected(reason)
            }
            other => RelayError::ProviderUnavailable(other.to_string()),
        }
    }
}

/// A convenience type alias for `Result<T, RelayError>`.
pub type RelayResult<T> = Result<T, RelayError>;
