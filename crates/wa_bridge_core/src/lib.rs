pub mod bus;
pub mod domain;
pub mod error;
pub mod ingest;
pub mod ports;
pub mod registry;
pub mod retry;
pub mod service;
pub mod session;
pub mod store;

pub use bus::{Notification, NotificationBus, Subscription, Topic};
pub use domain::{
    Change, ChatSummary, Direction, Message, MessageStatus, PageCursor, ProviderMessage, QrCode,
    Session, SessionState,
};
pub use error::{RelayError, RelayResult};
pub use ingest::{EventIngestor, InboundEvent, Ingested};
pub use ports::{
    MessageRepository, PortError, PortResult, ProviderConnection, ProviderGateway,
    SessionRepository,
};
pub use retry::RetryPolicy;
pub use service::{RelayOptions, RelayService, SessionStatus};
