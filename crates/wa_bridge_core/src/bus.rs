//! crates/wa_bridge_core/src/bus.rs
//!
//! In-process publish/subscribe for state changes.
//!
//! Each topic owns a bounded broadcast queue. Publishing never blocks: when a
//! subscriber falls behind, the oldest queued notifications are dropped for
//! that subscriber only.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{MessageStatus, SessionState};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every change concerning one session.
    Session(Uuid),
}

/// Payloads delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Notification {
    NewMessage {
        session_id: Uuid,
        chat_id: String,
        message_id: Uuid,
        content: String,
        timestamp: DateTime<Utc>,
    },
    StatusUpdate {
        message_id: Uuid,
        status: MessageStatus,
    },
    ConnectionUpdate {
        session_id: Uuid,
        state: SessionState,
    },
}

pub struct NotificationBus {
    topics: DashMap<Topic, broadcast::Sender<Notification>>,
    capacity: usize,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let receiver = self
            .topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Subscription { topic, receiver }
    }

    /// Fans `notification` out to the current subscribers of `topic`.
    /// Returns how many subscribers it was queued for.
    pub fn publish(&self, topic: Topic, notification: Notification) -> usize {
        let Some(sender) = self.topics.get(&topic).map(|s| s.clone()) else {
            return 0;
        };
        match sender.send(notification) {
            Ok(count) => count,
            Err(_) => {
                // Nobody is listening any more.
                self.topics
                    .remove_if(&topic, |_, s| s.receiver_count() == 0);
                debug!(?topic, "dropped notification without subscribers");
                0
            }
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics
            .get(&topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

/// One subscriber's view of a topic.
pub struct Subscription {
    topic: Topic,
    receiver: broadcast::Receiver<Notification>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Waits for the next notification. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.receiver.recv().await {
                Ok(notification) => return Some(notification),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(topic = ?self.topic, skipped, "subscriber lagged, oldest notifications dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Notification> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|n| (n, sub))
        })
    }
}
