#![allow(dead_code)]

use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use api_lib::adapters::{FakeGateway, MemoryStore};
use wa_bridge_core::{Ingested, RelayOptions, RelayService, RetryPolicy};

pub struct Harness {
    pub relay: Arc<RelayService>,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakeGateway>,
}

pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(FakeGateway::new());
    let options = RelayOptions {
        retry: RetryPolicy::immediate(3),
        queue_capacity: 16,
    };
    let relay = Arc::new(RelayService::new(
        store.clone(),
        store.clone(),
        gateway.clone(),
        options,
    ));
    Harness {
        relay,
        store,
        gateway,
    }
}

impl Harness {
    /// The provider token the relay issued for the session.
    pub async fn token(&self, session_id: Uuid) -> String {
        self.relay
            .session(session_id)
            .await
            .unwrap()
            .external_session_token
            .expect("session has no provider token")
    }

    /// Opens a session and confirms pairing through the webhook.
    pub async fn connected_session(&self, user_id: i64, name: &str) -> (Uuid, String) {
        let session_id = self.relay.connect(user_id, name).await.unwrap();
        let token = self.token(session_id).await;
        let outcome = self
            .relay
            .ingest(&connection_event(&token, "connected"))
            .await
            .unwrap();
        assert_eq!(outcome, Ingested::Applied);
        (session_id, token)
    }
}

pub fn connection_event(token: &str, status: &str) -> serde_json::Value {
    json!({ "type": "connection_update", "session_id": token, "status": status })
}

pub fn message_event(token: &str, chat_id: &str, external_id: &str, content: &str) -> serde_json::Value {
    json!({
        "type": "message",
        "session_id": token,
        "message": { "id": external_id, "chat_id": chat_id, "content": content }
    })
}

pub fn status_event(token: &str, external_id: &str, status: &str) -> serde_json::Value {
    json!({
        "type": "status_update",
        "session_id": token,
        "status": { "message_id": external_id, "status": status }
    })
}
