//! services/api/src/adapters/bridge.rs
//!
//! This module contains the adapter for the whatsapp-web.js bridge service.
//! It implements the `ProviderGateway` port from the `core` crate over the
//! bridge's HTTP API.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;
use wa_bridge_core::domain::{ChatSummary, MessageStatus, ProviderMessage, QrCode};
use wa_bridge_core::ports::{PortError, PortResult, ProviderConnection, ProviderGateway};

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements the `ProviderGateway` port against the bridge.
#[derive(Clone)]
pub struct BridgeGateway {
    client: Client,
    base_url: String,
}

impl BridgeGateway {
    /// Creates a new `BridgeGateway` with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[derive(Deserialize)]
struct BridgeStatus {
    state: String,
}

#[derive(Deserialize)]
struct SendResponse {
    message_id: Option<String>,
}

#[derive(Deserialize)]
struct BridgeChat {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    unread: Option<u32>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    last_message: Option<String>,
}

impl BridgeChat {
    fn to_domain(self) -> ChatSummary {
        ChatSummary {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            last_message: self.last_message.unwrap_or_default(),
            unread: self.unread.unwrap_or(0),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Deserialize)]
struct BridgeMessage {
    id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    timestamp: Option<i64>,
    direction: String,
    #[serde(default)]
    state: Option<String>,
}

impl BridgeMessage {
    fn to_domain(self, chat_id: &str) -> PortResult<ProviderMessage> {
        let direction = self.direction.parse().map_err(PortError::Unexpected)?;
        let status = match self.state.as_deref() {
            Some(state) => state.parse().map_err(PortError::Unexpected)?,
            None => MessageStatus::Sent,
        };
        Ok(ProviderMessage {
            external_id: self.id,
            // The bridge's own `chat_id` is the sender, which is the local account for outgoing messages.
            chat_id: chat_id.to_string(),
            content: self.content,
            direction,
            status,
            timestamp: self.timestamp,
        })
    }
}

/// Network-level failures are always worth another attempt.
fn transport_err(e: reqwest::Error) -> PortError {
    PortError::Unavailable(e.to_string())
}

/// Maps a non-success response: 5xx and 429 are transient, other 4xx are final.
async fn status_err(response: Response) -> PortError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let reason = format!("bridge returned {}: {}", status, body.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        PortError::Unavailable(reason)
    } else {
        PortError::Rejected(reason)
    }
}

//=========================================================================================
// `ProviderGateway` Trait Implementation
//=========================================================================================

#[async_trait]
impl ProviderGateway for BridgeGateway {
    async fn request_qr(&self, session_token: &str) -> PortResult<QrCode> {
        // Starting an already running client is a no-op on the bridge side.
        let started = self
            .client
            .post(self.url("/start"))
            .json(&json!({ "session_id": session_token }))
            .send()
            .await
            .map_err(transport_err)?;
        if !started.status().is_success() {
            return Err(status_err(started).await);
        }

        let response = self
            .client
            .get(self.url(&format!("/qr_code/{}", session_token)))
            .send()
            .await
            .map_err(transport_err)?;
        match response.status() {
            s if s.is_success() => {
                let bytes = response.bytes().await.map_err(transport_err)?;
                debug!(session_token, size = bytes.len(), "QR code fetched");
                Ok(QrCode::new(bytes.to_vec()))
            }
            // The client is up but has not emitted its first QR yet.
            StatusCode::NOT_FOUND => Err(PortError::Unavailable(
                "QR code not available yet".to_string(),
            )),
            _ => Err(status_err(response).await),
        }
    }

    async fn query_status(&self, session_token: &str) -> PortResult<ProviderConnection> {
        let response = self
            .client
            .get(self.url(&format!("/status/{}", session_token)))
            .send()
            .await
            .map_err(transport_err)?;
        match response.status() {
            s if s.is_success() => {
                let status: BridgeStatus = response.json().await.map_err(transport_err)?;
                Ok(match status.state.as_str() {
                    "connected" => ProviderConnection::Connected,
                    _ => ProviderConnection::Pairing,
                })
            }
            StatusCode::NOT_FOUND => Ok(ProviderConnection::Unpaired),
            _ => Err(status_err(response).await),
        }
    }

    async fn list_chats(&self, session_token: &str) -> PortResult<Vec<ChatSummary>> {
        let response = self
            .client
            .get(self.url(&format!("/chats/{}", session_token)))
            .send()
            .await
            .map_err(transport_err)?;
        if !response.status().is_success() {
            return Err(status_err(response).await);
        }
        let chats: Vec<BridgeChat> = response.json().await.map_err(transport_err)?;
        Ok(chats.into_iter().map(BridgeChat::to_domain).collect())
    }

    async fn send_message(
        &self,
        session_token: &str,
        chat_id: &str,
        content: &str,
    ) -> PortResult<String> {
        let response = self
            .client
            .post(self.url("/send"))
            .json(&json!({
                "session_id": session_token,
                "chat_id": chat_id,
                "message": content,
            }))
            .send()
            .await
            .map_err(transport_err)?;
        if !response.status().is_success() {
            return Err(status_err(response).await);
        }
        let sent: SendResponse = response.json().await.map_err(transport_err)?;
        sent.message_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| PortError::Unexpected("bridge response carried no message_id".into()))
    }

    async fn fetch_history(
        &self,
        session_token: &str,
        chat_id: &str,
        limit: usize,
    ) -> PortResult<Vec<ProviderMessage>> {
        let response = self
            .client
            .get(self.url(&format!("/messages/{}/{}", session_token, chat_id)))
            .query(&[("limit", limit)])
            .send()
            .await
            .map_err(transport_err)?;
        if !response.status().is_success() {
            return Err(status_err(response).await);
        }
        let messages: Vec<BridgeMessage> = response.json().await.map_err(transport_err)?;
        messages
            .into_iter()
            .map(|message| message.to_domain(chat_id))
            .collect()
    }

    async fn mark_seen(&self, session_token: &str, chat_id: &str) -> PortResult<()> {
        let response = self
            .client
            .post(self.url(&format!("/read/{}", session_token)))
            .json(&json!({ "chat_id": chat_id }))
            .send()
            .await
            .map_err(transport_err)?;
        if !response.status().is_success() {
            return Err(status_err(response).await);
        }
        Ok(())
    }

    async fn logout(&self, session_token: &str) -> PortResult<()> {
        let response = self
            .client
            .post(self.url(&format!("/logout/{}", session_token)))
            .send()
            .await
            .map_err(transport_err)?;
        match response.status() {
            s if s.is_success() => Ok(()),
            // Nothing left to log out.
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(status_err(response).await),
        }
    }
}
