//! services/api/src/adapters/fake_gateway.rs
//!
//! A scripted, in-memory provider. Selected with `GATEWAY=fake` for local
//! development and used by the test suite to inject provider failures.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use wa_bridge_core::domain::{ChatSummary, ProviderMessage, QrCode};
use wa_bridge_core::ports::{PortError, PortResult, ProviderConnection, ProviderGateway};

/// Identifies one gateway operation when scripting failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    RequestQr,
    QueryStatus,
    ListChats,
    FetchHistory,
    SendMessage,
    MarkSeen,
    Logout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub session_token: String,
    pub chat_id: String,
    pub content: String,
    pub external_id: String,
}

/// Holds one gateway call in flight until released.
#[derive(Default)]
pub struct Gate {
    entered: Notify,
    released: Notify,
}

impl Gate {
    /// Resolves once the held call has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Lets the held call proceed.
    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[derive(Default)]
struct FakeState {
    connections: HashMap<String, ProviderConnection>,
    chats: Vec<ChatSummary>,
    histories: HashMap<String, Vec<ProviderMessage>>,
    failures: HashMap<FakeOp, VecDeque<PortError>>,
    gates: HashMap<(FakeOp, usize), Arc<Gate>>,
    calls: HashMap<FakeOp, usize>,
    sent: Vec<SentMessage>,
    next_id: u64,
}

#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `error` to be returned by the next call of `op`.
    pub fn fail_next(&self, op: FakeOp, error: PortError) {
        self.state()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Sets what `query_status` reports for `token`.
    pub fn set_connection(&self, token: &str, connection: ProviderConnection) {
        self.state()
            .connections
            .insert(token.to_string(), connection);
    }

    pub fn set_chats(&self, chats: Vec<ChatSummary>) {
        self.state().chats = chats;
    }

    /// Sets the provider-side history of a chat, oldest first.
    pub fn set_history(&self, chat_id: &str, messages: Vec<ProviderMessage>) {
        self.state()
            .histories
            .insert(chat_id.to_string(), messages);
    }

    /// Holds the `call`-th call of `op` (counting from 1) until the gate is released.
    pub fn hold(&self, op: FakeOp, call: usize) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.state().gates.insert((op, call), gate.clone());
        gate
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state().sent.clone()
    }

    pub fn calls(&self, op: FakeOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Records the call and pops a scripted failure, if any. Waits first when
    /// the call is held.
    async fn enter(&self, op: FakeOp) -> PortResult<MutexGuard<'_, FakeState>> {
        let gate = {
            let mut state = self.state();
            let calls = state.calls.entry(op).or_default();
            *calls += 1;
            let call = *calls;
            state.gates.remove(&(op, call))
        };
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.released.notified().await;
        }

        let mut state = self.state();
        let failure = state.failures.get_mut(&op).and_then(VecDeque::pop_front);
        match failure {
            Some(error) => Err(error),
            None => Ok(state),
        }
    }
}

/// The PNG signature followed by the token, so every session gets distinct bytes.
fn fake_qr(token: &str) -> QrCode {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    bytes.extend_from_slice(token.as_bytes());
    QrCode::new(bytes)
}

#[async_trait]
impl ProviderGateway for FakeGateway {
    async fn request_qr(&self, session_token: &str) -> PortResult<QrCode> {
        let mut state = self.enter(FakeOp::RequestQr).await?;
        state
            .connections
            .entry(session_token.to_string())
            .or_insert(ProviderConnection::Pairing);
        Ok(fake_qr(session_token))
    }

    async fn query_status(&self, session_token: &str) -> PortResult<ProviderConnection> {
        let state = self.enter(FakeOp::QueryStatus).await?;
        Ok(state
            .connections
            .get(session_token)
            .copied()
            .unwrap_or(ProviderConnection::Unpaired))
    }

    async fn list_chats(&self, _session_token: &str) -> PortResult<Vec<ChatSummary>> {
        let state = self.enter(FakeOp::ListChats).await?;
        Ok(state.chats.clone())
    }

    async fn send_message(
        &self,
        session_token: &str,
        chat_id: &str,
        content: &str,
    ) -> PortResult<String> {
        let mut state = self.enter(FakeOp::SendMessage).await?;
        state.next_id += 1;
        let external_id = format!("fake_{}", state.next_id);
        state.sent.push(SentMessage {
            session_token: session_token.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            external_id: external_id.clone(),
        });
        Ok(external_id)
    }

    async fn fetch_history(
        &self,
        _session_token: &str,
        chat_id: &str,
        limit: usize,
    ) -> PortResult<Vec<ProviderMessage>> {
        let state = self.enter(FakeOp::FetchHistory).await?;
        let history = state.histories.get(chat_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(history[history.len().saturating_sub(limit)..].to_vec())
    }

    async fn mark_seen(&self, _session_token: &str, _chat_id: &str) -> PortResult<()> {
        self.enter(FakeOp::MarkSeen).await.map(|_| ())
    }

    async fn logout(&self, session_token: &str) -> PortResult<()> {
        let mut state = self.enter(FakeOp::Logout).await?;
        state.connections.remove(session_token);
        Ok(())
    }
}
