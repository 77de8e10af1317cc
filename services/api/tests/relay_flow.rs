mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{connection_event, harness, message_event, status_event};
use std::collections::HashSet;
use std::time::Duration;
use wa_bridge_core::ports::{MessageRepository, PortError, ProviderConnection};
use wa_bridge_core::{
    ChatSummary, Direction, Ingested, Message, MessageStatus, Notification, PageCursor,
    ProviderMessage, QrCode, RelayError, SessionState,
};

use api_lib::adapters::FakeOp;

//=========================================================================================
// Pairing
//=========================================================================================

#[tokio::test]
async fn pairing_send_and_delivery_scenario() {
    let h = harness();

    let session_id = h.relay.connect(7, "work").await.unwrap();
    let status = h.relay.get_status(session_id).await.unwrap();
    assert_eq!(status.state, SessionState::Connecting);
    assert!(h.relay.get_qr(session_id).await.unwrap().is_some());
    let token = status.session_token.unwrap();
    assert!(token.starts_with("sess_7_"));

    let outcome = h.relay.ingest(&connection_event(&token, "connected")).await.unwrap();
    assert_eq!(outcome, Ingested::Applied);
    let status = h.relay.get_status(session_id).await.unwrap();
    assert_eq!(status.state, SessionState::Connected);
    assert!(status.last_connected.is_some());

    let mut events = h.relay.subscribe(session_id);
    let sent = h.relay.send(session_id, "123@c.us", "hi").await.unwrap();
    assert_eq!(sent.status, MessageStatus::Sent);
    let external = sent.external_message_id.clone().unwrap();
    assert_eq!(h.gateway.sent()[0].content, "hi");

    let delivered = status_event(&token, &external, "delivered");
    assert_eq!(h.relay.ingest(&delivered).await.unwrap(), Ingested::Applied);
    assert_eq!(h.relay.ingest(&delivered).await.unwrap(), Ingested::Duplicate);

    let history = h.relay.list_messages(session_id, "123@c.us", 50, None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, sent.id);
    assert_eq!(history[0].status, MessageStatus::Delivered);

    assert_eq!(
        events.recv().await,
        Some(Notification::StatusUpdate {
            message_id: sent.id,
            status: MessageStatus::Sent
        })
    );
    assert_eq!(
        events.recv().await,
        Some(Notification::StatusUpdate {
            message_id: sent.id,
            status: MessageStatus::Delivered
        })
    );
    assert!(tokio::time::timeout(Duration::from_millis(20), events.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn connect_reuses_the_named_session() {
    let h = harness();
    let first = h.relay.connect(7, "work").await.unwrap();
    let again = h.relay.connect(7, "work").await.unwrap();
    let other_user = h.relay.connect(8, "work").await.unwrap();

    assert_eq!(first, again);
    assert_ne!(first, other_user);
    assert_eq!(h.gateway.calls(FakeOp::RequestQr), 3);
}

#[tokio::test]
async fn connect_on_connected_session_is_rejected() {
    let h = harness();
    let (session_id, _) = h.connected_session(7, "work").await;

    let err = h.relay.connect(7, "work").await.unwrap_err();
    assert!(matches!(err, RelayError::AlreadyConnected(id) if id == session_id));
    assert_eq!(
        h.relay.get_status(session_id).await.unwrap().state,
        SessionState::Connected
    );
}

#[tokio::test]
async fn failed_qr_request_rolls_back_to_disconnected() {
    let h = harness();
    for _ in 0..3 {
        h.gateway
            .fail_next(FakeOp::RequestQr, PortError::Unavailable("bridge down".into()));
    }

    let err = h.relay.connect(7, "work").await.unwrap_err();
    assert!(matches!(err, RelayError::ProviderUnavailable(_)));
    assert_eq!(h.gateway.calls(FakeOp::RequestQr), 3);

    let session = h.relay.sessions().open(7, "work").await.unwrap();
    assert_eq!(session.state, SessionState::Disconnected);
    assert!(session.qr_code.is_none());
}

#[tokio::test]
async fn transient_qr_failure_is_retried() {
    let h = harness();
    h.gateway
        .fail_next(FakeOp::RequestQr, PortError::Unavailable("starting".into()));

    let session_id = h.relay.connect(7, "work").await.unwrap();
    assert_eq!(h.gateway.calls(FakeOp::RequestQr), 2);
    assert!(h.relay.get_qr(session_id).await.unwrap().is_some());
}

#[tokio::test]
async fn duplicate_pairing_confirmation_is_a_no_op() {
    let h = harness();
    let (session_id, token) = h.connected_session(7, "work").await;
    let first = h.relay.session(session_id).await.unwrap().last_connected;

    let outcome = h.relay.ingest(&connection_event(&token, "connected")).await.unwrap();
    assert_eq!(outcome, Ingested::Duplicate);
    assert_eq!(h.relay.session(session_id).await.unwrap().last_connected, first);
}

#[tokio::test]
async fn pairing_clears_the_qr_code() {
    let h = harness();
    let (session_id, _) = h.connected_session(7, "work").await;
    assert!(h.relay.get_qr(session_id).await.unwrap().is_none());
}

#[tokio::test]
async fn rotated_qr_code_replaces_the_pending_one() {
    let h = harness();
    let session_id = h.relay.connect(7, "work").await.unwrap();
    let token = h.token(session_id).await;

    let rotated = QrCode::new(vec![0x89, b'P', b'N', b'G', 1, 2, 3]);
    let event = serde_json::json!({
        "type": "connection_update",
        "session_id": token,
        "status": "connecting",
        "qr_code": rotated.to_base64(),
    });
    assert_eq!(h.relay.ingest(&event).await.unwrap(), Ingested::Applied);
    assert_eq!(h.relay.get_qr(session_id).await.unwrap(), Some(rotated));
    assert_eq!(h.relay.ingest(&event).await.unwrap(), Ingested::Duplicate);
}

#[tokio::test]
async fn status_poll_promotes_on_provider_confirmation() {
    let h = harness();
    let session_id = h.relay.connect(7, "work").await.unwrap();
    let token = h.token(session_id).await;

    // Still pairing: the poll must not promote on its own.
    assert_eq!(
        h.relay.get_status(session_id).await.unwrap().state,
        SessionState::Connecting
    );

    h.gateway.set_connection(&token, ProviderConnection::Connected);
    let status = h.relay.get_status(session_id).await.unwrap();
    assert_eq!(status.state, SessionState::Connected);
    assert!(status.last_connected.is_some());
}

#[tokio::test]
async fn status_poll_resets_a_session_the_provider_forgot() {
    let h = harness();
    let session_id = h.relay.connect(7, "work").await.unwrap();
    let token = h.token(session_id).await;
    h.gateway.set_connection(&token, ProviderConnection::Unpaired);

    let status = h.relay.get_status(session_id).await.unwrap();
    assert_eq!(status.state, SessionState::Disconnected);
    assert_eq!(status.session_token, None);
}

#[tokio::test]
async fn status_poll_failure_returns_the_stored_state() {
    let h = harness();
    let session_id = h.relay.connect(7, "work").await.unwrap();
    for _ in 0..3 {
        h.gateway
            .fail_next(FakeOp::QueryStatus, PortError::Unavailable("timeout".into()));
    }

    let status = h.relay.get_status(session_id).await.unwrap();
    assert_eq!(status.state, SessionState::Connecting);
}

#[tokio::test]
async fn connected_status_does_not_poll_the_provider() {
    let h = harness();
    let (session_id, _) = h.connected_session(7, "work").await;
    h.relay.get_status(session_id).await.unwrap();
    assert_eq!(h.gateway.calls(FakeOp::QueryStatus), 0);
}

//=========================================================================================
// Disconnect
//=========================================================================================

#[tokio::test]
async fn disconnect_is_idempotent_from_every_state() {
    let h = harness();

    let idle = h.relay.sessions().open(1, "idle").await.unwrap().id;
    let pairing = h.relay.connect(2, "pairing").await.unwrap();
    let (connected, _) = h.connected_session(3, "live").await;

    for session_id in [idle, pairing, connected] {
        for _ in 0..3 {
            h.relay.disconnect(session_id).await.unwrap();
        }
        let session = h.relay.session(session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Disconnected);
        assert!(session.external_session_token.is_none());
        assert!(session.qr_code.is_none());
    }
    // Only the two sessions that held a token were logged out, once each.
    assert_eq!(h.gateway.calls(FakeOp::Logout), 2);
}

#[tokio::test]
async fn disconnect_succeeds_when_provider_logout_fails() {
    let h = harness();
    let (session_id, _) = h.connected_session(7, "work").await;
    h.gateway
        .fail_next(FakeOp::Logout, PortError::Unavailable("bridge down".into()));

    h.relay.disconnect(session_id).await.unwrap();
    assert_eq!(
        h.relay.session(session_id).await.unwrap().state,
        SessionState::Disconnected
    );
}

#[tokio::test]
async fn provider_disconnect_event_resets_without_logout() {
    let h = harness();
    let (session_id, token) = h.connected_session(7, "work").await;
    let mut events = h.relay.subscribe(session_id);

    let outcome = h.relay.ingest(&connection_event(&token, "disconnected")).await.unwrap();
    assert_eq!(outcome, Ingested::Applied);
    assert_eq!(h.gateway.calls(FakeOp::Logout), 0);
    assert_eq!(
        events.recv().await,
        Some(Notification::ConnectionUpdate {
            session_id,
            state: SessionState::Disconnected
        })
    );

    // The old token no longer resolves.
    let err = h.relay.ingest(&connection_event(&token, "connected")).await.unwrap_err();
    assert!(matches!(err, RelayError::UnknownSession(_)));
}

#[tokio::test]
async fn reconnect_after_disconnect_issues_a_new_token() {
    let h = harness();
    let (session_id, first) = h.connected_session(7, "work").await;
    h.relay.disconnect(session_id).await.unwrap();

    assert_eq!(h.relay.connect(7, "work").await.unwrap(), session_id);
    let second = h.token(session_id).await;
    assert_ne!(first, second);
}

//=========================================================================================
// Sending
//=========================================================================================

#[tokio::test]
async fn send_requires_a_connected_session_and_stores_nothing() {
    let h = harness();
    let idle = h.relay.sessions().open(1, "idle").await.unwrap().id;
    let pairing = h.relay.connect(2, "pairing").await.unwrap();

    for session_id in [idle, pairing] {
        let err = h.relay.send(session_id, "123@c.us", "hi").await.unwrap_err();
        assert!(matches!(err, RelayError::NotConnected(id) if id == session_id));
    }
    assert_eq!(h.store.message_count(), 0);
    assert_eq!(h.gateway.calls(FakeOp::SendMessage), 0);
}

#[tokio::test]
async fn transient_send_failure_is_retried() {
    let h = harness();
    let (session_id, _) = h.connected_session(7, "work").await;
    h.gateway
        .fail_next(FakeOp::SendMessage, PortError::Unavailable("timeout".into()));

    let sent = h.relay.send(session_id, "123@c.us", "hi").await.unwrap();
    assert_eq!(sent.status, MessageStatus::Sent);
    assert_eq!(h.gateway.calls(FakeOp::SendMessage), 2);
}

#[tokio::test]
async fn exhausted_retries_fail_the_message() {
    let h = harness();
    let (session_id, _) = h.connected_session(7, "work").await;
    for _ in 0..3 {
        h.gateway
            .fail_next(FakeOp::SendMessage, PortError::Unavailable("timeout".into()));
    }

    let err = h.relay.send(session_id, "123@c.us", "hi").await.unwrap_err();
    let message_id = match err {
        RelayError::SendFailed { message_id, .. } => message_id,
        other => panic!("unexpected error {:?}", other),
    };
    assert_eq!(h.gateway.calls(FakeOp::SendMessage), 3);

    let history = h.relay.list_messages(session_id, "123@c.us", 10, None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, message_id);
    assert_eq!(history[0].status, MessageStatus::Failed);
    assert!(history[0].external_message_id.is_none());
}

#[tokio::test]
async fn rejected_send_fails_immediately() {
    let h = harness();
    let (session_id, _) = h.connected_session(7, "work").await;
    h.gateway
        .fail_next(FakeOp::SendMessage, PortError::Rejected("invalid chat id".into()));

    let err = h.relay.send(session_id, "nobody", "hi").await.unwrap_err();
    assert!(matches!(err, RelayError::ProviderRejected(_)));
    assert_eq!(h.gateway.calls(FakeOp::SendMessage), 1);

    let history = h.relay.list_messages(session_id, "nobody", 10, None).await.unwrap();
    assert_eq!(history[0].status, MessageStatus::Failed);
}

#[tokio::test]
async fn send_result_is_recorded_once() {
    let h = harness();
    let (session_id, _) = h.connected_session(7, "work").await;
    let sent = h.relay.send(session_id, "123@c.us", "hi").await.unwrap();

    let again = h
        .relay
        .store()
        .record_send_result(sent.id, None, false)
        .await
        .unwrap();
    assert!(!again.is_applied());
    assert_eq!(again.get().status, MessageStatus::Sent);
}

//=========================================================================================
// Status Lattice
//=========================================================================================

fn permutations(items: &[MessageStatus]) -> Vec<Vec<MessageStatus>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head);
            out.push(tail);
        }
    }
    out
}

#[tokio::test]
async fn status_updates_in_any_order_end_at_the_highest_rank() {
    let h = harness();
    let (session_id, token) = h.connected_session(7, "work").await;
    let updates = [
        MessageStatus::Pending,
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Read,
    ];

    for order in permutations(&updates) {
        let sent = h.relay.send(session_id, "123@c.us", "hi").await.unwrap();
        let external = sent.external_message_id.unwrap();
        for status in &order {
            h.relay
                .ingest(&status_event(&token, &external, status.as_str()))
                .await
                .unwrap();
        }
        let stored = h
            .store
            .get_message(sent.id)
            .await
            .unwrap();
        assert_eq!(stored.status, MessageStatus::Read, "order {:?}", order);
    }
}

#[tokio::test]
async fn failed_is_terminal_and_only_reachable_before_delivery() {
    let h = harness();
    let (session_id, token) = h.connected_session(7, "work").await;

    let early = h.relay.send(session_id, "123@c.us", "a").await.unwrap();
    let early_ext = early.external_message_id.unwrap();
    for status in ["failed", "delivered", "read"] {
        h.relay
            .ingest(&status_event(&token, &early_ext, status))
            .await
            .unwrap();
    }
    assert_eq!(
        h.store.get_message(early.id).await.unwrap().status,
        MessageStatus::Failed
    );

    let late = h.relay.send(session_id, "123@c.us", "b").await.unwrap();
    let late_ext = late.external_message_id.unwrap();
    for status in ["delivered", "failed"] {
        h.relay
            .ingest(&status_event(&token, &late_ext, status))
            .await
            .unwrap();
    }
    assert_eq!(
        h.store.get_message(late.id).await.unwrap().status,
        MessageStatus::Delivered
    );
}

//=========================================================================================
// Incoming Messages
//=========================================================================================

#[tokio::test]
async fn redelivered_message_is_stored_once() {
    let h = harness();
    let (session_id, token) = h.connected_session(7, "work").await;
    let mut events = h.relay.subscribe(session_id);

    let event = message_event(&token, "123@c.us", "EXT1", "hello");
    assert_eq!(h.relay.ingest(&event).await.unwrap(), Ingested::Applied);
    assert_eq!(h.relay.ingest(&event).await.unwrap(), Ingested::Duplicate);
    assert_eq!(h.store.message_count(), 1);

    match events.recv().await {
        Some(Notification::NewMessage {
            session_id: sid,
            chat_id,
            content,
            ..
        }) => {
            assert_eq!(sid, session_id);
            assert_eq!(chat_id, "123@c.us");
            assert_eq!(content, "hello");
        }
        other => panic!("unexpected notification {:?}", other),
    }
    assert!(tokio::time::timeout(Duration::from_millis(20), events.recv())
        .await
        .is_err());

    let stored = h.relay.list_messages(session_id, "123@c.us", 10, None).await.unwrap();
    assert_eq!(stored[0].status, MessageStatus::Delivered);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redelivery_is_stored_once() {
    let h = harness();
    let (_, token) = h.connected_session(7, "work").await;
    let event = message_event(&token, "123@c.us", "EXT1", "hello");

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let relay = h.relay.clone();
            let event = event.clone();
            tokio::spawn(async move { relay.ingest(&event).await.unwrap() })
        })
        .collect();
    let outcomes = futures::future::join_all(tasks).await;

    let applied = outcomes
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|o| *o == Ingested::Applied)
        .count();
    assert_eq!(applied, 1);
    assert_eq!(h.store.message_count(), 1);
}

#[tokio::test]
async fn same_provider_id_in_two_sessions_is_two_messages() {
    let h = harness();
    let (_, first) = h.connected_session(7, "work").await;
    let (_, second) = h.connected_session(8, "home").await;

    h.relay.ingest(&message_event(&first, "c", "EXT1", "x")).await.unwrap();
    h.relay.ingest(&message_event(&second, "c", "EXT1", "x")).await.unwrap();
    assert_eq!(h.store.message_count(), 2);
}

#[tokio::test]
async fn mark_read_counts_unread_incoming_messages() {
    let h = harness();
    let (session_id, token) = h.connected_session(7, "work").await;
    for ext in ["A", "B", "C"] {
        h.relay
            .ingest(&message_event(&token, "123@c.us", ext, "hey"))
            .await
            .unwrap();
    }
    h.relay.ingest(&message_event(&token, "other", "D", "hey")).await.unwrap();
    h.relay.send(session_id, "123@c.us", "reply").await.unwrap();

    assert_eq!(h.relay.mark_read(session_id, "123@c.us").await.unwrap(), 3);
    assert_eq!(h.relay.mark_read(session_id, "123@c.us").await.unwrap(), 0);
    assert_eq!(h.gateway.calls(FakeOp::MarkSeen), 2);

    let history = h.relay.list_messages(session_id, "123@c.us", 10, None).await.unwrap();
    let outgoing: Vec<_> = history
        .iter()
        .filter(|m| m.status == MessageStatus::Sent)
        .collect();
    assert_eq!(outgoing.len(), 1);
}

#[tokio::test]
async fn mark_read_notifies_subscribers_of_each_message() {
    let h = harness();
    let (session_id, token) = h.connected_session(7, "work").await;
    h.relay.ingest(&message_event(&token, "123@c.us", "A", "hey")).await.unwrap();
    h.relay.ingest(&message_event(&token, "123@c.us", "B", "hey")).await.unwrap();
    let unread: HashSet<_> = h
        .relay
        .list_messages(session_id, "123@c.us", 10, None)
        .await
        .unwrap()
        .iter()
        .map(|m| m.id)
        .collect();

    let mut events = h.relay.subscribe(session_id);
    assert_eq!(h.relay.mark_read(session_id, "123@c.us").await.unwrap(), 2);

    let mut notified = HashSet::new();
    for _ in 0..2 {
        match events.recv().await {
            Some(Notification::StatusUpdate { message_id, status }) => {
                assert_eq!(status, MessageStatus::Read);
                notified.insert(message_id);
            }
            other => panic!("unexpected notification {:?}", other),
        }
    }
    assert_eq!(notified, unread);

    assert_eq!(h.relay.mark_read(session_id, "123@c.us").await.unwrap(), 0);
    let quiet = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
    assert!(quiet.is_err(), "no notification expected for an already read chat");
}

#[tokio::test]
async fn unread_count_spans_every_chat_of_the_session() {
    let h = harness();
    let (session_id, token) = h.connected_session(7, "work").await;
    assert_eq!(h.relay.unread_count(session_id).await.unwrap(), 0);

    for (chat_id, ext) in [("a", "A1"), ("a", "A2"), ("b", "B1")] {
        h.relay.ingest(&message_event(&token, chat_id, ext, "hey")).await.unwrap();
    }
    h.relay.send(session_id, "a", "reply").await.unwrap();
    assert_eq!(h.relay.unread_count(session_id).await.unwrap(), 3);

    h.relay.mark_read(session_id, "a").await.unwrap();
    assert_eq!(h.relay.unread_count(session_id).await.unwrap(), 1);

    let err = h.relay.unread_count(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, RelayError::SessionNotFound(_)));
}

#[tokio::test]
async fn active_session_is_the_connected_one() {
    let h = harness();
    assert!(h.relay.active_session(7).await.unwrap().is_none());

    let pairing = h.relay.connect(7, "pairing").await.unwrap();
    assert!(h.relay.active_session(7).await.unwrap().is_none());

    let (work, _) = h.connected_session(7, "work").await;
    h.connected_session(8, "other user").await;
    let active = h.relay.active_session(7).await.unwrap().unwrap();
    assert_eq!(active.id, work);
    assert_ne!(active.id, pairing);

    h.relay.disconnect(work).await.unwrap();
    assert!(h.relay.active_session(7).await.unwrap().is_none());
}

fn provider_message(external_id: &str, direction: Direction) -> ProviderMessage {
    ProviderMessage {
        external_id: external_id.to_string(),
        chat_id: "123@c.us".to_string(),
        content: format!("body of {}", external_id),
        direction,
        status: MessageStatus::Delivered,
        timestamp: Some(1_700_000_000),
    }
}

#[tokio::test]
async fn provider_history_is_read_through_without_storing() {
    let h = harness();
    let pairing = h.relay.connect(1, "pairing").await.unwrap();
    assert!(matches!(
        h.relay.fetch_history(pairing, "123@c.us", 10).await.unwrap_err(),
        RelayError::NotConnected(_)
    ));

    let (session_id, _) = h.connected_session(7, "work").await;
    h.gateway.set_history(
        "123@c.us",
        vec![
            provider_message("P1", Direction::Incoming),
            provider_message("P2", Direction::Outgoing),
            provider_message("P3", Direction::Incoming),
        ],
    );

    let newest = h.relay.fetch_history(session_id, "123@c.us", 2).await.unwrap();
    let ids: Vec<_> = newest.iter().map(|m| m.external_id.as_str()).collect();
    assert_eq!(ids, ["P2", "P3"]);
    assert!(h.relay.fetch_history(session_id, "empty", 10).await.unwrap().is_empty());
    assert_eq!(h.store.message_count(), 0);

    for _ in 0..3 {
        h.gateway
            .fail_next(FakeOp::FetchHistory, PortError::Unavailable("timeout".into()));
    }
    assert!(matches!(
        h.relay.fetch_history(session_id, "123@c.us", 2).await.unwrap_err(),
        RelayError::ProviderUnavailable(_)
    ));
}

//=========================================================================================
// Webhook Failures
//=========================================================================================

#[tokio::test]
async fn webhook_failures_are_reported_and_do_not_stop_ingestion() {
    let h = harness();
    let (session_id, token) = h.connected_session(7, "work").await;

    let err = h
        .relay
        .ingest(&message_event("sess_unknown", "c", "E", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::UnknownSession(_)));

    let err = h
        .relay
        .ingest(&serde_json::json!({"type": "message", "session_id": token}))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::MalformedEvent(_)));

    let err = h
        .relay
        .ingest(&status_event(&token, "never_seen", "read"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::MessageNotFound(_)));

    // The pipeline keeps working.
    h.relay
        .ingest(&message_event(&token, "c", "E", "x"))
        .await
        .unwrap();
    assert_eq!(
        h.relay.list_messages(session_id, "c", 10, None).await.unwrap().len(),
        1
    );
}

//=========================================================================================
// Chats
//=========================================================================================

fn chat(id: &str) -> ChatSummary {
    ChatSummary {
        id: id.to_string(),
        name: id.to_string(),
        last_message: String::new(),
        unread: 0,
        timestamp: None,
    }
}

#[tokio::test]
async fn list_chats_requires_connection_and_falls_back_to_cache() {
    let h = harness();
    let pairing = h.relay.connect(1, "pairing").await.unwrap();
    assert!(matches!(
        h.relay.list_chats(pairing).await.unwrap_err(),
        RelayError::NotConnected(_)
    ));

    let (session_id, _) = h.connected_session(7, "work").await;
    h.gateway.set_chats(vec![chat("123@c.us"), chat("456@c.us")]);
    assert_eq!(h.relay.list_chats(session_id).await.unwrap().len(), 2);

    for _ in 0..3 {
        h.gateway
            .fail_next(FakeOp::ListChats, PortError::Unavailable("timeout".into()));
    }
    h.gateway.set_chats(vec![]);
    let cached = h.relay.list_chats(session_id).await.unwrap();
    assert_eq!(cached, vec![chat("123@c.us"), chat("456@c.us")]);
}

//=========================================================================================
// Pagination
//=========================================================================================

/// Seeds `n` incoming messages, three per timestamp, so ties are common.
async fn seed_history(h: &common::Harness, session_id: uuid::Uuid, n: usize) -> Vec<Message> {
    let base = Utc::now() - ChronoDuration::hours(1);
    let mut seeded = Vec::new();
    for i in 0..n {
        let mut message = Message::incoming(session_id, "chat", &format!("EXT{}", i), "m");
        message.created_at = base + ChronoDuration::seconds((i / 3) as i64);
        h.store.insert_message(&message).await.unwrap();
        seeded.push(message);
    }
    seeded
}

#[tokio::test]
async fn pagination_enumerates_every_message_exactly_once() {
    let h = harness();
    let session_id = h.relay.sessions().open(1, "history").await.unwrap().id;
    let seeded = seed_history(&h, session_id, 25).await;

    let mut seen = Vec::new();
    let mut cursor: Option<PageCursor> = None;
    loop {
        let page = h
            .relay
            .list_messages(session_id, "chat", 7, cursor)
            .await
            .unwrap();
        if page.is_empty() {
            break;
        }
        assert!(page.len() <= 7);
        cursor = page.last().map(Message::cursor);
        seen.extend(page);
    }

    assert_eq!(seen.len(), seeded.len());
    let unique: HashSet<_> = seen.iter().map(|m| m.id).collect();
    assert_eq!(unique.len(), seeded.len());
    for pair in seen.windows(2) {
        assert!((pair[0].created_at, pair[0].id) > (pair[1].created_at, pair[1].id));
    }
}

#[tokio::test]
async fn timestamp_only_cursor_pages_strictly_older_messages() {
    let h = harness();
    let session_id = h.relay.sessions().open(1, "history").await.unwrap().id;
    let seeded = seed_history(&h, session_id, 9).await;

    let cursor = PageCursor {
        created_at: seeded[6].created_at,
        id: None,
    };
    let page = h
        .relay
        .list_messages(session_id, "chat", 50, Some(cursor))
        .await
        .unwrap();
    assert_eq!(page.len(), 6);
    assert!(page.iter().all(|m| m.created_at < seeded[6].created_at));
}

#[tokio::test]
async fn stored_messages_never_share_a_timestamp() {
    let h = harness();
    let (session_id, token) = h.connected_session(7, "work").await;

    // A message stamped ahead of the clock forces every later one to be bumped past it.
    let mut ahead = Message::incoming(session_id, "chat", "AHEAD", "m");
    ahead.created_at = Utc::now() + ChronoDuration::hours(1);
    h.store.insert_message(&ahead).await.unwrap();

    for i in 0..4 {
        h.relay
            .ingest(&message_event(&token, "chat", &format!("E{}", i), "m"))
            .await
            .unwrap();
    }
    h.relay.send(session_id, "chat", "reply").await.unwrap();

    let mut cursor: Option<PageCursor> = None;
    let mut seen = Vec::new();
    loop {
        let page = h
            .relay
            .list_messages(session_id, "chat", 2, cursor)
            .await
            .unwrap();
        let Some(last) = page.last() else { break };
        cursor = Some(PageCursor {
            created_at: last.created_at,
            id: None,
        });
        seen.extend(page);
    }

    assert_eq!(seen.len(), 6);
    assert_eq!(seen.last().map(|m| m.id), Some(ahead.id));
    for pair in seen.windows(2) {
        assert_eq!(
            pair[0].created_at - pair[1].created_at,
            ChronoDuration::microseconds(1)
        );
    }
}

#[tokio::test]
async fn page_size_is_clamped() {
    let h = harness();
    let session_id = h.relay.sessions().open(1, "history").await.unwrap().id;
    seed_history(&h, session_id, 5).await;

    let page = h.relay.list_messages(session_id, "chat", 0, None).await.unwrap();
    assert_eq!(page.len(), 1);
}

#[tokio::test]
async fn history_of_unknown_session_is_not_found() {
    let h = harness();
    let err = h
        .relay
        .list_messages(uuid::Uuid::new_v4(), "chat", 10, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::SessionNotFound(_)));
}
