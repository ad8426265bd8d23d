//! End-to-end flows through `SessionRuntime`
//!
//! Protocol answers and framework requests travel on separate queues, so each
//! step waits for the framework event proving the previous one was applied.

use std::sync::Arc;
use std::time::Duration;

use imbridge_core::framework::{ConnectionStatus, FrameworkEvent};
use imbridge_core::protocol::{MessageData, ProtocolEvent};
use imbridge_core::state::MemoryStateStore;
use imbridge_core::test_utils::*;
use imbridge_core::{
    Challenge, Connection, HandleType, Peer, ProtocolEventSender, SessionError, SessionHandle, SessionRuntime,
};

const WAIT: Duration = Duration::from_secs(5);

fn spawn_runtime() -> (
    SessionHandle,
    ProtocolEventSender,
    tokio::task::JoinHandle<()>,
    Arc<MockProtocol>,
) {
    let protocol = Arc::new(MockProtocol::new());
    protocol.add_user(2, TestUserBuilder::new("Grace").last_name("Hopper").build());
    let connection = Connection::new(
        protocol.clone(),
        test_context(),
        test_account(),
        Box::new(MemoryStateStore::new()),
    );
    let (handle, events, task) = SessionRuntime::spawn(connection);
    (handle, events, task, protocol)
}

async fn bring_up(handle: &SessionHandle, events: &ProtocolEventSender) {
    let mut rx = handle.subscribe();

    handle.connect().await.unwrap();
    for event in transport_up_events() {
        events.send(event).await.unwrap();
    }
    recv_matching(&mut rx, WAIT, |e| {
        matches!(e, FrameworkEvent::AuthChallenge { challenge: Challenge::AuthCode })
    })
    .await
    .unwrap();

    handle.submit_auth_code("13579").await.unwrap();
    for event in sign_in_complete_events(1, vec![2], vec![]) {
        events.send(event).await.unwrap();
    }
    recv_matching(&mut rx, WAIT, |e| {
        matches!(e, FrameworkEvent::StatusChanged { status: ConnectionStatus::Connected, .. })
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_send_and_confirm_through_runtime() {
    let (handle, events, task, protocol) = spawn_runtime();
    bring_up(&handle, &events).await;
    let mut rx = handle.subscribe();

    let handles = handle
        .request_handles(HandleType::Contact, vec!["user2".into(), "user2".into()])
        .await
        .unwrap();
    assert_eq!(handles[0], handles[1]);

    let (channel, created) = handle.ensure_text_channel(HandleType::Contact, handles[0]).await.unwrap();
    assert!(created);
    assert!(!channel.incoming);
    let token = handle.send_message(channel.id, "ping").await.unwrap();
    assert_ne!(token, 0);
    assert_eq!(
        protocol.count_calls(|call| matches!(call, ProtocolCall::SendMessage { token: t, .. } if *t == token)),
        1
    );

    events
        .send(ProtocolEvent::MessageSent { peer: Peer::User(2), token, message_id: 42 })
        .await
        .unwrap();
    let sent = recv_matching(&mut rx, WAIT, |e| matches!(e, FrameworkEvent::MessageSent { .. }))
        .await
        .unwrap();
    assert_eq!(sent, FrameworkEvent::MessageSent { channel: channel.id, token, message_id: 42 });

    // the engine echoes our own message; it must not come back as received
    protocol.add_message(Peer::User(2), 42, MessageData {
        sender: 1,
        text: "ping".into(),
        timestamp: 100,
        outgoing: true,
    });
    protocol.add_message(Peer::User(2), 43, incoming_text(2, "pong", 101));
    events.send(ProtocolEvent::NewMessage { peer: Peer::User(2), message_id: 42 }).await.unwrap();
    events.send(ProtocolEvent::NewMessage { peer: Peer::User(2), message_id: 43 }).await.unwrap();

    let received = recv_matching(&mut rx, WAIT, |e| matches!(e, FrameworkEvent::MessageReceived { .. }))
        .await
        .unwrap();
    match received {
        FrameworkEvent::MessageReceived { message, .. } => assert_eq!(message.id, 43),
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(handle.conversation(Peer::User(2)).await.unwrap(), vec![42, 43]);

    handle.shutdown().await.unwrap();
    assert_completes_within(WAIT, task).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_send_fails_after_timeout() {
    let (handle, events, task, _protocol) = spawn_runtime();
    bring_up(&handle, &events).await;
    let mut rx = handle.subscribe();

    let (channel, _) = handle.ensure_text_channel(HandleType::Contact, 2).await.unwrap();
    let token = handle.send_message(channel.id, "anyone there?").await.unwrap();

    let failed = recv_matching(&mut rx, Duration::from_secs(3600), |e| {
        matches!(e, FrameworkEvent::MessageSendFailed { .. })
    })
    .await
    .unwrap();
    match failed {
        FrameworkEvent::MessageSendFailed { token: failed_token, error, .. } => {
            assert_eq!(failed_token, token);
            assert!(matches!(error, SessionError::OperationTimeout { .. }));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_requests_fail_individually_before_ready() {
    let (handle, _events, task, _protocol) = spawn_runtime();

    let err = handle.get_presences(vec![1]).await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidStateTransition { .. }));
    assert_eq!(handle.status().await.unwrap(), ConnectionStatus::Disconnected);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert!(matches!(handle.status().await, Err(SessionError::RuntimeStopped)));
}
