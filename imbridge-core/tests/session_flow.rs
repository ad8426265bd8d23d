//! Session behaviour driven through `Connection` with the mock engine

use std::sync::Arc;

use imbridge_core::auth::AuthState;
use imbridge_core::framework::{
    ConnectionStatus, ContactInterface, FrameworkEvent, StatusReason, SubscriptionState,
};
use imbridge_core::protocol::{
    AuthErrorCode, AvatarData, DropReason, ProtocolEvent, RoomInfo, TransportStatus,
};
use imbridge_core::state::{FileStateStore, MemoryStateStore, StateStore};
use imbridge_core::test_utils::*;
use imbridge_core::{Connection, HandleType, Peer, SessionError};
use tempfile::TempDir;

type TestConnection = Connection<MockProtocol>;

fn new_connection(store: Box<dyn StateStore>) -> (TestConnection, Arc<MockProtocol>) {
    let protocol = Arc::new(MockProtocol::new());
    protocol.add_user(2, TestUserBuilder::new("Grace").last_name("Hopper").username("grace").phone("15550002").avatar("av-2").build());
    protocol.add_user(3, TestUserBuilder::new("").username("linus").build());
    let connection = Connection::new(protocol.clone(), test_context(), test_account(), store);
    (connection, protocol)
}

async fn feed(conn: &mut TestConnection, events: Vec<ProtocolEvent>) {
    for event in events {
        conn.handle_protocol_event(event).await.unwrap();
    }
}

/// Self user 1, contacts 2 and 3, one group chat 10
async fn sign_in(conn: &mut TestConnection) {
    conn.connect().await.unwrap();
    feed(conn, transport_up_events()).await;
    conn.submit_auth_code("24680").await.unwrap();
    feed(conn, sign_in_complete_events(1, vec![2, 3], vec![Peer::Chat(10)])).await;
    assert_eq!(conn.auth_state(), AuthState::Ready);
}

fn transport(status: TransportStatus, reason: DropReason) -> ProtocolEvent {
    ProtocolEvent::ConnectionStatusChanged { status, reason }
}

#[tokio::test]
async fn test_batch_attributes_with_valid_and_invalid_handle() {
    let (mut conn, _protocol) = new_connection(Box::new(MemoryStateStore::new()));
    sign_in(&mut conn).await;

    let batch = conn
        .get_contact_attributes(&[2, 99], &[ContactInterface::Alias, ContactInterface::ContactList])
        .unwrap();

    assert_eq!(batch.items.len(), 1);
    let grace = &batch.items[&2];
    assert_eq!(grace.identifier, "user2");
    assert_eq!(grace.alias.as_deref(), Some("Grace Hopper"));
    assert_eq!(grace.subscription, Some(SubscriptionState::Yes));
    assert!(grace.presence.is_none());

    assert_eq!(
        batch.errors[&99],
        SessionError::UnknownHandle { handle: 99, handle_type: HandleType::Contact }
    );
}

#[tokio::test]
async fn test_alias_falls_back_to_username_then_identifier() {
    let (mut conn, _protocol) = new_connection(Box::new(MemoryStateStore::new()));
    sign_in(&mut conn).await;
    let handles = conn
        .request_handles(HandleType::Contact, &["user3".into(), "user44".into()])
        .unwrap();

    let aliases = conn.get_aliases(HandleType::Contact, &handles).unwrap();
    assert_eq!(aliases.items[&handles[0]], "linus");
    assert_eq!(aliases.items[&handles[1]], "user44");
}

#[tokio::test]
async fn test_contact_info_fields() {
    let (mut conn, _protocol) = new_connection(Box::new(MemoryStateStore::new()));
    sign_in(&mut conn).await;

    let fields = conn.request_contact_info(2).unwrap();
    let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["fn", "nickname", "x-telegram-profile", "tel"]);
    assert_eq!(fields[2].values, vec!["https://t.me/grace".to_string()]);
    assert_eq!(fields[3].values, vec!["+15550002".to_string()]);

    let handle = conn.request_handles(HandleType::Contact, &["user50".into()]).unwrap()[0];
    assert!(matches!(conn.request_contact_info(handle), Err(SessionError::NotAvailable(_))));
}

#[tokio::test]
async fn test_sync_messages_stored_in_ascending_order() {
    let (mut conn, protocol) = new_connection(Box::new(MemoryStateStore::new()));
    sign_in(&mut conn).await;
    for id in [5, 3, 4] {
        protocol.add_message(Peer::Chat(10), id, incoming_text(2, &format!("m{}", id), 1_000 + id as u64));
    }

    let mut rx = conn.context().events.subscribe();
    feed(&mut conn, vec![ProtocolEvent::SyncMessages { peer: Peer::Chat(10), message_ids: vec![5, 3, 4] }]).await;

    assert_eq!(conn.conversation(&Peer::Chat(10)), vec![3, 4, 5]);
    let delivered: Vec<u32> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            FrameworkEvent::MessageReceived { message, .. } => Some(message.id),
            _ => None,
        })
        .collect();
    assert_eq!(delivered, vec![3, 4, 5]);
}

#[tokio::test]
async fn test_incoming_message_opens_incoming_channel() {
    let (mut conn, protocol) = new_connection(Box::new(MemoryStateStore::new()));
    sign_in(&mut conn).await;
    protocol.add_message(Peer::User(3), 77, incoming_text(3, "hey", 5));

    let mut rx = conn.context().events.subscribe();
    feed(&mut conn, vec![ProtocolEvent::NewMessage { peer: Peer::User(3), message_id: 77 }]).await;

    let events = drain_events(&mut rx);
    match &events[0] {
        FrameworkEvent::ChannelOpened { channel } => {
            assert!(channel.incoming);
            assert_eq!(channel.target, Some((HandleType::Contact, 3)));
        }
        other => panic!("unexpected first event: {:?}", other),
    }
    assert!(matches!(&events[1], FrameworkEvent::MessageReceived { message, .. } if message.token == "77"));
}

#[tokio::test]
async fn test_room_list_cancel_after_two_rooms() {
    let (mut conn, protocol) = new_connection(Box::new(MemoryStateStore::new()));
    sign_in(&mut conn).await;
    let mut rx = conn.context().events.subscribe();

    conn.room_list_start_listing().await.unwrap();
    let operation = protocol.last_operation();
    for chat_id in [20, 21] {
        let rooms = vec![RoomInfo { chat_id, title: format!("room {}", chat_id), members: 4 }];
        feed(&mut conn, vec![ProtocolEvent::RoomsDiscovered { operation, rooms }]).await;
    }

    conn.room_list_stop_listing().await.unwrap();
    let rooms = vec![RoomInfo { chat_id: 22, title: "late".into(), members: 1 }];
    feed(&mut conn, vec![ProtocolEvent::RoomsDiscovered { operation, rooms }]).await;
    feed(&mut conn, vec![ProtocolEvent::RoomListingFinished { operation }]).await;

    let rows: usize = drain_events(&mut rx)
        .into_iter()
        .map(|event| match event {
            FrameworkEvent::RoomListRows { rows } => rows.len(),
            _ => 0,
        })
        .sum();
    assert_eq!(rows, 2);
    assert!(conn.channels().is_empty());

    // stopping again is harmless
    conn.room_list_stop_listing().await.unwrap();
}

#[tokio::test]
async fn test_password_before_code_is_rejected_and_two_factor_flow() {
    let (mut conn, protocol) = new_connection(Box::new(MemoryStateStore::new()));
    conn.connect().await.unwrap();
    feed(&mut conn, vec![
        transport(TransportStatus::Connected, DropReason::Requested),
        ProtocolEvent::AuthCodeRequired { two_factor: true },
    ])
    .await;

    let err = conn.submit_password("hunter2").await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::InvalidStateTransition { state: AuthState::AwaitingAuthCode, .. }
    ));

    conn.submit_auth_code("11111").await.unwrap();
    assert_eq!(conn.auth_state(), AuthState::AwaitingPassword);

    let mut rx = conn.context().events.subscribe();
    feed(&mut conn, vec![ProtocolEvent::PasswordRequired]).await;
    conn.submit_password("hunter2").await.unwrap();
    assert_eq!(conn.auth_state(), AuthState::SigningIn);

    let events = drain_events(&mut rx);
    assert!(events.contains(&FrameworkEvent::AuthAccepted { challenge: imbridge_core::Challenge::AuthCode }));
    assert!(protocol.calls().contains(&ProtocolCall::SubmitPassword("hunter2".into())));
}

#[tokio::test]
async fn test_auth_code_attempts_are_bounded() {
    let (mut conn, _protocol) = new_connection(Box::new(MemoryStateStore::new()));
    conn.connect().await.unwrap();
    feed(&mut conn, transport_up_events()).await;
    let mut rx = conn.context().events.subscribe();

    for attempt in 1..=3 {
        conn.submit_auth_code("00000").await.unwrap();
        feed(&mut conn, vec![ProtocolEvent::AuthError {
            code: AuthErrorCode::PhoneCodeInvalid,
            message: "PHONE_CODE_INVALID".into(),
        }])
        .await;
        if attempt < 3 {
            assert_eq!(conn.auth_state(), AuthState::AwaitingAuthCode);
        }
    }

    assert_eq!(conn.auth_state(), AuthState::Disconnected);
    assert!(!conn.has_session());
    assert!(matches!(
        conn.last_failure(),
        Some(SessionError::AuthenticationFailed { code: AuthErrorCode::PhoneCodeInvalid, .. })
    ));

    let events = drain_events(&mut rx);
    let retryable: Vec<bool> = events
        .iter()
        .filter_map(|event| match event {
            FrameworkEvent::AuthRejected { retryable, .. } => Some(*retryable),
            _ => None,
        })
        .collect();
    assert_eq!(retryable, vec![true, true, false]);
    assert_eq!(
        events.last(),
        Some(&FrameworkEvent::StatusChanged {
            status: ConnectionStatus::Disconnected,
            reason: StatusReason::AuthenticationFailed,
        })
    );
}

#[tokio::test]
async fn test_network_reconnect_keeps_handles() {
    let (mut conn, protocol) = new_connection(Box::new(MemoryStateStore::new()));
    protocol.set_session(Some(vec![0xab, 0xcd]));
    sign_in(&mut conn).await;
    let handle = conn.request_handles(HandleType::Contact, &["user77".into()]).unwrap()[0];

    feed(&mut conn, vec![transport(TransportStatus::Disconnected, DropReason::NetworkError)]).await;
    assert_eq!(conn.status(), ConnectionStatus::Connecting);
    assert!(conn.has_session());

    protocol.clear_calls();
    feed(&mut conn, vec![transport(TransportStatus::Connected, DropReason::Requested)]).await;
    assert_eq!(conn.auth_state(), AuthState::SigningIn);
    assert!(protocol.calls().contains(&ProtocolCall::CheckIn));

    feed(&mut conn, sign_in_complete_events(1, vec![2, 3], vec![])).await;
    assert_eq!(conn.status(), ConnectionStatus::Connected);
    assert_eq!(conn.inspect_handles(HandleType::Contact, &[handle]).unwrap(), vec!["user77"]);
}

#[tokio::test]
async fn test_reconnect_bound_gives_up() {
    let (mut conn, protocol) = new_connection(Box::new(MemoryStateStore::new()));
    sign_in(&mut conn).await;

    for _ in 0..4 {
        feed(&mut conn, vec![transport(TransportStatus::Disconnected, DropReason::NetworkError)]).await;
    }

    assert!(!conn.has_session());
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    // initial connect plus three reconnects
    assert_eq!(protocol.count_calls(|call| matches!(call, ProtocolCall::Connect(_))), 4);
}

#[tokio::test]
async fn test_account_invalidation_tears_down() {
    let store = Arc::new(MemoryStateStore::new());
    let (mut conn, protocol) = new_connection(Box::new(store.clone()));
    protocol.set_session(Some(vec![1, 2, 3]));
    sign_in(&mut conn).await;
    conn.ensure_text_channel(HandleType::Contact, 2).unwrap();
    assert!(conn.persisted_state().is_authorized());

    let mut rx = conn.context().events.subscribe();
    feed(&mut conn, vec![ProtocolEvent::AccountInvalidated { account: TEST_PHONE.into() }]).await;

    assert!(!conn.has_session());
    assert_eq!(conn.auth_state(), AuthState::Disconnected);
    assert!(!conn.persisted_state().is_authorized());
    assert!(!store.load().unwrap().is_authorized());

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(e, FrameworkEvent::ChannelClosed { .. })));
    assert_eq!(
        events.last(),
        Some(&FrameworkEvent::StatusChanged {
            status: ConnectionStatus::Disconnected,
            reason: StatusReason::SessionInvalidated,
        })
    );

    let err = conn.get_presences(&[2]).unwrap_err();
    assert!(matches!(err, SessionError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn test_resume_from_persisted_state() {
    let raw = format!(r#"{{"phone":"{}","server_port":443,"self_user_id":1,"session_data":"0a0b"}}"#, TEST_PHONE);
    let (mut conn, protocol) = new_connection(Box::new(MemoryStateStore::with_raw(raw)));

    conn.connect().await.unwrap();
    match &protocol.calls()[0] {
        ProtocolCall::Connect(params) => assert_eq!(params.session_data, Some(vec![0x0a, 0x0b])),
        other => panic!("unexpected call: {:?}", other),
    }

    feed(&mut conn, vec![transport(TransportStatus::Connected, DropReason::Requested)]).await;
    assert_eq!(conn.auth_state(), AuthState::SigningIn);
    assert!(protocol.calls().contains(&ProtocolCall::CheckIn));
}

#[tokio::test]
async fn test_corrupt_state_loads_as_fresh_session() {
    let (mut conn, protocol) = new_connection(Box::new(MemoryStateStore::with_raw("{ definitely not json")));
    assert!(!conn.persisted_state().is_authorized());

    conn.connect().await.unwrap();
    feed(&mut conn, vec![transport(TransportStatus::Connected, DropReason::Requested)]).await;
    assert!(protocol.calls().contains(&ProtocolCall::SignIn(TEST_PHONE.into())));
}

#[tokio::test]
async fn test_state_file_written_at_ready() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state").join("session.json");
    let (mut conn, protocol) = new_connection(Box::new(FileStateStore::new(&path)));
    protocol.set_session(Some(b"engine".to_vec()));
    sign_in(&mut conn).await;

    let saved = FileStateStore::new(&path).load().unwrap();
    assert_eq!(saved.self_user_id, Some(1));
    assert_eq!(saved.phone.as_deref(), Some(TEST_PHONE));
    assert_eq!(saved.session_bytes(), Some(b"engine".to_vec()));
}

#[tokio::test]
async fn test_avatar_fetch_and_cancellation() {
    let (mut conn, protocol) = new_connection(Box::new(MemoryStateStore::new()));
    sign_in(&mut conn).await;
    let mut rx = conn.context().events.subscribe();

    let tokens = conn.get_known_avatar_tokens(&[2, 3]).unwrap();
    assert_eq!(tokens.items[&2], "av-2");
    assert_eq!(tokens.items[&3], "");

    let batch = conn.request_avatars(&[2, 3]).await.unwrap();
    assert!(batch.is_complete());
    assert_eq!(protocol.count_calls(|call| matches!(call, ProtocolCall::FetchAvatar(_))), 1);
    let operation = protocol.last_operation();

    let avatar = AvatarData { token: "av-2".into(), mime_type: "image/jpeg".into(), bytes: vec![0xff, 0xd8] };
    feed(&mut conn, vec![ProtocolEvent::AvatarFetchCompleted {
        operation,
        peer: Peer::User(2),
        result: Ok(avatar.clone()),
    }])
    .await;
    assert!(drain_events(&mut rx).iter().any(|e| matches!(e, FrameworkEvent::AvatarRetrieved { handle: 2, .. })));

    conn.request_avatars(&[2]).await.unwrap();
    let operation = protocol.last_operation();
    conn.cancel_avatar_requests().await.unwrap();
    assert!(protocol.calls().contains(&ProtocolCall::CancelOperation(operation)));

    feed(&mut conn, vec![ProtocolEvent::AvatarFetchCompleted {
        operation,
        peer: Peer::User(2),
        result: Ok(avatar),
    }])
    .await;
    assert!(drain_events(&mut rx).is_empty());
}

#[tokio::test]
async fn test_remove_contacts_batch() {
    let (mut conn, protocol) = new_connection(Box::new(MemoryStateStore::new()));
    sign_in(&mut conn).await;
    let mut rx = conn.context().events.subscribe();

    let batch = conn.remove_contacts(&[3, 42]).await.unwrap();
    assert!(batch.items.contains_key(&3));
    assert!(batch.errors.contains_key(&42));
    assert!(protocol.calls().contains(&ProtocolCall::DeleteContacts(vec![3])));

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        FrameworkEvent::ContactListChanged { removed, .. } if removed.contains(&3)
    )));
    let listed = conn.get_contact_list_attributes(&[]).unwrap();
    assert_eq!(listed.items.keys().copied().collect::<Vec<_>>(), vec![2]);
}

#[tokio::test]
async fn test_explicit_disconnect_then_fresh_handles() {
    let (mut conn, _protocol) = new_connection(Box::new(MemoryStateStore::new()));
    sign_in(&mut conn).await;
    conn.request_handles(HandleType::Contact, &["user500".into()]).unwrap();

    conn.disconnect().await.unwrap();
    assert!(!conn.has_session());
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    conn.disconnect().await.unwrap();

    sign_in(&mut conn).await;
    // new scope: self, contact list, then the requested peer
    let handle = conn.request_handles(HandleType::Contact, &["user500".into()]).unwrap()[0];
    assert_eq!(handle, 4);
}
