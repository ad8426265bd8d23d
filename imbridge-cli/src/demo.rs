//! Scripted session against the in-memory protocol engine
//!
//! Plays the protocol side by hand: sign-in, initial sync, one sent message
//! with its confirmation, one incoming reply.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use imbridge_core::config::Config;
use imbridge_core::framework::{ConnectionStatus, ContactInterface, FrameworkEvent};
use imbridge_core::protocol::{ChatInfo, ProtocolEvent};
use imbridge_core::state::{FileStateStore, MemoryStateStore, StateStore};
use imbridge_core::test_utils::{
    incoming_text, recv_matching, sign_in_complete_events, transport_up_events, MockProtocol,
    TestUserBuilder, TEST_PHONE,
};
use imbridge_core::{Connection, HandleType, Peer, SessionContext, SessionRuntime};
use tokio::sync::broadcast;
use tracing::info;

const SELF_ID: u32 = 1;
const CONTACT_ID: u32 = 2;
const CHAT_ID: u32 = 10;
const WAIT: Duration = Duration::from_secs(5);

async fn wait_for(
    rx: &mut broadcast::Receiver<FrameworkEvent>,
    what: &str,
    predicate: impl FnMut(&FrameworkEvent) -> bool,
) -> Result<FrameworkEvent> {
    match recv_matching(rx, WAIT, predicate).await {
        Ok(event) => Ok(event),
        Err(e) => bail!("waiting for {}: {}", what, e),
    }
}

/// Run the demo; returns a one-line summary
pub async fn run(mut config: Config, message: &str) -> Result<String> {
    if config.account.phone.is_none() {
        config.account.phone = Some(TEST_PHONE.to_string());
    }

    let protocol = Arc::new(MockProtocol::new());
    protocol.add_user(
        CONTACT_ID,
        TestUserBuilder::new("Grace").last_name("Hopper").username("grace").build(),
    );
    protocol.add_chat(
        CHAT_ID,
        ChatInfo {
            title: "Compilers".to_string(),
            members: vec![SELF_ID, CONTACT_ID],
            avatar_token: None,
        },
    );

    let store: Box<dyn StateStore> = match &config.state.path {
        Some(path) => Box::new(FileStateStore::new(path)),
        None => Box::new(MemoryStateStore::new()),
    };
    let ctx = SessionContext::new(config.session.clone());
    let connection = Connection::new(protocol.clone(), ctx, config.account.clone(), store);
    let (session, engine, task) = SessionRuntime::spawn(connection);
    let mut rx = session.subscribe();

    session.connect().await?;
    for event in transport_up_events() {
        engine.send(event).await?;
    }
    wait_for(&mut rx, "auth challenge", |e| matches!(e, FrameworkEvent::AuthChallenge { .. })).await?;
    session.submit_auth_code("12345").await?;

    for event in sign_in_complete_events(SELF_ID, vec![CONTACT_ID], vec![Peer::Chat(CHAT_ID)]) {
        engine.send(event).await?;
    }
    wait_for(&mut rx, "ready", |e| {
        matches!(e, FrameworkEvent::StatusChanged { status: ConnectionStatus::Connected, .. })
    })
    .await?;
    info!("Demo session ready");

    let handle = session
        .request_handles(HandleType::Contact, vec![Peer::User(CONTACT_ID).to_identifier()])
        .await?[0];
    let (channel, _) = session.ensure_text_channel(HandleType::Contact, handle).await?;
    let token = session.send_message(channel.id, message).await?;
    engine
        .send(ProtocolEvent::MessageSent {
            peer: Peer::User(CONTACT_ID),
            token,
            message_id: 100,
        })
        .await?;
    wait_for(&mut rx, "send confirmation", |e| matches!(e, FrameworkEvent::MessageSent { .. })).await?;

    protocol.add_message(Peer::User(CONTACT_ID), 101, incoming_text(CONTACT_ID, "Hi there!", 1_700_000_000));
    engine
        .send(ProtocolEvent::NewMessage {
            peer: Peer::User(CONTACT_ID),
            message_id: 101,
        })
        .await?;
    let reply = match wait_for(&mut rx, "reply", |e| matches!(e, FrameworkEvent::MessageReceived { .. })).await? {
        FrameworkEvent::MessageReceived { message, .. } => message.text,
        _ => String::new(),
    };

    let attributes = session
        .get_contact_attributes(vec![handle], vec![ContactInterface::Alias])
        .await?;
    let alias = attributes
        .items
        .get(&handle)
        .and_then(|a| a.alias.clone())
        .unwrap_or_default();

    session.shutdown().await?;
    task.await?;

    Ok(format!(
        "sent {:?} to {} (token {:016x}), got reply {:?}",
        message, alias, token, reply
    ))
}
