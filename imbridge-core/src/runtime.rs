/*
    SessionRuntime

    Runs one Connection inside a single tokio task. Everything that touches
    session state goes through this task, so no two mutations ever overlap.

    ┌──────────────────┐   SessionCommand    ┌──────────────────────────┐
    │  SessionHandle   │────────────────────►│                          │
    │   (framework)    │◄── oneshot reply ───│      SessionRuntime      │
    └──────────────────┘                     │   select! {              │
    ┌──────────────────┐   ProtocolEvent     │     protocol events,     │
    │ProtocolEventSender────────────────────►│     commands,            │
    │ (protocol engine)│                     │     sweep tick }         │
    └──────────────────┘                     └────────────┬─────────────┘
                                                          │ FrameworkEvent
                                                          ▼
                                                   EventBroadcaster

    Protocol calls made by the connection only issue requests; their
    completions come back through the ProtocolEventSender, never inline.
*/

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::errors::{SessionError, SessionResult};
use crate::framework::{
    Batch, ChannelInfo, ChannelRequest, ConnectionStatus, ContactAttributes, ContactInfoField,
    ContactInterface, EventBroadcaster, FrameworkEvent,
};
use crate::presence::Presence;
use crate::protocol::{ProtocolClient, ProtocolEvent};
use crate::types::{ChannelId, CorrelationToken, Handle, HandleType, MessageId, Peer};

type Reply<T> = oneshot::Sender<SessionResult<T>>;

/// Framework requests handled by the session task
#[derive(Debug)]
pub enum SessionCommand {
    Connect { reply: Reply<()> },
    Disconnect { reply: Reply<()> },
    SubmitAuthCode { code: String, reply: Reply<()> },
    SubmitPassword { password: String, reply: Reply<()> },
    SelfHandle { reply: Reply<Handle> },
    Status { reply: Reply<ConnectionStatus> },
    RequestHandles { handle_type: HandleType, identifiers: Vec<String>, reply: Reply<Vec<Handle>> },
    InspectHandles { handle_type: HandleType, handles: Vec<Handle>, reply: Reply<Vec<String>> },
    CreateChannel { request: ChannelRequest, reply: Reply<ChannelInfo> },
    EnsureTextChannel { handle_type: HandleType, handle: Handle, reply: Reply<(ChannelInfo, bool)> },
    CloseChannel { channel: ChannelId, reply: Reply<()> },
    Channels { reply: Reply<Vec<ChannelInfo>> },
    Conversation { peer: Peer, reply: Reply<Vec<MessageId>> },
    SendMessage { channel: ChannelId, text: String, reply: Reply<CorrelationToken> },
    GetContactAttributes {
        handles: Vec<Handle>,
        interfaces: Vec<ContactInterface>,
        reply: Reply<Batch<ContactAttributes>>,
    },
    GetContactListAttributes { interfaces: Vec<ContactInterface>, reply: Reply<Batch<ContactAttributes>> },
    RemoveContacts { handles: Vec<Handle>, reply: Reply<Batch<()>> },
    GetPresences { handles: Vec<Handle>, reply: Reply<Batch<Presence>> },
    SetPresence { status: String, message: String, reply: Reply<()> },
    RequestContactInfo { handle: Handle, reply: Reply<Vec<ContactInfoField>> },
    GetContactInfo { handles: Vec<Handle>, reply: Reply<Batch<Vec<ContactInfoField>>> },
    GetAliases { handle_type: HandleType, handles: Vec<Handle>, reply: Reply<Batch<String>> },
    GetKnownAvatarTokens { handles: Vec<Handle>, reply: Reply<Batch<String>> },
    RequestAvatars { handles: Vec<Handle>, reply: Reply<Batch<()>> },
    CancelAvatarRequests { reply: Reply<()> },
    RoomListStartListing { reply: Reply<()> },
    RoomListStopListing { reply: Reply<()> },
    /// Persist state, disconnect and stop the task
    Shutdown { reply: Reply<()> },
}

/// Framework-side entry point to a running session
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionCommand>,
    events: EventBroadcaster,
}

impl SessionHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> SessionCommand) -> SessionResult<T> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .await
            .map_err(|_| SessionError::RuntimeStopped)?;
        response.await.map_err(|_| SessionError::RuntimeStopped)?
    }

    /// Receive framework notifications from now on
    pub fn subscribe(&self) -> broadcast::Receiver<FrameworkEvent> {
        self.events.subscribe()
    }

    pub async fn connect(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Connect { reply }).await
    }

    pub async fn disconnect(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Disconnect { reply }).await
    }

    pub async fn submit_auth_code(&self, code: impl Into<String>) -> SessionResult<()> {
        let code = code.into();
        self.request(|reply| SessionCommand::SubmitAuthCode { code, reply }).await
    }

    pub async fn submit_password(&self, password: impl Into<String>) -> SessionResult<()> {
        let password = password.into();
        self.request(|reply| SessionCommand::SubmitPassword { password, reply }).await
    }

    pub async fn self_handle(&self) -> SessionResult<Handle> {
        self.request(|reply| SessionCommand::SelfHandle { reply }).await
    }

    pub async fn status(&self) -> SessionResult<ConnectionStatus> {
        self.request(|reply| SessionCommand::Status { reply }).await
    }

    pub async fn request_handles(
        &self,
        handle_type: HandleType,
        identifiers: Vec<String>,
    ) -> SessionResult<Vec<Handle>> {
        self.request(|reply| SessionCommand::RequestHandles { handle_type, identifiers, reply })
            .await
    }

    pub async fn inspect_handles(&self, handle_type: HandleType, handles: Vec<Handle>) -> SessionResult<Vec<String>> {
        self.request(|reply| SessionCommand::InspectHandles { handle_type, handles, reply })
            .await
    }

    pub async fn create_channel(&self, request: ChannelRequest) -> SessionResult<ChannelInfo> {
        self.request(|reply| SessionCommand::CreateChannel { request, reply }).await
    }

    pub async fn ensure_text_channel(
        &self,
        handle_type: HandleType,
        handle: Handle,
    ) -> SessionResult<(ChannelInfo, bool)> {
        self.request(|reply| SessionCommand::EnsureTextChannel { handle_type, handle, reply })
            .await
    }

    pub async fn close_channel(&self, channel: ChannelId) -> SessionResult<()> {
        self.request(|reply| SessionCommand::CloseChannel { channel, reply }).await
    }

    pub async fn channels(&self) -> SessionResult<Vec<ChannelInfo>> {
        self.request(|reply| SessionCommand::Channels { reply }).await
    }

    /// Stored message ids of the conversation with `peer`
    pub async fn conversation(&self, peer: Peer) -> SessionResult<Vec<MessageId>> {
        self.request(|reply| SessionCommand::Conversation { peer, reply }).await
    }

    pub async fn send_message(&self, channel: ChannelId, text: impl Into<String>) -> SessionResult<CorrelationToken> {
        let text = text.into();
        self.request(|reply| SessionCommand::SendMessage { channel, text, reply }).await
    }

    pub async fn get_contact_attributes(
        &self,
        handles: Vec<Handle>,
        interfaces: Vec<ContactInterface>,
    ) -> SessionResult<Batch<ContactAttributes>> {
        self.request(|reply| SessionCommand::GetContactAttributes { handles, interfaces, reply })
            .await
    }

    pub async fn get_contact_list_attributes(
        &self,
        interfaces: Vec<ContactInterface>,
    ) -> SessionResult<Batch<ContactAttributes>> {
        self.request(|reply| SessionCommand::GetContactListAttributes { interfaces, reply })
            .await
    }

    pub async fn remove_contacts(&self, handles: Vec<Handle>) -> SessionResult<Batch<()>> {
        self.request(|reply| SessionCommand::RemoveContacts { handles, reply }).await
    }

    pub async fn get_presences(&self, handles: Vec<Handle>) -> SessionResult<Batch<Presence>> {
        self.request(|reply| SessionCommand::GetPresences { handles, reply }).await
    }

    pub async fn set_presence(&self, status: impl Into<String>, message: impl Into<String>) -> SessionResult<()> {
        let (status, message) = (status.into(), message.into());
        self.request(|reply| SessionCommand::SetPresence { status, message, reply })
            .await
    }

    pub async fn request_contact_info(&self, handle: Handle) -> SessionResult<Vec<ContactInfoField>> {
        self.request(|reply| SessionCommand::RequestContactInfo { handle, reply }).await
    }

    pub async fn get_contact_info(&self, handles: Vec<Handle>) -> SessionResult<Batch<Vec<ContactInfoField>>> {
        self.request(|reply| SessionCommand::GetContactInfo { handles, reply }).await
    }

    pub async fn get_aliases(&self, handle_type: HandleType, handles: Vec<Handle>) -> SessionResult<Batch<String>> {
        self.request(|reply| SessionCommand::GetAliases { handle_type, handles, reply })
            .await
    }

    pub async fn get_known_avatar_tokens(&self, handles: Vec<Handle>) -> SessionResult<Batch<String>> {
        self.request(|reply| SessionCommand::GetKnownAvatarTokens { handles, reply })
            .await
    }

    pub async fn request_avatars(&self, handles: Vec<Handle>) -> SessionResult<Batch<()>> {
        self.request(|reply| SessionCommand::RequestAvatars { handles, reply }).await
    }

    pub async fn cancel_avatar_requests(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::CancelAvatarRequests { reply }).await
    }

    pub async fn room_list_start_listing(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::RoomListStartListing { reply }).await
    }

    pub async fn room_list_stop_listing(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::RoomListStopListing { reply }).await
    }

    /// Persist state, disconnect and stop the session task
    pub async fn shutdown(&self) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Shutdown { reply }).await
    }
}

/// Protocol-side producer for the single-consumer event queue
#[derive(Clone)]
pub struct ProtocolEventSender {
    event_tx: mpsc::Sender<ProtocolEvent>,
}

impl ProtocolEventSender {
    pub async fn send(&self, event: ProtocolEvent) -> SessionResult<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| SessionError::RuntimeStopped)
    }

    /// Non-blocking variant for engine threads outside the runtime
    pub fn try_send(&self, event: ProtocolEvent) -> SessionResult<()> {
        self.event_tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SessionError::NotAvailable("protocol event queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => SessionError::RuntimeStopped,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.event_tx.is_closed()
    }
}

/// The session task
pub struct SessionRuntime<P: ProtocolClient + 'static> {
    connection: Connection<P>,
    command_rx: mpsc::Receiver<SessionCommand>,
    event_rx: mpsc::Receiver<ProtocolEvent>,
}

impl<P: ProtocolClient + 'static> SessionRuntime<P> {
    /// Spawn the task that owns `connection`
    pub fn spawn(connection: Connection<P>) -> (SessionHandle, ProtocolEventSender, JoinHandle<()>) {
        let ctx = Arc::clone(connection.context());
        let capacity = ctx.settings.queue_capacity.max(1);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);

        let runtime = SessionRuntime {
            connection,
            command_rx,
            event_rx,
        };
        let task = tokio::spawn(async move {
            runtime.run().await;
        });

        (
            SessionHandle {
                command_tx,
                events: ctx.events.clone(),
            },
            ProtocolEventSender { event_tx },
            task,
        )
    }

    async fn run(mut self) {
        let period = self.connection.context().settings.sweep_interval;
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(?period, "Session runtime started");

        loop {
            tokio::select! {
                Some(event) = self.event_rx.recv() => {
                    if let Err(e) = self.connection.handle_protocol_event(event).await {
                        warn!(error = %e, "Protocol event ignored");
                    }
                }

                command = self.command_rx.recv() => match command {
                    Some(SessionCommand::Shutdown { reply }) => {
                        let _ = reply.send(self.connection.shutdown().await);
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All session handles dropped");
                        if let Err(e) = self.connection.shutdown().await {
                            warn!(error = %e, "Shutdown failed");
                        }
                        break;
                    }
                },

                _ = sweep.tick() => {
                    self.connection.sweep_timeouts(tokio::time::Instant::now().into_std()).await;
                }
            }
        }

        info!("Session runtime stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        let conn = &mut self.connection;
        // a dropped reply receiver only means the caller gave up waiting
        match command {
            SessionCommand::Connect { reply } => {
                let _ = reply.send(conn.connect().await);
            }
            SessionCommand::Disconnect { reply } => {
                let _ = reply.send(conn.disconnect().await);
            }
            SessionCommand::SubmitAuthCode { code, reply } => {
                let _ = reply.send(conn.submit_auth_code(&code).await);
            }
            SessionCommand::SubmitPassword { password, reply } => {
                let _ = reply.send(conn.submit_password(&password).await);
            }
            SessionCommand::SelfHandle { reply } => {
                let _ = reply.send(conn.self_handle());
            }
            SessionCommand::Status { reply } => {
                let _ = reply.send(Ok(conn.status()));
            }
            SessionCommand::RequestHandles { handle_type, identifiers, reply } => {
                let _ = reply.send(conn.request_handles(handle_type, &identifiers));
            }
            SessionCommand::InspectHandles { handle_type, handles, reply } => {
                let _ = reply.send(conn.inspect_handles(handle_type, &handles));
            }
            SessionCommand::CreateChannel { request, reply } => {
                let _ = reply.send(conn.create_channel(request).await);
            }
            SessionCommand::EnsureTextChannel { handle_type, handle, reply } => {
                let _ = reply.send(conn.ensure_text_channel(handle_type, handle));
            }
            SessionCommand::CloseChannel { channel, reply } => {
                let _ = reply.send(conn.close_channel(channel).await);
            }
            SessionCommand::Channels { reply } => {
                let _ = reply.send(Ok(conn.channels()));
            }
            SessionCommand::Conversation { peer, reply } => {
                let _ = reply.send(Ok(conn.conversation(&peer)));
            }
            SessionCommand::SendMessage { channel, text, reply } => {
                let _ = reply.send(conn.send_message(channel, &text).await);
            }
            SessionCommand::GetContactAttributes { handles, interfaces, reply } => {
                let _ = reply.send(conn.get_contact_attributes(&handles, &interfaces));
            }
            SessionCommand::GetContactListAttributes { interfaces, reply } => {
                let _ = reply.send(conn.get_contact_list_attributes(&interfaces));
            }
            SessionCommand::RemoveContacts { handles, reply } => {
                let _ = reply.send(conn.remove_contacts(&handles).await);
            }
            SessionCommand::GetPresences { handles, reply } => {
                let _ = reply.send(conn.get_presences(&handles));
            }
            SessionCommand::SetPresence { status, message, reply } => {
                let _ = reply.send(conn.set_presence(&status, &message).await);
            }
            SessionCommand::RequestContactInfo { handle, reply } => {
                let _ = reply.send(conn.request_contact_info(handle));
            }
            SessionCommand::GetContactInfo { handles, reply } => {
                let _ = reply.send(conn.get_contact_info(&handles));
            }
            SessionCommand::GetAliases { handle_type, handles, reply } => {
                let _ = reply.send(conn.get_aliases(handle_type, &handles));
            }
            SessionCommand::GetKnownAvatarTokens { handles, reply } => {
                let _ = reply.send(conn.get_known_avatar_tokens(&handles));
            }
            SessionCommand::RequestAvatars { handles, reply } => {
                let _ = reply.send(conn.request_avatars(&handles).await);
            }
            SessionCommand::CancelAvatarRequests { reply } => {
                let _ = reply.send(conn.cancel_avatar_requests().await);
            }
            SessionCommand::RoomListStartListing { reply } => {
                let _ = reply.send(conn.room_list_start_listing().await);
            }
            SessionCommand::RoomListStopListing { reply } => {
                let _ = reply.send(conn.room_list_stop_listing().await);
            }
            SessionCommand::Shutdown { reply } => {
                let _ = reply.send(conn.shutdown().await);
            }
        }
    }
}
