//! Connection
//!
//! The session-scoped adapter between one protocol engine and the framework.
//! It owns the authentication machine and, while a session exists, the
//! session scope: handle registry, sent-message correlation, channels and
//! in-flight avatar fetches.
//!
//! # Lifecycle
//!
//! ```text
//! connect() ──► scope created ──► ... ──► Ready ──► disconnect() / fatal error
//!                    ▲                                        │
//!                    └──── network reconnect keeps scope ─────┤
//!                                                             ▼
//!                                                      scope dropped
//! ```
//!
//! Framework requests are the `pub async fn`s on [`Connection`]; protocol
//! events go through [`Connection::handle_protocol_event`]. Both are driven
//! from a single task (see [`crate::runtime`]), so nothing here needs locking.
//! Every table update happens before the matching [`FrameworkEvent`] goes out.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::auth::{AuthErrorOutcome, AuthLimits, AuthMachine, AuthState, Challenge, DisconnectOutcome, SyncKind};
use crate::avatars::AvatarRequests;
use crate::channels::ChannelSupervisor;
use crate::config::AccountConfig;
use crate::context::SessionContext;
use crate::correlation::SentMessageTable;
use crate::errors::{SessionError, SessionResult};
use crate::framework::{
    Batch, ChannelInfo, ChannelKind, ChannelMessage, ChannelRequest, ConnectionStatus,
    ContactAttributes, ContactInfoField, ContactInterface, FrameworkEvent, MessageDirection,
    StatusReason, SubscriptionState,
};
use crate::metrics;
use crate::presence::Presence;
use crate::protocol::{
    AuthErrorCode, AvatarData, ConnectParams, DropReason, ProtocolClient, ProtocolEvent,
    TransportStatus,
};
use crate::registry::HandleRegistry;
use crate::state::{PersistedState, StateStore};
use crate::types::{
    ChannelId, ChatId, CorrelationToken, Handle, HandleType, MessageId, OperationId, Peer, UserId,
};

/// Everything that lives exactly as long as one session
struct SessionScope {
    registry: HandleRegistry,
    sent: SentMessageTable,
    channels: ChannelSupervisor,
    avatars: AvatarRequests,
    self_handle: Option<Handle>,
    contacts: BTreeSet<UserId>,
    presences: HashMap<UserId, Presence>,
}

impl SessionScope {
    fn new(ctx: &Arc<SessionContext>) -> Self {
        Self {
            registry: HandleRegistry::new(),
            sent: SentMessageTable::new(ctx.settings.sent_messages_per_peer),
            channels: ChannelSupervisor::new(Arc::clone(ctx)),
            avatars: AvatarRequests::new(),
            self_handle: None,
            contacts: BTreeSet::new(),
            presences: HashMap::new(),
        }
    }
}

/// One account's connection
pub struct Connection<P: ProtocolClient> {
    protocol: Arc<P>,
    ctx: Arc<SessionContext>,
    account: AccountConfig,
    auth: AuthMachine,
    store: Box<dyn StateStore>,
    persisted: PersistedState,
    status: ConnectionStatus,
    wanted_presence: Presence,
    /// Challenge answered last, reported as accepted once the protocol moves on
    answered: Option<Challenge>,
    scope: Option<SessionScope>,
}

impl<P: ProtocolClient> Connection<P> {
    /// Build a connection; the persisted state is read here and only here
    pub fn new(
        protocol: Arc<P>,
        ctx: Arc<SessionContext>,
        account: AccountConfig,
        store: Box<dyn StateStore>,
    ) -> Self {
        let persisted = store.load().unwrap_or_default();
        let auth = AuthMachine::new(AuthLimits::from(&ctx.settings));

        Self {
            protocol,
            ctx,
            account,
            auth,
            store,
            persisted,
            status: ConnectionStatus::Disconnected,
            wanted_presence: Presence::requested("available", "").unwrap_or_else(|_| Presence::unknown()),
            answered: None,
            scope: None,
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth.state()
    }

    /// Failure that ended the last authentication attempt
    pub fn last_failure(&self) -> Option<&SessionError> {
        self.auth.last_failure()
    }

    pub fn persisted_state(&self) -> &PersistedState {
        &self.persisted
    }

    pub fn has_session(&self) -> bool {
        self.scope.is_some()
    }

    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.scope
            .as_ref()
            .map(|scope| scope.channels.channels())
            .unwrap_or_default()
    }

    /// Stored message ids of the conversation with `peer`
    pub fn conversation(&self, peer: &Peer) -> Vec<MessageId> {
        self.scope
            .as_ref()
            .and_then(|scope| scope.channels.text_channel(peer))
            .map(|channel| channel.message_ids())
            .unwrap_or_default()
    }

    fn set_status(&mut self, status: ConnectionStatus, reason: StatusReason) {
        if self.status == status {
            return;
        }
        info!(?status, ?reason, "Connection status changed");
        self.status = status;
        self.ctx.events.emit(FrameworkEvent::StatusChanged { status, reason });
    }

    fn require_ready(&self, action: &'static str) -> SessionResult<()> {
        if self.auth.is_ready() && self.scope.is_some() {
            Ok(())
        } else {
            Err(SessionError::invalid_state(self.auth.state(), action))
        }
    }

    fn ready_scope(&mut self, action: &'static str) -> SessionResult<&mut SessionScope> {
        self.require_ready(action)?;
        let state = self.auth.state();
        self.scope
            .as_mut()
            .ok_or_else(|| SessionError::invalid_state(state, action))
    }

    fn connect_params(&self) -> SessionResult<ConnectParams> {
        let phone = self
            .account
            .phone
            .clone()
            .ok_or_else(|| SessionError::InvalidArgument("no phone number configured".to_string()))?;

        let session_data = if self.persisted.phone.as_deref() == Some(phone.as_str()) {
            self.persisted.session_bytes()
        } else {
            None
        };

        Ok(ConnectParams {
            phone,
            server_address: self.account.server_address.clone(),
            server_port: self.account.server_port,
            server_key_file: self.account.server_key_file.clone(),
            keep_alive_secs: self.account.keep_alive_interval.as_secs(),
            session_data,
        })
    }

    // ---- session lifecycle ----

    /// Start connecting; progress is reported through status events
    pub async fn connect(&mut self) -> SessionResult<()> {
        let params = self.connect_params()?;
        self.auth.start()?;

        if self.scope.is_none() {
            self.scope = Some(SessionScope::new(&self.ctx));
        }
        self.set_status(ConnectionStatus::Connecting, StatusReason::Requested);
        info!(phone = %params.phone, resumable = params.session_data.is_some(), "Connecting");

        if let Err(e) = self.protocol.connect(&params).await {
            warn!(error = %e, "Protocol refused to connect");
            self.teardown(StatusReason::NetworkError, "connect_failed").await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Explicit disconnect; ends the session scope
    pub async fn disconnect(&mut self) -> SessionResult<()> {
        if self.scope.is_none() && self.auth.state() == AuthState::Disconnected {
            return Ok(());
        }

        self.checkpoint();
        if let Err(e) = self.protocol.disconnect().await {
            warn!(error = %e, "Protocol disconnect failed");
        }
        self.auth.on_disconnected(DropReason::Requested);
        self.teardown(StatusReason::Requested, "requested").await;
        Ok(())
    }

    /// Persist state and leave the session, for process exit
    pub async fn shutdown(&mut self) -> SessionResult<()> {
        let disconnect = self.disconnect().await;
        self.save_state()?;
        disconnect
    }

    /// Drop the session scope and reset authentication
    async fn teardown(&mut self, reason: StatusReason, cause: &'static str) {
        if let Some(mut scope) = self.scope.take() {
            let mut cancelled = scope.avatars.cancel_all();
            cancelled.extend(scope.channels.close_all());
            for operation in cancelled {
                self.protocol.cancel_operation(operation).await;
            }
            info!(
                handles = scope.registry.len(),
                cause, "Session scope torn down"
            );
        }

        self.auth.reset();
        self.answered = None;
        metrics::record_teardown(cause);
        metrics::record_open_channels(0);
        self.set_status(ConnectionStatus::Disconnected, reason);
    }

    fn checkpoint(&mut self) {
        if !self.auth.is_authenticated() {
            return;
        }
        self.persisted.phone = self.account.phone.clone();
        self.persisted.server_address = self.account.server_address.clone();
        self.persisted.server_port = Some(self.account.server_port);
        if let Some(session) = self.protocol.export_session() {
            self.persisted.set_session_bytes(Some(&session));
        }
        if let Err(e) = self.save_state() {
            warn!(error = %e, "Failed to persist session state");
        }
    }

    fn save_state(&self) -> SessionResult<()> {
        self.store.save(&self.persisted)?;
        Ok(())
    }

    // ---- authentication ----

    pub async fn submit_auth_code(&mut self, code: &str) -> SessionResult<()> {
        self.auth.submit_auth_code(code)?;
        self.answered = Some(Challenge::AuthCode);
        self.protocol.submit_auth_code(code.trim()).await?;
        Ok(())
    }

    pub async fn submit_password(&mut self, password: &str) -> SessionResult<()> {
        self.auth.submit_password(password)?;
        self.answered = Some(Challenge::Password);
        self.protocol.submit_password(password).await?;
        Ok(())
    }

    /// Handle of the account owner
    pub fn self_handle(&self) -> SessionResult<Handle> {
        self.scope
            .as_ref()
            .and_then(|scope| scope.self_handle)
            .ok_or_else(|| SessionError::invalid_state(self.auth.state(), "query the self handle"))
    }

    fn accept_answered(&mut self) {
        if let Some(challenge) = self.answered.take() {
            self.ctx.events.emit(FrameworkEvent::AuthAccepted { challenge });
        }
    }

    // ---- handles ----

    pub fn request_handles(
        &mut self,
        handle_type: HandleType,
        identifiers: &[String],
    ) -> SessionResult<Vec<Handle>> {
        let scope = self.ready_scope("request handles")?;
        scope.registry.request_handles(handle_type, identifiers)
    }

    pub fn inspect_handles(&self, handle_type: HandleType, handles: &[Handle]) -> SessionResult<Vec<String>> {
        self.require_ready("inspect handles")?;
        Ok(self
            .scope
            .as_ref()
            .map(|scope| scope.registry.inspect_handles(handle_type, handles))
            .unwrap_or_default())
    }

    // ---- channels ----

    /// Create a channel; fails when the requested one already exists
    pub async fn create_channel(&mut self, request: ChannelRequest) -> SessionResult<ChannelInfo> {
        match request.kind {
            ChannelKind::Text => {
                let (handle_type, handle) = request.target.ok_or_else(|| {
                    SessionError::InvalidArgument("text channel needs a target".to_string())
                })?;
                let (info, created) = self.ensure_text_channel(handle_type, handle)?;
                if !created {
                    return Err(SessionError::NotAvailable(format!(
                        "a text channel for {} handle {} already exists",
                        handle_type, handle
                    )));
                }
                Ok(info)
            }
            ChannelKind::RoomList => {
                let scope = self.ready_scope("create a room list")?;
                let (id, created) = scope.channels.ensure_room_list();
                if !created {
                    return Err(SessionError::NotAvailable("room list already exists".to_string()));
                }
                channel_info(scope, id)
            }
        }
    }

    /// Text channel for a target, created if needed; `true` when created
    pub fn ensure_text_channel(
        &mut self,
        handle_type: HandleType,
        handle: Handle,
    ) -> SessionResult<(ChannelInfo, bool)> {
        let scope = self.ready_scope("open a text channel")?;
        let peer = scope.registry.resolve_peer(handle, handle_type)?;
        let (id, created) = scope.channels.ensure_text_channel(peer, handle, false);
        metrics::record_open_channels(scope.channels.len());
        Ok((channel_info(scope, id)?, created))
    }

    pub async fn close_channel(&mut self, id: ChannelId) -> SessionResult<()> {
        let scope = self.ready_scope("close a channel")?;
        let cancelled = scope.channels.close_channel(id)?;
        metrics::record_open_channels(scope.channels.len());
        if let Some(operation) = cancelled {
            self.protocol.cancel_operation(operation).await;
        }
        Ok(())
    }

    // ---- messaging ----

    /// Send text on a text channel; returns the correlation token
    ///
    /// The token comes back in `MessageSent` once the server assigned an id,
    /// or in `MessageSendFailed` if it never does.
    pub async fn send_message(&mut self, channel: ChannelId, text: &str) -> SessionResult<CorrelationToken> {
        if text.is_empty() {
            return Err(SessionError::InvalidArgument("empty message".to_string()));
        }

        let scope = self.ready_scope("send a message")?;
        let peer = match scope.channels.channel(channel) {
            Some(crate::channels::Channel::Text(text_channel)) => text_channel.peer(),
            Some(_) => {
                return Err(SessionError::InvalidArgument(format!("{} is not a text channel", channel)))
            }
            None => return Err(SessionError::InvalidArgument(format!("no such channel: {}", channel))),
        };
        let token = fresh_token(&scope.sent, &peer);

        self.protocol.send_message(peer, text, token).await?;

        if let Some(scope) = self.scope.as_mut() {
            scope.sent.record_send(peer, token, now());
        }
        metrics::record_sent();
        debug!(%peer, token, "Message send issued");
        Ok(token)
    }

    // ---- contacts ----

    pub fn get_contact_attributes(
        &self,
        handles: &[Handle],
        interfaces: &[ContactInterface],
    ) -> SessionResult<Batch<ContactAttributes>> {
        self.require_ready("get contact attributes")?;
        let mut batch = Batch::new();
        let Some(scope) = self.scope.as_ref() else {
            return Ok(batch);
        };

        for &handle in handles {
            match scope.registry.resolve_peer(handle, HandleType::Contact) {
                Ok(peer) => {
                    batch.items.insert(handle, self.attributes_for(scope, peer, interfaces));
                }
                Err(e) => {
                    batch.errors.insert(handle, e);
                }
            }
        }
        Ok(batch)
    }

    /// Attributes of every contact-list member
    pub fn get_contact_list_attributes(
        &self,
        interfaces: &[ContactInterface],
    ) -> SessionResult<Batch<ContactAttributes>> {
        self.require_ready("get contact list attributes")?;
        let mut batch = Batch::new();
        let Some(scope) = self.scope.as_ref() else {
            return Ok(batch);
        };

        for &user_id in &scope.contacts {
            let peer = Peer::User(user_id);
            if let Some(handle) = scope.registry.handle_of(&peer) {
                batch.items.insert(handle, self.attributes_for(scope, peer, interfaces));
            }
        }
        Ok(batch)
    }

    fn attributes_for(
        &self,
        scope: &SessionScope,
        peer: Peer,
        interfaces: &[ContactInterface],
    ) -> ContactAttributes {
        let mut attributes = ContactAttributes {
            identifier: peer.to_identifier(),
            ..Default::default()
        };

        for interface in interfaces {
            match interface {
                ContactInterface::Alias => attributes.alias = Some(self.alias_for(peer)),
                ContactInterface::Presence => attributes.presence = Some(self.presence_for(scope, peer)),
                ContactInterface::ContactList => {
                    let listed = scope.contacts.contains(&peer.id());
                    attributes.subscription =
                        Some(if listed { SubscriptionState::Yes } else { SubscriptionState::No });
                }
                ContactInterface::Avatar => attributes.avatar_token = self.avatar_token(peer),
                ContactInterface::ContactInfo => attributes.info = self.contact_info_fields(peer.id()),
            }
        }
        attributes
    }

    pub async fn remove_contacts(&mut self, handles: &[Handle]) -> SessionResult<Batch<()>> {
        let scope = self.ready_scope("remove contacts")?;
        let mut batch = Batch::new();
        let mut targets = BTreeMap::new();

        for &handle in handles {
            match scope.registry.resolve_peer(handle, HandleType::Contact) {
                Ok(peer) => {
                    targets.insert(handle, peer.id());
                }
                Err(e) => {
                    batch.errors.insert(handle, e);
                }
            }
        }
        if targets.is_empty() {
            return Ok(batch);
        }

        let user_ids: Vec<UserId> = targets.values().copied().collect();
        self.protocol.delete_contacts(&user_ids).await?;

        let mut removed = BTreeSet::new();
        if let Some(scope) = self.scope.as_mut() {
            for (handle, user_id) in targets {
                if scope.contacts.remove(&user_id) {
                    removed.insert(handle);
                }
                batch.items.insert(handle, ());
            }
        }
        if !removed.is_empty() {
            self.ctx.events.emit(FrameworkEvent::ContactListChanged {
                added: BTreeSet::new(),
                removed,
            });
        }
        Ok(batch)
    }

    // ---- presence ----

    pub fn get_presences(&self, handles: &[Handle]) -> SessionResult<Batch<Presence>> {
        self.require_ready("get presences")?;
        let mut batch = Batch::new();
        let Some(scope) = self.scope.as_ref() else {
            return Ok(batch);
        };

        for &handle in handles {
            match scope.registry.resolve_peer(handle, HandleType::Contact) {
                Ok(peer) => {
                    batch.items.insert(handle, self.presence_for(scope, peer));
                }
                Err(e) => {
                    batch.errors.insert(handle, e);
                }
            }
        }
        Ok(batch)
    }

    fn presence_for(&self, scope: &SessionScope, peer: Peer) -> Presence {
        if scope.self_handle.is_some() && scope.registry.handle_of(&peer) == scope.self_handle {
            return self.wanted_presence.clone();
        }
        scope
            .presences
            .get(&peer.id())
            .cloned()
            .unwrap_or_else(Presence::unknown)
    }

    /// Set the account's own presence
    ///
    /// Applied right away when the session is ready, otherwise on reaching
    /// Ready.
    pub async fn set_presence(&mut self, status: &str, message: &str) -> SessionResult<()> {
        let presence = Presence::requested(status, message)?;
        self.wanted_presence = presence;

        if self.auth.is_ready() {
            self.apply_presence().await?;
        } else {
            debug!(status, "Presence deferred until the session is ready");
        }
        Ok(())
    }

    async fn apply_presence(&mut self) -> SessionResult<()> {
        self.protocol
            .set_online(self.wanted_presence.protocol_online())
            .await?;

        if let Some(handle) = self.scope.as_ref().and_then(|scope| scope.self_handle) {
            let mut presences = BTreeMap::new();
            presences.insert(handle, self.wanted_presence.clone());
            self.ctx.events.emit(FrameworkEvent::PresencesChanged { presences });
        }
        Ok(())
    }

    // ---- contact info & aliases ----

    fn alias_for(&self, peer: Peer) -> String {
        match peer {
            Peer::User(user_id) => self
                .protocol
                .user_info(user_id)
                .and_then(|info| {
                    let name = info.full_name();
                    if !name.is_empty() {
                        Some(name)
                    } else {
                        info.username.filter(|u| !u.is_empty()).or(info.phone)
                    }
                })
                .unwrap_or_else(|| peer.to_identifier()),
            Peer::Chat(chat_id) => self
                .protocol
                .chat_info(chat_id)
                .map(|info| info.title)
                .filter(|title| !title.is_empty())
                .unwrap_or_else(|| peer.to_identifier()),
        }
    }

    fn contact_info_fields(&self, user_id: UserId) -> Option<Vec<ContactInfoField>> {
        let info = self.protocol.user_info(user_id)?;
        let mut fields = Vec::new();

        let name = info.full_name();
        if !name.is_empty() {
            fields.push(ContactInfoField::new("fn", name));
        }
        if let Some(username) = info.username.as_deref().filter(|u| !u.is_empty()) {
            fields.push(ContactInfoField::new("nickname", username));
            fields.push(ContactInfoField::new(
                "x-telegram-profile",
                format!("https://t.me/{}", username),
            ));
        }
        if let Some(phone) = info.phone.as_deref().filter(|p| !p.is_empty()) {
            let mut tel = ContactInfoField::new("tel", format!("+{}", phone.trim_start_matches('+')));
            tel.parameters.push("type=cell".to_string());
            fields.push(tel);
        }
        Some(fields)
    }

    pub fn get_aliases(&self, handle_type: HandleType, handles: &[Handle]) -> SessionResult<Batch<String>> {
        self.require_ready("get aliases")?;
        let mut batch = Batch::new();
        let Some(scope) = self.scope.as_ref() else {
            return Ok(batch);
        };

        for &handle in handles {
            match scope.registry.resolve_peer(handle, handle_type) {
                Ok(peer) => {
                    batch.items.insert(handle, self.alias_for(peer));
                }
                Err(e) => {
                    batch.errors.insert(handle, e);
                }
            }
        }
        Ok(batch)
    }

    /// Contact info of one contact, failing when the protocol has none cached
    pub fn request_contact_info(&self, handle: Handle) -> SessionResult<Vec<ContactInfoField>> {
        self.require_ready("request contact info")?;
        let scope = self
            .scope
            .as_ref()
            .ok_or_else(|| SessionError::invalid_state(self.auth.state(), "request contact info"))?;
        let peer = scope.registry.resolve_peer(handle, HandleType::Contact)?;
        self.contact_info_fields(peer.id())
            .ok_or_else(|| SessionError::NotAvailable(format!("no profile for {}", peer)))
    }

    pub fn get_contact_info(&self, handles: &[Handle]) -> SessionResult<Batch<Vec<ContactInfoField>>> {
        self.require_ready("get contact info")?;
        let mut batch = Batch::new();
        let Some(scope) = self.scope.as_ref() else {
            return Ok(batch);
        };

        for &handle in handles {
            let fields = scope
                .registry
                .resolve_peer(handle, HandleType::Contact)
                .and_then(|peer| {
                    self.contact_info_fields(peer.id())
                        .ok_or_else(|| SessionError::NotAvailable(format!("no profile for {}", peer)))
                });
            match fields {
                Ok(fields) => {
                    batch.items.insert(handle, fields);
                }
                Err(e) => {
                    batch.errors.insert(handle, e);
                }
            }
        }
        Ok(batch)
    }

    // ---- avatars ----

    fn avatar_token(&self, peer: Peer) -> Option<String> {
        match peer {
            Peer::User(user_id) => self.protocol.user_info(user_id).map(|info| info.avatar_token.unwrap_or_default()),
            Peer::Chat(chat_id) => self.protocol.chat_info(chat_id).map(|info| info.avatar_token.unwrap_or_default()),
        }
    }

    /// Known avatar tokens; an empty token means "no avatar"
    ///
    /// Contacts whose profile is not cached are left out of the result.
    pub fn get_known_avatar_tokens(&self, handles: &[Handle]) -> SessionResult<Batch<String>> {
        self.require_ready("get avatar tokens")?;
        let mut batch = Batch::new();
        let Some(scope) = self.scope.as_ref() else {
            return Ok(batch);
        };

        for &handle in handles {
            match scope.registry.resolve_peer(handle, HandleType::Contact) {
                Ok(peer) => {
                    if let Some(token) = self.avatar_token(peer) {
                        batch.items.insert(handle, token);
                    }
                }
                Err(e) => {
                    batch.errors.insert(handle, e);
                }
            }
        }
        Ok(batch)
    }

    /// Start fetching avatars; results arrive as `AvatarRetrieved`
    pub async fn request_avatars(&mut self, handles: &[Handle]) -> SessionResult<Batch<()>> {
        let scope = self.ready_scope("request avatars")?;
        let mut batch = Batch::new();
        let mut wanted = BTreeMap::new();

        for &handle in handles {
            match scope.registry.resolve_peer(handle, HandleType::Contact) {
                Ok(peer) => {
                    if !scope.avatars.is_pending(&peer) {
                        wanted.insert(peer, handle);
                    }
                    batch.items.insert(handle, ());
                }
                Err(e) => {
                    batch.errors.insert(handle, e);
                }
            }
        }

        for (peer, handle) in wanted {
            if self.avatar_token(peer).map_or(true, |token| token.is_empty()) {
                continue;
            }
            match self.protocol.fetch_avatar(peer).await {
                Ok(operation) => {
                    if let Some(scope) = self.scope.as_mut() {
                        scope.avatars.track(operation, peer, handle, now());
                    }
                }
                Err(e) => {
                    batch.items.remove(&handle);
                    batch.errors.insert(handle, e.into());
                }
            }
        }
        Ok(batch)
    }

    pub async fn cancel_avatar_requests(&mut self) -> SessionResult<()> {
        let scope = self.ready_scope("cancel avatar requests")?;
        let operations = scope.avatars.cancel_all();
        for operation in operations {
            self.protocol.cancel_operation(operation).await;
        }
        Ok(())
    }

    // ---- room list ----

    pub async fn room_list_start_listing(&mut self) -> SessionResult<()> {
        let scope = self.ready_scope("list rooms")?;
        if scope.channels.is_listing_rooms() {
            return Ok(());
        }

        let operation = self.protocol.list_rooms().await?;
        if let Some(scope) = self.scope.as_mut() {
            scope.channels.start_listing(operation);
            metrics::record_open_channels(scope.channels.len());
        }
        Ok(())
    }

    /// Cancel the listing and close the room list; harmless when idle
    pub async fn room_list_stop_listing(&mut self) -> SessionResult<()> {
        let scope = self.ready_scope("stop listing rooms")?;
        let cancelled = scope.channels.stop_listing();
        metrics::record_open_channels(scope.channels.len());
        if let Some(operation) = cancelled {
            self.protocol.cancel_operation(operation).await;
        }
        Ok(())
    }

    // ---- timeouts ----

    /// Fail sends and avatar fetches that outlived the operation timeout
    pub async fn sweep_timeouts(&mut self, now: Instant) {
        let timeout = self.ctx.settings.operation_timeout;
        let Some(scope) = self.scope.as_mut() else {
            return;
        };

        let sends = scope.sent.expire_pending(now, timeout);
        metrics::record_timeouts("send", sends.len());
        for (peer, token) in &sends {
            warn!(%peer, token, "Send was never confirmed");
            self.ctx.events.emit(FrameworkEvent::MessageSendFailed {
                channel: scope.channels.channel_for(peer),
                peer: *peer,
                token: *token,
                error: SessionError::OperationTimeout {
                    operation: format!("send {:016x} to {}", token, peer),
                },
            });
        }
        for (peer, _) in &sends {
            if !scope.sent.has_pending(peer) {
                let released = scope.channels.release_held(peer);
                metrics::record_received(released.len());
            }
        }

        let avatars = scope.avatars.expire(now, timeout);
        metrics::record_timeouts("avatar", avatars.len());
        for (operation, request) in &avatars {
            self.ctx.events.emit(FrameworkEvent::AvatarFailed {
                handle: request.handle,
                error: SessionError::OperationTimeout {
                    operation: format!("avatar fetch {} for {}", operation, request.peer),
                },
            });
        }
        for (operation, _) in avatars {
            self.protocol.cancel_operation(operation).await;
        }
    }

    // ---- protocol events ----

    /// Apply one protocol event
    ///
    /// Errors mean the event did not fit the current state and was ignored.
    pub async fn handle_protocol_event(&mut self, event: ProtocolEvent) -> SessionResult<()> {
        match event {
            ProtocolEvent::ConnectionStatusChanged { status, reason } => {
                self.on_transport_status(status, reason).await
            }
            ProtocolEvent::AuthCodeRequired { two_factor } => {
                self.auth.on_auth_code_required(two_factor)?;
                self.ctx.events.emit(FrameworkEvent::AuthChallenge {
                    challenge: Challenge::AuthCode,
                });
                Ok(())
            }
            ProtocolEvent::PasswordRequired => {
                self.auth.on_password_required()?;
                self.accept_answered();
                self.ctx.events.emit(FrameworkEvent::AuthChallenge {
                    challenge: Challenge::Password,
                });
                Ok(())
            }
            ProtocolEvent::PasswordCheckFailed => {
                self.on_auth_error(AuthErrorCode::PasswordHashInvalid, "password check failed".to_string())
                    .await
            }
            ProtocolEvent::AuthError { code, message } => self.on_auth_error(code, message).await,
            ProtocolEvent::SelfUserAvailable { user_id } => self.on_self_user(user_id).await,
            ProtocolEvent::ContactListReady { user_ids } => self.on_contact_list(user_ids).await,
            ProtocolEvent::DialogsReady { peers } => self.on_dialogs(peers).await,
            ProtocolEvent::ContactStatusChanged { user_id, status } => {
                let Some(scope) = self.scope.as_mut() else {
                    return Ok(());
                };
                let handle = scope.registry.ensure_contact(user_id);
                let presence = Presence::from_contact_status(status);
                scope.presences.insert(user_id, presence.clone());

                let mut presences = BTreeMap::new();
                presences.insert(handle, presence);
                self.ctx.events.emit(FrameworkEvent::PresencesChanged { presences });
                Ok(())
            }
            ProtocolEvent::NewMessage { peer, message_id } => {
                self.on_messages(peer, vec![message_id], true);
                Ok(())
            }
            ProtocolEvent::SyncMessages { peer, message_ids } => {
                self.on_messages(peer, message_ids, false);
                Ok(())
            }
            ProtocolEvent::MessageSent { peer, token, message_id } => {
                let Some(scope) = self.scope.as_mut() else {
                    return Ok(());
                };
                let was_pending = scope.sent.on_send_confirmed(peer, token, message_id);
                metrics::record_confirmed(was_pending);
                scope.channels.on_message_sent(&peer, token, message_id);
                if !scope.sent.has_pending(&peer) {
                    let released = scope.channels.release_held(&peer);
                    metrics::record_received(released.len());
                }
                Ok(())
            }
            ProtocolEvent::AvatarFetchCompleted { operation, peer, result } => {
                self.on_avatar(operation, peer, result);
                Ok(())
            }
            ProtocolEvent::RoomsDiscovered { operation, rooms } => {
                if let Some(scope) = self.scope.as_mut() {
                    let forwarded = scope.channels.on_rooms_discovered(operation, rooms);
                    debug!(%operation, forwarded, "Rooms discovered");
                }
                Ok(())
            }
            ProtocolEvent::RoomListingFinished { operation } => {
                if let Some(scope) = self.scope.as_mut() {
                    scope.channels.on_listing_finished(operation);
                }
                Ok(())
            }
            ProtocolEvent::ChatChanged { chat_id } => {
                self.on_chat_changed(chat_id);
                Ok(())
            }
            ProtocolEvent::AccountInvalidated { account } => {
                self.on_account_invalidated(account).await;
                Ok(())
            }
        }
    }

    async fn on_transport_status(&mut self, status: TransportStatus, reason: DropReason) -> SessionResult<()> {
        match status {
            TransportStatus::Connecting => {
                debug!("Transport connecting");
                Ok(())
            }
            TransportStatus::Connected => {
                if self.auth.state() != AuthState::Connecting {
                    debug!(state = %self.auth.state(), "Transport up outside of connecting");
                    return Ok(());
                }
                let result = if self.persisted.is_authorized()
                    && self.persisted.phone == self.account.phone
                {
                    self.auth.on_check_in()?;
                    info!("Resuming authorized session");
                    self.protocol.check_in().await
                } else {
                    let phone = self.account.phone.clone().unwrap_or_default();
                    info!("Signing in");
                    self.protocol.sign_in(&phone).await
                };

                if let Err(e) = result {
                    warn!(error = %e, "Cannot start sign-in");
                    self.auth.on_disconnected(DropReason::Requested);
                    self.teardown(StatusReason::NetworkError, "sign_in_failed").await;
                    return Err(e.into());
                }
                Ok(())
            }
            TransportStatus::Disconnected => {
                if self.scope.is_none() && self.auth.state() == AuthState::Disconnected {
                    return Ok(());
                }

                match self.auth.on_disconnected(reason) {
                    DisconnectOutcome::Requested => {
                        self.teardown(StatusReason::Requested, "requested").await;
                    }
                    DisconnectOutcome::Reconnect { attempt } => {
                        metrics::record_reconnect();
                        info!(attempt, ?reason, "Connection lost, reconnecting");
                        self.answered = None;
                        self.set_status(ConnectionStatus::Connecting, StatusReason::NetworkError);
                        self.reconnect().await;
                    }
                    DisconnectOutcome::GiveUp { attempts } => {
                        warn!(attempts, "Giving up reconnecting");
                        self.teardown(StatusReason::NetworkError, "network").await;
                    }
                }
                Ok(())
            }
        }
    }

    async fn reconnect(&mut self) {
        let params = match self.connect_params() {
            Ok(params) => params,
            Err(e) => {
                warn!(error = %e, "Cannot reconnect");
                self.teardown(StatusReason::NetworkError, "network").await;
                return;
            }
        };
        if self.auth.start().is_err() {
            return;
        }
        if let Err(e) = self.protocol.connect(&params).await {
            warn!(error = %e, "Reconnect failed");
            self.teardown(StatusReason::NetworkError, "network").await;
        }
    }

    async fn on_auth_error(&mut self, code: AuthErrorCode, message: String) -> SessionResult<()> {
        let outcome = self.auth.on_auth_error(code, &message)?;

        match outcome {
            AuthErrorOutcome::Retry(challenge) => {
                metrics::record_auth_failure(false);
                self.answered = None;
                self.ctx.events.emit(FrameworkEvent::AuthRejected {
                    challenge: Some(challenge),
                    code,
                    message,
                    retryable: true,
                });
                self.ctx.events.emit(FrameworkEvent::AuthChallenge { challenge });
            }
            AuthErrorOutcome::Terminal(error) => {
                metrics::record_auth_failure(true);
                warn!(error = %error, "Authentication failed, ending session");
                self.ctx.events.emit(FrameworkEvent::AuthRejected {
                    challenge: self.answered.take(),
                    code,
                    message,
                    retryable: false,
                });
                if let Err(e) = self.protocol.disconnect().await {
                    debug!(error = %e, "Disconnect after auth failure");
                }
                self.teardown(StatusReason::AuthenticationFailed, "auth_failed").await;
            }
        }
        Ok(())
    }

    async fn on_self_user(&mut self, user_id: UserId) -> SessionResult<()> {
        self.auth.on_authenticated()?;
        self.accept_answered();

        if let Some(scope) = self.scope.as_mut() {
            scope.self_handle = Some(scope.registry.ensure_contact(user_id));
        }
        self.persisted.self_user_id = Some(user_id);
        info!(user_id, "Signed in");

        self.protocol.sync_contact_list().await?;
        self.protocol.sync_dialogs().await?;
        Ok(())
    }

    async fn on_contact_list(&mut self, user_ids: Vec<UserId>) -> SessionResult<()> {
        let Some(scope) = self.scope.as_mut() else {
            return Ok(());
        };

        let listed: BTreeSet<UserId> = user_ids.into_iter().collect();
        let mut added = BTreeSet::new();
        for &user_id in listed.difference(&scope.contacts) {
            added.insert(scope.registry.ensure_contact(user_id));
        }
        let mut removed = BTreeSet::new();
        for user_id in scope.contacts.difference(&listed) {
            if let Some(handle) = scope.registry.handle_of(&Peer::User(*user_id)) {
                removed.insert(handle);
            }
        }
        scope.contacts = listed;

        if !added.is_empty() || !removed.is_empty() {
            self.ctx.events.emit(FrameworkEvent::ContactListChanged { added, removed });
        }

        self.initial_sync(SyncKind::ContactList).await
    }

    async fn on_dialogs(&mut self, peers: Vec<Peer>) -> SessionResult<()> {
        let Some(scope) = self.scope.as_mut() else {
            return Ok(());
        };
        for peer in peers {
            scope.registry.ensure_handle(peer);
        }
        self.initial_sync(SyncKind::Dialogs).await
    }

    async fn initial_sync(&mut self, kind: SyncKind) -> SessionResult<()> {
        if !self.auth.is_authenticated() {
            debug!(?kind, state = %self.auth.state(), "Sync outside of an authenticated session");
            return Ok(());
        }
        if self.auth.on_initial_sync(kind)? {
            self.on_ready().await;
        }
        Ok(())
    }

    async fn on_ready(&mut self) {
        self.checkpoint();
        self.set_status(ConnectionStatus::Connected, StatusReason::Requested);
        if let Err(e) = self.apply_presence().await {
            warn!(error = %e, "Failed to apply presence");
        }
    }

    fn on_messages(&mut self, peer: Peer, mut message_ids: Vec<MessageId>, live: bool) {
        let Some(scope) = self.scope.as_mut() else {
            debug!(%peer, "Messages outside of a session");
            return;
        };

        message_ids.sort_unstable();
        message_ids.dedup();

        let target = scope.registry.ensure_handle(peer);
        let mut batch = Vec::with_capacity(message_ids.len());
        for message_id in message_ids {
            let Some(data) = self.protocol.message(peer, message_id) else {
                warn!(%peer, message_id, "Message not in protocol cache");
                continue;
            };

            let token = scope.sent.token_for(&peer, message_id);
            if live && data.outgoing && token.is_some() {
                // already reported by MessageSent
                continue;
            }

            let direction = if data.outgoing {
                MessageDirection::Outgoing { token }
            } else {
                MessageDirection::Incoming
            };
            let message = ChannelMessage {
                id: message_id,
                sender: scope.registry.ensure_contact(data.sender),
                text: data.text,
                timestamp: data.timestamp,
                token: scope.sent.message_token(&peer, message_id),
                direction,
            };

            // may be our own send arriving before its MessageSent
            if data.outgoing && token.is_none() && scope.sent.has_pending(&peer) {
                scope.channels.hold_echo(peer, target, message);
                continue;
            }
            batch.push(message);
        }

        let added = scope.channels.deliver_messages(peer, target, batch);
        metrics::record_received(added.len());
        metrics::record_open_channels(scope.channels.len());
    }

    fn on_avatar(&mut self, operation: OperationId, peer: Peer, result: Result<AvatarData, String>) {
        let Some(request) = self.scope.as_mut().and_then(|scope| scope.avatars.complete(operation)) else {
            debug!(%operation, %peer, "Avatar completion for a cancelled fetch");
            return;
        };

        match result {
            Ok(avatar) => {
                self.ctx.events.emit(FrameworkEvent::AvatarRetrieved {
                    handle: request.handle,
                    token: avatar.token,
                    mime_type: avatar.mime_type,
                    bytes: avatar.bytes,
                });
            }
            Err(reason) => {
                self.ctx.events.emit(FrameworkEvent::AvatarFailed {
                    handle: request.handle,
                    error: SessionError::NotAvailable(reason),
                });
            }
        }
    }

    fn on_chat_changed(&mut self, chat_id: ChatId) {
        let Some(scope) = self.scope.as_mut() else {
            return;
        };
        let Some(info) = self.protocol.chat_info(chat_id) else {
            debug!(chat_id, "Changed chat not in protocol cache");
            return;
        };

        let chat = scope.registry.ensure_chat(chat_id);
        let members = info
            .members
            .iter()
            .map(|user_id| scope.registry.ensure_contact(*user_id))
            .collect();
        self.ctx.events.emit(FrameworkEvent::ChatDetailsChanged { chat, members });
    }

    async fn on_account_invalidated(&mut self, account: String) {
        let error = SessionError::SessionInvalidated { account };
        warn!(error = %error, "Account invalidated, ending session");

        self.persisted.set_session_bytes(None);
        self.persisted.self_user_id = None;
        if let Err(e) = self.save_state() {
            warn!(error = %e, "Failed to clear persisted session");
        }
        if let Err(e) = self.protocol.disconnect().await {
            debug!(error = %e, "Disconnect after invalidation");
        }
        self.teardown(StatusReason::SessionInvalidated, "invalidated").await;
    }
}

fn channel_info(scope: &SessionScope, id: ChannelId) -> SessionResult<ChannelInfo> {
    scope
        .channels
        .channel(id)
        .map(|channel| channel.info())
        .ok_or_else(|| SessionError::NotAvailable(format!("{} vanished", id)))
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Random non-zero token not yet used for `peer`
fn fresh_token(sent: &SentMessageTable, peer: &Peer) -> CorrelationToken {
    loop {
        let token: CorrelationToken = rand::random();
        if token != 0 && !sent.contains_token(peer, token) {
            return token;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::protocol::{ContactStatus, MessageData, RoomInfo, UserInfo};
    use crate::state::MemoryStateStore;
    use crate::test_utils::{drain_events, MockProtocol, ProtocolCall};
    use std::time::Duration;

    fn account() -> AccountConfig {
        AccountConfig {
            phone: Some("15550001".to_string()),
            ..Default::default()
        }
    }

    fn connection(protocol: Arc<MockProtocol>) -> Connection<MockProtocol> {
        let ctx = SessionContext::new(SessionConfig::default());
        Connection::new(protocol, ctx, account(), Box::new(MemoryStateStore::new()))
    }

    async fn ready_connection() -> (Connection<MockProtocol>, Arc<MockProtocol>) {
        let protocol = Arc::new(MockProtocol::new());
        protocol.add_user(7, UserInfo { first_name: "Ada".into(), ..Default::default() });
        let mut conn = connection(protocol.clone());

        conn.connect().await.unwrap();
        conn.handle_protocol_event(ProtocolEvent::ConnectionStatusChanged {
            status: TransportStatus::Connected,
            reason: DropReason::Requested,
        })
        .await
        .unwrap();
        conn.handle_protocol_event(ProtocolEvent::AuthCodeRequired { two_factor: false })
            .await
            .unwrap();
        conn.submit_auth_code("12345").await.unwrap();
        conn.handle_protocol_event(ProtocolEvent::SelfUserAvailable { user_id: 1 })
            .await
            .unwrap();
        conn.handle_protocol_event(ProtocolEvent::ContactListReady { user_ids: vec![7] })
            .await
            .unwrap();
        conn.handle_protocol_event(ProtocolEvent::DialogsReady { peers: vec![Peer::Chat(3)] })
            .await
            .unwrap();
        assert_eq!(conn.auth_state(), AuthState::Ready);
        (conn, protocol)
    }

    #[tokio::test]
    async fn test_requests_before_ready_are_rejected() {
        let mut conn = connection(Arc::new(MockProtocol::new()));
        let err = conn
            .request_handles(HandleType::Contact, &["user1".to_string()])
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidStateTransition { .. }));

        let err = conn.submit_password("secret").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidStateTransition { state: AuthState::Disconnected, .. }
        ));
    }

    #[tokio::test]
    async fn test_full_sign_in_reaches_ready() {
        let (conn, protocol) = ready_connection().await;
        assert_eq!(conn.status(), ConnectionStatus::Connected);
        assert_eq!(conn.self_handle().unwrap(), 1);
        assert!(protocol.calls().contains(&ProtocolCall::SignIn("15550001".into())));
        assert!(protocol.calls().contains(&ProtocolCall::SetOnline(true)));
    }

    #[tokio::test]
    async fn test_send_and_confirm() {
        let (mut conn, protocol) = ready_connection().await;
        let handle = conn.request_handles(HandleType::Contact, &["user7".into()]).unwrap()[0];
        let (info, created) = conn.ensure_text_channel(HandleType::Contact, handle).unwrap();
        assert!(created);

        let mut rx = conn.context().events.subscribe();
        let token = conn.send_message(info.id, "hello").await.unwrap();
        assert_ne!(token, 0);

        conn.handle_protocol_event(ProtocolEvent::MessageSent {
            peer: Peer::User(7),
            token,
            message_id: 42,
        })
        .await
        .unwrap();

        let events = drain_events(&mut rx);
        assert!(events.contains(&FrameworkEvent::MessageSent {
            channel: info.id,
            token,
            message_id: 42,
        }));

        // the live echo of our own message is not delivered twice
        protocol.add_message(Peer::User(7), 42, MessageData {
            sender: 1,
            text: "hello".into(),
            timestamp: 10,
            outgoing: true,
        });
        conn.handle_protocol_event(ProtocolEvent::NewMessage { peer: Peer::User(7), message_id: 42 })
            .await
            .unwrap();
        assert!(!drain_events(&mut rx)
            .iter()
            .any(|event| matches!(event, FrameworkEvent::MessageReceived { .. })));
        assert_eq!(conn.conversation(&Peer::User(7)), vec![42]);
    }

    fn own_message(text: &str) -> MessageData {
        MessageData {
            sender: 1,
            text: text.into(),
            timestamp: 10,
            outgoing: true,
        }
    }

    #[tokio::test]
    async fn test_echo_before_confirmation_is_reported_once() {
        let (mut conn, protocol) = ready_connection().await;
        let handle = conn.request_handles(HandleType::Contact, &["user7".into()]).unwrap()[0];
        let (info, _) = conn.ensure_text_channel(HandleType::Contact, handle).unwrap();

        let mut rx = conn.context().events.subscribe();
        let token = conn.send_message(info.id, "hello").await.unwrap();

        protocol.add_message(Peer::User(7), 42, own_message("hello"));
        conn.handle_protocol_event(ProtocolEvent::NewMessage { peer: Peer::User(7), message_id: 42 })
            .await
            .unwrap();
        conn.handle_protocol_event(ProtocolEvent::MessageSent {
            peer: Peer::User(7),
            token,
            message_id: 42,
        })
        .await
        .unwrap();

        let events = drain_events(&mut rx);
        let sent = events
            .iter()
            .filter(|event| matches!(event, FrameworkEvent::MessageSent { message_id: 42, .. }))
            .count();
        let received = events
            .iter()
            .filter(|event| matches!(event, FrameworkEvent::MessageReceived { .. }))
            .count();
        assert_eq!(sent, 1);
        assert_eq!(received, 0);
        assert_eq!(conn.conversation(&Peer::User(7)), vec![42]);
    }

    #[tokio::test]
    async fn test_other_device_message_waits_for_pending_send() {
        let (mut conn, protocol) = ready_connection().await;
        let handle = conn.request_handles(HandleType::Contact, &["user7".into()]).unwrap()[0];
        let (info, _) = conn.ensure_text_channel(HandleType::Contact, handle).unwrap();

        let mut rx = conn.context().events.subscribe();
        let token = conn.send_message(info.id, "hello").await.unwrap();

        // sent from another client of the same account
        protocol.add_message(Peer::User(7), 41, own_message("from phone"));
        conn.handle_protocol_event(ProtocolEvent::NewMessage { peer: Peer::User(7), message_id: 41 })
            .await
            .unwrap();
        assert!(conn.conversation(&Peer::User(7)).is_empty());

        conn.handle_protocol_event(ProtocolEvent::MessageSent {
            peer: Peer::User(7),
            token,
            message_id: 42,
        })
        .await
        .unwrap();

        let received: Vec<_> = drain_events(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                FrameworkEvent::MessageReceived { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, 41);
        assert_eq!(received[0].direction, MessageDirection::Outgoing { token: None });
        assert_eq!(conn.conversation(&Peer::User(7)), vec![41, 42]);
    }

    #[tokio::test]
    async fn test_held_message_released_when_send_times_out() {
        let (mut conn, protocol) = ready_connection().await;
        let handle = conn.request_handles(HandleType::Contact, &["user7".into()]).unwrap()[0];
        let (info, _) = conn.ensure_text_channel(HandleType::Contact, handle).unwrap();
        conn.send_message(info.id, "lost").await.unwrap();

        protocol.add_message(Peer::User(7), 41, own_message("from phone"));
        conn.handle_protocol_event(ProtocolEvent::NewMessage { peer: Peer::User(7), message_id: 41 })
            .await
            .unwrap();
        assert!(conn.conversation(&Peer::User(7)).is_empty());

        conn.sweep_timeouts(now() + Duration::from_secs(3600)).await;
        assert_eq!(conn.conversation(&Peer::User(7)), vec![41]);
    }

    #[tokio::test]
    async fn test_unconfirmed_send_times_out() {
        let (mut conn, _protocol) = ready_connection().await;
        let (info, _) = conn.ensure_text_channel(HandleType::Contact, 2).unwrap();
        let mut rx = conn.context().events.subscribe();
        let token = conn.send_message(info.id, "hi").await.unwrap();

        conn.sweep_timeouts(now() + Duration::from_secs(3600)).await;
        let events = drain_events(&mut rx);
        assert!(events.iter().any(|event| matches!(
            event,
            FrameworkEvent::MessageSendFailed {
                token: t,
                error: SessionError::OperationTimeout { .. },
                ..
            } if *t == token
        )));
    }

    #[tokio::test]
    async fn test_contact_status_becomes_presence() {
        let (mut conn, _protocol) = ready_connection().await;
        conn.handle_protocol_event(ProtocolEvent::ContactStatusChanged {
            user_id: 7,
            status: ContactStatus::Online,
        })
        .await
        .unwrap();

        let batch = conn.get_presences(&[2, 99]).unwrap();
        assert_eq!(batch.items[&2].status, "available");
        assert!(matches!(batch.errors[&99], SessionError::UnknownHandle { handle: 99, .. }));
    }

    #[tokio::test]
    async fn test_room_list_cancel_is_silent() {
        let (mut conn, protocol) = ready_connection().await;
        conn.room_list_start_listing().await.unwrap();
        let operation = protocol.last_operation();

        let rooms = |id| vec![RoomInfo { chat_id: id, title: "r".into(), members: 2 }];
        conn.handle_protocol_event(ProtocolEvent::RoomsDiscovered { operation, rooms: rooms(1) })
            .await
            .unwrap();
        conn.room_list_stop_listing().await.unwrap();
        assert!(protocol.calls().contains(&ProtocolCall::CancelOperation(operation)));

        let mut rx = conn.context().events.subscribe();
        conn.handle_protocol_event(ProtocolEvent::RoomsDiscovered { operation, rooms: rooms(2) })
            .await
            .unwrap();
        assert!(drain_events(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_presence_deferred_until_ready() {
        let protocol = Arc::new(MockProtocol::new());
        let mut conn = connection(protocol.clone());
        conn.set_presence("hidden", "").await.unwrap();
        assert!(protocol.calls().is_empty());

        let err = conn.set_presence("unknown", "").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidArgument(_)));
    }
}
