//! In-memory protocol engine
//!
//! Records every outbound call and serves users, chats and messages from a
//! cache filled by the test. It never produces events on its own: tests (or
//! the demo) push the protocol's answers explicitly, which keeps ordering
//! deterministic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::protocol::{
    ChatInfo, ConnectParams, MessageData, ProtocolClient, ProtocolError, ProtocolResult, UserInfo,
};
use crate::types::{ChatId, CorrelationToken, MessageId, OperationId, Peer, UserId};

/// One outbound call as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolCall {
    Connect(ConnectParams),
    Disconnect,
    SignIn(String),
    CheckIn,
    SubmitAuthCode(String),
    SubmitPassword(String),
    SendMessage {
        peer: Peer,
        text: String,
        token: CorrelationToken,
    },
    SetOnline(bool),
    FetchAvatar(Peer),
    SyncContactList,
    SyncDialogs,
    DeleteContacts(Vec<UserId>),
    ListRooms,
    CancelOperation(OperationId),
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<ProtocolCall>,
    users: HashMap<UserId, UserInfo>,
    chats: HashMap<ChatId, ChatInfo>,
    messages: HashMap<(Peer, MessageId), MessageData>,
    session: Option<Vec<u8>>,
    fail_connect: bool,
    fail_sends: bool,
    last_operation: Option<OperationId>,
}

#[derive(Debug, Default)]
pub struct MockProtocol {
    state: Mutex<MockState>,
    next_operation: AtomicU64,
}

impl MockProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: ProtocolCall) {
        self.state().calls.push(call);
    }

    fn next_operation(&self) -> OperationId {
        let operation = OperationId(self.next_operation.fetch_add(1, Ordering::Relaxed) + 1);
        self.state().last_operation = Some(operation);
        operation
    }

    pub fn add_user(&self, user_id: UserId, info: UserInfo) {
        self.state().users.insert(user_id, info);
    }

    pub fn add_chat(&self, chat_id: ChatId, info: ChatInfo) {
        self.state().chats.insert(chat_id, info);
    }

    pub fn add_message(&self, peer: Peer, message_id: MessageId, data: MessageData) {
        self.state().messages.insert((peer, message_id), data);
    }

    /// Session blob returned by `export_session`
    pub fn set_session(&self, session: Option<Vec<u8>>) {
        self.state().session = session;
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state().fail_sends = fail;
    }

    /// Calls recorded so far, oldest first
    pub fn calls(&self) -> Vec<ProtocolCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Number of recorded calls matching `predicate`
    pub fn count_calls(&self, predicate: impl Fn(&ProtocolCall) -> bool) -> usize {
        self.state().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Operation id handed out by the latest `fetch_avatar`/`list_rooms`
    pub fn last_operation(&self) -> OperationId {
        self.state().last_operation.unwrap_or(OperationId(0))
    }
}

#[async_trait]
impl ProtocolClient for MockProtocol {
    async fn connect(&self, params: &ConnectParams) -> ProtocolResult<()> {
        self.record(ProtocolCall::Connect(params.clone()));
        if self.state().fail_connect {
            return Err(ProtocolError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self) -> ProtocolResult<()> {
        self.record(ProtocolCall::Disconnect);
        Ok(())
    }

    async fn sign_in(&self, phone: &str) -> ProtocolResult<()> {
        self.record(ProtocolCall::SignIn(phone.to_string()));
        Ok(())
    }

    async fn check_in(&self) -> ProtocolResult<()> {
        self.record(ProtocolCall::CheckIn);
        Ok(())
    }

    async fn submit_auth_code(&self, code: &str) -> ProtocolResult<()> {
        self.record(ProtocolCall::SubmitAuthCode(code.to_string()));
        Ok(())
    }

    async fn submit_password(&self, password: &str) -> ProtocolResult<()> {
        self.record(ProtocolCall::SubmitPassword(password.to_string()));
        Ok(())
    }

    async fn send_message(&self, peer: Peer, text: &str, token: CorrelationToken) -> ProtocolResult<()> {
        if self.state().fail_sends {
            return Err(ProtocolError::Rejected("sending disabled".to_string()));
        }
        self.record(ProtocolCall::SendMessage {
            peer,
            text: text.to_string(),
            token,
        });
        Ok(())
    }

    async fn set_online(&self, online: bool) -> ProtocolResult<()> {
        self.record(ProtocolCall::SetOnline(online));
        Ok(())
    }

    async fn fetch_avatar(&self, peer: Peer) -> ProtocolResult<OperationId> {
        self.record(ProtocolCall::FetchAvatar(peer));
        Ok(self.next_operation())
    }

    async fn sync_contact_list(&self) -> ProtocolResult<()> {
        self.record(ProtocolCall::SyncContactList);
        Ok(())
    }

    async fn sync_dialogs(&self) -> ProtocolResult<()> {
        self.record(ProtocolCall::SyncDialogs);
        Ok(())
    }

    async fn delete_contacts(&self, user_ids: &[UserId]) -> ProtocolResult<()> {
        self.record(ProtocolCall::DeleteContacts(user_ids.to_vec()));
        Ok(())
    }

    async fn list_rooms(&self) -> ProtocolResult<OperationId> {
        self.record(ProtocolCall::ListRooms);
        Ok(self.next_operation())
    }

    async fn cancel_operation(&self, operation: OperationId) {
        self.record(ProtocolCall::CancelOperation(operation));
    }

    fn user_info(&self, user_id: UserId) -> Option<UserInfo> {
        self.state().users.get(&user_id).cloned()
    }

    fn chat_info(&self, chat_id: ChatId) -> Option<ChatInfo> {
        self.state().chats.get(&chat_id).cloned()
    }

    fn message(&self, peer: Peer, message_id: MessageId) -> Option<MessageData> {
        self.state().messages.get(&(peer, message_id)).cloned()
    }

    fn export_session(&self) -> Option<Vec<u8>> {
        self.state().session.clone()
    }
}
