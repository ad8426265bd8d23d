//! Protocol collaborator seam
//!
//! The protocol engine (server connection, encryption, wire format) lives
//! outside this crate. It is driven through [`ProtocolClient`] and reports back
//! by pushing [`ProtocolEvent`]s onto the session's single-consumer queue.
//!
//! Outbound calls only *issue* a request: they return once the engine accepted
//! it, never after a network round trip. Completions come back as events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::{ChatId, CorrelationToken, MessageId, OperationId, Peer, UserId};

/// Result type for protocol calls
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Failure to issue a protocol request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Not connected")]
    NotConnected,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Authentication error codes reported by the protocol engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthErrorCode {
    Unknown,
    PhoneNumberUnknown,
    PhoneCodeInvalid,
    PhoneCodeExpired,
    PasswordHashInvalid,
    FloodWait,
}

impl AuthErrorCode {
    /// Whether the user may simply try the same challenge again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthErrorCode::PhoneCodeInvalid
                | AuthErrorCode::PasswordHashInvalid
                | AuthErrorCode::FloodWait
        )
    }
}

impl fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthErrorCode::Unknown => "unknown",
            AuthErrorCode::PhoneNumberUnknown => "phone number unknown",
            AuthErrorCode::PhoneCodeInvalid => "phone code invalid",
            AuthErrorCode::PhoneCodeExpired => "phone code expired",
            AuthErrorCode::PasswordHashInvalid => "password invalid",
            AuthErrorCode::FloodWait => "flood wait",
        };
        f.write_str(name)
    }
}

/// Transport-level connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportStatus {
    Connecting,
    /// Transport is up; authentication can start
    Connected,
    Disconnected,
}

/// Why the transport went down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// We asked for it
    Requested,
    NetworkError,
    ServerError,
}

/// Online state of a contact as seen by the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactStatus {
    Unknown,
    Online,
    Offline,
}

/// Connection parameters handed to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub phone: String,
    pub server_address: Option<String>,
    pub server_port: u16,
    pub server_key_file: Option<std::path::PathBuf>,
    pub keep_alive_secs: u64,
    /// Opaque engine session previously exported by [`ProtocolClient::export_session`]
    pub session_data: Option<Vec<u8>>,
}

/// Cached user profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub first_name: String,
    pub last_name: String,
    pub username: Option<String>,
    pub phone: Option<String>,
    pub avatar_token: Option<String>,
}

impl UserInfo {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Cached group chat details
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub title: String,
    pub members: Vec<UserId>,
    pub avatar_token: Option<String>,
}

/// Cached message content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageData {
    pub sender: UserId,
    pub text: String,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    /// Sent by the account owner (possibly from another device)
    pub outgoing: bool,
}

/// A discovered room, as listed by the room-list channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub chat_id: ChatId,
    pub title: String,
    pub members: u32,
}

/// Avatar image bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarData {
    pub token: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Typed events delivered by the protocol engine
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    ConnectionStatusChanged {
        status: TransportStatus,
        reason: DropReason,
    },
    AuthCodeRequired {
        /// The account is known to be protected by a cloud password
        two_factor: bool,
    },
    PasswordRequired,
    PasswordCheckFailed,
    AuthError {
        code: AuthErrorCode,
        message: String,
    },
    SelfUserAvailable {
        user_id: UserId,
    },
    ContactListReady {
        user_ids: Vec<UserId>,
    },
    DialogsReady {
        peers: Vec<Peer>,
    },
    ContactStatusChanged {
        user_id: UserId,
        status: ContactStatus,
    },
    NewMessage {
        peer: Peer,
        message_id: MessageId,
    },
    SyncMessages {
        peer: Peer,
        message_ids: Vec<MessageId>,
    },
    MessageSent {
        peer: Peer,
        token: CorrelationToken,
        message_id: MessageId,
    },
    AvatarFetchCompleted {
        operation: OperationId,
        peer: Peer,
        result: Result<AvatarData, String>,
    },
    RoomsDiscovered {
        operation: OperationId,
        rooms: Vec<RoomInfo>,
    },
    RoomListingFinished {
        operation: OperationId,
    },
    ChatChanged {
        chat_id: ChatId,
    },
    AccountInvalidated {
        account: String,
    },
}

/// Outbound protocol calls plus read access to the engine's cache
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Open the transport
    async fn connect(&self, params: &ConnectParams) -> ProtocolResult<()>;

    /// Close the transport
    async fn disconnect(&self) -> ProtocolResult<()>;

    /// Start sign-in (or sign-up) for `phone`; the engine answers with
    /// `AuthCodeRequired`
    async fn sign_in(&self, phone: &str) -> ProtocolResult<()>;

    /// Resume an already authorized engine session
    async fn check_in(&self) -> ProtocolResult<()>;

    async fn submit_auth_code(&self, code: &str) -> ProtocolResult<()>;

    async fn submit_password(&self, password: &str) -> ProtocolResult<()>;

    /// Queue a text message; confirmed later by `MessageSent` carrying `token`
    async fn send_message(
        &self,
        peer: Peer,
        text: &str,
        token: CorrelationToken,
    ) -> ProtocolResult<()>;

    async fn set_online(&self, online: bool) -> ProtocolResult<()>;

    async fn fetch_avatar(&self, peer: Peer) -> ProtocolResult<OperationId>;

    async fn sync_contact_list(&self) -> ProtocolResult<()>;

    async fn sync_dialogs(&self) -> ProtocolResult<()>;

    async fn delete_contacts(&self, user_ids: &[UserId]) -> ProtocolResult<()>;

    /// Start room discovery; results arrive as `RoomsDiscovered`
    async fn list_rooms(&self) -> ProtocolResult<OperationId>;

    /// Best-effort cancellation of an in-flight operation
    async fn cancel_operation(&self, operation: OperationId);

    fn user_info(&self, user_id: UserId) -> Option<UserInfo>;

    fn chat_info(&self, chat_id: ChatId) -> Option<ChatInfo>;

    fn message(&self, peer: Peer, message_id: MessageId) -> Option<MessageData>;

    /// Serialized engine session for resumption, if authorized
    fn export_session(&self) -> Option<Vec<u8>> {
        None
    }
}
