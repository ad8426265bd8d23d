//! Framework-facing types and event fan-out
//!
//! Everything the session tells the framework goes out as a [`FrameworkEvent`]
//! through the [`EventBroadcaster`]. Events are only emitted after the
//! internal tables have been updated, so a listener reacting to an event always
//! sees a consistent session.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::broadcast;

use crate::auth::Challenge;
use crate::errors::SessionError;
use crate::presence::Presence;
use crate::protocol::{AuthErrorCode, RoomInfo};
use crate::types::{ChannelId, CorrelationToken, Handle, HandleType, MessageId, Peer};

/// Framework connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
}

/// Reason attached to a status change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusReason {
    NoneSpecified,
    Requested,
    NetworkError,
    AuthenticationFailed,
    SessionInvalidated,
}

/// Channel kinds; the set is closed on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Text,
    RoomList,
}

/// Published description of a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub kind: ChannelKind,
    /// Target of a text channel
    pub target: Option<(HandleType, Handle)>,
    /// Opened by an incoming message rather than a local request
    pub incoming: bool,
}

/// Channel creation request from the framework
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub kind: ChannelKind,
    pub target: Option<(HandleType, Handle)>,
}

impl ChannelRequest {
    pub fn text(handle_type: HandleType, handle: Handle) -> Self {
        Self {
            kind: ChannelKind::Text,
            target: Some((handle_type, handle)),
        }
    }

    pub fn room_list() -> Self {
        Self {
            kind: ChannelKind::RoomList,
            target: None,
        }
    }
}

/// Direction of a channel message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Incoming,
    /// Sent by the account; `token` set when sent from this session
    Outgoing { token: Option<CorrelationToken> },
}

/// A message as stored by a text channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub id: MessageId,
    pub sender: Handle,
    pub text: String,
    pub timestamp: u64,
    /// Message-token header
    pub token: String,
    pub direction: MessageDirection,
}

/// Contact attribute interfaces that can be requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContactInterface {
    Alias,
    Presence,
    ContactList,
    Avatar,
    ContactInfo,
}

/// Contact-list subscription state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    No,
    Yes,
}

/// One vCard-style contact info field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactInfoField {
    pub name: String,
    pub parameters: Vec<String>,
    pub values: Vec<String>,
}

impl ContactInfoField {
    pub fn new(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            parameters: Vec::new(),
            values: vec![value.into()],
        }
    }
}

/// Attributes of one contact; only requested interfaces are filled in
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContactAttributes {
    pub identifier: String,
    pub alias: Option<String>,
    pub presence: Option<Presence>,
    pub subscription: Option<SubscriptionState>,
    pub avatar_token: Option<String>,
    pub info: Option<Vec<ContactInfoField>>,
}

/// Result of a batch request: per-handle values plus per-handle errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    pub items: BTreeMap<Handle, T>,
    pub errors: BTreeMap<Handle, SessionError>,
}

impl<T> Batch<T> {
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            errors: BTreeMap::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Notifications for the framework
#[derive(Debug, Clone, PartialEq)]
pub enum FrameworkEvent {
    StatusChanged {
        status: ConnectionStatus,
        reason: StatusReason,
    },
    /// A SASL-style challenge channel awaits the user's answer
    AuthChallenge {
        challenge: Challenge,
    },
    AuthRejected {
        challenge: Option<Challenge>,
        code: AuthErrorCode,
        message: String,
        retryable: bool,
    },
    AuthAccepted {
        challenge: Challenge,
    },
    ChannelOpened {
        channel: ChannelInfo,
    },
    ChannelClosed {
        channel: ChannelId,
    },
    MessageReceived {
        channel: ChannelId,
        message: ChannelMessage,
    },
    /// Local echo of a send, emitted when the server assigned an id
    MessageSent {
        channel: ChannelId,
        token: CorrelationToken,
        message_id: MessageId,
    },
    MessageSendFailed {
        channel: Option<ChannelId>,
        peer: Peer,
        token: CorrelationToken,
        error: SessionError,
    },
    PresencesChanged {
        presences: BTreeMap<Handle, Presence>,
    },
    ContactListChanged {
        added: BTreeSet<Handle>,
        removed: BTreeSet<Handle>,
    },
    ChatDetailsChanged {
        chat: Handle,
        members: Vec<Handle>,
    },
    AvatarRetrieved {
        handle: Handle,
        token: String,
        mime_type: String,
        bytes: Vec<u8>,
    },
    AvatarFailed {
        handle: Handle,
        error: SessionError,
    },
    RoomListRows {
        rows: Vec<RoomInfo>,
    },
    RoomListingChanged {
        listing: bool,
    },
}

/// Fan-out of framework events to every subscriber
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<FrameworkEvent>,
}

impl EventBroadcaster {
    /// `capacity` events are buffered per lagging subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; returns how many subscribers got it
    pub fn emit(&self, event: FrameworkEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FrameworkEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
