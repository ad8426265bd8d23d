//! Core identifiers shared by every session component
//!
//! The framework side speaks in integer [`Handle`]s scoped by [`HandleType`];
//! the protocol side speaks in [`Peer`]s. Everything else in the crate is built
//! on these few types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::SessionError;

/// Protocol-level user identifier
pub type UserId = u32;

/// Protocol-level chat identifier
pub type ChatId = u32;

/// Protocol-assigned message identifier, unique only within one peer's dialog
pub type MessageId = u32;

/// Framework handle (0 is never allocated)
pub type Handle = u32;

/// Adapter-generated value linking a send request to its server-assigned id
pub type CorrelationToken = u64;

/// Protocol-level identifier of a conversation partner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Peer {
    User(UserId),
    Chat(ChatId),
}

impl Peer {
    const USER_PREFIX: &'static str = "user";
    const CHAT_PREFIX: &'static str = "chat";

    /// Raw protocol id without the kind
    pub fn id(&self) -> u32 {
        match self {
            Peer::User(id) | Peer::Chat(id) => *id,
        }
    }

    /// Handle namespace this peer lives in
    pub fn handle_type(&self) -> HandleType {
        match self {
            Peer::User(_) => HandleType::Contact,
            Peer::Chat(_) => HandleType::Chat,
        }
    }

    pub fn is_room(&self) -> bool {
        matches!(self, Peer::Chat(_))
    }

    /// Stable text form exposed to the framework as the handle identifier
    pub fn to_identifier(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::User(id) => write!(f, "{}{}", Self::USER_PREFIX, id),
            Peer::Chat(id) => write!(f, "{}{}", Self::CHAT_PREFIX, id),
        }
    }
}

impl FromStr for Peer {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SessionError::InvalidIdentifier(s.to_string());

        let (ctor, digits): (fn(u32) -> Peer, &str) =
            if let Some(rest) = s.strip_prefix(Self::USER_PREFIX) {
                (Peer::User, rest)
            } else if let Some(rest) = s.strip_prefix(Self::CHAT_PREFIX) {
                (Peer::Chat, rest)
            } else {
                return Err(invalid());
            };

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        match digits.parse::<u32>() {
            Ok(0) | Err(_) => Err(invalid()),
            Ok(id) => Ok(ctor(id)),
        }
    }
}

/// Handle namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleType {
    Contact,
    Chat,
}

impl fmt::Display for HandleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleType::Contact => write!(f, "contact"),
            HandleType::Chat => write!(f, "chat"),
        }
    }
}

/// Framework-visible channel object identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel/{}", self.0)
    }
}

/// Identifier of an asynchronous protocol operation (avatar fetch, room listing)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}
