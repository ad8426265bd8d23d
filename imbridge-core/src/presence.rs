//! Presence mapping
//!
//! The framework uses named statuses from a fixed status table; the protocol only
//! knows online/offline. This module owns the translation in both
//! directions.

use serde::{Deserialize, Serialize};

use crate::errors::{SessionError, SessionResult};
use crate::protocol::ContactStatus;

/// Framework presence category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresenceType {
    Available,
    Away,
    Hidden,
    Offline,
    Unknown,
    Error,
}

/// One entry of the status table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEntry {
    pub name: &'static str,
    pub kind: PresenceType,
    /// May be set on the self contact
    pub may_set_on_self: bool,
    pub can_have_message: bool,
}

/// Statuses supported by the connection
pub const STATUS_TABLE: &[StatusEntry] = &[
    StatusEntry { name: "available", kind: PresenceType::Available, may_set_on_self: true, can_have_message: true },
    StatusEntry { name: "away", kind: PresenceType::Away, may_set_on_self: true, can_have_message: true },
    StatusEntry { name: "hidden", kind: PresenceType::Hidden, may_set_on_self: true, can_have_message: false },
    StatusEntry { name: "offline", kind: PresenceType::Offline, may_set_on_self: true, can_have_message: false },
    StatusEntry { name: "unknown", kind: PresenceType::Unknown, may_set_on_self: false, can_have_message: false },
    StatusEntry { name: "error", kind: PresenceType::Error, may_set_on_self: false, can_have_message: false },
];

pub fn status_entry(name: &str) -> Option<&'static StatusEntry> {
    STATUS_TABLE.iter().find(|entry| entry.name == name)
}

/// Presence of one contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub kind: PresenceType,
    pub status: String,
    pub message: String,
}

impl Presence {
    fn from_entry(entry: &StatusEntry, message: &str) -> Self {
        Self {
            kind: entry.kind,
            status: entry.name.to_string(),
            message: if entry.can_have_message { message.to_string() } else { String::new() },
        }
    }

    pub fn unknown() -> Self {
        Self {
            kind: PresenceType::Unknown,
            status: "unknown".to_string(),
            message: String::new(),
        }
    }

    pub fn offline() -> Self {
        Self {
            kind: PresenceType::Offline,
            status: "offline".to_string(),
            message: String::new(),
        }
    }

    pub fn from_contact_status(status: ContactStatus) -> Self {
        match status {
            ContactStatus::Online => Self {
                kind: PresenceType::Available,
                status: "available".to_string(),
                message: String::new(),
            },
            ContactStatus::Offline => Self::offline(),
            ContactStatus::Unknown => Self::unknown(),
        }
    }

    /// Validate a self presence request against the status table
    pub fn requested(status: &str, message: &str) -> SessionResult<Self> {
        match status_entry(status) {
            Some(entry) if entry.may_set_on_self => Ok(Self::from_entry(entry, message)),
            Some(_) => Err(SessionError::InvalidArgument(format!(
                "status '{}' cannot be set on self",
                status
            ))),
            None => Err(SessionError::InvalidArgument(format!("unknown status '{}'", status))),
        }
    }

    /// Online flag pushed to the protocol for this self presence
    pub fn protocol_online(&self) -> bool {
        matches!(self.kind, PresenceType::Available | PresenceType::Away)
    }
}
