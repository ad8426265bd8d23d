//! Test fixtures for creating common test objects

use std::sync::Arc;

use crate::config::{AccountConfig, SessionConfig};
use crate::context::SessionContext;
use crate::protocol::{DropReason, MessageData, ProtocolEvent, TransportStatus, UserInfo};
use crate::types::{Peer, UserId};

pub const TEST_PHONE: &str = "15550100";

pub fn test_account() -> AccountConfig {
    AccountConfig {
        phone: Some(TEST_PHONE.to_string()),
        ..Default::default()
    }
}

pub fn test_context() -> Arc<SessionContext> {
    SessionContext::new(SessionConfig::default())
}

/// Builder for cached user profiles
pub struct TestUserBuilder {
    info: UserInfo,
}

impl TestUserBuilder {
    pub fn new(first_name: &str) -> Self {
        Self {
            info: UserInfo {
                first_name: first_name.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn last_name(mut self, last_name: &str) -> Self {
        self.info.last_name = last_name.to_string();
        self
    }

    pub fn username(mut self, username: &str) -> Self {
        self.info.username = Some(username.to_string());
        self
    }

    pub fn phone(mut self, phone: &str) -> Self {
        self.info.phone = Some(phone.to_string());
        self
    }

    pub fn avatar(mut self, token: &str) -> Self {
        self.info.avatar_token = Some(token.to_string());
        self
    }

    pub fn build(self) -> UserInfo {
        self.info
    }
}

pub fn incoming_text(sender: UserId, text: &str, timestamp: u64) -> MessageData {
    MessageData {
        sender,
        text: text.to_string(),
        timestamp,
        outgoing: false,
    }
}

/// Protocol answers that take a fresh connection from `Connecting` to the
/// auth-code challenge
pub fn transport_up_events() -> Vec<ProtocolEvent> {
    vec![
        ProtocolEvent::ConnectionStatusChanged {
            status: TransportStatus::Connected,
            reason: DropReason::Requested,
        },
        ProtocolEvent::AuthCodeRequired { two_factor: false },
    ]
}

/// Protocol answers that take a signed-in connection to `Ready`
pub fn sign_in_complete_events(self_id: UserId, contacts: Vec<UserId>, dialogs: Vec<Peer>) -> Vec<ProtocolEvent> {
    vec![
        ProtocolEvent::SelfUserAvailable { user_id: self_id },
        ProtocolEvent::ContactListReady { user_ids: contacts },
        ProtocolEvent::DialogsReady { peers: dialogs },
    ]
}
