//! Room-list channel: forwards discovered rooms while a listing is active

use std::collections::HashSet;

use crate::framework::{ChannelInfo, ChannelKind};
use crate::protocol::RoomInfo;
use crate::types::{ChannelId, ChatId, OperationId};

#[derive(Debug)]
pub struct RoomListChannel {
    id: ChannelId,
    listing: Option<OperationId>,
    seen: HashSet<ChatId>,
}

impl RoomListChannel {
    pub(crate) fn new(id: ChannelId) -> Self {
        Self {
            id,
            listing: None,
            seen: HashSet::new(),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            id: self.id,
            kind: ChannelKind::RoomList,
            target: None,
            incoming: false,
        }
    }

    pub fn is_listing(&self) -> bool {
        self.listing.is_some()
    }

    pub fn operation(&self) -> Option<OperationId> {
        self.listing
    }

    pub(crate) fn start(&mut self, operation: OperationId) {
        self.listing = Some(operation);
        self.seen.clear();
    }

    /// Stop forwarding; returns the operation that was active
    pub(crate) fn stop(&mut self) -> Option<OperationId> {
        self.listing.take()
    }

    /// Rooms to forward for this discovery batch
    ///
    /// Batches from a stopped or superseded listing yield nothing.
    pub(crate) fn accept(&mut self, operation: OperationId, rooms: Vec<RoomInfo>) -> Vec<RoomInfo> {
        if self.listing != Some(operation) {
            return Vec::new();
        }
        rooms
            .into_iter()
            .filter(|room| self.seen.insert(room.chat_id))
            .collect()
    }
}
