//! Text channel: one conversation with a contact or a chat

use std::collections::BTreeSet;

use crate::framework::{ChannelInfo, ChannelKind, ChannelMessage};
use crate::types::{ChannelId, Handle, HandleType, MessageId, Peer};

/// One conversation
///
/// Only message ids are retained: message bodies go out with their
/// `MessageReceived` event and are not kept for the session.
#[derive(Debug)]
pub struct TextChannel {
    id: ChannelId,
    peer: Peer,
    target: (HandleType, Handle),
    incoming: bool,
    message_ids: BTreeSet<MessageId>,
}

impl TextChannel {
    pub(crate) fn new(id: ChannelId, peer: Peer, target: Handle, incoming: bool) -> Self {
        Self {
            id,
            peer,
            target: (peer.handle_type(), target),
            incoming,
            message_ids: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn target(&self) -> (HandleType, Handle) {
        self.target
    }

    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            id: self.id,
            kind: ChannelKind::Text,
            target: Some(self.target),
            incoming: self.incoming,
        }
    }

    /// Append a batch; returns the messages that were new, ascending by id
    pub(crate) fn append(&mut self, mut batch: Vec<ChannelMessage>) -> Vec<ChannelMessage> {
        batch.sort_by_key(|message| message.id);
        batch.dedup_by_key(|message| message.id);
        batch.retain(|message| self.message_ids.insert(message.id));
        batch
    }

    /// Record the id of a locally sent message; `false` when already known
    pub(crate) fn record_sent(&mut self, message_id: MessageId) -> bool {
        self.message_ids.insert(message_id)
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.message_ids.contains(&message_id)
    }

    /// Known message ids, ascending
    pub fn message_ids(&self) -> Vec<MessageId> {
        self.message_ids.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.message_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message_ids.is_empty()
    }
}
