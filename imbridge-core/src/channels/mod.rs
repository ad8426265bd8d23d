//! Channel/Session Supervisor
//!
//! Owns the framework-visible channel objects of one session: at most one
//! text channel per peer and a singleton room-list channel. Creates them on
//! demand, routes protocol events to them, and publishes their lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │         ChannelSupervisor          │
//! │  channels: ChannelId → Channel     │
//! │  text_by_peer: Peer → ChannelId    │
//! │  room_list: Option<ChannelId>      │
//! │  held: Peer → echoes awaiting ids  │
//! └───────┬───────────────────┬────────┘
//!         ▼                   ▼
//!   Channel::Text       Channel::RoomList
//! ```
//!
//! Every mutation completes before the matching [`FrameworkEvent`] is emitted.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info};

use crate::context::SessionContext;
use crate::errors::{SessionError, SessionResult};
use crate::framework::{ChannelInfo, ChannelMessage, FrameworkEvent};
use crate::protocol::RoomInfo;
use crate::types::{ChannelId, CorrelationToken, Handle, MessageId, OperationId, Peer};

mod room_list;
mod text;

pub use room_list::RoomListChannel;
pub use text::TextChannel;

/// The closed set of channel kinds
#[derive(Debug)]
pub enum Channel {
    Text(TextChannel),
    RoomList(RoomListChannel),
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        match self {
            Channel::Text(channel) => channel.id(),
            Channel::RoomList(channel) => channel.id(),
        }
    }

    pub fn info(&self) -> ChannelInfo {
        match self {
            Channel::Text(channel) => channel.info(),
            Channel::RoomList(channel) => channel.info(),
        }
    }
}

/// Per-session channel owner
pub struct ChannelSupervisor {
    ctx: Arc<SessionContext>,
    channels: BTreeMap<ChannelId, Channel>,
    text_by_peer: HashMap<Peer, ChannelId>,
    room_list: Option<ChannelId>,
    held: HashMap<Peer, HeldEchoes>,
    next_id: u32,
}

/// Outgoing messages without a token, seen while a send to the same peer
/// was still waiting for its server id
#[derive(Debug)]
struct HeldEchoes {
    target: Handle,
    messages: BTreeMap<MessageId, ChannelMessage>,
}

impl ChannelSupervisor {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            ctx,
            channels: BTreeMap::new(),
            text_by_peer: HashMap::new(),
            room_list: None,
            held: HashMap::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> ChannelId {
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Existing text channel for `peer`, or a newly opened one
    ///
    /// Returns the channel id and whether it was created by this call.
    pub fn ensure_text_channel(
        &mut self,
        peer: Peer,
        target: Handle,
        incoming: bool,
    ) -> (ChannelId, bool) {
        if let Some(id) = self.text_by_peer.get(&peer) {
            return (*id, false);
        }

        let id = self.allocate_id();
        let channel = TextChannel::new(id, peer, target, incoming);
        let info = channel.info();
        self.channels.insert(id, Channel::Text(channel));
        self.text_by_peer.insert(peer, id);

        info!(%peer, channel = %id, incoming, "Opened text channel");
        self.ctx.events.emit(FrameworkEvent::ChannelOpened { channel: info });
        (id, true)
    }

    pub fn text_channel(&self, peer: &Peer) -> Option<&TextChannel> {
        let id = self.text_by_peer.get(peer)?;
        match self.channels.get(id) {
            Some(Channel::Text(channel)) => Some(channel),
            _ => None,
        }
    }

    fn text_channel_mut(&mut self, peer: &Peer) -> Option<&mut TextChannel> {
        let id = self.text_by_peer.get(peer)?;
        match self.channels.get_mut(id) {
            Some(Channel::Text(channel)) => Some(channel),
            _ => None,
        }
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn channel_for(&self, peer: &Peer) -> Option<ChannelId> {
        self.text_by_peer.get(peer).copied()
    }

    /// Descriptions of all open channels
    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.channels.values().map(Channel::info).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Append messages to `peer`'s conversation in ascending id order
    ///
    /// Opens the channel if needed. Returns the ids that were new.
    pub fn deliver_messages(
        &mut self,
        peer: Peer,
        target: Handle,
        messages: Vec<ChannelMessage>,
    ) -> Vec<MessageId> {
        if messages.is_empty() {
            return Vec::new();
        }

        let (id, _) = self.ensure_text_channel(peer, target, true);
        let added = match self.text_channel_mut(&peer) {
            Some(channel) => channel.append(messages),
            None => return Vec::new(),
        };

        let ids = added.iter().map(|message| message.id).collect();
        for message in added {
            self.ctx.events.emit(FrameworkEvent::MessageReceived { channel: id, message });
        }
        ids
    }

    /// Park an outgoing message that may be the echo of a pending send
    ///
    /// It is dropped if a later `MessageSent` claims its id, and delivered by
    /// [`release_held`](Self::release_held) otherwise.
    pub fn hold_echo(&mut self, peer: Peer, target: Handle, message: ChannelMessage) {
        debug!(%peer, message_id = message.id, "Holding outgoing message until pending sends resolve");
        self.held
            .entry(peer)
            .or_insert_with(|| HeldEchoes {
                target,
                messages: BTreeMap::new(),
            })
            .messages
            .insert(message.id, message);
    }

    /// Number of messages held for `peer`
    pub fn held_count(&self, peer: &Peer) -> usize {
        self.held.get(peer).map_or(0, |held| held.messages.len())
    }

    /// Deliver whatever is still held for `peer`; returns the ids that were new
    pub fn release_held(&mut self, peer: &Peer) -> Vec<MessageId> {
        match self.held.remove(peer) {
            Some(held) => self.deliver_messages(*peer, held.target, held.messages.into_values().collect()),
            None => Vec::new(),
        }
    }

    /// Publish the local echo of a confirmed send
    ///
    /// The id is recorded on the channel so the same message is never echoed
    /// a second time as `MessageReceived`. Returns whether an echo went out.
    pub fn on_message_sent(&mut self, peer: &Peer, token: CorrelationToken, message_id: MessageId) -> bool {
        if let Some(held) = self.held.get_mut(peer) {
            held.messages.remove(&message_id);
            if held.messages.is_empty() {
                self.held.remove(peer);
            }
        }

        let Some(channel) = self.channel_for(peer) else {
            debug!(%peer, message_id, "Send confirmed for a peer without an open channel");
            return false;
        };
        let recorded = self
            .text_channel_mut(peer)
            .is_some_and(|text| text.record_sent(message_id));
        if !recorded {
            debug!(%peer, message_id, "Send confirmed for a message already in the conversation");
            return false;
        }

        self.ctx.events.emit(FrameworkEvent::MessageSent {
            channel,
            token,
            message_id,
        });
        true
    }

    /// Close one channel at the framework's request
    pub fn close_channel(&mut self, id: ChannelId) -> SessionResult<Option<OperationId>> {
        let channel = self
            .channels
            .remove(&id)
            .ok_or_else(|| SessionError::InvalidArgument(format!("no such channel: {}", id)))?;

        let cancelled = match channel {
            Channel::Text(text) => {
                self.text_by_peer.remove(&text.peer());
                None
            }
            Channel::RoomList(mut room_list) => {
                self.room_list = None;
                room_list.stop()
            }
        };

        info!(channel = %id, "Closed channel");
        self.ctx.events.emit(FrameworkEvent::ChannelClosed { channel: id });
        Ok(cancelled)
    }

    /// Close every channel (session teardown)
    ///
    /// Returns the room-list operation that was still running, if any.
    pub fn close_all(&mut self) -> Option<OperationId> {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        let mut cancelled = None;
        for id in ids {
            if let Ok(Some(operation)) = self.close_channel(id) {
                cancelled = Some(operation);
            }
        }
        cancelled
    }

    /// Singleton room-list channel, opened on first use
    pub fn ensure_room_list(&mut self) -> (ChannelId, bool) {
        if let Some(id) = self.room_list {
            return (id, false);
        }

        let id = self.allocate_id();
        let channel = RoomListChannel::new(id);
        let info = channel.info();
        self.channels.insert(id, Channel::RoomList(channel));
        self.room_list = Some(id);

        info!(channel = %id, "Opened room list channel");
        self.ctx.events.emit(FrameworkEvent::ChannelOpened { channel: info });
        (id, true)
    }

    fn room_list_mut(&mut self) -> Option<&mut RoomListChannel> {
        let id = self.room_list?;
        match self.channels.get_mut(&id) {
            Some(Channel::RoomList(channel)) => Some(channel),
            _ => None,
        }
    }

    pub fn is_listing_rooms(&self) -> bool {
        self.room_list
            .and_then(|id| self.channels.get(&id))
            .is_some_and(|channel| matches!(channel, Channel::RoomList(list) if list.is_listing()))
    }

    /// Mark the room list as listing under `operation`
    pub fn start_listing(&mut self, operation: OperationId) {
        self.ensure_room_list();
        if let Some(channel) = self.room_list_mut() {
            channel.start(operation);
            self.ctx.events.emit(FrameworkEvent::RoomListingChanged { listing: true });
        }
    }

    /// Stop forwarding and tear the room list down
    ///
    /// Returns the operation to cancel. Stopping when nothing is listed is not
    /// an error.
    pub fn stop_listing(&mut self) -> Option<OperationId> {
        let id = self.room_list?;
        let operation = self.room_list_mut().and_then(RoomListChannel::stop);
        if operation.is_some() {
            self.ctx.events.emit(FrameworkEvent::RoomListingChanged { listing: false });
        }
        let _ = self.close_channel(id);
        operation
    }

    /// Forward newly discovered rooms; returns how many rows went out
    pub fn on_rooms_discovered(&mut self, operation: OperationId, rooms: Vec<RoomInfo>) -> usize {
        let Some(channel) = self.room_list_mut() else {
            return 0;
        };
        let rows = channel.accept(operation, rooms);
        let forwarded = rows.len();
        if forwarded > 0 {
            self.ctx.events.emit(FrameworkEvent::RoomListRows { rows });
        }
        forwarded
    }

    /// Discovery for `operation` is complete
    pub fn on_listing_finished(&mut self, operation: OperationId) {
        let Some(channel) = self.room_list_mut() else {
            return;
        };
        if channel.operation() == Some(operation) {
            channel.stop();
            self.ctx.events.emit(FrameworkEvent::RoomListingChanged { listing: false });
        }
    }
}
