//! Message Correlation Table
//!
//! Links locally generated correlation tokens to protocol-assigned message
//! ids, per conversation. A send is recorded before the protocol has seen it;
//! the "message sent" confirmation later binds the server id to the token.
//! Confirmations may arrive late, out of order, or never.
//!
//! Message ids are only unique within one dialog, so every lookup is scoped by
//! [`Peer`]. Retention is an LRU bound per peer: the oldest entries (pending or
//! resolved) are evicted once a peer reaches `capacity_per_peer`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hashlink::LruCache;
use tracing::{debug, trace};

use crate::types::{CorrelationToken, MessageId, Peer};

/// Lookup result for [`SentMessageTable::message_id_for`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Recorded, no server id yet
    Pending,
    /// Server accepted the message under this id
    Sent(MessageId),
    /// Peer has sends, but not this token (never recorded, expired or evicted)
    UnknownToken,
    /// No sends recorded for this peer
    UnknownPeer,
}

#[derive(Debug, Clone, Copy)]
enum SendEntry {
    Pending { issued_at: Instant },
    Sent { message_id: MessageId },
}

struct PeerSends {
    by_token: LruCache<CorrelationToken, SendEntry>,
    by_message: HashMap<MessageId, CorrelationToken>,
}

impl PeerSends {
    fn new(capacity: usize) -> Self {
        Self {
            by_token: LruCache::new(capacity),
            by_message: HashMap::new(),
        }
    }

    fn forget(&mut self, entry: SendEntry) {
        if let SendEntry::Sent { message_id } = entry {
            self.by_message.remove(&message_id);
        }
    }

    fn make_room_for(&mut self, token: CorrelationToken) {
        if self.by_token.contains_key(&token) {
            return;
        }
        while self.by_token.len() >= self.by_token.capacity() {
            match self.by_token.remove_lru() {
                Some((evicted, entry)) => {
                    trace!(token = evicted, "Evicting correlation entry");
                    self.forget(entry);
                }
                None => break,
            }
        }
    }
}

/// Per-peer sent message correlation
pub struct SentMessageTable {
    peers: HashMap<Peer, PeerSends>,
    capacity_per_peer: usize,
}

impl SentMessageTable {
    /// Create a table retaining at most `capacity_per_peer` entries per peer
    pub fn new(capacity_per_peer: usize) -> Self {
        Self {
            peers: HashMap::new(),
            capacity_per_peer: capacity_per_peer.max(1),
        }
    }

    fn sends_mut(&mut self, peer: Peer) -> &mut PeerSends {
        let capacity = self.capacity_per_peer;
        self.peers
            .entry(peer)
            .or_insert_with(|| PeerSends::new(capacity))
    }

    /// Record a send before any protocol confirmation arrives
    pub fn record_send(&mut self, peer: Peer, token: CorrelationToken, issued_at: Instant) {
        let sends = self.sends_mut(peer);
        sends.make_room_for(token);
        if let Some(previous) = sends.by_token.insert(token, SendEntry::Pending { issued_at }) {
            sends.forget(previous);
        }
        trace!(%peer, token, "Recorded pending send");
    }

    /// Bind the server-assigned id to `token`, replacing the pending entry
    ///
    /// Returns `false` when the token was not pending (late confirmation after
    /// expiry or eviction); the binding is made either way.
    pub fn on_send_confirmed(
        &mut self,
        peer: Peer,
        token: CorrelationToken,
        message_id: MessageId,
    ) -> bool {
        let sends = self.sends_mut(peer);
        sends.make_room_for(token);

        let previous = sends.by_token.insert(token, SendEntry::Sent { message_id });
        let was_pending = matches!(previous, Some(SendEntry::Pending { .. }));
        if let Some(SendEntry::Sent { message_id: old }) = previous {
            if old != message_id {
                sends.by_message.remove(&old);
            }
        }

        if let Some(stale) = sends.by_message.insert(message_id, token) {
            if stale != token {
                sends.by_token.remove(&stale);
            }
        }

        if !was_pending {
            debug!(%peer, token, message_id, "Confirmation for a send that was not pending");
        }
        was_pending
    }

    /// Server id of a locally sent message
    pub fn message_id_for(&self, peer: &Peer, token: CorrelationToken) -> SendStatus {
        let Some(sends) = self.peers.get(peer) else {
            return SendStatus::UnknownPeer;
        };
        match sends.by_token.peek(&token) {
            Some(SendEntry::Pending { .. }) => SendStatus::Pending,
            Some(SendEntry::Sent { message_id }) => SendStatus::Sent(*message_id),
            None => SendStatus::UnknownToken,
        }
    }

    /// Token of a locally sent message, given its server id
    pub fn token_for(&self, peer: &Peer, message_id: MessageId) -> Option<CorrelationToken> {
        self.peers.get(peer)?.by_message.get(&message_id).copied()
    }

    /// Whether `token` is already in use for `peer`
    pub fn contains_token(&self, peer: &Peer, token: CorrelationToken) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|sends| sends.by_token.contains_key(&token))
    }

    /// Whether any send to `peer` still awaits its server id
    pub fn has_pending(&self, peer: &Peer) -> bool {
        self.peers.get(peer).is_some_and(|sends| {
            sends
                .by_token
                .iter()
                .any(|(_, entry)| matches!(entry, SendEntry::Pending { .. }))
        })
    }

    /// Drop pending entries issued more than `timeout` before `now`
    pub fn expire_pending(&mut self, now: Instant, timeout: Duration) -> Vec<(Peer, CorrelationToken)> {
        let mut expired = Vec::new();

        for (peer, sends) in self.peers.iter_mut() {
            let stale: Vec<CorrelationToken> = sends
                .by_token
                .iter()
                .filter_map(|(token, entry)| match entry {
                    SendEntry::Pending { issued_at }
                        if now.saturating_duration_since(*issued_at) >= timeout =>
                    {
                        Some(*token)
                    }
                    _ => None,
                })
                .collect();

            for token in stale {
                sends.by_token.remove(&token);
                expired.push((*peer, token));
            }
        }

        expired
    }

    /// Message token header value for a message in `peer`'s dialog
    ///
    /// Locally sent messages use their correlation token (16 hex digits) so the
    /// framework can match them with the send request; other messages use the
    /// decimal server id.
    pub fn message_token(&self, peer: &Peer, message_id: MessageId) -> String {
        match self.token_for(peer, message_id) {
            Some(token) => format!("{:016x}", token),
            None => message_id.to_string(),
        }
    }

    /// Inverse of [`message_token`](Self::message_token)
    pub fn message_id_for_token(&self, peer: &Peer, message_token: &str) -> Option<MessageId> {
        if message_token.len() == 16 {
            let token = u64::from_str_radix(message_token, 16).ok()?;
            return match self.message_id_for(peer, token) {
                SendStatus::Sent(id) => Some(id),
                _ => None,
            };
        }
        message_token.parse().ok()
    }

    /// Number of tracked entries for `peer`
    pub fn len_for(&self, peer: &Peer) -> usize {
        self.peers.get(peer).map_or(0, |sends| sends.by_token.len())
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
