//! Identity Registry
//!
//! Bidirectional mapping between framework handles and protocol peers, one
//! namespace per [`HandleType`].
//!
//! # Invariants
//!
//! - Within a namespace the mapping is injective: one handle, one peer.
//! - Handles are allocated monotonically starting at 1 and are never
//!   reassigned or recycled while the registry lives. Entries are only dropped
//!   together with the whole registry at session teardown.

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::errors::{SessionError, SessionResult};
use crate::types::{ChatId, Handle, HandleType, Peer, UserId};

/// One handle namespace
#[derive(Debug)]
struct HandleTable {
    handle_type: HandleType,
    by_handle: BTreeMap<Handle, Peer>,
    by_peer: HashMap<Peer, Handle>,
    next: Handle,
}

impl HandleTable {
    fn new(handle_type: HandleType) -> Self {
        Self {
            handle_type,
            by_handle: BTreeMap::new(),
            by_peer: HashMap::new(),
            next: 1,
        }
    }

    fn ensure(&mut self, peer: Peer) -> Handle {
        if let Some(handle) = self.by_peer.get(&peer) {
            return *handle;
        }

        let handle = self.next;
        self.next += 1;
        self.by_handle.insert(handle, peer);
        self.by_peer.insert(peer, handle);

        trace!(%peer, handle, handle_type = %self.handle_type, "Allocated handle");
        handle
    }

    fn resolve(&self, handle: Handle) -> SessionResult<Peer> {
        self.by_handle
            .get(&handle)
            .copied()
            .ok_or_else(|| SessionError::unknown_handle(handle, self.handle_type))
    }
}

/// Handle ↔ peer registry for one session
#[derive(Debug)]
pub struct HandleRegistry {
    contacts: HandleTable,
    chats: HandleTable,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            contacts: HandleTable::new(HandleType::Contact),
            chats: HandleTable::new(HandleType::Chat),
        }
    }

    fn table(&self, handle_type: HandleType) -> &HandleTable {
        match handle_type {
            HandleType::Contact => &self.contacts,
            HandleType::Chat => &self.chats,
        }
    }

    /// Return the handle for `peer`, allocating one on first sight
    ///
    /// Idempotent: equal peers always yield the same handle.
    pub fn ensure_handle(&mut self, peer: Peer) -> Handle {
        match peer {
            Peer::User(_) => self.contacts.ensure(peer),
            Peer::Chat(_) => self.chats.ensure(peer),
        }
    }

    /// Contact-namespace form of [`ensure_handle`](Self::ensure_handle)
    pub fn ensure_contact(&mut self, user_id: UserId) -> Handle {
        self.contacts.ensure(Peer::User(user_id))
    }

    /// Chat-namespace form of [`ensure_handle`](Self::ensure_handle)
    pub fn ensure_chat(&mut self, chat_id: ChatId) -> Handle {
        self.chats.ensure(Peer::Chat(chat_id))
    }

    /// Reverse lookup
    pub fn resolve_peer(&self, handle: Handle, handle_type: HandleType) -> SessionResult<Peer> {
        self.table(handle_type).resolve(handle)
    }

    /// Lookup without allocating
    pub fn handle_of(&self, peer: &Peer) -> Option<Handle> {
        self.table(peer.handle_type()).by_peer.get(peer).copied()
    }

    /// Identifier strings for `handles`, in order
    ///
    /// Unknown handles yield an empty string in their slot instead of failing
    /// the whole batch.
    pub fn inspect_handles(&self, handle_type: HandleType, handles: &[Handle]) -> Vec<String> {
        let table = self.table(handle_type);
        handles
            .iter()
            .map(|handle| {
                table
                    .by_handle
                    .get(handle)
                    .map(Peer::to_identifier)
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Parse identifiers and ensure handles for them
    ///
    /// All identifiers are validated before anything is allocated, so a
    /// rejected request leaves the registry untouched.
    pub fn request_handles(
        &mut self,
        handle_type: HandleType,
        identifiers: &[String],
    ) -> SessionResult<Vec<Handle>> {
        let peers = identifiers
            .iter()
            .map(|identifier| {
                let peer: Peer = identifier.parse()?;
                if peer.handle_type() != handle_type {
                    return Err(SessionError::InvalidIdentifier(identifier.clone()));
                }
                Ok(peer)
            })
            .collect::<SessionResult<Vec<_>>>()?;

        Ok(peers.into_iter().map(|peer| self.ensure_handle(peer)).collect())
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.by_handle.len()
    }

    pub fn chat_count(&self) -> usize {
        self.chats.by_handle.len()
    }

    pub fn len(&self) -> usize {
        self.contact_count() + self.chat_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
