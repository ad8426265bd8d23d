//! In-flight avatar fetches
//!
//! One protocol operation per peer. Completions for operations that were
//! cancelled (or never issued by this session) are ignored.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::types::{Handle, OperationId, Peer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvatarRequest {
    pub peer: Peer,
    pub handle: Handle,
    pub issued_at: Instant,
}

#[derive(Debug, Default)]
pub struct AvatarRequests {
    pending: HashMap<OperationId, AvatarRequest>,
}

impl AvatarRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, operation: OperationId, peer: Peer, handle: Handle, issued_at: Instant) {
        self.pending.insert(operation, AvatarRequest { peer, handle, issued_at });
    }

    /// Whether a fetch for `peer` is already running
    pub fn is_pending(&self, peer: &Peer) -> bool {
        self.pending.values().any(|request| request.peer == *peer)
    }

    /// Take the request an operation belongs to; `None` when it was cancelled
    pub fn complete(&mut self, operation: OperationId) -> Option<AvatarRequest> {
        self.pending.remove(&operation)
    }

    /// Forget every pending request; returns the operations to cancel
    pub fn cancel_all(&mut self) -> Vec<OperationId> {
        let mut operations: Vec<OperationId> = self.pending.drain().map(|(op, _)| op).collect();
        operations.sort();
        operations
    }

    /// Remove requests older than `timeout`
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(OperationId, AvatarRequest)> {
        let expired: Vec<OperationId> = self
            .pending
            .iter()
            .filter(|(_, request)| now.saturating_duration_since(request.issued_at) >= timeout)
            .map(|(op, _)| *op)
            .collect();

        let mut removed: Vec<(OperationId, AvatarRequest)> = expired
            .into_iter()
            .filter_map(|op| self.pending.remove(&op).map(|request| (op, request)))
            .collect();
        removed.sort_by_key(|(op, _)| *op);
        removed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
