//! Requests that have been sent and are awaiting a reply or their deadline.
//!
//! The table is owned by the transmitter loop. An entry is inserted before the
//! request is handed to the transport and is taken out exactly once, by
//! whichever of the reply or the timeout gets there first; the loser finds
//! nothing and is dropped.

use std::collections::HashMap;
use std::sync::Weak;
use std::time::{Instant, SystemTime};

use crate::engine::PingTarget;

#[derive(Debug, Clone)]
pub(crate) struct PendingRequest {
    pub target: Weak<PingTarget>,
    pub epoch: SystemTime,
    pub sent_at: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: HashMap<u64, PendingRequest>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: u64, request: PendingRequest) {
        if self.entries.insert(token, request).is_some() {
            log::warn!("Sequence {} was already pending", token);
        }
    }

    pub fn take(&mut self, token: u64) -> Option<PendingRequest> {
        self.entries.remove(&token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Forgets every outstanding request, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let abandoned = self.entries.len();
        self.entries.clear();
        abandoned
    }
}
