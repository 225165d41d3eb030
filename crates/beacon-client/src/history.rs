use std::collections::VecDeque;

use beacon_core::{Envelope, MessageKind};

/// Bounded newest-first record of decoded inbound envelopes.
#[derive(Debug, Clone)]
pub struct MessageHistory {
    capacity: usize,
    entries: VecDeque<Envelope>,
}

impl MessageHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Record an envelope, evicting the oldest past capacity.
    pub fn push(&mut self, envelope: Envelope) {
        if self.capacity == 0 {
            return;
        }
        self.entries.push_front(envelope);
        self.entries.truncate(self.capacity);
    }

    pub fn last(&self) -> Option<&Envelope> {
        self.entries.front()
    }

    /// Most recent envelope of `kind`.
    pub fn last_of(&self, kind: MessageKind) -> Option<&Envelope> {
        self.entries.iter().find(|e| e.kind() == Some(kind))
    }

    /// Newest first.
    pub fn to_vec(&self) -> Vec<Envelope> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
