//! Admission against `max_connections`.
//!
//! A slot is reserved before the upgrade is accepted and held by the socket
//! task for the connection's whole life, so concurrent upgrades cannot
//! overshoot the limit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct ConnectionSlots {
    max: usize,
    taken: Arc<AtomicUsize>,
}

impl ConnectionSlots {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            taken: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve a slot, or `None` when all are taken.
    pub fn try_acquire(&self) -> Option<SlotGuard> {
        self.taken
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .ok()?;
        Some(SlotGuard {
            taken: self.taken.clone(),
        })
    }

    pub fn in_use(&self) -> usize {
        self.taken.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Releases its slot on drop.
#[derive(Debug)]
#[must_use = "the slot is released when the guard is dropped"]
pub struct SlotGuard {
    taken: Arc<AtomicUsize>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let _ = self.taken.fetch_sub(1, Ordering::AcqRel);
    }
}
