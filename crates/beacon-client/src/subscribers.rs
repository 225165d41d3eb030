//! Per-kind callback lists with token-based unsubscribe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use beacon_core::{Envelope, MessageKind};
use parking_lot::Mutex;

/// Callback invoked with each matching decoded envelope.
pub type Callback = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// `None` is the "every message" list.
type Topic = Option<MessageKind>;

#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    topics: Mutex<HashMap<Topic, Vec<(u64, Callback)>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, topic: Topic, callback: Callback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics.lock().entry(topic).or_default().push((id, callback));
        id
    }

    fn remove(&self, topic: Topic, id: u64) -> bool {
        let mut topics = self.topics.lock();
        let Some(list) = topics.get_mut(&topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|(entry, _)| *entry != id);
        let removed = list.len() != before;
        if list.is_empty() {
            let _ = topics.remove(&topic);
        }
        removed
    }

    /// Number of callbacks registered for `kind` (`None` for catch-all).
    pub fn count(&self, kind: Option<MessageKind>) -> usize {
        self.topics.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Call the kind's subscribers in registration order, then the catch-all
    /// observers. Unknown kinds only reach the catch-all observers.
    ///
    /// Callbacks run outside the lock and may subscribe or unsubscribe.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let callbacks: Vec<Callback> = {
            let topics = self.topics.lock();
            let specific = envelope.kind().and_then(|k| topics.get(&Some(k)));
            let all = topics.get(&None);
            specific
                .into_iter()
                .chain(all)
                .flatten()
                .map(|(_, cb)| cb.clone())
                .collect()
        };
        for cb in &callbacks {
            cb(envelope);
        }
        callbacks.len()
    }
}

/// Handle for one registered callback.
///
/// Dropping it keeps the callback registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[derive(Debug)]
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    topic: Topic,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    pub(crate) fn register(registry: &Arc<SubscriberRegistry>, topic: Topic, callback: Callback) -> Self {
        let id = registry.insert(topic, callback);
        Self {
            id,
            topic,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn kind(&self) -> Option<MessageKind> {
        self.topic
    }

    /// Remove exactly this callback. Returns whether it was still registered.
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(self.topic, self.id))
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.topics.lock();
        f.debug_struct("SubscriberRegistry")
            .field("topics", &topics.len())
            .finish()
    }
}
