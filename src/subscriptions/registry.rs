use super::subscription::{Completion, SubscriptionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct RegistryEntry {
    cancel: CancellationToken,
    done: Completion,
}

/// Live subscriptions keyed by id.
///
/// Entries are added once the server has accepted the subscription and
/// removed by the worker during teardown, so the registry never holds a
/// subscription whose completion has fired.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    entries: Mutex<HashMap<SubscriptionId, RegistryEntry>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: SubscriptionId, cancel: CancellationToken, done: Completion) {
        self.entries.lock().insert(id, RegistryEntry { cancel, done });
    }

    /// Remove the entry; false when it was already gone
    pub fn remove(&self, id: &SubscriptionId) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    /// Signal the subscription to stop and hand back its completion signal
    pub fn cancel(&self, id: &SubscriptionId) -> Option<Completion> {
        let entries = self.entries.lock();
        let entry = entries.get(id)?;
        entry.cancel.cancel();
        Some(entry.done.clone())
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Cancel every subscription, returning their completion signals.
    /// Entries stay registered until their workers remove them.
    pub fn cancel_all(&self) -> Vec<Completion> {
        self.entries
            .lock()
            .values()
            .map(|entry| {
                entry.cancel.cancel();
                entry.done.clone()
            })
            .collect()
    }
}
