use super::category::SubscriptionCategory;
use super::event::SubscriptionEvent;
use std::collections::HashSet;

/// Tracks which records a caller has already seen.
///
/// Pushes are full snapshots of the matching result set, so the same record
/// arrives again on every later push. Feed each event through
/// [`SnapshotDeduplicator::is_new`] to keep only first sightings.
#[derive(Debug, Default)]
pub struct SnapshotDeduplicator {
    seen: HashSet<(SubscriptionCategory, i64)>,
}

impl SnapshotDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the event and report whether it was unseen.
    /// Events without an `id` are always new.
    pub fn is_new(&mut self, event: &SubscriptionEvent) -> bool {
        match event.id() {
            Some(id) => self.seen.insert((event.category, id)),
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
