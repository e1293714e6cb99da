use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::registry::ConnectorId;
use crate::sequencer::SyncId;

/// Ids of recently unregistered connectors, bucketed by the round-trip in
/// which they were removed.
///
/// A client message written before it saw a removal may still name the
/// removed connector, so ids stay here until the dispatcher knows the client
/// has moved past that round-trip and calls [`cleanup`](Self::cleanup).
/// Nothing else ever shrinks the journal.
#[derive(Debug, Default)]
pub struct UnregisteredIdJournal {
    buckets: BTreeMap<SyncId, Vec<ConnectorId>>,
    /// Reverse index: id -> the bucket holding it.
    index: HashMap<ConnectorId, SyncId>,
}

/// Snapshot of journal occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalStats {
    pub buckets: usize,
    pub ids: usize,
    pub oldest_sync_id: Option<SyncId>,
    pub newest_sync_id: Option<SyncId>,
}

impl UnregisteredIdJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` as removed during round-trip `sync_id`.
    ///
    /// An id already journaled under another round-trip moves to `sync_id`;
    /// one already in that bucket is left alone.
    pub fn record(&mut self, sync_id: SyncId, id: ConnectorId) {
        match self.index.insert(id.clone(), sync_id) {
            Some(previous) if previous == sync_id => return,
            Some(previous) => self.remove_from_bucket(previous, &id),
            None => {}
        }
        tracing::trace!(sync_id, id = %id, "journaled unregistered connector");
        self.buckets.entry(sync_id).or_default().push(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// The round-trip in which `id` was removed, if it is still journaled.
    pub fn removed_in(&self, id: &str) -> Option<SyncId> {
        self.index.get(id).copied()
    }

    /// Drop every bucket whose sync id is `<= threshold`.
    ///
    /// Returns the number of ids discarded.
    pub fn cleanup(&mut self, threshold: SyncId) -> usize {
        let purged = match threshold.checked_add(1) {
            Some(first_kept) => {
                let kept = self.buckets.split_off(&first_kept);
                std::mem::replace(&mut self.buckets, kept)
            }
            None => std::mem::take(&mut self.buckets),
        };
        let buckets = purged.len();
        let mut ids = 0;
        for id in purged.into_values().flatten() {
            self.index.remove(&id);
            ids += 1;
        }
        if buckets > 0 {
            tracing::debug!(threshold, buckets, ids, "purged unregistered connector ids");
        }
        ids
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// `(sync id, number of ids)` for each bucket, oldest first.
    pub fn bucket_sizes(&self) -> Vec<(SyncId, usize)> {
        self.buckets
            .iter()
            .map(|(sync_id, ids)| (*sync_id, ids.len()))
            .collect()
    }

    /// Total ids across all buckets.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn stats(&self) -> JournalStats {
        JournalStats {
            buckets: self.buckets.len(),
            ids: self.index.len(),
            oldest_sync_id: self.buckets.keys().next().copied(),
            newest_sync_id: self.buckets.keys().next_back().copied(),
        }
    }

    fn remove_from_bucket(&mut self, sync_id: SyncId, id: &str) {
        if let Some(ids) = self.buckets.get_mut(&sync_id) {
            ids.retain(|existing| existing != id);
            if ids.is_empty() {
                self.buckets.remove(&sync_id);
            }
        }
    }
}
