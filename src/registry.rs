use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::journal::UnregisteredIdJournal;
use crate::sequencer::{SyncId, SyncSequencer};

pub type ConnectorId = String;

/// Default number of ids a single bulk removal leaves in the journal.
pub const DEFAULT_JOURNAL_PAGE_SIZE: usize = 100;

/// A UI element addressable by the remote client.
///
/// Connectors are owned by the UI tree; the registry only indexes them.
pub trait Connector: Send + Sync {
    fn connector_id(&self) -> &str;
}

/// Result of resolving a client-supplied connector id.
#[derive(Debug)]
pub enum Lookup<C: ?Sized> {
    /// The connector is registered.
    Found(Arc<C>),
    /// Removed recently; the client may not have seen the removal yet.
    Stale,
    /// Never issued, or removed long enough ago to have been purged.
    Unknown,
}

impl<C: ?Sized> Lookup<C> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Lookup::Stale)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Lookup::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connector id already in use: {0}")]
    DuplicateId(ConnectorId),
    #[error("unknown connector id: {0}")]
    UnknownConnector(ConnectorId),
}

/// Outcome of [`ConnectorRegistry::unregister_bulk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkRemoval {
    /// Connectors that left the registry.
    pub removed: usize,
    /// Of those, how many were journaled.
    pub journaled: usize,
}

/// Live connectors of one session plus the bookkeeping that lets the
/// session answer for recently removed ones.
///
/// Owns the session's [`SyncSequencer`] and [`UnregisteredIdJournal`]:
/// every unregistration is journaled under the round-trip current at the
/// time. Performs no locking of its own; callers hold the session lock.
pub struct ConnectorRegistry<C: Connector + ?Sized> {
    connectors: HashMap<ConnectorId, Arc<C>>,
    dirty: BTreeSet<ConnectorId>,
    journal: UnregisteredIdJournal,
    sequencer: SyncSequencer,
    next_id: u64,
    journal_page_size: usize,
}

impl<C: Connector + ?Sized> Default for ConnectorRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector + ?Sized> ConnectorRegistry<C> {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_JOURNAL_PAGE_SIZE)
    }

    /// Create a registry whose bulk removals journal at most
    /// `journal_page_size` ids each.
    pub fn with_page_size(journal_page_size: usize) -> Self {
        Self {
            connectors: HashMap::new(),
            dirty: BTreeSet::new(),
            journal: UnregisteredIdJournal::new(),
            sequencer: SyncSequencer::new(),
            next_id: 0,
            journal_page_size,
        }
    }

    /// Add a connector under its own id.
    ///
    /// Fails with [`RegistryError::DuplicateId`] if the id is live or still
    /// journaled, since a stale client reference to the old connector would
    /// otherwise resolve to the new one.
    pub fn register(&mut self, connector: Arc<C>) -> Result<(), RegistryError> {
        let id = connector.connector_id().to_owned();
        if self.connectors.contains_key(&id) || self.journal.contains(&id) {
            tracing::warn!(id = %id, "rejected duplicate connector registration");
            return Err(RegistryError::DuplicateId(id));
        }
        tracing::trace!(id = %id, "registered connector");
        self.connectors.insert(id, connector);
        Ok(())
    }

    /// Remove a connector and journal its id under the current sync id.
    ///
    /// Returns false without doing anything if this connector is not the one
    /// registered under its id.
    pub fn unregister(&mut self, connector: &C) -> bool {
        let Some(id) = self.detach(connector) else {
            return false;
        };
        let sync_id = self.sequencer.current();
        self.journal.record(sync_id, id);
        true
    }

    /// Remove a batch of connectors detached in one tree operation.
    ///
    /// Only the first `journal_page_size` removals are journaled; the rest
    /// leave the registry immediately and resolve as unknown afterwards.
    pub fn unregister_bulk<'a, I>(&mut self, connectors: I) -> BulkRemoval
    where
        I: IntoIterator<Item = &'a C>,
        C: 'a,
    {
        let sync_id = self.sequencer.current();
        let mut outcome = BulkRemoval::default();
        for connector in connectors {
            let Some(id) = self.detach(connector) else {
                continue;
            };
            outcome.removed += 1;
            if outcome.journaled < self.journal_page_size {
                self.journal.record(sync_id, id);
                outcome.journaled += 1;
            }
        }
        tracing::debug!(
            sync_id,
            removed = outcome.removed,
            journaled = outcome.journaled,
            "bulk connector removal"
        );
        outcome
    }

    /// Resolve an id to a live connector, a stale reference, or nothing.
    pub fn lookup(&self, id: &str) -> Lookup<C> {
        if let Some(connector) = self.connectors.get(id) {
            Lookup::Found(Arc::clone(connector))
        } else if self.journal.contains(id) {
            Lookup::Stale
        } else {
            Lookup::Unknown
        }
    }

    /// [`lookup`](Self::lookup) for the response layer: stale references
    /// resolve to `None`, unknown ones are an error.
    pub fn resolve(&self, id: &str) -> Result<Option<Arc<C>>, RegistryError> {
        match self.lookup(id) {
            Lookup::Found(connector) => Ok(Some(connector)),
            Lookup::Stale => {
                tracing::debug!(id, "ignoring reference to recently removed connector");
                Ok(None)
            }
            Lookup::Unknown => {
                tracing::warn!(id, sync_id = self.sync_id(), "reference to unknown connector");
                Err(RegistryError::UnknownConnector(id.to_owned()))
            }
        }
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.connectors.contains_key(id)
    }

    /// Allocate the next free sequential id for this session.
    pub fn next_connector_id(&mut self) -> ConnectorId {
        loop {
            let candidate = self.next_id.to_string();
            self.next_id += 1;
            if !self.connectors.contains_key(&candidate) && !self.journal.contains(&candidate) {
                break candidate;
            }
        }
    }

    /// Flag a registered connector as needing to be sent in the next
    /// response. Returns false for ids that are not registered.
    pub fn mark_dirty(&mut self, id: &str) -> bool {
        if !self.connectors.contains_key(id) {
            return false;
        }
        self.dirty.insert(id.to_owned());
        true
    }

    /// Drain the dirty set, in id order.
    pub fn take_dirty(&mut self) -> Vec<Arc<C>> {
        std::mem::take(&mut self.dirty)
            .into_iter()
            .filter_map(|id| self.connectors.get(&id).cloned())
            .collect()
    }

    pub fn registered_ids(&self) -> impl Iterator<Item = &str> {
        self.connectors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// The round-trip currently being processed.
    pub fn sync_id(&self) -> SyncId {
        self.sequencer.current()
    }

    /// Complete the current round-trip.
    pub fn advance_sync_id(&mut self) -> SyncId {
        self.sequencer.advance()
    }

    /// Forget ids removed in round-trips up to and including `threshold`.
    pub fn cleanup(&mut self, threshold: SyncId) -> usize {
        self.journal.cleanup(threshold)
    }

    pub fn journal(&self) -> &UnregisteredIdJournal {
        &self.journal
    }

    pub fn journal_page_size(&self) -> usize {
        self.journal_page_size
    }

    /// Take `connector` out of the registry if it is the object registered
    /// under its id.
    fn detach(&mut self, connector: &C) -> Option<ConnectorId> {
        let id = connector.connector_id();
        let registered = self.connectors.get(id)?;
        if !std::ptr::addr_eq(Arc::as_ptr(registered), connector as *const C) {
            tracing::debug!(id, "ignoring unregister of unrecognised connector object");
            return None;
        }
        let (id, _) = self.connectors.remove_entry(id)?;
        self.dirty.remove(&id);
        tracing::trace!(id = %id, "unregistered connector");
        Some(id)
    }
}

impl<C: Connector + ?Sized> std::fmt::Debug for ConnectorRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("connectors", &self.connectors.len())
            .field("sync_id", &self.sequencer.current())
            .field("journal", &self.journal.stats())
            .finish_non_exhaustive()
    }
}
