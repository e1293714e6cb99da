/// Identifier of one request/response round-trip within a session.
pub type SyncId = u64;

/// Round-trip clock for a session.
///
/// Holds the id of the round-trip currently being processed. The request
/// dispatcher advances it exactly once per completed round-trip; values are
/// never reused.
#[derive(Debug, Clone, Default)]
pub struct SyncSequencer {
    current: SyncId,
}

impl SyncSequencer {
    /// Start at sync id 0.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(origin: SyncId) -> Self {
        Self { current: origin }
    }

    /// The round-trip currently being processed.
    pub fn current(&self) -> SyncId {
        self.current
    }

    /// Mark the current round-trip complete and return the next id.
    pub fn advance(&mut self) -> SyncId {
        self.current += 1;
        self.current
    }
}
