//! uisync - server-side state for incrementally synchronized UI sessions.
//!
//! A [`Session`] pairs a reentrant [`SessionLock`] with a
//! [`ConnectorRegistry`]: the set of live UI connectors, the round-trip
//! clock, and a journal of recently removed connector ids that lets the
//! server tell a stale client reference apart from a bogus one.

pub mod config;
pub mod journal;
pub mod lock;
pub mod registry;
pub mod sequencer;
pub mod session;

pub use config::{ConfigError, SessionConfig};
pub use journal::{JournalStats, UnregisteredIdJournal};
pub use lock::{LockError, ParkingLotRawLock, RawLock, SessionLock, SessionLockGuard};
pub use registry::{BulkRemoval, Connector, ConnectorId, ConnectorRegistry, Lookup, RegistryError};
pub use sequencer::{SyncId, SyncSequencer};
pub use session::{RoundTrip, Session, SessionError, SessionGuard};
