//! uisync - session state soak tool
//!
//! Drives a single shared [`Session`] from several worker threads the way
//! overlapping client connections would: each round-trip removes part of the
//! worker's connectors, attaches new ones, and resolves the ids it removed
//! the round before as a lagging client would. Each worker acknowledges its
//! own round-trips `--ack-lag` behind; the session is purged only up to the
//! oldest acknowledgement across all workers, so no lagging reference may
//! ever resolve as unknown. Any that do fail the run.

use clap::{Parser as ClapParser, Subcommand};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uisync::{
    Connector, ConnectorId, JournalStats, Lookup, Session, SessionConfig, SessionError, SyncId,
    config::ConfigError,
};

#[derive(ClapParser, Debug)]
#[command(name = "uisync", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Session config file (TOML)
    #[arg(long, global = true, env = "UISYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Override the number of ids journaled per bulk removal
    #[arg(long, global = true)]
    journal_page_size: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Churn connectors on one session from several threads and report
    /// journal occupancy as JSON
    Soak {
        /// Number of concurrent workers
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Round-trips per worker
        #[arg(long, default_value_t = 1000)]
        rounds: usize,

        /// Connectors attached per round-trip
        #[arg(long, default_value_t = 16)]
        churn: usize,

        /// How many of its own round-trips a worker's acknowledgement
        /// trails behind (at least 1: a worker still resolves ids removed in
        /// its latest round-trip)
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..))]
        ack_lag: u64,
    },

    /// Print the effective session config as TOML
    Config,
}

#[derive(Error, Debug)]
pub enum UisyncError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("soak failed: {0} lagging references resolved as unknown")]
    UnknownReferences(usize),
}

struct SoakConnector {
    id: ConnectorId,
}

impl Connector for SoakConnector {
    fn connector_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy)]
struct SoakOptions {
    rounds: usize,
    churn: usize,
    ack_lag: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckSlot {
    /// The worker has not acknowledged anything yet.
    Pending,
    Acked(SyncId),
    /// The worker stopped and holds no more references.
    Done,
}

/// Per-worker acknowledgements on one shared session.
///
/// Sync ids are session-wide, so a purge is only safe up to the oldest
/// acknowledgement of any worker still running.
#[derive(Debug)]
struct AckTracker {
    slots: Mutex<Vec<AckSlot>>,
}

impl AckTracker {
    fn new(workers: usize) -> Self {
        Self {
            slots: Mutex::new(vec![AckSlot::Pending; workers]),
        }
    }

    /// The sync id the session may purge up to, if any.
    fn session_ack(&self) -> Option<SyncId> {
        let slots = self.slots.lock();
        let mut oldest: Option<SyncId> = None;
        for slot in slots.iter() {
            match *slot {
                AckSlot::Pending => return None,
                AckSlot::Acked(id) => oldest = Some(oldest.map_or(id, |o| o.min(id))),
                AckSlot::Done => {}
            }
        }
        oldest
    }

    fn acknowledge(&self, worker: usize, sync_id: SyncId) {
        self.slots.lock()[worker] = AckSlot::Acked(sync_id);
    }

    fn finish(&self, worker: usize) {
        self.slots.lock()[worker] = AckSlot::Done;
    }
}

#[derive(Debug, Default)]
struct WorkerReport {
    round_trips: usize,
    stale_refs: usize,
    unknown_refs: usize,
}

#[derive(Debug, Serialize)]
struct SoakReport {
    workers: usize,
    round_trips: usize,
    stale_refs: usize,
    unknown_refs: usize,
    cancelled: bool,
    elapsed_ms: u64,
    sync_id: SyncId,
    registered: usize,
    journal: JournalStats,
}

#[tokio::main]
async fn main() -> Result<(), UisyncError> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(&cli)?;
    match cli.command {
        Commands::Soak {
            workers,
            rounds,
            churn,
            ack_lag,
        } => {
            let options = SoakOptions {
                rounds,
                churn,
                ack_lag: ack_lag as usize,
            };
            run_soak(config, workers, options).await
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Initialize tracing with stderr output; stdout carries the report.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "uisync=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> Result<SessionConfig, UisyncError> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)?.unwrap_or_else(|| {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            SessionConfig::default()
        }),
        None => SessionConfig::default(),
    };
    if let Some(page_size) = cli.journal_page_size {
        config.journal_page_size = page_size;
    }
    Ok(config)
}

async fn run_soak(
    config: SessionConfig,
    workers: usize,
    options: SoakOptions,
) -> Result<(), UisyncError> {
    let session: Arc<Session<SoakConnector>> = Arc::new(Session::new(config));
    let acks = Arc::new(AckTracker::new(workers));
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, stopping workers");
                cancel.cancel();
            }
        });
    }

    tracing::info!(workers, rounds = options.rounds, churn = options.churn, "starting soak");
    let started = Instant::now();
    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let session = Arc::clone(&session);
            let acks = Arc::clone(&acks);
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || churn(&session, &acks, worker, options, &cancel))
        })
        .collect();

    let mut report = WorkerReport::default();
    for result in futures::future::join_all(handles).await {
        let worker = result??;
        report.round_trips += worker.round_trips;
        report.stale_refs += worker.stale_refs;
        report.unknown_refs += worker.unknown_refs;
    }

    let (sync_id, registered, journal) = session
        .with_state(|registry| (registry.sync_id(), registry.len(), registry.journal().stats()))?;
    let summary = SoakReport {
        workers,
        round_trips: report.round_trips,
        stale_refs: report.stale_refs,
        unknown_refs: report.unknown_refs,
        cancelled: cancel.is_cancelled(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        sync_id,
        registered,
        journal,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.unknown_refs > 0 {
        tracing::error!(unknown_refs = summary.unknown_refs, "stale ids were purged too early");
        return Err(UisyncError::UnknownReferences(summary.unknown_refs));
    }
    Ok(())
}

/// One worker's share of the soak: a client connection that keeps
/// replacing half of its connectors every round-trip.
fn churn(
    session: &Session<SoakConnector>,
    acks: &AckTracker,
    worker: usize,
    options: SoakOptions,
    cancel: &CancellationToken,
) -> Result<WorkerReport, SessionError> {
    let result = churn_rounds(session, acks, worker, options, cancel);
    acks.finish(worker);
    result
}

fn churn_rounds(
    session: &Session<SoakConnector>,
    acks: &AckTracker,
    worker: usize,
    options: SoakOptions,
    cancel: &CancellationToken,
) -> Result<WorkerReport, SessionError> {
    let mut report = WorkerReport::default();
    let mut live: Vec<Arc<SoakConnector>> = Vec::new();
    let mut removed_last_round: Vec<ConnectorId> = Vec::new();
    // This worker's completed sync ids, newest last.
    let mut completed: VecDeque<SyncId> = VecDeque::with_capacity(options.ack_lag + 1);

    for _ in 0..options.rounds {
        if cancel.is_cancelled() {
            tracing::debug!(worker, "worker cancelled");
            break;
        }
        let trip = session.round_trip(acks.session_ack(), |registry| {
            let mut stale = 0usize;
            let mut unknown = 0usize;
            for id in &removed_last_round {
                match registry.lookup(id) {
                    Lookup::Stale => stale += 1,
                    Lookup::Unknown => unknown += 1,
                    Lookup::Found(_) => {}
                }
            }

            let detached: Vec<_> = live.drain(..live.len() / 2).collect();
            for connector in &detached {
                registry.unregister(connector);
            }
            for _ in 0..options.churn {
                let connector = Arc::new(SoakConnector {
                    id: registry.next_connector_id(),
                });
                registry.register(Arc::clone(&connector))?;
                registry.mark_dirty(&connector.id);
                live.push(connector);
            }
            registry.take_dirty();

            let detached_ids: Vec<ConnectorId> = detached.iter().map(|c| c.id.clone()).collect();
            Ok((stale, unknown, detached_ids))
        })?;

        let (stale, unknown, detached_ids) = trip.value;
        report.round_trips += 1;
        report.stale_refs += stale;
        report.unknown_refs += unknown;
        removed_last_round = detached_ids;
        completed.push_back(trip.sync_id);
        if completed.len() > options.ack_lag {
            if let Some(oldest) = completed.pop_front() {
                acks.acknowledge(worker, oldest);
            }
        }
    }

    tracing::debug!(worker, round_trips = report.round_trips, "worker finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_session_ack_waits_for_every_worker() {
        let acks = AckTracker::new(3);
        assert_eq!(acks.session_ack(), None);
        acks.acknowledge(0, 7);
        acks.acknowledge(1, 4);
        assert_eq!(acks.session_ack(), None);
        acks.acknowledge(2, 9);
        assert_eq!(acks.session_ack(), Some(4));
        acks.finish(1);
        assert_eq!(acks.session_ack(), Some(7));
    }

    #[test]
    fn test_shared_session_never_loses_lagging_references() {
        let session: Arc<Session<SoakConnector>> = Arc::new(Session::default());
        let acks = Arc::new(AckTracker::new(4));
        let cancel = CancellationToken::new();
        let options = SoakOptions {
            rounds: 200,
            churn: 8,
            ack_lag: 1,
        };
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let session = Arc::clone(&session);
                let acks = Arc::clone(&acks);
                let cancel = cancel.clone();
                thread::spawn(move || churn(&session, &acks, worker, options, &cancel))
            })
            .collect();

        let mut stale = 0;
        for handle in handles {
            let report = handle.join().unwrap().unwrap();
            assert_eq!(report.round_trips, 200);
            assert_eq!(report.unknown_refs, 0);
            stale += report.stale_refs;
        }
        assert!(stale > 0);
    }

    #[test]
    fn test_zero_ack_lag_is_rejected() {
        assert!(Cli::try_parse_from(["uisync", "soak", "--ack-lag", "0"]).is_err());
        assert!(Cli::try_parse_from(["uisync", "soak", "--ack-lag", "1"]).is_ok());
    }
}
