//! One copy invocation.
//!
//! [`Migration::run_cycle`] is what a scheduler calls over and over:
//!
//! 1. take the run guard
//! 2. make sure every selected database has a snapshot
//! 3. flush the target if this is the first run
//! 4. copy one slice per database
//! 5. release the run guard
//!
//! Databases are processed one after another and the guard lease is renewed
//! between steps. [`status`] and [`unlock`] only touch the source.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::copier::{read_checkpoint, BatchOutcome, CheckpointedCopier, Checkpoint};
use super::dispatcher::TypeDispatcher;
use super::flusher::TargetFlusher;
use super::guard::{GuardState, RunGuard, RunLease};
use super::lister::{read_counter, KeyLister, ListingOutcome};
use super::namespace::{ControlNamespace, Servername};
use crate::config::{Config, Endpoint};
use crate::error::{CopyError, Result};
use crate::store::KeyValueStore;

/// Outcome for one database within a cycle.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseReport {
    /// Database index
    pub db: u32,
    /// `host:port:db` of the source database
    pub servername: String,
    /// Whether the snapshot was taken during this cycle
    pub listed_now: bool,
    /// Snapshot length
    pub snapshot_len: u64,
    /// Source `DBSIZE` minus control keys, after the batch
    pub db_size: u64,
    /// What the copy step did
    pub batch: BatchOutcome,
}

/// Summary of one [`Migration::run_cycle`].
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    /// Source server
    pub source: String,
    /// Target server
    pub target: String,
    /// Whether the target was flushed during this cycle
    pub flushed: bool,
    /// Per-database outcomes, in selection order
    pub databases: Vec<DatabaseReport>,
    /// When the guard was taken
    pub started_at: DateTime<Utc>,
    /// When the guard was released
    pub finished_at: DateTime<Utc>,
}

impl CycleReport {
    /// Whether every selected database is fully copied.
    pub fn is_complete(&self) -> bool {
        self.databases.iter().all(|db| match db.batch {
            BatchOutcome::AlreadyComplete { .. } => true,
            BatchOutcome::Copied { to, total, .. } => to >= total,
        })
    }

    /// Keys written to the target in this cycle.
    pub fn keys_copied(&self) -> u64 {
        self.databases
            .iter()
            .map(|db| match db.batch {
                BatchOutcome::Copied { copied, .. } => copied,
                BatchOutcome::AlreadyComplete { .. } => 0,
            })
            .sum()
    }
}

/// A configured source → target migration.
pub struct Migration {
    source_endpoint: Endpoint,
    target_endpoint: Endpoint,
    databases: Vec<u32>,
    limit: usize,
    source: Arc<dyn KeyValueStore>,
    target: Arc<dyn KeyValueStore>,
    guard: RunGuard,
    lister: KeyLister,
    flusher: TargetFlusher,
    copier: CheckpointedCopier,
}

impl Migration {
    /// Build a migration from a validated configuration and the two stores.
    pub fn new(
        config: &Config,
        source: Arc<dyn KeyValueStore>,
        target: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        config.validate()?;
        let (source_endpoint, target_endpoint) = config.endpoints()?;

        let namespace = ControlNamespace::new(&config.control, &config.databases);
        let dispatcher =
            TypeDispatcher::new(source.clone(), target.clone(), config.copy.list_policy);

        Ok(Self {
            source_endpoint: source_endpoint.clone(),
            target_endpoint: target_endpoint.clone(),
            databases: config.databases.clone(),
            limit: config.limit,
            guard: RunGuard::new(source.clone(), &namespace, config.control.lease()),
            lister: KeyLister::new(
                source.clone(),
                namespace.clone(),
                config.copy.scan_count,
                config.copy.progress_interval,
            ),
            flusher: TargetFlusher::new(source.clone(), target.clone(), &namespace),
            copier: CheckpointedCopier::new(
                source.clone(),
                namespace,
                dispatcher,
                config.copy.progress_interval,
            ),
            source,
            target,
        })
    }

    /// Run one full cycle. Fails without side effects when another process
    /// holds the guard.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let started_at = Utc::now();
        let lease = self.guard.acquire().await?;

        match self.run_guarded(&lease).await {
            Ok((flushed, databases)) => {
                self.guard.release(lease).await?;
                let report = CycleReport {
                    source: self.source.address(),
                    target: self.target.address(),
                    flushed,
                    databases,
                    started_at,
                    finished_at: Utc::now(),
                };
                info!(
                    keys_copied = report.keys_copied(),
                    complete = report.is_complete(),
                    "copy cycle finished"
                );
                Ok(report)
            }
            Err(e) => {
                // The lease expires on its own if this fails too.
                if let Err(release_err) = self.guard.release(lease).await {
                    warn!(error = %release_err, "failed to release run guard after error");
                }
                Err(e)
            }
        }
    }

    async fn run_guarded(&self, lease: &RunLease) -> Result<(bool, Vec<DatabaseReport>)> {
        let mut listings: Vec<(Servername, ListingOutcome)> = Vec::with_capacity(self.databases.len());
        for &db in &self.databases {
            let servername = Servername::new(&self.source_endpoint, db);
            let listing = self.lister.ensure_snapshot(&servername).await?;
            self.guard.renew(lease).await?;
            listings.push((servername, listing));
        }

        let flushed = self.flusher.flush_if_first_run(&self.databases).await?;
        if flushed {
            self.guard.renew(lease).await?;
        }

        let mut reports = Vec::with_capacity(listings.len());
        for (servername, listing) in listings {
            let batch = self.copier.copy_batch(&servername, self.limit).await?;
            let checkpoint = self.copier.checkpoint(&servername).await?;
            self.guard.renew(lease).await?;
            reports.push(DatabaseReport {
                db: servername.db(),
                servername: servername.to_string(),
                listed_now: listing.listed_now,
                snapshot_len: listing.snapshot_len,
                db_size: checkpoint.db_size,
                batch,
            });
        }
        Ok((flushed, reports))
    }

    /// Source endpoint.
    pub fn source_endpoint(&self) -> &Endpoint {
        &self.source_endpoint
    }

    /// Target endpoint.
    pub fn target_endpoint(&self) -> &Endpoint {
        &self.target_endpoint
    }
}

/// Progress of one database as seen from the control namespace.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStatus {
    /// Database index
    pub db: u32,
    /// `host:port:db` of the source database
    pub servername: String,
    /// Whether the snapshot is complete
    pub listed: bool,
    /// Cursor, snapshot length and corrected size
    pub checkpoint: Checkpoint,
}

/// Read-only view of a migration's control state.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Source server
    pub source: String,
    /// Run guard state
    pub guard: GuardState,
    /// Whether the target has been flushed
    pub target_flushed: bool,
    /// Per-database progress
    pub databases: Vec<DatabaseStatus>,
}

impl StatusReport {
    /// Whether every database is listed and fully copied.
    pub fn is_complete(&self) -> bool {
        self.databases
            .iter()
            .all(|db| db.listed && db.checkpoint.is_complete())
    }
}

/// Read the control state for the configured databases without writing.
pub async fn status(config: &Config, source: Arc<dyn KeyValueStore>) -> Result<StatusReport> {
    config.validate_source()?;
    let endpoint = config
        .source
        .as_ref()
        .ok_or_else(|| CopyError::Config("source endpoint is required".to_string()))?;
    let namespace = ControlNamespace::new(&config.control, &config.databases);
    let guard = RunGuard::new(source.clone(), &namespace, config.control.lease());

    let mut databases = Vec::with_capacity(config.databases.len());
    for &db in &config.databases {
        let servername = Servername::new(endpoint, db);
        let listed = read_counter(source.as_ref(), &namespace.listed(&servername)).await? == Some(1);
        let checkpoint = read_checkpoint(source.as_ref(), &namespace, &servername).await?;
        databases.push(DatabaseStatus {
            db,
            servername: servername.to_string(),
            listed,
            checkpoint,
        });
    }

    Ok(StatusReport {
        source: source.address(),
        guard: guard.inspect().await?,
        target_flushed: read_counter(source.as_ref(), &namespace.first_run())
            .await?
            .is_some_and(|flag| flag != 0),
        databases,
    })
}

/// Clear a stuck run guard. Refuses a live lease unless `force`.
pub async fn unlock(config: &Config, source: Arc<dyn KeyValueStore>, force: bool) -> Result<GuardState> {
    config.validate_source()?;
    let namespace = ControlNamespace::new(&config.control, &config.databases);
    RunGuard::new(source, &namespace, config.control.lease())
        .clear(force)
        .await
}
