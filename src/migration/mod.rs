//! Resumable key-space migration
//!
//! Copies the selected databases of a source server to a target server in
//! bounded slices. All progress lives in a small control namespace on the
//! source, so each invocation picks up where the previous one stopped.
//!
//! # Components
//!
//! - [`namespace`]: names and locations of control entries
//! - [`guard`]: leased run flag keeping invocations exclusive
//! - [`lister`]: one-time key snapshot per database
//! - [`flusher`]: one-time wipe of the target databases
//! - [`dispatcher`]: per-type read and write of a single key
//! - [`copier`]: slice copy with checkpoint
//! - [`cycle`]: the full invocation plus `status` and `unlock`
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use redis_copy::migration::Migration;
//!
//! let migration = Migration::new(&config, source, target)?;
//! let report = migration.run_cycle().await?;
//! if report.is_complete() {
//!     println!("done");
//! }
//! ```

pub mod copier;
pub mod cycle;
pub mod dispatcher;
pub mod flusher;
pub mod guard;
pub mod lister;
pub mod namespace;

pub use copier::{BatchOutcome, Checkpoint, CheckpointedCopier};
pub use cycle::{status, unlock, CycleReport, DatabaseReport, DatabaseStatus, Migration, StatusReport};
pub use dispatcher::{KeyValue, TransferOutcome, TypeDispatcher};
pub use flusher::TargetFlusher;
pub use guard::{GuardState, RunGuard, RunLease};
pub use lister::{KeyLister, ListingOutcome};
pub use namespace::{ControlKey, ControlNamespace, Servername};
