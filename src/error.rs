//! Error types for redis-copy
//!
//! Every fallible operation in the crate returns [`CopyError`]. Store-level
//! failures are wrapped from [`StoreError`] so a failed batch propagates
//! untouched up to the caller, leaving the checkpoint cursor where it was.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for copy operations
#[derive(Error, Debug)]
pub enum CopyError {
    /// Endpoint string is not `host:port`
    #[error("invalid endpoint '{0}': expected host:port, e.g. 127.0.0.1:6379")]
    InvalidEndpoint(String),

    /// Source and target point at the same server
    #[error("source and target are the same server ({0})")]
    SameEndpoint(String),

    /// Database selector is empty
    #[error("no databases selected, e.g. --databases 0,1")]
    NoDatabases,

    /// Per-run key limit is unusable
    #[error("invalid limit {0}: must be at least 1")]
    InvalidLimit(usize),

    /// Configuration parsing or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another process holds the run guard under a live lease
    #[error("another copy process is already running against {source_server} (lease expires in {remaining_ms}ms)")]
    AlreadyRunning {
        /// `host:port` of the guarded source
        source_server: String,
        /// Remaining lease time in milliseconds
        remaining_ms: i64,
    },

    /// Run flag is set with no lease; nothing will ever clear it on its own
    #[error("stale run flag '{key}' on {source_server}: set without a lease, most likely by a killed process; run `redis-copy unlock` once no copy is running")]
    StaleLock {
        /// `host:port` of the guarded source
        source_server: String,
        /// Fully prefixed run-flag key
        key: String,
    },

    /// Our lease was taken over or expired while the cycle was running
    #[error("run guard on {0} was lost during the cycle")]
    LockLost(String),

    /// Copy was requested before the key snapshot was completed
    #[error("key snapshot for {0} has not been listed")]
    SnapshotMissing(String),

    /// A control entry holds a value that cannot be interpreted
    #[error("corrupt control entry '{key}': {reason}")]
    CorruptState {
        /// Fully prefixed control key
        key: String,
        /// What was wrong with it
        reason: String,
    },

    /// Store-level failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl CopyError {
    /// True for the conditions reported before any state is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CopyError::InvalidEndpoint(_)
                | CopyError::SameEndpoint(_)
                | CopyError::NoDatabases
                | CopyError::InvalidLimit(_)
                | CopyError::Config(_)
        )
    }

    /// True when the run guard refused entry (live or stale holder).
    pub fn is_guard_conflict(&self) -> bool {
        matches!(
            self,
            CopyError::AlreadyRunning { .. } | CopyError::StaleLock { .. }
        )
    }
}

/// Result type alias for copy operations
pub type Result<T> = std::result::Result<T, CopyError>;
