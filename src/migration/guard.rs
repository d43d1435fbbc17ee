//! Run guard.
//!
//! Keeps two copy processes from working on the same source at once. The
//! flag is taken with an atomic compare-and-set from "free" (absent or `0`)
//! to a per-process token carrying a lease, so a killed holder frees the
//! source on its own once the lease runs out. A holder value with no lease
//! can only come from a writer that predates leases; it is reported as a
//! stale lock and needs `unlock`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::namespace::{ControlKey, ControlNamespace};
use crate::error::{CopyError, Result};
use crate::store::{KeyTtl, KeyValueStore};

/// Value the flag holds when no process owns it.
const RELEASED: &[u8] = b"0";

/// Observed state of the run flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GuardState {
    /// Nobody holds the guard
    Free,
    /// Held under a lease that expires after `remaining_ms`
    Held {
        /// Remaining lease in milliseconds
        remaining_ms: i64,
    },
    /// Held with no lease; will never clear on its own
    Stale {
        /// Raw flag value
        value: String,
    },
}

/// Proof of ownership returned by [`RunGuard::acquire`].
#[derive(Debug)]
pub struct RunLease {
    token: Bytes,
}

/// Advisory mutual exclusion over one source server.
pub struct RunGuard {
    source: Arc<dyn KeyValueStore>,
    flag: ControlKey,
    lease: Duration,
}

impl RunGuard {
    /// Guard over `source` using the namespace's run flag.
    pub fn new(source: Arc<dyn KeyValueStore>, namespace: &ControlNamespace, lease: Duration) -> Self {
        Self {
            source,
            flag: namespace.run_flag(),
            lease,
        }
    }

    /// Take the guard, or fail with [`CopyError::AlreadyRunning`] /
    /// [`CopyError::StaleLock`] without writing anything.
    pub async fn acquire(&self) -> Result<RunLease> {
        let current = self.source.get(self.flag.db, &self.flag.key).await?;
        if let Some(value) = &current {
            if &value[..] != RELEASED {
                let state = self.inspect().await?;
                return Err(self.conflict(state));
            }
        }

        let token = Bytes::from(Uuid::new_v4().to_string());
        let taken = self
            .source
            .compare_and_set(
                self.flag.db,
                &self.flag.key,
                current.as_deref(),
                &token,
                Some(self.lease),
            )
            .await?;
        if !taken {
            let state = self.inspect().await?;
            return Err(self.conflict(state));
        }

        info!(
            source = %self.source.address(),
            flag = %self.flag.name(),
            lease_secs = self.lease.as_secs(),
            "run guard acquired"
        );
        Ok(RunLease { token })
    }

    /// Extend the lease. Fails with [`CopyError::LockLost`] when the flag
    /// no longer holds our token.
    pub async fn renew(&self, lease: &RunLease) -> Result<()> {
        let renewed = self
            .source
            .compare_and_set(
                self.flag.db,
                &self.flag.key,
                Some(&lease.token[..]),
                &lease.token,
                Some(self.lease),
            )
            .await?;
        if !renewed {
            return Err(CopyError::LockLost(self.source.address()));
        }
        debug!(flag = %self.flag.name(), "run guard lease renewed");
        Ok(())
    }

    /// Give the guard back. Returns `false` if the lease had already been
    /// lost, in which case nothing is written.
    pub async fn release(&self, lease: RunLease) -> Result<bool> {
        let released = self
            .source
            .compare_and_set(self.flag.db, &self.flag.key, Some(&lease.token[..]), RELEASED, None)
            .await?;
        if released {
            info!(flag = %self.flag.name(), "run guard released");
        } else {
            warn!(flag = %self.flag.name(), "run guard lease was lost before release");
        }
        Ok(released)
    }

    /// Read the flag without changing it.
    pub async fn inspect(&self) -> Result<GuardState> {
        let value = match self.source.get(self.flag.db, &self.flag.key).await? {
            None => return Ok(GuardState::Free),
            Some(value) if &value[..] == RELEASED => return Ok(GuardState::Free),
            Some(value) => value,
        };
        Ok(match self.source.ttl(self.flag.db, &self.flag.key).await? {
            KeyTtl::Missing => GuardState::Free,
            KeyTtl::Expires(remaining_ms) => GuardState::Held { remaining_ms },
            KeyTtl::Persistent => GuardState::Stale {
                value: String::from_utf8_lossy(&value).into_owned(),
            },
        })
    }

    /// Reset the flag to free. A live lease is only overridden with
    /// `force`. Returns the state found before clearing.
    pub async fn clear(&self, force: bool) -> Result<GuardState> {
        let state = self.inspect().await?;
        if let GuardState::Held { .. } = state {
            if !force {
                return Err(self.conflict(state));
            }
        }
        if state != GuardState::Free {
            self.source.set(self.flag.db, &self.flag.key, RELEASED).await?;
            warn!(flag = %self.flag.name(), previous = ?state, "run guard cleared manually");
        }
        Ok(state)
    }

    fn conflict(&self, state: GuardState) -> CopyError {
        match state {
            GuardState::Stale { .. } => CopyError::StaleLock {
                source_server: self.source.address(),
                key: self.flag.name(),
            },
            GuardState::Held { remaining_ms } => CopyError::AlreadyRunning {
                source_server: self.source.address(),
                remaining_ms,
            },
            // Lost a race with another acquirer between the read and the swap.
            GuardState::Free => CopyError::AlreadyRunning {
                source_server: self.source.address(),
                remaining_ms: 0,
            },
        }
    }
}
