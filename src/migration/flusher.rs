//! Target flusher.
//!
//! Empties every selected database on the target exactly once, before the
//! first batch is copied, so the merge and union write strategies start
//! from a clean slate. The first-run flag on the source records that the
//! flush happened.

use std::sync::Arc;

use tracing::info;

use super::lister::read_counter;
use super::namespace::{ControlKey, ControlNamespace};
use crate::error::Result;
use crate::store::KeyValueStore;

/// One-time wipe of the target databases.
pub struct TargetFlusher {
    source: Arc<dyn KeyValueStore>,
    target: Arc<dyn KeyValueStore>,
    first_run: ControlKey,
}

impl TargetFlusher {
    /// Flusher whose flag lives on `source`.
    pub fn new(
        source: Arc<dyn KeyValueStore>,
        target: Arc<dyn KeyValueStore>,
        namespace: &ControlNamespace,
    ) -> Self {
        Self {
            source,
            target,
            first_run: namespace.first_run(),
        }
    }

    /// Whether the target has already been flushed.
    pub async fn is_flushed(&self) -> Result<bool> {
        Ok(read_counter(self.source.as_ref(), &self.first_run)
            .await?
            .is_some_and(|flag| flag != 0))
    }

    /// Flush `dbs` on the target unless that already happened. Returns
    /// whether a flush was performed.
    pub async fn flush_if_first_run(&self, dbs: &[u32]) -> Result<bool> {
        if self.is_flushed().await? {
            return Ok(false);
        }

        for &db in dbs {
            info!(target_server = %self.target.address(), db, "flushing target database");
            self.target.flush_db(db).await?;
        }
        self.source
            .set(self.first_run.db, &self.first_run.key, b"1")
            .await?;
        info!(target_server = %self.target.address(), databases = ?dbs, "target flushed");
        Ok(true)
    }
}
