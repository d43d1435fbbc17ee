//! Checkpointed copier.
//!
//! Each call copies one bounded slice `[cursor, cursor + limit)` of a
//! database's snapshot and then stores the new cursor with a single write.
//! A failure anywhere in the slice leaves the cursor untouched, so the next
//! invocation repeats the same slice.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::dispatcher::{TransferOutcome, TypeDispatcher};
use super::lister::{corrected_db_size, read_counter};
use super::namespace::{ControlNamespace, Servername};
use crate::error::{CopyError, Result};
use crate::store::KeyValueStore;

/// Progress figures for one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    /// Keys of the snapshot already processed
    pub cursor: u64,
    /// Snapshot length
    pub total: u64,
    /// Source `DBSIZE` minus control keys
    pub db_size: u64,
}

impl Checkpoint {
    /// Whether every snapshot key has been processed.
    pub fn is_complete(&self) -> bool {
        self.cursor >= self.total
    }

    /// Share of the snapshot processed, in percent.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.cursor.min(self.total) as f64 * 100.0 / self.total as f64
        }
    }
}

/// Result of one [`CheckpointedCopier::copy_batch`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// The cursor had already reached the end; nothing was written
    AlreadyComplete {
        /// Snapshot length
        total: u64,
    },
    /// A slice was processed and the cursor advanced
    Copied {
        /// Cursor before the batch
        from: u64,
        /// Cursor after the batch
        to: u64,
        /// Snapshot length
        total: u64,
        /// Keys written to the target
        copied: u64,
        /// Keys absent at the source or of an unsupported type
        skipped: u64,
    },
}

/// Drives the type dispatcher over snapshot slices.
pub struct CheckpointedCopier {
    source: Arc<dyn KeyValueStore>,
    namespace: ControlNamespace,
    dispatcher: TypeDispatcher,
    progress_interval: u64,
}

impl CheckpointedCopier {
    /// Copier reading control state from `source`.
    pub fn new(
        source: Arc<dyn KeyValueStore>,
        namespace: ControlNamespace,
        dispatcher: TypeDispatcher,
        progress_interval: u64,
    ) -> Self {
        Self {
            source,
            namespace,
            dispatcher,
            progress_interval: progress_interval.max(1),
        }
    }

    /// Current progress for `servername`.
    pub async fn checkpoint(&self, servername: &Servername) -> Result<Checkpoint> {
        read_checkpoint(self.source.as_ref(), &self.namespace, servername).await
    }

    /// Copy the next slice of at most `limit` keys.
    pub async fn copy_batch(&self, servername: &Servername, limit: usize) -> Result<BatchOutcome> {
        if limit == 0 {
            return Err(CopyError::InvalidLimit(limit));
        }
        let listed = read_counter(self.source.as_ref(), &self.namespace.listed(servername)).await?;
        if listed != Some(1) {
            return Err(CopyError::SnapshotMissing(servername.to_string()));
        }

        let Checkpoint {
            cursor,
            total,
            db_size,
        } = self.checkpoint(servername).await?;
        if db_size != total {
            warn!(
                %servername,
                db_size,
                snapshot_len = total,
                "source key count drifted since listing; copying the snapshot only"
            );
        }
        if cursor >= total {
            if cursor > total {
                warn!(%servername, cursor, total, "cursor is past the end of the snapshot");
            }
            info!(%servername, total, "all keys have already been copied");
            return Ok(BatchOutcome::AlreadyComplete { total });
        }

        let next = cursor.saturating_add(limit as u64).min(total);
        info!(%servername, from = cursor, to = next, total, "copying keys");

        let snapshot = self.namespace.snapshot(servername);
        let keys = self
            .source
            .lrange(snapshot.db, &snapshot.key, cursor as i64, next as i64 - 1)
            .await?;

        let db = servername.db();
        let mut copied: u64 = 0;
        let mut skipped: u64 = 0;
        for key in &keys {
            if self.namespace.is_control_key(key) {
                skipped += 1;
                continue;
            }
            match self.dispatcher.transfer(db, key).await? {
                TransferOutcome::Copied(_) => copied += 1,
                TransferOutcome::Skipped(_) => skipped += 1,
            }
            let done = copied + skipped;
            if done % self.progress_interval == 0 {
                info!(%servername, done, "keys processed");
            }
        }

        let cursor_key = self.namespace.cursor(servername);
        self.source
            .set(cursor_key.db, &cursor_key.key, next.to_string().as_bytes())
            .await?;
        info!(%servername, cursor = next, total, copied, skipped, "checkpoint saved");

        Ok(BatchOutcome::Copied {
            from: cursor,
            to: next,
            total,
            copied,
            skipped,
        })
    }
}

/// Read the progress of `servername` from the control namespace.
pub async fn read_checkpoint(
    source: &dyn KeyValueStore,
    namespace: &ControlNamespace,
    servername: &Servername,
) -> Result<Checkpoint> {
    let cursor = read_counter(source, &namespace.cursor(servername))
        .await?
        .unwrap_or(0);
    let snapshot = namespace.snapshot(servername);
    let total = source.llen(snapshot.db, &snapshot.key).await?;
    let db_size = corrected_db_size(source, namespace, servername).await?;
    Ok(Checkpoint {
        cursor,
        total,
        db_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControlConfig, Endpoint, ListPolicy};
    use crate::migration::lister::KeyLister;
    use crate::store::{MemoryStore, Value};
    use bytes::Bytes;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    struct Fixture {
        source: Arc<MemoryStore>,
        target: Arc<MemoryStore>,
        lister: KeyLister,
        copier: CheckpointedCopier,
        servername: Servername,
    }

    fn fixture(keys: usize) -> Fixture {
        let source = Arc::new(MemoryStore::new("10.0.0.1:6379"));
        let target = Arc::new(MemoryStore::new("10.0.0.2:6379"));
        for i in 0..keys {
            source.insert(0, format!("key:{i:03}"), Value::String(b("v")));
        }
        let ns = ControlNamespace::new(&ControlConfig::default(), &[0]);
        let dispatcher = TypeDispatcher::new(source.clone(), target.clone(), ListPolicy::Replace);
        Fixture {
            lister: KeyLister::new(source.clone(), ns.clone(), 100, 10_000),
            copier: CheckpointedCopier::new(source.clone(), ns, dispatcher, 10_000),
            servername: Servername::new(&Endpoint::new("10.0.0.1", 6379), 0),
            source,
            target,
        }
    }

    #[tokio::test]
    async fn test_requires_snapshot() {
        let f = fixture(3);
        assert!(matches!(
            f.copier.copy_batch(&f.servername, 2).await,
            Err(CopyError::SnapshotMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_batches_until_complete() {
        let f = fixture(5);
        f.lister.ensure_snapshot(&f.servername).await.unwrap();

        let first = f.copier.copy_batch(&f.servername, 2).await.unwrap();
        assert_eq!(
            first,
            BatchOutcome::Copied {
                from: 0,
                to: 2,
                total: 5,
                copied: 2,
                skipped: 0
            }
        );
        assert_eq!(f.target.keys(0), vec![b("key:000"), b("key:001")]);

        f.copier.copy_batch(&f.servername, 2).await.unwrap();
        let last = f.copier.copy_batch(&f.servername, 2).await.unwrap();
        assert!(matches!(last, BatchOutcome::Copied { from: 4, to: 5, .. }));

        let done = f.copier.copy_batch(&f.servername, 2).await.unwrap();
        assert_eq!(done, BatchOutcome::AlreadyComplete { total: 5 });
        assert_eq!(f.target.keys(0).len(), 5);
        assert!(f.copier.checkpoint(&f.servername).await.unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_cursor() {
        let f = fixture(4);
        f.lister.ensure_snapshot(&f.servername).await.unwrap();

        f.target.fail_writes_after(1);
        assert!(matches!(
            f.copier.copy_batch(&f.servername, 3).await,
            Err(CopyError::Store(_))
        ));
        assert_eq!(f.copier.checkpoint(&f.servername).await.unwrap().cursor, 0);

        f.target.clear_faults();
        let retry = f.copier.copy_batch(&f.servername, 3).await.unwrap();
        assert!(matches!(retry, BatchOutcome::Copied { from: 0, to: 3, .. }));
    }

    #[tokio::test]
    async fn test_deleted_keys_are_skipped_but_counted() {
        let f = fixture(3);
        f.lister.ensure_snapshot(&f.servername).await.unwrap();
        f.source.del(0, &[b("key:001")]).await.unwrap();

        let outcome = f.copier.copy_batch(&f.servername, 10).await.unwrap();
        assert_eq!(
            outcome,
            BatchOutcome::Copied {
                from: 0,
                to: 3,
                total: 3,
                copied: 2,
                skipped: 1
            }
        );
    }

    #[tokio::test]
    async fn test_empty_database_is_complete() {
        let f = fixture(0);
        f.lister.ensure_snapshot(&f.servername).await.unwrap();
        assert_eq!(
            f.copier.copy_batch(&f.servername, 10).await.unwrap(),
            BatchOutcome::AlreadyComplete { total: 0 }
        );
        assert_eq!(f.copier.checkpoint(&f.servername).await.unwrap().percent(), 100.0);
    }

    #[tokio::test]
    async fn test_corrupt_cursor() {
        let f = fixture(2);
        f.lister.ensure_snapshot(&f.servername).await.unwrap();
        f.source
            .insert(0, "mig:keymoved:10.0.0.1:6379:0", Value::String(b("-3")));
        assert!(matches!(
            f.copier.copy_batch(&f.servername, 1).await,
            Err(CopyError::CorruptState { .. })
        ));
    }

    #[tokio::test]
    async fn test_control_keys_in_snapshot_are_skipped() {
        let f = fixture(2);
        f.source.insert(0, "mig:stray", Value::String(b("x")));
        f.source
            .rpush(
                0,
                b"mig:keylist:10.0.0.1:6379:0",
                &[b("key:000"), b("mig:stray"), b("key:001")],
            )
            .await
            .unwrap();
        f.source
            .set(0, b"mig:havekeylist:10.0.0.1:6379:0", b"1")
            .await
            .unwrap();

        let outcome = f.copier.copy_batch(&f.servername, 10).await.unwrap();
        assert_eq!(
            outcome,
            BatchOutcome::Copied {
                from: 0,
                to: 3,
                total: 3,
                copied: 2,
                skipped: 1
            }
        );
        assert_eq!(f.target.keys(0), vec![b("key:000"), b("key:001")]);
        assert_eq!(f.copier.checkpoint(&f.servername).await.unwrap().cursor, 3);
    }

    #[tokio::test]
    async fn test_zero_progress_interval_is_clamped() {
        let source = Arc::new(MemoryStore::new("10.0.0.1:6379"));
        let target = Arc::new(MemoryStore::new("10.0.0.2:6379"));
        source.insert(0, "a", Value::String(b("v")));
        let ns = ControlNamespace::new(&ControlConfig::default(), &[0]);
        let dispatcher = TypeDispatcher::new(source.clone(), target.clone(), ListPolicy::Replace);
        let lister = KeyLister::new(source.clone(), ns.clone(), 100, 0);
        let copier = CheckpointedCopier::new(source.clone(), ns, dispatcher, 0);
        let servername = Servername::new(&Endpoint::new("10.0.0.1", 6379), 0);

        lister.ensure_snapshot(&servername).await.unwrap();
        let outcome = copier.copy_batch(&servername, 5).await.unwrap();
        assert!(matches!(outcome, BatchOutcome::Copied { copied: 1, .. }));
    }

    #[tokio::test]
    async fn test_zero_limit_rejected() {
        let f = fixture(1);
        assert!(matches!(
            f.copier.copy_batch(&f.servername, 0).await,
            Err(CopyError::InvalidLimit(0))
        ));
    }
}
