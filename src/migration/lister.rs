//! Key lister.
//!
//! Captures the key-space of one source database once, as an ordered list
//! stored under the control namespace, and marks it complete. The copier
//! only ever reads slices of this list, so keys written to the source after
//! listing are not part of the migration.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use super::namespace::{ControlKey, ControlNamespace, Servername};
use crate::error::{CopyError, Result};
use crate::store::KeyValueStore;

/// Result of [`KeyLister::ensure_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingOutcome {
    /// Whether this call enumerated the database (false: already listed)
    pub listed_now: bool,
    /// Number of keys in the snapshot
    pub snapshot_len: u64,
}

/// Builds and reads key snapshots on the source server.
pub struct KeyLister {
    source: Arc<dyn KeyValueStore>,
    namespace: ControlNamespace,
    scan_count: usize,
    progress_interval: u64,
}

impl KeyLister {
    /// Lister over `source`.
    pub fn new(
        source: Arc<dyn KeyValueStore>,
        namespace: ControlNamespace,
        scan_count: usize,
        progress_interval: u64,
    ) -> Self {
        Self {
            source,
            namespace,
            scan_count: scan_count.max(1),
            progress_interval: progress_interval.max(1),
        }
    }

    /// Make sure a complete snapshot exists for `servername`.
    ///
    /// When the listed flag is unset any partial snapshot left by an
    /// interrupted run is discarded and the database enumerated again.
    pub async fn ensure_snapshot(&self, servername: &Servername) -> Result<ListingOutcome> {
        let snapshot = self.namespace.snapshot(servername);
        if self.is_listed(servername).await? {
            let snapshot_len = self.source.llen(snapshot.db, &snapshot.key).await?;
            debug!(%servername, snapshot_len, "snapshot already listed");
            return Ok(ListingOutcome {
                listed_now: false,
                snapshot_len,
            });
        }

        info!(%servername, snapshot = %snapshot.name(), "listing keys");
        self.source
            .del(snapshot.db, std::slice::from_ref(&snapshot.key))
            .await?;

        let db = servername.db();
        let mut seen: HashSet<Bytes> = HashSet::new();
        let mut listed: u64 = 0;
        let mut cursor = 0;
        loop {
            let (next, keys) = self.source.scan(db, cursor, self.scan_count).await?;
            let batch: Vec<Bytes> = keys
                .into_iter()
                .filter(|key| !self.namespace.is_control_key(key))
                .filter(|key| seen.insert(key.clone()))
                .collect();

            if !batch.is_empty() {
                self.source.rpush(snapshot.db, &snapshot.key, &batch).await?;
                let before = listed;
                listed += batch.len() as u64;
                if listed / self.progress_interval > before / self.progress_interval {
                    info!(%servername, listed, "keys added to snapshot");
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        let flag = self.namespace.listed(servername);
        self.source.set(flag.db, &flag.key, b"1").await?;
        info!(%servername, snapshot_len = listed, "snapshot complete");

        Ok(ListingOutcome {
            listed_now: true,
            snapshot_len: listed,
        })
    }

    /// Whether the snapshot for `servername` is complete.
    pub async fn is_listed(&self, servername: &Servername) -> Result<bool> {
        let flag = self.namespace.listed(servername);
        Ok(read_counter(self.source.as_ref(), &flag).await? == Some(1))
    }

    /// Length of the stored snapshot (0 when none exists).
    pub async fn snapshot_len(&self, servername: &Servername) -> Result<u64> {
        let snapshot = self.namespace.snapshot(servername);
        Ok(self.source.llen(snapshot.db, &snapshot.key).await?)
    }

    /// `DBSIZE` of the source database minus the control keys stored in it.
    pub async fn corrected_db_size(&self, servername: &Servername) -> Result<u64> {
        corrected_db_size(self.source.as_ref(), &self.namespace, servername).await
    }
}

pub(crate) async fn corrected_db_size(
    store: &dyn KeyValueStore,
    namespace: &ControlNamespace,
    servername: &Servername,
) -> Result<u64> {
    let db = servername.db();
    let raw = store.db_size(db).await?;
    let control = store.exists(db, &namespace.resident_keys(servername)).await?;
    Ok(raw.saturating_sub(control))
}

/// Read an integer control entry; `None` when absent.
pub(crate) async fn read_counter(store: &dyn KeyValueStore, control: &ControlKey) -> Result<Option<u64>> {
    let Some(raw) = store.get(control.db, &control.key).await? else {
        return Ok(None);
    };
    std::str::from_utf8(&raw)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| CopyError::CorruptState {
            key: control.name(),
            reason: format!("expected an integer, found {:?}", String::from_utf8_lossy(&raw)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControlConfig, Endpoint};
    use crate::store::{MemoryStore, Value};

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn setup(dedicated: Option<u32>) -> (Arc<MemoryStore>, KeyLister, Servername) {
        let store = Arc::new(MemoryStore::new("10.0.0.1:6379"));
        for key in ["k1", "k2", "k3"] {
            store.insert(2, key, Value::String(b("v")));
        }
        let control = ControlConfig {
            database: dedicated,
            ..ControlConfig::default()
        };
        let ns = ControlNamespace::new(&control, &[2]);
        let lister = KeyLister::new(store.clone(), ns, 2, 10_000);
        let servername = Servername::new(&Endpoint::new("10.0.0.1", 6379), 2);
        (store, lister, servername)
    }

    #[tokio::test]
    async fn test_snapshot_lists_all_keys_in_order() {
        let (store, lister, servername) = setup(None);
        let outcome = lister.ensure_snapshot(&servername).await.unwrap();
        assert!(outcome.listed_now);
        assert_eq!(outcome.snapshot_len, 3);

        let snapshot = store
            .lrange(2, b"mig:keylist:10.0.0.1:6379:2", 0, -1)
            .await
            .unwrap();
        assert_eq!(snapshot, vec![b("k1"), b("k2"), b("k3")]);
        assert!(lister.is_listed(&servername).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_listing_is_noop() {
        let (store, lister, servername) = setup(None);
        lister.ensure_snapshot(&servername).await.unwrap();
        let before = store.value(2, b"mig:keylist:10.0.0.1:6379:2");
        let writes = store.write_count();

        // New source keys do not enter a completed snapshot.
        store.insert(2, "k4", Value::String(b("v")));
        let outcome = lister.ensure_snapshot(&servername).await.unwrap();
        assert!(!outcome.listed_now);
        assert_eq!(outcome.snapshot_len, 3);
        assert_eq!(store.write_count(), writes);
        assert_eq!(store.value(2, b"mig:keylist:10.0.0.1:6379:2"), before);
    }

    #[tokio::test]
    async fn test_interrupted_listing_restarts_from_scratch() {
        let (store, lister, servername) = setup(None);
        // Leftover partial snapshot from a killed run; listed flag never set.
        store
            .rpush(2, b"mig:keylist:10.0.0.1:6379:2", &[b("k1"), b("k1")])
            .await
            .unwrap();

        let outcome = lister.ensure_snapshot(&servername).await.unwrap();
        assert!(outcome.listed_now);
        assert_eq!(outcome.snapshot_len, 3);
        assert_eq!(lister.snapshot_len(&servername).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_control_keys_never_listed() {
        let (store, lister, servername) = setup(None);
        store.insert(2, "mig:run", Value::String(b("0")));
        store.insert(2, "mig:keylist:other:1:0", Value::List(Default::default()));

        let outcome = lister.ensure_snapshot(&servername).await.unwrap();
        assert_eq!(outcome.snapshot_len, 3);
        let snapshot = store
            .lrange(2, b"mig:keylist:10.0.0.1:6379:2", 0, -1)
            .await
            .unwrap();
        assert!(snapshot.iter().all(|key| !key.starts_with(b"mig:")));
    }

    #[tokio::test]
    async fn test_corrected_db_size() {
        let (_store, lister, servername) = setup(None);
        lister.ensure_snapshot(&servername).await.unwrap();
        // keylist + havekeylist live in db 2 next to the three user keys.
        assert_eq!(lister.corrected_db_size(&servername).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_dedicated_control_database() {
        let (store, lister, servername) = setup(Some(15));
        lister.ensure_snapshot(&servername).await.unwrap();
        assert_eq!(store.keys(2).len(), 3);
        assert_eq!(store.keys(15).len(), 2);
        assert_eq!(lister.corrected_db_size(&servername).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_listed_flag() {
        let (store, lister, servername) = setup(None);
        store.insert(2, "mig:havekeylist:10.0.0.1:6379:2", Value::String(b("yes")));
        assert!(matches!(
            lister.ensure_snapshot(&servername).await,
            Err(CopyError::CorruptState { .. })
        ));
    }
}
