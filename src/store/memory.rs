//! In-memory store implementation
//!
//! A multi-database, single-process store that answers the
//! [`KeyValueStore`] primitives with Redis semantics. Keys are kept in
//! byte order so `SCAN` enumeration is deterministic.
//!
//! Besides the data itself the store keeps a few counters (writes, flushes)
//! and can be told to start failing writes after a number of successful
//! ones, which is how crash-mid-batch behavior is exercised.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{KeyTtl, KeyType, KeyValueStore, StoreError, StoreResult};

/// Default number of logical databases, as in Redis.
pub const DEFAULT_DATABASES: u32 = 16;

/// Value types stored in the database
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// String value
    String(Bytes),
    /// List value
    List(VecDeque<Bytes>),
    /// Hash value (field-value mapping)
    Hash(HashMap<Bytes, Bytes>),
    /// Set value
    Set(HashSet<Bytes>),
    /// Sorted set value (member to score)
    SortedSet(HashMap<Bytes, f64>),
    /// Stream value; stored so unsupported types can be exercised, never
    /// produced by the copy engine
    Stream(Vec<(Bytes, Vec<(Bytes, Bytes)>)>),
}

impl Value {
    fn key_type(&self) -> KeyType {
        match self {
            Value::String(_) => KeyType::String,
            Value::List(_) => KeyType::List,
            Value::Hash(_) => KeyType::Hash,
            Value::Set(_) => KeyType::Set,
            Value::SortedSet(_) => KeyType::SortedSet,
            Value::Stream(_) => KeyType::Other("stream".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    #[inline]
    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|exp| Instant::now() >= exp)
            .unwrap_or(false)
    }
}

/// A single logical database.
#[derive(Debug, Default)]
struct Database {
    data: BTreeMap<Bytes, Entry>,
}

impl Database {
    /// Live entry for `key`, dropping it first if it has expired.
    fn live(&mut self, key: &[u8]) -> Option<&mut Entry> {
        if self.data.get(key).is_some_and(Entry::is_expired) {
            self.data.remove(key);
        }
        self.data.get_mut(key)
    }

    fn purge_expired(&mut self) {
        self.data.retain(|_, entry| !entry.is_expired());
    }
}

/// In-process multi-database store.
#[derive(Debug)]
pub struct MemoryStore {
    address: String,
    databases: RwLock<Vec<Database>>,
    writes: AtomicU64,
    flushes: AtomicU64,
    fail_writes_after: RwLock<Option<u64>>,
}

impl MemoryStore {
    /// Create a store answering as `address` with the default 16 databases.
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_databases(address, DEFAULT_DATABASES)
    }

    /// Create a store with a specific number of databases.
    pub fn with_databases(address: impl Into<String>, num_databases: u32) -> Self {
        let databases = (0..num_databases).map(|_| Database::default()).collect();
        Self {
            address: address.into(),
            databases: RwLock::new(databases),
            writes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            fail_writes_after: RwLock::new(None),
        }
    }

    /// Insert a value directly, bypassing counters and fault injection.
    pub fn insert(&self, db: u32, key: impl Into<Bytes>, value: Value) {
        if let Some(database) = self.databases.write().get_mut(db as usize) {
            database.data.insert(key.into(), Entry::new(value));
        }
    }

    /// Insert a value that expires after `ttl`.
    pub fn insert_with_ttl(&self, db: u32, key: impl Into<Bytes>, value: Value, ttl: Duration) {
        if let Some(database) = self.databases.write().get_mut(db as usize) {
            database.data.insert(
                key.into(),
                Entry {
                    value,
                    expires_at: Some(Instant::now() + ttl),
                },
            );
        }
    }

    /// Current value of `key`, if live.
    pub fn value(&self, db: u32, key: &[u8]) -> Option<Value> {
        let mut databases = self.databases.write();
        let database = databases.get_mut(db as usize)?;
        database.live(key).map(|entry| entry.value.clone())
    }

    /// All live keys of `db` in byte order.
    pub fn keys(&self, db: u32) -> Vec<Bytes> {
        let mut databases = self.databases.write();
        match databases.get_mut(db as usize) {
            Some(database) => {
                database.purge_expired();
                database.data.keys().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Number of mutating commands served so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of `FLUSHDB` commands served so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Let `n` more writes succeed, then fail every write with a
    /// connection error until [`clear_faults`](Self::clear_faults).
    pub fn fail_writes_after(&self, n: u64) {
        *self.fail_writes_after.write() = Some(self.write_count() + n);
    }

    /// Stop injecting write failures.
    pub fn clear_faults(&self) {
        *self.fail_writes_after.write() = None;
    }

    fn record_write(&self) -> StoreResult<()> {
        if let Some(limit) = *self.fail_writes_after.read() {
            if self.write_count() >= limit {
                return Err(StoreError::Connection(format!(
                    "{}: injected write failure",
                    self.address
                )));
            }
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn with_db<T>(&self, db: u32, f: impl FnOnce(&mut Database) -> StoreResult<T>) -> StoreResult<T> {
        let mut databases = self.databases.write();
        let database = databases
            .get_mut(db as usize)
            .ok_or_else(|| StoreError::UnexpectedReply("ERR DB index is out of range".into()))?;
        f(database)
    }

    fn write_db<T>(&self, db: u32, f: impl FnOnce(&mut Database) -> StoreResult<T>) -> StoreResult<T> {
        self.record_write()?;
        self.with_db(db, f)
    }
}

fn wrong_type(key: &[u8]) -> StoreError {
    StoreError::WrongType(String::from_utf8_lossy(key).into_owned())
}

/// Resolve Redis-style inclusive, possibly negative, range bounds.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn db_size(&self, db: u32) -> StoreResult<u64> {
        self.with_db(db, |d| {
            d.purge_expired();
            Ok(d.data.len() as u64)
        })
    }

    async fn scan(&self, db: u32, cursor: u64, count: usize) -> StoreResult<(u64, Vec<Bytes>)> {
        self.with_db(db, |d| {
            d.purge_expired();
            let start = cursor as usize;
            let keys: Vec<Bytes> = d.data.keys().skip(start).take(count.max(1)).cloned().collect();
            let next = start + keys.len();
            let next = if next >= d.data.len() { 0 } else { next as u64 };
            Ok((next, keys))
        })
    }

    async fn key_type(&self, db: u32, key: &[u8]) -> StoreResult<KeyType> {
        self.with_db(db, |d| {
            Ok(d.live(key)
                .map(|entry| entry.value.key_type())
                .unwrap_or(KeyType::None))
        })
    }

    async fn exists(&self, db: u32, keys: &[Bytes]) -> StoreResult<u64> {
        self.with_db(db, |d| {
            Ok(keys.iter().filter(|key| d.live(key).is_some()).count() as u64)
        })
    }

    async fn del(&self, db: u32, keys: &[Bytes]) -> StoreResult<u64> {
        self.write_db(db, |d| {
            let mut removed = 0;
            for key in keys {
                if d.live(key).is_some() {
                    d.data.remove(key);
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    async fn ttl(&self, db: u32, key: &[u8]) -> StoreResult<KeyTtl> {
        self.with_db(db, |d| {
            Ok(match d.live(key) {
                None => KeyTtl::Missing,
                Some(Entry {
                    expires_at: None, ..
                }) => KeyTtl::Persistent,
                Some(Entry {
                    expires_at: Some(exp),
                    ..
                }) => KeyTtl::Expires(exp.saturating_duration_since(Instant::now()).as_millis() as i64),
            })
        })
    }

    async fn get(&self, db: u32, key: &[u8]) -> StoreResult<Option<Bytes>> {
        self.with_db(db, |d| match d.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::String(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set(&self, db: u32, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.write_db(db, |d| {
            d.data.insert(
                Bytes::copy_from_slice(key),
                Entry::new(Value::String(Bytes::copy_from_slice(value))),
            );
            Ok(())
        })
    }

    async fn compare_and_set(
        &self,
        db: u32,
        key: &[u8],
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.write_db(db, |d| {
            let current = match d.live(key) {
                None => None,
                Some(Entry {
                    value: Value::String(s),
                    ..
                }) => Some(s.clone()),
                Some(_) => return Err(wrong_type(key)),
            };
            if current.as_deref() != expected {
                return Ok(false);
            }
            d.data.insert(
                Bytes::copy_from_slice(key),
                Entry {
                    value: Value::String(Bytes::copy_from_slice(value)),
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
            Ok(true)
        })
    }

    async fn rpush(&self, db: u32, key: &[u8], values: &[Bytes]) -> StoreResult<u64> {
        self.write_db(db, |d| {
            if d.live(key).is_none() {
                d.data
                    .insert(Bytes::copy_from_slice(key), Entry::new(Value::List(VecDeque::new())));
            }
            match d.live(key) {
                Some(Entry {
                    value: Value::List(list),
                    ..
                }) => {
                    list.extend(values.iter().cloned());
                    Ok(list.len() as u64)
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn lrange(&self, db: u32, key: &[u8], start: i64, stop: i64) -> StoreResult<Vec<Bytes>> {
        self.with_db(db, |d| match d.live(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(match resolve_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn llen(&self, db: u32, key: &[u8]) -> StoreResult<u64> {
        self.with_db(db, |d| match d.live(key) {
            None => Ok(0),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.len() as u64),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hgetall(&self, db: u32, key: &[u8]) -> StoreResult<Vec<(Bytes, Bytes)>> {
        self.with_db(db, |d| match d.live(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.iter().map(|(f, v)| (f.clone(), v.clone())).collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hset_multiple(&self, db: u32, key: &[u8], fields: &[(Bytes, Bytes)]) -> StoreResult<()> {
        self.write_db(db, |d| {
            if d.live(key).is_none() {
                d.data
                    .insert(Bytes::copy_from_slice(key), Entry::new(Value::Hash(HashMap::new())));
            }
            match d.live(key) {
                Some(Entry {
                    value: Value::Hash(hash),
                    ..
                }) => {
                    hash.extend(fields.iter().cloned());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn smembers(&self, db: u32, key: &[u8]) -> StoreResult<Vec<Bytes>> {
        self.with_db(db, |d| match d.live(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn sadd(&self, db: u32, key: &[u8], members: &[Bytes]) -> StoreResult<()> {
        self.write_db(db, |d| {
            if d.live(key).is_none() {
                d.data
                    .insert(Bytes::copy_from_slice(key), Entry::new(Value::Set(HashSet::new())));
            }
            match d.live(key) {
                Some(Entry {
                    value: Value::Set(set),
                    ..
                }) => {
                    set.extend(members.iter().cloned());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn zrange_withscores(&self, db: u32, key: &[u8]) -> StoreResult<Vec<(Bytes, f64)>> {
        self.with_db(db, |d| match d.live(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::SortedSet(zset),
                ..
            }) => {
                let mut members: Vec<(Bytes, f64)> =
                    zset.iter().map(|(m, s)| (m.clone(), *s)).collect();
                members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn zadd_multiple(&self, db: u32, key: &[u8], members: &[(Bytes, f64)]) -> StoreResult<()> {
        self.write_db(db, |d| {
            if d.live(key).is_none() {
                d.data.insert(
                    Bytes::copy_from_slice(key),
                    Entry::new(Value::SortedSet(HashMap::new())),
                );
            }
            match d.live(key) {
                Some(Entry {
                    value: Value::SortedSet(zset),
                    ..
                }) => {
                    zset.extend(members.iter().cloned());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn flush_db(&self, db: u32) -> StoreResult<()> {
        self.write_db(db, |d| {
            d.data.clear();
            Ok(())
        })?;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_set_get() {
        let store = MemoryStore::new("mem:1");
        store.set(0, b"k", b"v").await.unwrap();
        assert_eq!(store.get(0, b"k").await.unwrap(), Some(b("v")));
        assert_eq!(store.get(1, b"k").await.unwrap(), None);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryStore::new("mem:1");
        store.rpush(0, b"l", &[b("a")]).await.unwrap();
        assert!(matches!(
            store.get(0, b"l").await,
            Err(StoreError::WrongType(_))
        ));
    }

    #[tokio::test]
    async fn test_lrange_bounds() {
        let store = MemoryStore::new("mem:1");
        store
            .rpush(0, b"l", &[b("a"), b("b"), b("c"), b("d")])
            .await
            .unwrap();
        assert_eq!(store.lrange(0, b"l", 0, -1).await.unwrap().len(), 4);
        assert_eq!(
            store.lrange(0, b"l", 1, 2).await.unwrap(),
            vec![b("b"), b("c")]
        );
        assert_eq!(store.lrange(0, b"l", 3, 100).await.unwrap(), vec![b("d")]);
        assert!(store.lrange(0, b"l", 4, 10).await.unwrap().is_empty());
        assert_eq!(store.lrange(0, b"l", -2, -1).await.unwrap(), vec![b("c"), b("d")]);
    }

    #[tokio::test]
    async fn test_scan_visits_every_key_once() {
        let store = MemoryStore::new("mem:1");
        for i in 0..25 {
            store.insert(3, format!("key:{i:02}"), Value::String(b("x")));
        }
        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (next, keys) = store.scan(3, cursor, 10).await.unwrap();
            seen.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 25);
        assert_eq!(seen, store.keys(3));
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = MemoryStore::new("mem:1");
        assert!(store.compare_and_set(0, b"lock", None, b"t1", None).await.unwrap());
        assert!(!store.compare_and_set(0, b"lock", None, b"t2", None).await.unwrap());
        assert!(!store
            .compare_and_set(0, b"lock", Some(b"t2"), b"t3", None)
            .await
            .unwrap());
        assert!(store
            .compare_and_set(0, b"lock", Some(b"t1"), b"0", None)
            .await
            .unwrap());
        assert_eq!(store.get(0, b"lock").await.unwrap(), Some(b("0")));
    }

    #[tokio::test]
    async fn test_expiry_is_lazy_and_observed() {
        let store = MemoryStore::new("mem:1");
        store
            .compare_and_set(0, b"lease", None, b"t", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(matches!(
            store.ttl(0, b"lease").await.unwrap(),
            KeyTtl::Expires(_)
        ));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.ttl(0, b"lease").await.unwrap(), KeyTtl::Missing);
        assert_eq!(store.db_size(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = MemoryStore::new("mem:1");
        store.fail_writes_after(1);
        store.set(0, b"a", b"1").await.unwrap();
        assert!(matches!(
            store.set(0, b"b", b"2").await,
            Err(StoreError::Connection(_))
        ));
        store.clear_faults();
        store.set(0, b"b", b"2").await.unwrap();
    }

    #[tokio::test]
    async fn test_zrange_sorted_by_score() {
        let store = MemoryStore::new("mem:1");
        store
            .zadd_multiple(0, b"z", &[(b("b"), 2.0), (b("a"), 1.0), (b("c"), 2.0)])
            .await
            .unwrap();
        let members = store.zrange_withscores(0, b"z").await.unwrap();
        assert_eq!(
            members,
            vec![(b("a"), 1.0), (b("b"), 2.0), (b("c"), 2.0)]
        );
    }

    #[tokio::test]
    async fn test_flush_db_counts() {
        let store = MemoryStore::with_databases("mem:1", 2);
        store.set(1, b"k", b"v").await.unwrap();
        store.flush_db(1).await.unwrap();
        assert_eq!(store.db_size(1).await.unwrap(), 0);
        assert_eq!(store.flush_count(), 1);
        assert!(store.db_size(2).await.is_err());
    }
}
