//! Redis-backed store
//!
//! Wraps the [`redis`](https://crates.io/crates/redis) driver. One
//! multiplexed connection is opened per logical database the first time that
//! database is touched and reused for the rest of the run; no command ever
//! switches databases with `SELECT` mid-connection.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{cmd, Script};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::{KeyTtl, KeyType, KeyValueStore, StoreError, StoreResult};
use crate::config::Endpoint;

/// Atomic compare-and-set.
///
/// `ARGV[1]` is `1` when an expected value is given in `ARGV[2]`, `0` when
/// the key must be absent. `ARGV[3]` is the new value and `ARGV[4]` the
/// lease in milliseconds (`0` for none).
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
elseif current then
  return 0
end
if tonumber(ARGV[4]) > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#;

/// A Redis-compatible server reached over RESP.
pub struct RedisStore {
    endpoint: Endpoint,
    connections: Mutex<HashMap<u32, MultiplexedConnection>>,
    cas: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("endpoint", &self.endpoint)
            .field("open_databases", &self.connections.lock().len())
            .finish()
    }
}

impl RedisStore {
    /// Create a store for `endpoint`. No connection is made until a
    /// database is first used.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connections: Mutex::new(HashMap::new()),
            cas: Script::new(COMPARE_AND_SET),
        }
    }

    /// Connect to every database in `dbs` up front so that an unreachable
    /// server is reported before any state is touched.
    pub async fn connect(endpoint: Endpoint, dbs: &[u32]) -> StoreResult<Self> {
        let store = Self::new(endpoint);
        for &db in dbs {
            store.connection(db).await?;
        }
        Ok(store)
    }

    async fn connection(&self, db: u32) -> StoreResult<MultiplexedConnection> {
        let cached = self.connections.lock().get(&db).cloned();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let url = format!("redis://{}/{}", self.endpoint, db);
        debug!(%url, "opening connection");
        let client = ::redis::Client::open(url.as_str())
            .map_err(|e| StoreError::Connection(format!("failed to parse URL {url}: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(format!("failed to connect to {url}: {e}")))?;

        Ok(self.connections.lock().entry(db).or_insert(conn).clone())
    }
}

fn to_bytes(items: Vec<Vec<u8>>) -> Vec<Bytes> {
    items.into_iter().map(Bytes::from).collect()
}

#[async_trait]
impl KeyValueStore for RedisStore {
    fn address(&self) -> String {
        self.endpoint.to_string()
    }

    async fn db_size(&self, db: u32) -> StoreResult<u64> {
        let mut conn = self.connection(db).await?;
        let size: u64 = cmd("DBSIZE").query_async(&mut conn).await?;
        Ok(size)
    }

    async fn scan(&self, db: u32, cursor: u64, count: usize) -> StoreResult<(u64, Vec<Bytes>)> {
        let mut conn = self.connection(db).await?;
        let (next, keys): (u64, Vec<Vec<u8>>) = cmd("SCAN")
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok((next, to_bytes(keys)))
    }

    async fn key_type(&self, db: u32, key: &[u8]) -> StoreResult<KeyType> {
        let mut conn = self.connection(db).await?;
        let reply: String = cmd("TYPE").arg(key).query_async(&mut conn).await?;
        Ok(KeyType::from_type_reply(&reply))
    }

    async fn exists(&self, db: u32, keys: &[Bytes]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection(db).await?;
        let mut command = cmd("EXISTS");
        for key in keys {
            command.arg(&key[..]);
        }
        let count: u64 = command.query_async(&mut conn).await?;
        Ok(count)
    }

    async fn del(&self, db: u32, keys: &[Bytes]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection(db).await?;
        let mut command = cmd("DEL");
        for key in keys {
            command.arg(&key[..]);
        }
        let removed: u64 = command.query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn ttl(&self, db: u32, key: &[u8]) -> StoreResult<KeyTtl> {
        let mut conn = self.connection(db).await?;
        let ms: i64 = cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(KeyTtl::from_pttl(ms))
    }

    async fn get(&self, db: u32, key: &[u8]) -> StoreResult<Option<Bytes>> {
        let mut conn = self.connection(db).await?;
        let value: Option<Vec<u8>> = cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, db: u32, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let mut conn = self.connection(db).await?;
        let _: () = cmd("SET").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        db: u32,
        key: &[u8],
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.connection(db).await?;
        let lease_ms = ttl.map(|ttl| ttl.as_millis().max(1) as u64).unwrap_or(0);
        let applied: i64 = self
            .cas
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(value)
            .arg(lease_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn rpush(&self, db: u32, key: &[u8], values: &[Bytes]) -> StoreResult<u64> {
        if values.is_empty() {
            return self.llen(db, key).await;
        }
        let mut conn = self.connection(db).await?;
        let mut command = cmd("RPUSH");
        command.arg(key);
        for value in values {
            command.arg(&value[..]);
        }
        let len: u64 = command.query_async(&mut conn).await?;
        Ok(len)
    }

    async fn lrange(&self, db: u32, key: &[u8], start: i64, stop: i64) -> StoreResult<Vec<Bytes>> {
        let mut conn = self.connection(db).await?;
        let items: Vec<Vec<u8>> = cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(to_bytes(items))
    }

    async fn llen(&self, db: u32, key: &[u8]) -> StoreResult<u64> {
        let mut conn = self.connection(db).await?;
        let len: u64 = cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn hgetall(&self, db: u32, key: &[u8]) -> StoreResult<Vec<(Bytes, Bytes)>> {
        let mut conn = self.connection(db).await?;
        let fields: Vec<(Vec<u8>, Vec<u8>)> = cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(fields
            .into_iter()
            .map(|(f, v)| (Bytes::from(f), Bytes::from(v)))
            .collect())
    }

    async fn hset_multiple(&self, db: u32, key: &[u8], fields: &[(Bytes, Bytes)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection(db).await?;
        let mut command = cmd("HSET");
        command.arg(key);
        for (field, value) in fields {
            command.arg(&field[..]).arg(&value[..]);
        }
        let _: () = command.query_async(&mut conn).await?;
        Ok(())
    }

    async fn smembers(&self, db: u32, key: &[u8]) -> StoreResult<Vec<Bytes>> {
        let mut conn = self.connection(db).await?;
        let members: Vec<Vec<u8>> = cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(to_bytes(members))
    }

    async fn sadd(&self, db: u32, key: &[u8], members: &[Bytes]) -> StoreResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection(db).await?;
        let mut command = cmd("SADD");
        command.arg(key);
        for member in members {
            command.arg(&member[..]);
        }
        let _: () = command.query_async(&mut conn).await?;
        Ok(())
    }

    async fn zrange_withscores(&self, db: u32, key: &[u8]) -> StoreResult<Vec<(Bytes, f64)>> {
        let mut conn = self.connection(db).await?;
        let members: Vec<(Vec<u8>, f64)> = cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(members
            .into_iter()
            .map(|(m, s)| (Bytes::from(m), s))
            .collect())
    }

    async fn zadd_multiple(&self, db: u32, key: &[u8], members: &[(Bytes, f64)]) -> StoreResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection(db).await?;
        let mut command = cmd("ZADD");
        command.arg(key);
        for (member, score) in members {
            command.arg(*score).arg(&member[..]);
        }
        let _: () = command.query_async(&mut conn).await?;
        Ok(())
    }

    async fn flush_db(&self, db: u32) -> StoreResult<()> {
        let mut conn = self.connection(db).await?;
        let _: () = cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }
}
