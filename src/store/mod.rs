//! Key-value store abstraction
//!
//! The copy engine talks to both the source and the target server through
//! [`KeyValueStore`]. Every method takes the logical database index, so one
//! handle covers every selected database on a server.
//!
//! Two backends are provided:
//!
//! - [`RedisStore`]: a live Redis-compatible server over RESP
//! - [`MemoryStore`]: an in-process store with the same semantics, used by
//!   the test suite and by embedders that want to dry-run a migration

pub mod memory;
pub mod redis;

pub use self::memory::{MemoryStore, Value};
pub use self::redis::RedisStore;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

/// Errors raised by a store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Error reported by the Redis driver (I/O, protocol or server error)
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// The server could not be reached
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation against a key holding the wrong kind of value
    #[error("WRONGTYPE operation against key '{0}'")]
    WrongType(String),

    /// The server replied with something we cannot interpret
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage type of a key as reported by `TYPE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Plain string value
    String,
    /// Field-value mapping
    Hash,
    /// Ordered list
    List,
    /// Unordered set of unique members
    Set,
    /// Members ordered by score
    SortedSet,
    /// Key does not exist (deleted or expired since it was listed)
    None,
    /// Any other type (stream, module types, ...)
    Other(String),
}

impl KeyType {
    /// Map a `TYPE` reply to a [`KeyType`].
    pub fn from_type_reply(reply: &str) -> Self {
        match reply {
            "string" => KeyType::String,
            "hash" => KeyType::Hash,
            "list" => KeyType::List,
            "set" => KeyType::Set,
            "zset" => KeyType::SortedSet,
            "none" => KeyType::None,
            other => KeyType::Other(other.to_string()),
        }
    }

    /// The name `TYPE` uses for this type.
    pub fn as_str(&self) -> &str {
        match self {
            KeyType::String => "string",
            KeyType::Hash => "hash",
            KeyType::List => "list",
            KeyType::Set => "set",
            KeyType::SortedSet => "zset",
            KeyType::None => "none",
            KeyType::Other(name) => name,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remaining time-to-live of a key, as reported by `PTTL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist
    Missing,
    /// Key exists with no expiry
    Persistent,
    /// Key expires after the given number of milliseconds
    Expires(i64),
}

impl KeyTtl {
    /// Map a raw `PTTL` reply (`-2`, `-1` or milliseconds).
    pub fn from_pttl(ms: i64) -> Self {
        match ms {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(ms.max(0)),
        }
    }
}

/// Primitive operations the copy engine needs from a server.
///
/// Methods mirror single Redis commands so that each call is one round
/// trip; no method spans more than one command except
/// [`compare_and_set`](Self::compare_and_set), which must be atomic.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Human-readable server address (`host:port`), used in diagnostics.
    fn address(&self) -> String;

    /// Number of keys in `db` (`DBSIZE`), control keys included.
    async fn db_size(&self, db: u32) -> StoreResult<u64>;

    /// One `SCAN` step. Returns the next cursor (`0` when done) and the keys
    /// found in this step.
    async fn scan(&self, db: u32, cursor: u64, count: usize) -> StoreResult<(u64, Vec<Bytes>)>;

    /// Storage type of `key` (`TYPE`).
    async fn key_type(&self, db: u32, key: &[u8]) -> StoreResult<KeyType>;

    /// Number of the given keys that exist (`EXISTS`).
    async fn exists(&self, db: u32, keys: &[Bytes]) -> StoreResult<u64>;

    /// Delete keys, returning how many existed (`DEL`).
    async fn del(&self, db: u32, keys: &[Bytes]) -> StoreResult<u64>;

    /// Remaining time-to-live (`PTTL`).
    async fn ttl(&self, db: u32, key: &[u8]) -> StoreResult<KeyTtl>;

    /// String value of `key` (`GET`).
    async fn get(&self, db: u32, key: &[u8]) -> StoreResult<Option<Bytes>>;

    /// Overwrite a string value with no expiry (`SET`).
    async fn set(&self, db: u32, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Atomically set `key` to `value` only if its current string value is
    /// `expected` (`None` meaning the key must be absent). A `ttl` attaches
    /// an expiry to the new value. Returns whether the write happened.
    async fn compare_and_set(
        &self,
        db: u32,
        key: &[u8],
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Append values to a list (`RPUSH`), returning the new length.
    async fn rpush(&self, db: u32, key: &[u8], values: &[Bytes]) -> StoreResult<u64>;

    /// Inclusive range of a list (`LRANGE`), negative indices from the end.
    async fn lrange(&self, db: u32, key: &[u8], start: i64, stop: i64) -> StoreResult<Vec<Bytes>>;

    /// Length of a list (`LLEN`).
    async fn llen(&self, db: u32, key: &[u8]) -> StoreResult<u64>;

    /// All fields of a hash (`HGETALL`).
    async fn hgetall(&self, db: u32, key: &[u8]) -> StoreResult<Vec<(Bytes, Bytes)>>;

    /// Write fields into a hash, keeping other fields (`HSET`).
    async fn hset_multiple(&self, db: u32, key: &[u8], fields: &[(Bytes, Bytes)]) -> StoreResult<()>;

    /// All members of a set (`SMEMBERS`).
    async fn smembers(&self, db: u32, key: &[u8]) -> StoreResult<Vec<Bytes>>;

    /// Add members to a set (`SADD`).
    async fn sadd(&self, db: u32, key: &[u8], members: &[Bytes]) -> StoreResult<()>;

    /// All members of a sorted set with scores, lowest score first
    /// (`ZRANGE key 0 -1 WITHSCORES`).
    async fn zrange_withscores(&self, db: u32, key: &[u8]) -> StoreResult<Vec<(Bytes, f64)>>;

    /// Add members to a sorted set, overwriting scores (`ZADD`).
    async fn zadd_multiple(&self, db: u32, key: &[u8], members: &[(Bytes, f64)]) -> StoreResult<()>;

    /// Delete every key in `db` (`FLUSHDB`).
    async fn flush_db(&self, db: u32) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_type_from_reply() {
        assert_eq!(KeyType::from_type_reply("string"), KeyType::String);
        assert_eq!(KeyType::from_type_reply("zset"), KeyType::SortedSet);
        assert_eq!(KeyType::from_type_reply("none"), KeyType::None);
        assert_eq!(
            KeyType::from_type_reply("stream"),
            KeyType::Other("stream".to_string())
        );
        assert_eq!(KeyType::SortedSet.to_string(), "zset");
    }

    #[test]
    fn test_ttl_from_pttl() {
        assert_eq!(KeyTtl::from_pttl(-2), KeyTtl::Missing);
        assert_eq!(KeyTtl::from_pttl(-1), KeyTtl::Persistent);
        assert_eq!(KeyTtl::from_pttl(1500), KeyTtl::Expires(1500));
    }
}
