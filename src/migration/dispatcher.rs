//! Type dispatcher.
//!
//! Reads one key from the source as a typed [`KeyValue`] and writes it to
//! the same database index on the target with the strategy for its type:
//!
//! | type       | write                                   | safe to repeat |
//! |------------|-----------------------------------------|----------------|
//! | string     | overwrite                               | yes            |
//! | hash       | merge fields                            | yes            |
//! | list       | replace (default) or append             | replace only   |
//! | set        | union members                           | yes            |
//! | sorted set | union members, source score wins        | yes            |
//!
//! Keys that vanished since listing, and types without a strategy (streams,
//! module types), are skipped.

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::config::ListPolicy;
use crate::error::Result;
use crate::store::{KeyType, KeyValueStore};

/// A key's full value, read from the source.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    /// String value
    String(Bytes),
    /// Hash fields
    Hash(Vec<(Bytes, Bytes)>),
    /// List elements, head first
    List(Vec<Bytes>),
    /// Set members
    Set(Vec<Bytes>),
    /// Sorted set members with scores, lowest first
    SortedSet(Vec<(Bytes, f64)>),
}

impl KeyValue {
    /// Storage type of this value.
    pub fn key_type(&self) -> KeyType {
        match self {
            KeyValue::String(_) => KeyType::String,
            KeyValue::Hash(_) => KeyType::Hash,
            KeyValue::List(_) => KeyType::List,
            KeyValue::Set(_) => KeyType::Set,
            KeyValue::SortedSet(_) => KeyType::SortedSet,
        }
    }
}

/// What happened to one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Written to the target
    Copied(KeyType),
    /// Absent at the source or of an unsupported type
    Skipped(KeyType),
}

/// Moves single keys from source to target.
pub struct TypeDispatcher {
    source: Arc<dyn KeyValueStore>,
    target: Arc<dyn KeyValueStore>,
    list_policy: ListPolicy,
}

impl TypeDispatcher {
    /// Dispatcher between `source` and `target`.
    pub fn new(
        source: Arc<dyn KeyValueStore>,
        target: Arc<dyn KeyValueStore>,
        list_policy: ListPolicy,
    ) -> Self {
        Self {
            source,
            target,
            list_policy,
        }
    }

    /// Copy `key` of database `db`.
    pub async fn transfer(&self, db: u32, key: &[u8]) -> Result<TransferOutcome> {
        let key_type = self.source.key_type(db, key).await?;
        let Some(value) = self.read(db, key, &key_type).await? else {
            trace!(db, key = %String::from_utf8_lossy(key), %key_type, "skipping key");
            return Ok(TransferOutcome::Skipped(key_type));
        };
        self.write(db, key, &value).await?;
        Ok(TransferOutcome::Copied(key_type))
    }

    /// Read `key` from the source as `key_type`. `None` for absent or
    /// unsupported keys, and for collections emptied since `TYPE`.
    pub async fn read(&self, db: u32, key: &[u8], key_type: &KeyType) -> Result<Option<KeyValue>> {
        let value = match key_type {
            KeyType::String => self.source.get(db, key).await?.map(KeyValue::String),
            KeyType::Hash => non_empty(self.source.hgetall(db, key).await?).map(KeyValue::Hash),
            KeyType::List => non_empty(self.source.lrange(db, key, 0, -1).await?).map(KeyValue::List),
            KeyType::Set => non_empty(self.source.smembers(db, key).await?).map(KeyValue::Set),
            KeyType::SortedSet => {
                non_empty(self.source.zrange_withscores(db, key).await?).map(KeyValue::SortedSet)
            }
            KeyType::None | KeyType::Other(_) => None,
        };
        Ok(value)
    }

    /// Write `value` under `key` on the target.
    pub async fn write(&self, db: u32, key: &[u8], value: &KeyValue) -> Result<()> {
        match value {
            KeyValue::String(s) => self.target.set(db, key, s).await?,
            KeyValue::Hash(fields) => self.target.hset_multiple(db, key, fields).await?,
            KeyValue::List(items) => {
                if self.list_policy == ListPolicy::Replace {
                    self.target.del(db, &[Bytes::copy_from_slice(key)]).await?;
                }
                self.target.rpush(db, key, items).await?;
            }
            KeyValue::Set(members) => self.target.sadd(db, key, members).await?,
            KeyValue::SortedSet(members) => self.target.zadd_multiple(db, key, members).await?,
        }
        Ok(())
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}
