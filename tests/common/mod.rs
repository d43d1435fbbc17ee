//! Shared test utilities for redis-copy integration tests.
//!
//! Import via `mod common;` in integration test files:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;

use redis_copy::config::{Config, Endpoint};
use redis_copy::migration::Migration;
use redis_copy::store::{MemoryStore, Value};

pub const SOURCE_ADDR: &str = "10.0.0.1:6379";
pub const TARGET_ADDR: &str = "10.0.0.2:6379";

// ============================================================================
// Value helpers
// ============================================================================

#[allow(dead_code)]
pub fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

#[allow(dead_code)]
pub fn string(s: &str) -> Value {
    Value::String(b(s))
}

#[allow(dead_code)]
pub fn set(members: &[&str]) -> Value {
    Value::Set(members.iter().map(|m| b(m)).collect::<HashSet<_>>())
}

#[allow(dead_code)]
pub fn hash(fields: &[(&str, &str)]) -> Value {
    Value::Hash(
        fields
            .iter()
            .map(|(f, v)| (b(f), b(v)))
            .collect::<HashMap<_, _>>(),
    )
}

#[allow(dead_code)]
pub fn list(items: &[&str]) -> Value {
    Value::List(items.iter().map(|i| b(i)).collect::<VecDeque<_>>())
}

#[allow(dead_code)]
pub fn zset(members: &[(&str, f64)]) -> Value {
    Value::SortedSet(members.iter().map(|(m, s)| (b(m), *s)).collect::<HashMap<_, _>>())
}

// ============================================================================
// Store and migration helpers
// ============================================================================

/// Fresh source and target stores with 16 databases each.
pub fn new_stores() -> (Arc<MemoryStore>, Arc<MemoryStore>) {
    (
        Arc::new(MemoryStore::new(SOURCE_ADDR)),
        Arc::new(MemoryStore::new(TARGET_ADDR)),
    )
}

/// Config copying `databases` from the source to the target, `limit` keys
/// per run.
pub fn test_config(databases: &[u32], limit: usize) -> Config {
    Config {
        source: Some(Endpoint::new("10.0.0.1", 6379)),
        target: Some(Endpoint::new("10.0.0.2", 6379)),
        databases: databases.to_vec(),
        limit,
        ..Config::default()
    }
}

/// Build a migration over the two in-memory stores.
#[allow(dead_code)]
pub fn migration(config: &Config, source: &Arc<MemoryStore>, target: &Arc<MemoryStore>) -> Migration {
    Migration::new(config, source.clone(), target.clone()).expect("valid test config")
}

/// Insert `count` string keys `key:000`.. into `db`.
#[allow(dead_code)]
pub fn seed_strings(store: &MemoryStore, db: u32, count: usize) {
    for i in 0..count {
        store.insert(db, format!("key:{i:04}"), Value::String(Bytes::from(format!("value-{i}"))));
    }
}

/// User keys of `db`, control keys excluded.
#[allow(dead_code)]
pub fn user_keys(store: &MemoryStore, db: u32) -> Vec<Bytes> {
    store
        .keys(db)
        .into_iter()
        .filter(|key| !key.starts_with(b"mig:"))
        .collect()
}
