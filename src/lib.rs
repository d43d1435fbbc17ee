//! # redis-copy
//!
//! Resumable, batched copy of a Redis key-space from one server to another.
//!
//! Each invocation copies at most `limit` keys per selected database and
//! records its position on the source server, so a scheduler can call the
//! tool repeatedly until the whole snapshot has been moved. Running again
//! after completion is a no-op.
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Endpoints, database selection, TOML configuration |
//! | [`error`] | Error type shared by every operation |
//! | [`store`] | Key-value store seam with Redis and in-memory backends |
//! | [`migration`] | Guard, lister, flusher, dispatcher, copier and the cycle driver |

pub mod config;
pub mod error;
pub mod migration;
pub mod store;

pub use config::{Config, Endpoint, ListPolicy};
pub use error::{CopyError, Result};
pub use migration::{CycleReport, Migration, StatusReport};
pub use store::{KeyValueStore, MemoryStore, RedisStore};
