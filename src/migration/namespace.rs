//! Control-namespace layout.
//!
//! All state the copy engine keeps between invocations lives on the source
//! server under a reserved key prefix (`mig:` by default):
//!
//! | key                              | scope                 | meaning                 |
//! |----------------------------------|-----------------------|-------------------------|
//! | `mig:run`                        | source                | run guard               |
//! | `mig:firstrun`                   | source/target pair    | target already flushed  |
//! | `mig:keylist:<servername>`       | one source database   | key snapshot (list)     |
//! | `mig:havekeylist:<servername>`   | one source database   | snapshot complete flag  |
//! | `mig:keymoved:<servername>`      | one source database   | checkpoint cursor       |
//!
//! In the default layout the per-database keys live inside the database
//! they describe and the two global flags live in the first selected
//! database, which is what earlier copy tools wrote. With a dedicated
//! control database every key lives there instead and never shows up in a
//! migrated key-space.

use std::fmt;

use bytes::Bytes;

use crate::config::{ControlConfig, Endpoint};

/// Identity of one source database, `host:port:db`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Servername {
    endpoint: Endpoint,
    db: u32,
}

impl Servername {
    /// Identity of database `db` on `endpoint`.
    pub fn new(endpoint: &Endpoint, db: u32) -> Self {
        Self {
            endpoint: endpoint.clone(),
            db,
        }
    }

    /// The database index.
    pub fn db(&self) -> u32 {
        self.db
    }
}

impl fmt::Display for Servername {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.endpoint, self.db)
    }
}

/// A control key together with the source database it is stored in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlKey {
    /// Database holding the key
    pub db: u32,
    /// Fully prefixed key name
    pub key: Bytes,
}

impl ControlKey {
    /// Key name for diagnostics.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

/// Resolves control keys for one source server.
#[derive(Debug, Clone)]
pub struct ControlNamespace {
    prefix: String,
    control_db: Option<u32>,
    global_db: u32,
}

impl ControlNamespace {
    /// Namespace for a run over `databases` (first one hosts the global
    /// flags in the default layout).
    pub fn new(control: &ControlConfig, databases: &[u32]) -> Self {
        let global_db = control
            .database
            .or_else(|| databases.first().copied())
            .unwrap_or(0);
        Self {
            prefix: control.prefix.clone(),
            control_db: control.database,
            global_db,
        }
    }

    /// Whether control state is kept apart from migrated databases.
    pub fn is_dedicated(&self) -> bool {
        self.control_db.is_some()
    }

    /// Whether `key` belongs to the control namespace.
    pub fn is_control_key(&self, key: &[u8]) -> bool {
        key.starts_with(self.prefix.as_bytes())
    }

    /// Run-guard flag, one per source server.
    pub fn run_flag(&self) -> ControlKey {
        self.global("run")
    }

    /// Target-flushed flag, one per source/target pair.
    pub fn first_run(&self) -> ControlKey {
        self.global("firstrun")
    }

    /// Snapshot list for one source database.
    pub fn snapshot(&self, servername: &Servername) -> ControlKey {
        self.scoped("keylist:", servername)
    }

    /// Snapshot-complete flag for one source database.
    pub fn listed(&self, servername: &Servername) -> ControlKey {
        self.scoped("havekeylist:", servername)
    }

    /// Checkpoint cursor for one source database.
    pub fn cursor(&self, servername: &Servername) -> ControlKey {
        self.scoped("keymoved:", servername)
    }

    /// Control keys that may be stored inside the database `servername`
    /// names; used to correct raw `DBSIZE` counts.
    pub fn resident_keys(&self, servername: &Servername) -> Vec<Bytes> {
        let db = servername.db();
        [
            self.run_flag(),
            self.first_run(),
            self.snapshot(servername),
            self.listed(servername),
            self.cursor(servername),
        ]
        .into_iter()
        .filter(|control| control.db == db)
        .map(|control| control.key)
        .collect()
    }

    fn global(&self, name: &str) -> ControlKey {
        ControlKey {
            db: self.global_db,
            key: Bytes::from(format!("{}{}", self.prefix, name)),
        }
    }

    fn scoped(&self, kind: &str, servername: &Servername) -> ControlKey {
        ControlKey {
            db: self.control_db.unwrap_or(servername.db()),
            key: Bytes::from(format!("{}{}{}", self.prefix, kind, servername)),
        }
    }
}
