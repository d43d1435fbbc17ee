//! Configuration module for redis-copy
//!
//! Settings come from an optional TOML file, then CLI flags override
//! individual values. Every section has defaults, so a file only needs the
//! values that differ:
//!
//! ```toml
//! source = "192.168.0.99:6379"
//! target = "192.168.0.101:6379"
//! databases = [2, 5]
//! limit = 1000
//!
//! [control]
//! prefix = "mig:"
//! lease_secs = 600
//!
//! [copy]
//! list_policy = "replace"
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CopyError, Result};

/// Default number of keys copied per database per invocation.
pub const DEFAULT_LIMIT: usize = 10_000;

/// Default control-namespace prefix, shared with earlier copy tools.
pub const DEFAULT_CONTROL_PREFIX: &str = "mig:";

/// A server address, `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    /// Hostname or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint from parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether two endpoints name the same server.
    pub fn same_server(&self, other: &Endpoint) -> bool {
        self.port == other.port && self.host.eq_ignore_ascii_case(&other.host)
    }
}

impl FromStr for Endpoint {
    type Err = CopyError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        match parts.as_slice() {
            [host, port] if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .ok()
                    .filter(|port| *port != 0)
                    .ok_or_else(|| CopyError::InvalidEndpoint(s.to_string()))?;
                Ok(Endpoint::new(*host, port))
            }
            _ => Err(CopyError::InvalidEndpoint(s.to_string())),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = CopyError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parse a comma separated database list such as `2,5`.
pub fn parse_databases(s: &str) -> Result<Vec<u32>> {
    let dbs = s
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u32>()
                .map_err(|_| CopyError::Config(format!("Invalid database index: {}", part)))
        })
        .collect::<Result<Vec<_>>>()?;
    if dbs.is_empty() {
        return Err(CopyError::NoDatabases);
    }
    Ok(dbs)
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server keys are copied from; also holds all control state
    pub source: Option<Endpoint>,

    /// Server keys are copied to
    pub target: Option<Endpoint>,

    /// Databases to migrate, processed in this order
    pub databases: Vec<u32>,

    /// Maximum keys copied per database per invocation
    pub limit: usize,

    /// Control-state configuration
    pub control: ControlConfig,

    /// Copy behavior
    pub copy: CopySettings,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: None,
            target: None,
            databases: Vec::new(),
            limit: DEFAULT_LIMIT,
            control: ControlConfig::default(),
            copy: CopySettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CopyError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| CopyError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Source and target endpoints, both required.
    pub fn endpoints(&self) -> Result<(&Endpoint, &Endpoint)> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| CopyError::Config("source endpoint is required".to_string()))?;
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| CopyError::Config("target endpoint is required".to_string()))?;
        Ok((source, target))
    }

    /// Validate the configuration for a copy run
    pub fn validate(&self) -> Result<()> {
        let (source, target) = self.endpoints()?;
        if source.same_server(target) {
            return Err(CopyError::SameEndpoint(source.to_string()));
        }

        self.validate_databases()?;

        if self.limit == 0 {
            return Err(CopyError::InvalidLimit(self.limit));
        }

        self.control.validate(&self.databases)?;
        self.copy.validate()?;

        Ok(())
    }

    /// Validate only what read-only commands (`status`, `unlock`) need:
    /// a source and a database list.
    pub fn validate_source(&self) -> Result<()> {
        if self.source.is_none() {
            return Err(CopyError::Config("source endpoint is required".to_string()));
        }
        self.validate_databases()?;
        self.control.validate(&self.databases)
    }

    fn validate_databases(&self) -> Result<()> {
        if self.databases.is_empty() {
            return Err(CopyError::NoDatabases);
        }
        for (i, db) in self.databases.iter().enumerate() {
            if self.databases[..i].contains(db) {
                return Err(CopyError::Config(format!(
                    "database {} is selected more than once",
                    db
                )));
            }
        }
        Ok(())
    }
}

/// Where control state lives and how the run guard behaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Prefix reserved for control keys
    pub prefix: String,

    /// Dedicated database for all control state. When unset, state lives
    /// inside the migrated databases (compatible layout).
    pub database: Option<u32>,

    /// Run-guard lease in seconds
    pub lease_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_CONTROL_PREFIX.to_string(),
            database: None,
            lease_secs: 600,
        }
    }
}

impl ControlConfig {
    /// Run-guard lease duration
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    fn validate(&self, databases: &[u32]) -> Result<()> {
        if self.prefix.is_empty() {
            return Err(CopyError::Config(
                "control prefix cannot be empty".to_string(),
            ));
        }
        if self.lease_secs == 0 {
            return Err(CopyError::Config("lease_secs cannot be 0".to_string()));
        }
        if let Some(db) = self.database {
            if databases.contains(&db) {
                return Err(CopyError::Config(format!(
                    "control database {} cannot also be migrated",
                    db
                )));
            }
        }
        Ok(())
    }
}

/// How list values are written when a slice is copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ListPolicy {
    /// Delete the target list, then push the source contents. Re-copying a
    /// slice after a crash leaves the list identical to the source.
    #[default]
    Replace,

    /// Push the source contents onto whatever the target list holds.
    /// Re-copying a slice after a crash duplicates its elements.
    Append,
}

/// Copy behavior settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CopySettings {
    /// List write strategy
    pub list_policy: ListPolicy,

    /// Log progress every this many keys
    pub progress_interval: u64,

    /// `COUNT` hint for each `SCAN` step while listing keys
    pub scan_count: usize,
}

impl Default for CopySettings {
    fn default() -> Self {
        Self {
            list_policy: ListPolicy::Replace,
            progress_interval: 10_000,
            scan_count: 1000,
        }
    }
}

impl CopySettings {
    fn validate(&self) -> Result<()> {
        if self.progress_interval == 0 {
            return Err(CopyError::Config(
                "progress_interval cannot be 0".to_string(),
            ));
        }
        if self.scan_count == 0 {
            return Err(CopyError::Config("scan_count cannot be 0".to_string()));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format
    #[default]
    Pretty,

    /// JSON format
    Json,
}
