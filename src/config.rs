//! Store configuration.
//!
//! Configuration is consumed as a flat key/value map, the way the pool owner
//! hands it over: the database path, pool sizing under `pool.*`, and SQL
//! template overrides under the reserved `queries.*` prefix. Anything else
//! is ignored.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigSnafu, Result};

/// Default values for configuration
mod defaults {
    pub fn max_active() -> usize {
        90
    }
    pub fn max_idle() -> usize {
        50
    }
    pub fn min_idle() -> usize {
        10
    }
    pub fn initial_size() -> usize {
        10
    }
    pub fn cache_statements() -> bool {
        true
    }
    pub fn busy_timeout_ms() -> u64 {
        5_000
    }
    pub fn statement_cache_capacity() -> usize {
        64
    }
}

/// Connection pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Hard ceiling on concurrently handed-out connections.
    #[serde(default = "defaults::max_active")]
    pub max_active: usize,
    /// Connections kept around after release; the rest are closed.
    #[serde(default = "defaults::max_idle")]
    pub max_idle: usize,
    /// Lower bound the pool keeps open once it has been reached.
    #[serde(default = "defaults::min_idle")]
    pub min_idle: usize,
    /// Connections opened eagerly at store open.
    #[serde(default = "defaults::initial_size")]
    pub initial_size: usize,
    /// Route statements through the per-connection prepared-statement cache.
    #[serde(default = "defaults::cache_statements")]
    pub cache_statements: bool,
    /// SQLite busy timeout applied to every connection.
    #[serde(default = "defaults::busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: defaults::max_active(),
            max_idle: defaults::max_idle(),
            min_idle: defaults::min_idle(),
            initial_size: defaults::initial_size(),
            cache_statements: defaults::cache_statements(),
            busy_timeout_ms: defaults::busy_timeout_ms(),
        }
    }
}

impl PoolConfig {
    /// Capacity for rusqlite's prepared-statement cache when enabled.
    pub fn statement_cache_capacity(&self) -> usize {
        if self.cache_statements {
            defaults::statement_cache_capacity()
        } else {
            0
        }
    }
}

/// Full store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the SQLite database file.
    pub path: PathBuf,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Per-query SQL template overrides, keyed by query name.
    #[serde(default)]
    pub query_overrides: BTreeMap<String, String>,
}

impl StoreConfig {
    /// Configuration with defaults for everything but the database path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: PoolConfig::default(),
            query_overrides: BTreeMap::new(),
        }
    }

    /// Parse a flat property map.
    ///
    /// Recognized keys: `path`, `pool.max_active`, `pool.max_idle`,
    /// `pool.min_idle`, `pool.initial_size`, `pool.cache_statements`,
    /// `pool.busy_timeout_ms`, and `queries.<name>` template overrides.
    /// Unrecognized keys are ignored so callers can pass a shared map.
    pub fn from_properties(props: &BTreeMap<String, String>) -> Result<Self> {
        let path = props.get("path").ok_or_else(|| {
            ConfigSnafu {
                key: "path",
                reason: "required property is missing",
            }
            .build()
        })?;

        let mut config = Self::new(path);

        if let Some(v) = props.get("pool.max_active") {
            config.pool.max_active = parse_usize("pool.max_active", v)?;
        }
        if let Some(v) = props.get("pool.max_idle") {
            config.pool.max_idle = parse_usize("pool.max_idle", v)?;
        }
        if let Some(v) = props.get("pool.min_idle") {
            config.pool.min_idle = parse_usize("pool.min_idle", v)?;
        }
        if let Some(v) = props.get("pool.initial_size") {
            config.pool.initial_size = parse_usize("pool.initial_size", v)?;
        }
        if let Some(v) = props.get("pool.cache_statements") {
            config.pool.cache_statements = parse_bool("pool.cache_statements", v)?;
        }
        if let Some(v) = props.get("pool.busy_timeout_ms") {
            config.pool.busy_timeout_ms = parse_usize("pool.busy_timeout_ms", v)? as u64;
        }

        for (key, value) in props {
            if let Some(name) = key.strip_prefix("queries.") {
                config
                    .query_overrides
                    .insert(name.to_string(), value.clone());
            }
        }

        if config.pool.max_active == 0 {
            return ConfigSnafu {
                key: "pool.max_active",
                reason: "must be at least 1",
            }
            .fail();
        }

        Ok(config)
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value.parse::<usize>().map_err(|e| {
        ConfigSnafu {
            key,
            reason: format!("must be a non-negative integer: {e}"),
        }
        .build()
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    value.parse::<bool>().map_err(|e| {
        ConfigSnafu {
            key,
            reason: format!("must be 'true' or 'false': {e}"),
        }
        .build()
    })
}
