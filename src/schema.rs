//! Schema manager.
//!
//! Tables for a logical index are created lazily, exactly once per store.
//! The existence probe is a catalog lookup (the `check` template returns a
//! row iff the main table exists), so an unrelated backend failure can
//! never masquerade as "table missing". Check-and-create is serialized by
//! one mutex; a racer that loses simply finds the table present on its own
//! probe and records the index as known.

use std::collections::HashSet;

use parking_lot::Mutex;
use snafu::ResultExt;
use tracing::debug;

use crate::error::{ExecuteSnafu, QuerySnafu, Result};
use crate::pool::{PooledConn, SqlitePool};
use crate::template::{QueryId, TemplateSet};

/// Per-store record of which indices have been ensured.
///
/// Owned by the store value, so its lifetime is bounded by the pool's and
/// closing the store discards it.
pub(crate) struct SchemaManager {
    known: Mutex<HashSet<String>>,
}

impl SchemaManager {
    pub fn new() -> Self {
        Self {
            known: Mutex::new(HashSet::new()),
        }
    }

    /// Acquire a connection with the index's tables guaranteed to exist.
    ///
    /// The first call per index runs the probe-and-create sequence; later
    /// calls skip straight to `acquire`. Idempotent: repeat calls never
    /// re-execute the create script and never surface an error for an
    /// already-existing index.
    pub fn ensure(
        &self,
        pool: &SqlitePool,
        templates: &TemplateSet,
        index: &str,
    ) -> Result<PooledConn> {
        if self.known.lock().contains(index) {
            return pool.acquire();
        }

        let conn = pool.acquire()?;
        let mut known = self.known.lock();
        // Re-check under the lock: another caller may have won the race
        // while this one was acquiring.
        if known.contains(index) {
            return Ok(conn);
        }

        let check_sql = templates.render_static(QueryId::Check, index)?;
        let exists = conn
            .query_row_opt(&check_sql, &[], |_| Ok(()))
            .context(QuerySnafu)?
            .is_some();

        if !exists {
            debug!(index, "creating tables for index");
            let create_sql = templates.render_static(QueryId::Create, index)?;
            for statement in create_sql.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                conn.execute(statement, &[]).context(ExecuteSnafu)?;
            }
        }

        known.insert(index.to_string());
        Ok(conn)
    }

    #[cfg(test)]
    pub fn is_known(&self, index: &str) -> bool {
        self.known.lock().contains(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir) -> (SqlitePool, TemplateSet, SchemaManager) {
        let pool = SqlitePool::open(dir.path().join("schema.db"), PoolConfig::default())
            .expect("pool should open");
        let templates = TemplateSet::load(&BTreeMap::new()).expect("templates should compile");
        (pool, templates, SchemaManager::new())
    }

    #[test]
    fn ensure_creates_once_and_remembers() {
        let dir = TempDir::new().expect("temp dir");
        let (pool, templates, schema) = fixture(&dir);

        assert!(!schema.is_known("docs"));
        schema.ensure(&pool, &templates, "docs").expect("first ensure");
        assert!(schema.is_known("docs"));
        schema.ensure(&pool, &templates, "docs").expect("second ensure");
    }

    #[test]
    fn ensure_adopts_tables_created_elsewhere() {
        let dir = TempDir::new().expect("temp dir");
        let (pool, templates, first) = fixture(&dir);
        first.ensure(&pool, &templates, "docs").expect("create");

        // A fresh manager over the same database must probe, not recreate.
        let second = SchemaManager::new();
        second.ensure(&pool, &templates, "docs").expect("adopt");
        assert!(second.is_known("docs"));
    }
}
