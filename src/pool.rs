//! SQLite connection pool.
//!
//! The store's contract with its pool is acquire/release plus transaction
//! control; this module is the bundled provider of that contract. Released
//! connections go back to an idle free-list up to the configured ceiling,
//! and `PooledConn` returns itself on drop so a connection can never leak
//! past its guard.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params_from_iter};
use snafu::ResultExt;
use tracing::trace;

use crate::config::PoolConfig;
use crate::error::{ExecuteSnafu, OpenDatabaseSnafu, PoolExhaustedSnafu, Result, StoreError};

struct PoolInner {
    path: PathBuf,
    config: PoolConfig,
    idle: Mutex<Vec<Connection>>,
    active: AtomicUsize,
}

/// A pool of SQLite connections over one database file.
#[derive(Clone)]
pub struct SqlitePool {
    inner: Arc<PoolInner>,
}

impl SqlitePool {
    /// Open the pool, eagerly creating `initial_size` connections.
    pub fn open(path: impl Into<PathBuf>, config: PoolConfig) -> Result<Self> {
        let inner = PoolInner {
            path: path.into(),
            config,
            idle: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
        };

        let mut warm = Vec::with_capacity(inner.config.initial_size);
        for _ in 0..inner.config.initial_size {
            warm.push(open_connection(&inner.path, &inner.config)?);
        }
        *inner.idle.lock() = warm;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Hand out a connection, reusing an idle one when available.
    ///
    /// Never blocks: when `max_active` connections are already out, this
    /// returns [`StoreError::PoolExhausted`] and the caller owns the retry
    /// policy.
    pub fn acquire(&self) -> Result<PooledConn> {
        let previous = self.inner.active.fetch_add(1, Ordering::SeqCst);
        if previous >= self.inner.config.max_active {
            self.inner.active.fetch_sub(1, Ordering::SeqCst);
            return PoolExhaustedSnafu {
                max: self.inner.config.max_active,
            }
            .fail();
        }

        let conn = match self.inner.idle.lock().pop() {
            Some(conn) => conn,
            None => match open_connection(&self.inner.path, &self.inner.config) {
                Ok(conn) => conn,
                Err(e) => {
                    self.inner.active.fetch_sub(1, Ordering::SeqCst);
                    return Err(e);
                }
            },
        };

        Ok(PooledConn {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            cached: self.inner.config.cache_statements,
        })
    }
}

fn open_connection(path: &PathBuf, config: &PoolConfig) -> Result<Connection> {
    let conn = Connection::open(path).context(OpenDatabaseSnafu { path: path.clone() })?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context(ExecuteSnafu)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context(ExecuteSnafu)?;
    conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))
        .context(ExecuteSnafu)?;
    // The pool owner's documented default isolation.
    conn.pragma_update(None, "read_uncommitted", true)
        .context(ExecuteSnafu)?;
    conn.set_prepared_statement_cache_capacity(config.statement_cache_capacity());
    Ok(conn)
}

/// RAII guard over a pooled connection.
///
/// Dropping the guard returns the connection to the pool (or closes it when
/// the idle list is full), so every acquisition is paired with exactly one
/// release, including on early returns and panics.
pub struct PooledConn {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    cached: bool,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("cached", &self.cached)
            .finish_non_exhaustive()
    }
}

impl PooledConn {
    fn conn(&self) -> &Connection {
        self.conn
            .as_ref()
            .expect("connection present until guard is dropped")
    }

    /// Execute a statement, returning the affected row count.
    pub(crate) fn execute(&self, sql: &str, params: &[Value]) -> rusqlite::Result<usize> {
        execute_on(self.conn(), self.cached, sql, params)
    }

    /// First column of every row, as strings.
    pub(crate) fn query_strings(&self, sql: &str, params: &[Value]) -> rusqlite::Result<Vec<String>> {
        query_strings_on(self.conn(), self.cached, sql, params)
    }

    /// Single optional row mapped through `f`.
    pub(crate) fn query_row_opt<T>(
        &self,
        sql: &str,
        params: &[Value],
        f: impl FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<Option<T>> {
        if self.cached {
            let mut stmt = self.conn().prepare_cached(sql)?;
            stmt.query_row(params_from_iter(params.iter()), f).optional()
        } else {
            let mut stmt = self.conn().prepare(sql)?;
            stmt.query_row(params_from_iter(params.iter()), f).optional()
        }
    }

    /// Single integer result (COUNT-style queries).
    pub(crate) fn query_count(&self, sql: &str, params: &[Value]) -> rusqlite::Result<i64> {
        if self.cached {
            let mut stmt = self.conn().prepare_cached(sql)?;
            stmt.query_row(params_from_iter(params.iter()), |row| row.get(0))
        } else {
            let mut stmt = self.conn().prepare(sql)?;
            stmt.query_row(params_from_iter(params.iter()), |row| row.get(0))
        }
    }

    /// Run `f` inside one transaction, committing on `Ok`.
    ///
    /// An error return rolls back implicitly when the transaction guard
    /// drops uncommitted.
    pub(crate) fn in_transaction<T>(
        &mut self,
        f: impl FnOnce(&TxConn<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let cached = self.cached;
        let conn = self
            .conn
            .as_mut()
            .expect("connection present until guard is dropped");
        let tx = conn.transaction().context(ExecuteSnafu)?;
        let out = {
            let handle = TxConn { conn: &tx, cached };
            f(&handle)?
        };
        tx.commit().context(ExecuteSnafu)?;
        Ok(out)
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(conn) = self.conn.take() {
            let mut idle = self.pool.idle.lock();
            let keep = self.pool.config.max_idle.max(self.pool.config.min_idle);
            if idle.len() < keep {
                idle.push(conn);
            } else {
                trace!("closing connection released over the idle ceiling");
            }
        }
    }
}

/// Connection handle scoped to one open transaction.
pub(crate) struct TxConn<'a> {
    conn: &'a Connection,
    cached: bool,
}

impl TxConn<'_> {
    pub fn execute(&self, sql: &str, params: &[Value]) -> rusqlite::Result<usize> {
        execute_on(self.conn, self.cached, sql, params)
    }
}

fn execute_on(
    conn: &Connection,
    cached: bool,
    sql: &str,
    params: &[Value],
) -> rusqlite::Result<usize> {
    if cached {
        conn.prepare_cached(sql)?.execute(params_from_iter(params.iter()))
    } else {
        conn.prepare(sql)?.execute(params_from_iter(params.iter()))
    }
}

fn query_strings_on(
    conn: &Connection,
    cached: bool,
    sql: &str,
    params: &[Value],
) -> rusqlite::Result<Vec<String>> {
    let collect = |stmt: &mut rusqlite::Statement<'_>| -> rusqlite::Result<Vec<String>> {
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            row.get::<_, String>(0)
        })?;
        rows.collect()
    };
    if cached {
        let mut stmt = conn.prepare_cached(sql)?;
        collect(&mut stmt)
    } else {
        let mut stmt = conn.prepare(sql)?;
        collect(&mut stmt)
    }
}
