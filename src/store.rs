//! The store handle: open/close, the write path, point reads, removal, and
//! index discovery.
//!
//! Every operation acquires one pooled connection, does its statements,
//! commits if it wrote, and releases the connection before returning. The
//! paginated key iterator in [`crate::query`] is the one exception and is
//! documented there.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::types::Value;
use snafu::ResultExt;
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{ExecuteSnafu, QuerySnafu, Result, SerializeAttributesSnafu};
use crate::pool::{PooledConn, SqlitePool};
use crate::query::TextSearch;
use crate::schema::SchemaManager;
use crate::template::{QueryId, TemplateSet};

/// Attribute map attached to an index entry, serialized to JSON at rest.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Physical table suffixes behind one logical index.
pub(crate) const TABLE_SUFFIXES: [&str; 3] = ["_main", "_indx", "_lock"];

/// A tag- and range-indexable key/value document store over SQLite.
///
/// One `Store` owns one connection pool plus the caches scoped to it (the
/// rendered-SQL cache and the known-index set); dropping the store drops
/// them together.
pub struct Store {
    pub(crate) pool: SqlitePool,
    pub(crate) templates: TemplateSet,
    pub(crate) schema: SchemaManager,
    pub(crate) text: Option<Arc<dyn TextSearch>>,
}

impl Store {
    /// Open a store: compile the template set (with any configured
    /// overrides) and warm the pool. Template problems are fatal here, not
    /// at first use.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let templates = TemplateSet::load(&config.query_overrides)?;
        let pool = SqlitePool::open(&config.path, config.pool.clone())?;
        Ok(Self {
            pool,
            templates,
            schema: SchemaManager::new(),
            text: None,
        })
    }

    /// Open from a flat property map (see [`StoreConfig::from_properties`]).
    pub fn open_from_properties(props: &BTreeMap<String, String>) -> Result<Self> {
        Self::open(StoreConfig::from_properties(props)?)
    }

    /// Register the free-text query extension this store dispatches to.
    pub fn with_text_search(mut self, ext: Arc<dyn TextSearch>) -> Self {
        self.text = Some(ext);
        self
    }

    pub(crate) fn ensure(&self, index: &str) -> Result<PooledConn> {
        self.schema.ensure(&self.pool, &self.templates, index)
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn put_value(&self, index: &str, key: &str, value: &[u8]) -> Result<()> {
        self.put_value_with_hooks(index, key, value, || (), || ())
    }

    /// [`put_value`](Self::put_value) with ordering hooks: `pre` runs before
    /// the write transaction is acquired, `post` runs after commit and only
    /// if the write succeeded.
    pub fn put_value_with_hooks(
        &self,
        index: &str,
        key: &str,
        value: &[u8],
        pre: impl FnOnce(),
        post: impl FnOnce(),
    ) -> Result<()> {
        pre();

        let mut conn = self.ensure(index)?;
        let delete = self.templates.render_static(QueryId::Delete, index)?;
        let insert = self.templates.render_static(QueryId::Insert, index)?;
        conn.in_transaction(|tx| {
            // Unconditional delete: zero rows matched is the fresh-key case.
            tx.execute(&delete, &[Value::Text(key.to_string())])
                .context(ExecuteSnafu)?;
            tx.execute(
                &insert,
                &[Value::Text(key.to_string()), Value::Blob(value.to_vec())],
            )
            .context(ExecuteSnafu)?;
            Ok(())
        })?;

        post();
        Ok(())
    }

    /// Replace the index entry for `key`: attributes, sorter, secondary key
    /// and tag fan-out. One row per tag; a single null-tag row when `tags`
    /// is empty.
    pub fn put_index_entry(
        &self,
        index: &str,
        key: &str,
        attributes: &Attributes,
        sorter: Option<&[u8]>,
        secondary: Option<&str>,
        tags: &[String],
    ) -> Result<()> {
        self.put_index_entry_with_hook(index, key, attributes, sorter, secondary, tags, || ())
    }

    /// [`put_index_entry`](Self::put_index_entry) with a hook run after the
    /// index rows are committed.
    #[allow(clippy::too_many_arguments)]
    pub fn put_index_entry_with_hook(
        &self,
        index: &str,
        key: &str,
        attributes: &Attributes,
        sorter: Option<&[u8]>,
        secondary: Option<&str>,
        tags: &[String],
        post: impl FnOnce(),
    ) -> Result<()> {
        let json = serde_json::to_string(attributes).context(SerializeAttributesSnafu)?;

        let mut conn = self.ensure(index)?;
        let delete = self.templates.render_static(QueryId::DeleteIndex, index)?;
        let insert = self.templates.render_static(QueryId::InsertIndex, index)?;
        conn.in_transaction(|tx| {
            tx.execute(&delete, &[Value::Text(key.to_string())])
                .context(ExecuteSnafu)?;

            let sorter_value = || match sorter {
                Some(bytes) => Value::Blob(bytes.to_vec()),
                None => Value::Null,
            };
            let secondary_value = || match secondary {
                Some(sec) => Value::Text(sec.to_string()),
                None => Value::Null,
            };

            if tags.is_empty() {
                tx.execute(
                    &insert,
                    &[
                        Value::Text(key.to_string()),
                        Value::Text(json.clone()),
                        Value::Null,
                        sorter_value(),
                        secondary_value(),
                    ],
                )
                .context(ExecuteSnafu)?;
            } else {
                for tag in tags {
                    tx.execute(
                        &insert,
                        &[
                            Value::Text(key.to_string()),
                            Value::Text(json.clone()),
                            Value::Text(tag.clone()),
                            sorter_value(),
                            secondary_value(),
                        ],
                    )
                    .context(ExecuteSnafu)?;
                }
            }
            Ok(())
        })?;

        post();
        Ok(())
    }

    /// Fetch the value stored under `key`, if any.
    pub fn get(&self, index: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.ensure(index)?;
        let sql = self.templates.render_static(QueryId::SelectById, index)?;
        conn.query_row_opt(&sql, &[Value::Text(key.to_string())], |row| {
            row.get::<_, Vec<u8>>(0)
        })
        .context(QuerySnafu)
    }

    /// Delete `key` from both the main and index tables. Absent keys are a
    /// no-op, not an error.
    pub fn remove(&self, index: &str, key: &str) -> Result<()> {
        self.remove_with_hook(index, key, || ())
    }

    /// [`remove`](Self::remove) with a hook run after the commit.
    pub fn remove_with_hook(&self, index: &str, key: &str, post: impl FnOnce()) -> Result<()> {
        let mut conn = self.ensure(index)?;
        let delete_main = self.templates.render_static(QueryId::Delete, index)?;
        let delete_indx = self.templates.render_static(QueryId::DeleteIndex, index)?;
        conn.in_transaction(|tx| {
            let mut deleted = tx
                .execute(&delete_main, &[Value::Text(key.to_string())])
                .context(ExecuteSnafu)?;
            deleted += tx
                .execute(&delete_indx, &[Value::Text(key.to_string())])
                .context(ExecuteSnafu)?;
            if deleted > 0 {
                debug!(index, key, deleted, "removed key");
            }
            Ok(())
        })?;

        post();
        Ok(())
    }

    /// Truncate the main and index tables for `index`. Lock rows are left
    /// alone.
    pub fn remove_all(&self, index: &str) -> Result<()> {
        let mut conn = self.ensure(index)?;
        let script = self.templates.render_static(QueryId::DeleteAll, index)?;
        conn.in_transaction(|tx| {
            for statement in script.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                tx.execute(statement, &[]).context(ExecuteSnafu)?;
            }
            Ok(())
        })
    }

    /// Logical index names recovered from backend catalog metadata: table
    /// names carrying one of the three physical suffixes, suffix stripped.
    pub fn indices(&self) -> Result<Vec<String>> {
        let conn = self.pool.acquire()?;
        let sql = self.templates.render_static(QueryId::ListTables, "")?;
        let tables = conn.query_strings(&sql, &[]).context(QuerySnafu)?;

        let mut names = std::collections::BTreeSet::new();
        for table in tables {
            let lower = table.to_lowercase();
            for suffix in TABLE_SUFFIXES {
                if let Some(base) = lower.strip_suffix(suffix) {
                    if !base.is_empty() {
                        names.insert(base.to_string());
                    }
                    break;
                }
            }
        }
        Ok(names.into_iter().collect())
    }
}
