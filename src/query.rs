//! Query composition and lazily-paginated key iteration.
//!
//! Dispatch is a fixed decision tree over four independent optional
//! predicates: secondary key, sorter range, tag list, and free text. Each
//! combination maps to one named statement variant; free text
//! short-circuits to the registered [`TextSearch`] extension regardless of
//! the other three.
//!
//! Parameter order is produced by a single binding routine shared by every
//! variant — sorter bounds first (min then max, each only when present),
//! then tag values in list order, then the secondary key last — and the
//! default templates are written to the same order.

use std::collections::VecDeque;

use rusqlite::types::Value;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, trace};

use crate::error::{QuerySnafu, Result, StoreError, TextSearchUnavailableSnafu};
use crate::pool::PooledConn;
use crate::store::Store;
use crate::template::{QueryId, RenderVars};

/// Rows fetched per round trip by the key cursor.
const CURSOR_BATCH: u64 = 256;

/// The optional predicates of one query.
///
/// A `Some(vec![])` tag list is treated the same as `None`: there is no
/// empty `IN ()` variant.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub secondary: Option<String>,
    /// Inclusive lower sorter bound, compared byte-wise.
    pub min_sorter: Option<Vec<u8>>,
    /// Inclusive upper sorter bound, compared byte-wise.
    pub max_sorter: Option<Vec<u8>>,
    /// Match entries carrying at least one of these tags.
    pub tags: Option<Vec<String>>,
    /// Sort direction over the sorter; ascending when unset.
    pub ascending: Option<bool>,
    /// Free-text query handled by the [`TextSearch`] extension.
    pub text: Option<String>,
}

impl QuerySpec {
    fn has_sorter(&self) -> bool {
        self.min_sorter.is_some() || self.max_sorter.is_some()
    }

    fn tag_slice(&self) -> Option<&[String]> {
        match self.tags.as_deref() {
            Some([]) | None => None,
            Some(tags) => Some(tags),
        }
    }

    pub(crate) fn render_vars<'a>(&'a self, index: &'a str) -> RenderVars<'a> {
        RenderVars {
            index,
            tag_count: self.tag_slice().map_or(0, <[String]>::len),
            ascending: self.ascending.unwrap_or(true),
            has_min: self.min_sorter.is_some(),
            has_max: self.max_sorter.is_some(),
        }
    }

    /// The retrieval statement for this predicate combination.
    pub(crate) fn select_variant(&self) -> QueryId {
        match (self.secondary.is_some(), self.has_sorter(), self.tag_slice().is_some()) {
            (true, true, true) => QueryId::SelectByTagsAndSecAndFilterSorted,
            (true, true, false) => QueryId::SelectBySecAndFilterSorted,
            (true, false, true) => QueryId::SelectByTagsAndSec,
            (true, false, false) => QueryId::SelectBySec,
            (false, true, true) => QueryId::SelectByTagsAndFilterSorted,
            (false, true, false) => QueryId::SelectFilterSorted,
            (false, false, true) => QueryId::SelectByTags,
            (false, false, false) => QueryId::SelectAll,
        }
    }

    /// The counting statement for this predicate combination.
    pub(crate) fn count_variant(&self) -> QueryId {
        match (self.secondary.is_some(), self.has_sorter(), self.tag_slice().is_some()) {
            (true, true, true) => QueryId::CountByTagsAndSecAndFiltered,
            (true, true, false) => QueryId::CountBySecAndFiltered,
            (true, false, true) => QueryId::CountByTagsAndSec,
            (true, false, false) => QueryId::CountBySec,
            (false, true, true) => QueryId::CountByTagsAndFiltered,
            (false, true, false) => QueryId::CountFiltered,
            (false, false, true) => QueryId::CountByTags,
            (false, false, false) => QueryId::CountAll,
        }
    }

    /// Positional parameters in the fixed order every template expects.
    pub(crate) fn bind_params(&self) -> Vec<Value> {
        let mut params = Vec::new();
        if let Some(min) = &self.min_sorter {
            params.push(Value::Blob(min.clone()));
        }
        if let Some(max) = &self.max_sorter {
            params.push(Value::Blob(max.clone()));
        }
        if let Some(tags) = self.tag_slice() {
            for tag in tags {
                params.push(Value::Text(tag.clone()));
            }
        }
        if let Some(sec) = &self.secondary {
            params.push(Value::Text(sec.clone()));
        }
        params
    }
}

/// Free-text query execution, pluggable and external to this core.
pub trait TextSearch: Send + Sync {
    /// Keys matching `spec.text` (and the other predicates), windowed by
    /// `(from, size)`.
    fn query(&self, index: &str, spec: &QuerySpec, from: u64, size: u64) -> Result<Vec<String>>;

    /// Count of keys matching `spec.text` (and the other predicates).
    fn count(&self, index: &str, spec: &QuerySpec) -> Result<u64>;
}

impl Store {
    /// Run a query, returning a lazy key sequence.
    ///
    /// The sequence owns a pooled connection until it is exhausted, closed,
    /// or dropped — consume or drop it promptly. It is forward-only,
    /// single-pass, and not restartable.
    pub fn query(&self, index: &str, spec: &QuerySpec, from: u64, size: u64) -> Result<Keys> {
        if spec.text.is_some() {
            let ext = self.text.as_deref().context(TextSearchUnavailableSnafu)?;
            let keys = ext.query(index, spec, from, size)?;
            return Ok(Keys {
                inner: KeysInner::Buffered(keys.into_iter()),
            });
        }

        let conn = self.ensure(index)?;
        let variant = spec.select_variant();
        let sql = self.templates.render(variant, &spec.render_vars(index))?;
        debug!(index, query = variant.name(), from, size, "starting key query");
        Ok(Keys {
            inner: KeysInner::Cursor(KeyCursor::new(conn, &sql, spec.bind_params(), from, size)),
        })
    }

    /// Query with an unbounded window.
    pub fn query_all(&self, index: &str, spec: &QuerySpec) -> Result<Keys> {
        self.query(index, spec, 0, u64::MAX)
    }

    /// Count the keys the same predicate combination would return.
    pub fn count(&self, index: &str, spec: &QuerySpec) -> Result<u64> {
        if spec.text.is_some() {
            let ext = self.text.as_deref().context(TextSearchUnavailableSnafu)?;
            return ext.count(index, spec);
        }

        let conn = self.ensure(index)?;
        let variant = spec.count_variant();
        let sql = self.templates.render(variant, &spec.render_vars(index))?;
        let count = conn
            .query_count(&sql, &spec.bind_params())
            .context(QuerySnafu)?;
        Ok(count.max(0) as u64)
    }
}

/// Lazy, forward-only sequence of keys.
///
/// Yields `Result<String>`; after the first error the sequence is finished.
/// The backing connection is released exactly once: on exhaustion, on
/// [`close`](Keys::close), or on drop.
pub struct Keys {
    inner: KeysInner,
}

enum KeysInner {
    Cursor(KeyCursor),
    Buffered(std::vec::IntoIter<String>),
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match &self.inner {
            KeysInner::Cursor(_) => "Cursor",
            KeysInner::Buffered(_) => "Buffered",
        };
        f.debug_struct("Keys").field("inner", &variant).finish()
    }
}

impl Keys {
    /// Release the backing connection without consuming the rest.
    pub fn close(&mut self) {
        if let KeysInner::Cursor(cursor) = &mut self.inner {
            cursor.release();
        }
    }
}

impl Iterator for Keys {
    type Item = Result<String, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            KeysInner::Cursor(cursor) => cursor.next_key(),
            KeysInner::Buffered(iter) => iter.next().map(Ok),
        }
    }
}

/// Batched cursor over one rendered select statement.
///
/// Holds the pooled connection and fetches `CURSOR_BATCH` keys per round
/// trip with a cursor-level `LIMIT ?/OFFSET ?` window, so consumption stays
/// on demand while the `(from, size)` window is applied at the source.
struct KeyCursor {
    conn: Option<PooledConn>,
    paged_sql: String,
    params: Vec<Value>,
    offset: u64,
    remaining: u64,
    buf: VecDeque<String>,
    done: bool,
}

impl KeyCursor {
    fn new(conn: PooledConn, sql: &str, params: Vec<Value>, from: u64, size: u64) -> Self {
        Self {
            conn: Some(conn),
            paged_sql: format!("{sql} LIMIT ? OFFSET ?"),
            params,
            offset: from,
            remaining: size,
            buf: VecDeque::new(),
            done: false,
        }
    }

    fn next_key(&mut self) -> Option<Result<String, StoreError>> {
        loop {
            if let Some(key) = self.buf.pop_front() {
                return Some(Ok(key));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.refill() {
                self.done = true;
                self.release();
                return Some(Err(e));
            }
            if self.buf.is_empty() {
                self.done = true;
                self.release();
                return None;
            }
        }
    }

    fn refill(&mut self) -> Result<(), StoreError> {
        let want = self.remaining.min(CURSOR_BATCH);
        if want == 0 {
            return Ok(());
        }
        let conn = self
            .conn
            .as_ref()
            .expect("cursor connection held until done");

        let mut params = self.params.clone();
        params.push(Value::Integer(want as i64));
        params.push(Value::Integer(self.offset.min(i64::MAX as u64) as i64));

        let keys = conn.query_strings(&self.paged_sql, &params).context(QuerySnafu)?;
        let fetched = keys.len() as u64;
        self.offset += fetched;
        self.remaining -= fetched.min(self.remaining);
        if fetched < want {
            // Short page: the underlying result set is exhausted.
            self.remaining = 0;
        }
        self.buf.extend(keys);
        Ok(())
    }

    fn release(&mut self) {
        if self.conn.take().is_some() {
            trace!("key cursor released its connection");
        }
        self.done = true;
    }
}

impl Drop for KeyCursor {
    fn drop(&mut self) {
        self.release();
    }
}
