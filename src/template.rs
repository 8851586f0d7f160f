//! SQL template store, renderer, and render cache.
//!
//! Every statement the store executes is rendered from a named template.
//! The default set below targets SQLite; any template can be replaced per
//! store through the `queries.<name>` configuration prefix, which is how
//! schema or dialect variations are expressed.
//!
//! Template grammar, compiled once at open time:
//!
//! - `{index}` — the logical index name.
//! - `{tags}` — a `?, ?, …` placeholder list sized by the tag count.
//! - `{dir}` — `ASC` or `DESC` from the ascending flag (`ASC` when unset).
//! - `{min:…}` / `{max:…}` — the enclosed text is emitted only when the
//!   corresponding sorter bound is present.
//!
//! A template whose only substitution is `{index}` is static: its rendering
//! is cached per (query, index). Templates with dynamic substitutions are
//! re-rendered on every call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{ConfigSnafu, MissingTemplateSnafu, Result, TemplateSyntaxSnafu};

/// Milliseconds since the Unix epoch, evaluated on the backend's clock.
const NOW_MS: &str = "CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)";

/// The closed set of statement variants.
///
/// Identifiers are typed rather than stringly keyed so a template missing
/// for any variant is caught once, at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryId {
    Create,
    Check,
    ListTables,
    Insert,
    Delete,
    SelectById,
    SelectAll,
    CountAll,
    InsertIndex,
    DeleteIndex,
    DeleteAll,
    SelectByTags,
    CountByTags,
    SelectBySec,
    CountBySec,
    SelectFilterSorted,
    CountFiltered,
    SelectByTagsAndFilterSorted,
    CountByTagsAndFiltered,
    SelectByTagsAndSec,
    CountByTagsAndSec,
    SelectBySecAndFilterSorted,
    CountBySecAndFiltered,
    SelectByTagsAndSecAndFilterSorted,
    CountByTagsAndSecAndFiltered,
    SelectLock,
    InsertLock,
    UpdateLock,
    DeleteLock,
}

impl QueryId {
    pub const ALL: [QueryId; 29] = [
        QueryId::Create,
        QueryId::Check,
        QueryId::ListTables,
        QueryId::Insert,
        QueryId::Delete,
        QueryId::SelectById,
        QueryId::SelectAll,
        QueryId::CountAll,
        QueryId::InsertIndex,
        QueryId::DeleteIndex,
        QueryId::DeleteAll,
        QueryId::SelectByTags,
        QueryId::CountByTags,
        QueryId::SelectBySec,
        QueryId::CountBySec,
        QueryId::SelectFilterSorted,
        QueryId::CountFiltered,
        QueryId::SelectByTagsAndFilterSorted,
        QueryId::CountByTagsAndFiltered,
        QueryId::SelectByTagsAndSec,
        QueryId::CountByTagsAndSec,
        QueryId::SelectBySecAndFilterSorted,
        QueryId::CountBySecAndFiltered,
        QueryId::SelectByTagsAndSecAndFilterSorted,
        QueryId::CountByTagsAndSecAndFiltered,
        QueryId::SelectLock,
        QueryId::InsertLock,
        QueryId::UpdateLock,
        QueryId::DeleteLock,
    ];

    /// The template key, also used for `queries.<name>` overrides.
    pub fn name(self) -> &'static str {
        match self {
            QueryId::Create => "create",
            QueryId::Check => "check",
            QueryId::ListTables => "listTables",
            QueryId::Insert => "insert",
            QueryId::Delete => "delete",
            QueryId::SelectById => "selectById",
            QueryId::SelectAll => "selectAll",
            QueryId::CountAll => "countAll",
            QueryId::InsertIndex => "insertIndex",
            QueryId::DeleteIndex => "deleteIndex",
            QueryId::DeleteAll => "deleteAll",
            QueryId::SelectByTags => "selectByTags",
            QueryId::CountByTags => "countByTags",
            QueryId::SelectBySec => "selectBySec",
            QueryId::CountBySec => "countBySec",
            QueryId::SelectFilterSorted => "selectFilterSorted",
            QueryId::CountFiltered => "countFiltered",
            QueryId::SelectByTagsAndFilterSorted => "selectByTagsAndFilterSorted",
            QueryId::CountByTagsAndFiltered => "countByTagsAndFiltered",
            QueryId::SelectByTagsAndSec => "selectByTagsAndSec",
            QueryId::CountByTagsAndSec => "countByTagsAndSec",
            QueryId::SelectBySecAndFilterSorted => "selectBySecAndFilterSorted",
            QueryId::CountBySecAndFiltered => "countBySecAndFiltered",
            QueryId::SelectByTagsAndSecAndFilterSorted => "selectByTagsAndSecAndFilterSorted",
            QueryId::CountByTagsAndSecAndFiltered => "countByTagsAndSecAndFiltered",
            QueryId::SelectLock => "selectLock",
            QueryId::InsertLock => "insertLock",
            QueryId::UpdateLock => "updateLock",
            QueryId::DeleteLock => "deleteLock",
        }
    }

    fn default_template(self) -> String {
        match self {
            QueryId::Create => concat!(
                "CREATE TABLE {index}_main (id TEXT PRIMARY KEY, val BLOB);",
                "CREATE TABLE {index}_indx (id TEXT NOT NULL, attrs TEXT, tag TEXT, ",
                "sorter BLOB, sec TEXT);",
                "CREATE INDEX {index}_indx_tag ON {index}_indx (tag);",
                "CREATE INDEX {index}_indx_sorter ON {index}_indx (sorter);",
                "CREATE INDEX {index}_indx_sec ON {index}_indx (sec);",
                "CREATE TABLE {index}_lock (id TEXT PRIMARY KEY, createdat INTEGER NOT NULL, ",
                "waitfor INTEGER NOT NULL, session TEXT NOT NULL)"
            )
            .to_string(),
            // Catalog lookup: returns a row iff the main table exists.
            QueryId::Check => {
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = '{index}_main'"
                    .to_string()
            }
            QueryId::ListTables => {
                "SELECT name FROM sqlite_master WHERE type = 'table'".to_string()
            }
            QueryId::Insert => "INSERT INTO {index}_main (id, val) VALUES (?, ?)".to_string(),
            QueryId::Delete => "DELETE FROM {index}_main WHERE id = ?".to_string(),
            QueryId::SelectById => "SELECT val FROM {index}_main WHERE id = ?".to_string(),
            QueryId::SelectAll => "SELECT id FROM {index}_main ORDER BY id".to_string(),
            QueryId::CountAll => "SELECT COUNT(*) FROM {index}_main".to_string(),
            QueryId::InsertIndex => {
                "INSERT INTO {index}_indx (id, attrs, tag, sorter, sec) VALUES (?, ?, ?, ?, ?)"
                    .to_string()
            }
            QueryId::DeleteIndex => "DELETE FROM {index}_indx WHERE id = ?".to_string(),
            QueryId::DeleteAll => {
                "DELETE FROM {index}_main;DELETE FROM {index}_indx".to_string()
            }
            QueryId::SelectByTags => concat!(
                "SELECT DISTINCT id, sorter FROM {index}_indx ",
                "WHERE tag IN ({tags}) ORDER BY sorter {dir}"
            )
            .to_string(),
            QueryId::CountByTags => {
                "SELECT COUNT(DISTINCT id) FROM {index}_indx WHERE tag IN ({tags})".to_string()
            }
            QueryId::SelectBySec => concat!(
                "SELECT DISTINCT id, sorter FROM {index}_indx ",
                "WHERE sec = ? ORDER BY sorter {dir}"
            )
            .to_string(),
            QueryId::CountBySec => {
                "SELECT COUNT(DISTINCT id) FROM {index}_indx WHERE sec = ?".to_string()
            }
            QueryId::SelectFilterSorted => concat!(
                "SELECT DISTINCT id, sorter FROM {index}_indx WHERE 1 = 1",
                "{min: AND sorter >= ?}{max: AND sorter <= ?} ORDER BY sorter {dir}"
            )
            .to_string(),
            QueryId::CountFiltered => concat!(
                "SELECT COUNT(DISTINCT id) FROM {index}_indx WHERE 1 = 1",
                "{min: AND sorter >= ?}{max: AND sorter <= ?}"
            )
            .to_string(),
            QueryId::SelectByTagsAndFilterSorted => concat!(
                "SELECT DISTINCT id, sorter FROM {index}_indx WHERE 1 = 1",
                "{min: AND sorter >= ?}{max: AND sorter <= ?} AND tag IN ({tags}) ",
                "ORDER BY sorter {dir}"
            )
            .to_string(),
            QueryId::CountByTagsAndFiltered => concat!(
                "SELECT COUNT(DISTINCT id) FROM {index}_indx WHERE 1 = 1",
                "{min: AND sorter >= ?}{max: AND sorter <= ?} AND tag IN ({tags})"
            )
            .to_string(),
            QueryId::SelectByTagsAndSec => concat!(
                "SELECT DISTINCT id, sorter FROM {index}_indx ",
                "WHERE tag IN ({tags}) AND sec = ? ORDER BY sorter {dir}"
            )
            .to_string(),
            QueryId::CountByTagsAndSec => concat!(
                "SELECT COUNT(DISTINCT id) FROM {index}_indx ",
                "WHERE tag IN ({tags}) AND sec = ?"
            )
            .to_string(),
            QueryId::SelectBySecAndFilterSorted => concat!(
                "SELECT DISTINCT id, sorter FROM {index}_indx WHERE 1 = 1",
                "{min: AND sorter >= ?}{max: AND sorter <= ?} AND sec = ? ",
                "ORDER BY sorter {dir}"
            )
            .to_string(),
            QueryId::CountBySecAndFiltered => concat!(
                "SELECT COUNT(DISTINCT id) FROM {index}_indx WHERE 1 = 1",
                "{min: AND sorter >= ?}{max: AND sorter <= ?} AND sec = ?"
            )
            .to_string(),
            QueryId::SelectByTagsAndSecAndFilterSorted => concat!(
                "SELECT DISTINCT id, sorter FROM {index}_indx WHERE 1 = 1",
                "{min: AND sorter >= ?}{max: AND sorter <= ?} AND tag IN ({tags}) ",
                "AND sec = ? ORDER BY sorter {dir}"
            )
            .to_string(),
            QueryId::CountByTagsAndSecAndFiltered => concat!(
                "SELECT COUNT(DISTINCT id) FROM {index}_indx WHERE 1 = 1",
                "{min: AND sorter >= ?}{max: AND sorter <= ?} AND tag IN ({tags}) AND sec = ?"
            )
            .to_string(),
            QueryId::SelectLock => format!(
                "SELECT {NOW_MS}, createdat, waitfor, session FROM {{index}}_lock WHERE id = ?"
            ),
            QueryId::InsertLock => format!(
                "INSERT INTO {{index}}_lock (id, createdat, waitfor, session) \
                 VALUES (?, {NOW_MS}, ?, ?)"
            ),
            QueryId::UpdateLock => format!(
                "UPDATE {{index}}_lock SET createdat = {NOW_MS}, waitfor = ?, session = ? \
                 WHERE id = ?"
            ),
            QueryId::DeleteLock => "DELETE FROM {index}_lock WHERE id = ?".to_string(),
        }
    }

    fn by_name(name: &str) -> Option<QueryId> {
        QueryId::ALL.iter().copied().find(|id| id.name() == name)
    }
}

/// Bindings a render is evaluated against.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RenderVars<'a> {
    pub index: &'a str,
    pub tag_count: usize,
    pub ascending: bool,
    pub has_min: bool,
    pub has_max: bool,
}

impl<'a> RenderVars<'a> {
    /// Vars for a static render, where only the index name matters.
    pub fn for_index(index: &'a str) -> Self {
        Self {
            index,
            tag_count: 0,
            ascending: true,
            has_min: false,
            has_max: false,
        }
    }
}

#[derive(Debug, Clone)]
enum Token {
    Literal(String),
    Index,
    Tags,
    Dir,
    Min(String),
    Max(String),
}

/// One compiled template.
#[derive(Debug, Clone)]
struct Template {
    tokens: Vec<Token>,
    is_static: bool,
}

impl Template {
    fn compile(name: &str, source: &str) -> Result<Self> {
        let mut tokens = Vec::new();
        let mut is_static = true;
        let mut rest = source;

        while let Some(open) = rest.find('{') {
            if open > 0 {
                tokens.push(Token::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                TemplateSyntaxSnafu {
                    name,
                    reason: "unclosed '{' placeholder",
                }
                .build()
            })?;
            let inner = &after[..close];
            let token = match inner {
                "index" => Token::Index,
                "tags" => {
                    is_static = false;
                    Token::Tags
                }
                "dir" => {
                    is_static = false;
                    Token::Dir
                }
                _ => match inner.split_once(':') {
                    Some(("min", body)) => {
                        is_static = false;
                        Token::Min(body.to_string())
                    }
                    Some(("max", body)) => {
                        is_static = false;
                        Token::Max(body.to_string())
                    }
                    _ => {
                        return TemplateSyntaxSnafu {
                            name,
                            reason: format!("unknown placeholder '{{{inner}}}'"),
                        }
                        .fail();
                    }
                },
            };
            tokens.push(token);
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            tokens.push(Token::Literal(rest.to_string()));
        }

        Ok(Self { tokens, is_static })
    }

    fn render(&self, vars: &RenderVars<'_>) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Index => out.push_str(vars.index),
                Token::Tags => {
                    for i in 0..vars.tag_count {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        out.push('?');
                    }
                }
                Token::Dir => out.push_str(if vars.ascending { "ASC" } else { "DESC" }),
                Token::Min(body) => {
                    if vars.has_min {
                        out.push_str(body);
                    }
                }
                Token::Max(body) => {
                    if vars.has_max {
                        out.push_str(body);
                    }
                }
            }
        }
        out
    }
}

/// The full template set plus the static-render cache.
///
/// Owned by the store value so cache lifetime is bounded by the pool's.
pub(crate) struct TemplateSet {
    templates: HashMap<QueryId, Template>,
    static_cache: DashMap<(QueryId, String), Arc<str>>,
}

impl std::fmt::Debug for TemplateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateSet")
            .field("templates", &self.templates.len())
            .field("static_cache", &self.static_cache.len())
            .finish()
    }
}

impl TemplateSet {
    /// Compile the default set, replacing entries named in `overrides`.
    ///
    /// Every [`QueryId`] must end up with a valid template; an override for
    /// a name outside the set is a configuration error.
    pub fn load(overrides: &BTreeMap<String, String>) -> Result<Self> {
        for name in overrides.keys() {
            if QueryId::by_name(name).is_none() {
                return ConfigSnafu {
                    key: format!("queries.{name}"),
                    reason: "unknown query name",
                }
                .fail();
            }
        }

        let mut templates = HashMap::with_capacity(QueryId::ALL.len());
        for id in QueryId::ALL {
            let source = match overrides.get(id.name()) {
                Some(custom) => custom.clone(),
                None => id.default_template(),
            };
            templates.insert(id, Template::compile(id.name(), &source)?);
        }

        Ok(Self {
            templates,
            static_cache: DashMap::new(),
        })
    }

    /// Render `id` against `vars`.
    ///
    /// Static renders are cached per (query, index); concurrent duplicate
    /// renders are idempotent, so the racing loser just overwrites an equal
    /// value. Dynamic renders are rebuilt every call.
    pub fn render(&self, id: QueryId, vars: &RenderVars<'_>) -> Result<Arc<str>> {
        let template = self
            .templates
            .get(&id)
            .ok_or_else(|| MissingTemplateSnafu { name: id.name() }.build())?;

        if template.is_static {
            let key = (id, vars.index.to_string());
            if let Some(hit) = self.static_cache.get(&key) {
                return Ok(Arc::clone(&hit));
            }
            let sql: Arc<str> = template.render(vars).into();
            self.static_cache.insert(key, Arc::clone(&sql));
            Ok(sql)
        } else {
            Ok(template.render(vars).into())
        }
    }

    /// Render a static query for `index`.
    pub fn render_static(&self, id: QueryId, index: &str) -> Result<Arc<str>> {
        self.render(id, &RenderVars::for_index(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> TemplateSet {
        TemplateSet::load(&BTreeMap::new()).expect("default templates should compile")
    }

    #[test]
    fn static_render_substitutes_index_and_caches() {
        let templates = set();
        let first = templates
            .render_static(QueryId::Insert, "people")
            .expect("render should succeed");
        assert_eq!(&*first, "INSERT INTO people_main (id, val) VALUES (?, ?)");

        let second = templates
            .render_static(QueryId::Insert, "people")
            .expect("render should succeed");
        assert!(Arc::ptr_eq(&first, &second), "second render should be the cached value");
    }

    #[test]
    fn tag_placeholders_sized_by_tag_count() {
        let templates = set();
        let sql = templates
            .render(
                QueryId::SelectByTags,
                &RenderVars {
                    index: "docs",
                    tag_count: 3,
                    ascending: false,
                    has_min: false,
                    has_max: false,
                },
            )
            .expect("render should succeed");
        assert_eq!(
            &*sql,
            "SELECT DISTINCT id, sorter FROM docs_indx \
             WHERE tag IN (?, ?, ?) ORDER BY sorter DESC"
        );
    }

    #[test]
    fn sorter_sections_track_bound_presence() {
        let templates = set();
        let both = templates
            .render(
                QueryId::SelectFilterSorted,
                &RenderVars {
                    index: "docs",
                    tag_count: 0,
                    ascending: true,
                    has_min: true,
                    has_max: true,
                },
            )
            .expect("render should succeed");
        assert_eq!(
            &*both,
            "SELECT DISTINCT id, sorter FROM docs_indx WHERE 1 = 1 \
             AND sorter >= ? AND sorter <= ? ORDER BY sorter ASC"
        );

        let min_only = templates
            .render(
                QueryId::SelectFilterSorted,
                &RenderVars {
                    index: "docs",
                    tag_count: 0,
                    ascending: true,
                    has_min: true,
                    has_max: false,
                },
            )
            .expect("render should succeed");
        assert!(!min_only.contains("<= ?"));
        assert!(min_only.contains(">= ?"));
    }

    #[test]
    fn dynamic_renders_are_not_cached() {
        let templates = set();
        let a = templates
            .render(
                QueryId::SelectByTags,
                &RenderVars {
                    index: "docs",
                    tag_count: 1,
                    ascending: true,
                    has_min: false,
                    has_max: false,
                },
            )
            .expect("render should succeed");
        let b = templates
            .render(
                QueryId::SelectByTags,
                &RenderVars {
                    index: "docs",
                    tag_count: 2,
                    ascending: true,
                    has_min: false,
                    has_max: false,
                },
            )
            .expect("render should succeed");
        assert_ne!(&*a, &*b);
    }

    #[test]
    fn override_replaces_default() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "selectAll".to_string(),
            "SELECT id FROM {index}_main ORDER BY id DESC".to_string(),
        );
        let templates = TemplateSet::load(&overrides).expect("overridden set should compile");
        let sql = templates
            .render_static(QueryId::SelectAll, "docs")
            .expect("render should succeed");
        assert_eq!(&*sql, "SELECT id FROM docs_main ORDER BY id DESC");
    }

    #[test]
    fn unknown_override_name_is_rejected() {
        let mut overrides = BTreeMap::new();
        overrides.insert("selectEverything".to_string(), "SELECT 1".to_string());
        let err = TemplateSet::load(&overrides).unwrap_err();
        assert!(err.to_string().contains("selectEverything"));
    }

    #[test]
    fn unclosed_placeholder_is_a_syntax_error() {
        let mut overrides = BTreeMap::new();
        overrides.insert("delete".to_string(), "DELETE FROM {index_main".to_string());
        let err = TemplateSet::load(&overrides).unwrap_err();
        assert!(err.to_string().contains("delete"));
    }
}
