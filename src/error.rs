//! Error types for the store.
//!
//! One enum covers the whole surface. Expected absences are not errors:
//! a delete that matched zero rows, a missing lock row, or an empty result
//! sequence all come back as ordinary `Ok` values.

use std::path::PathBuf;

use snafu::Snafu;

/// Errors surfaced by store operations.
///
/// Configuration problems (`MissingTemplate`, `TemplateSyntax`, `Config`)
/// are detected at open time and are fatal. Backend failures wrap the
/// underlying `rusqlite` cause and are never retried here.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("missing SQL template '{name}'"))]
    MissingTemplate { name: &'static str },

    #[snafu(display("invalid SQL template '{name}': {reason}"))]
    TemplateSyntax { name: String, reason: String },

    #[snafu(display("invalid configuration value for '{key}': {reason}"))]
    Config { key: String, reason: String },

    #[snafu(display("failed to open database at {}: {source}", path.display()))]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[snafu(display("failed to execute SQL statement: {source}"))]
    Execute { source: rusqlite::Error },

    #[snafu(display("failed to query database: {source}"))]
    Query { source: rusqlite::Error },

    #[snafu(display("failed to serialize attributes: {source}"))]
    SerializeAttributes { source: serde_json::Error },

    #[snafu(display("connection pool exhausted ({max} active)"))]
    PoolExhausted { max: usize },

    #[snafu(display("no text search extension registered"))]
    TextSearchUnavailable,
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
